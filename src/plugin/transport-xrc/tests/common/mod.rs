#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use rdma::loopback::{Fabric, LoopbackDevice};
use rdma::DeviceRef;
use transport_xrc::{
    BindFlags, CompletionQueue, ConnectionRequest, CqAttr, Domain, Endpoint, EpAttr, EqError,
    EqEvent, Error, EventQueue, PassiveEndpoint, PepAttr, XrcTransportConfig,
};

pub const LISTEN_PORT: u16 = 7471;

pub fn ip(host: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, host))
}

pub fn xrc_config() -> XrcTransportConfig {
    XrcTransportConfig::default()
}

pub fn rc_config() -> XrcTransportConfig {
    XrcTransportConfig {
        prefer_xrc: false,
        ..XrcTransportConfig::default()
    }
}

/// One host: a loopback device with a domain, an EQ, a CQ and a listener.
pub struct Node {
    pub fabric: Arc<Fabric>,
    pub lo: Arc<LoopbackDevice>,
    pub domain: Arc<Domain>,
    pub eq: Arc<EventQueue>,
    pub cq: Arc<CompletionQueue>,
    pub pep: Arc<PassiveEndpoint>,
    pub addr: SocketAddr,
}

impl Node {
    pub fn new(fabric: &Arc<Fabric>, host: u8, config: XrcTransportConfig) -> Node {
        let lo = fabric.device(ip(host));
        let dev: DeviceRef = lo.clone();
        let domain = Domain::open(dev, config).unwrap();
        let eq = domain.eq_open().unwrap();
        let cq = domain.cq_open(&CqAttr::default()).unwrap();
        let addr = SocketAddr::new(ip(host), LISTEN_PORT);
        let pep = domain
            .passive_ep(&PepAttr {
                src_addr: Some(addr),
                ..PepAttr::default()
            })
            .unwrap();
        pep.bind_eq(&eq).unwrap();
        pep.listen().unwrap();
        Node {
            fabric: Arc::clone(fabric),
            lo,
            domain,
            eq,
            cq,
            pep,
            addr,
        }
    }

    pub fn bind(&self, ep: &Arc<Endpoint>) {
        ep.bind_eq(&self.eq).unwrap();
        ep.bind_cq(&self.cq, BindFlags::TRANSMIT | BindFlags::RECV)
            .unwrap();
    }

    pub fn endpoint_with(&self, attr: &EpAttr) -> Arc<Endpoint> {
        let ep = self.domain.endpoint(attr).unwrap();
        self.bind(&ep);
        ep
    }

    pub fn endpoint(&self) -> Arc<Endpoint> {
        self.endpoint_with(&self.domain.ep_attr())
    }

    pub fn accept(&self, connreq: ConnectionRequest, param: &[u8]) -> Arc<Endpoint> {
        let ep = self
            .domain
            .endpoint_from_request(&self.domain.ep_attr(), connreq)
            .unwrap();
        self.bind(&ep);
        ep.accept(param).unwrap();
        ep
    }

    pub fn expect_connreq(&self) -> ConnectionRequest {
        match self.eq.read() {
            Ok(EqEvent::ConnReq(connreq)) => connreq,
            other => panic!("expected a connect request, got {:?}", other),
        }
    }
}

/// Reads every EQ until a full round neither surfaces an event nor
/// consumes a CM event internally.
pub fn pump(nodes: &[&Node]) -> Vec<Vec<EqEvent>> {
    let mut seen: Vec<Vec<EqEvent>> = nodes.iter().map(|_| Vec::new()).collect();
    let delivered = || {
        nodes
            .iter()
            .map(|node| node.fabric.events_delivered())
            .max()
            .unwrap_or(0)
    };
    loop {
        let before = delivered();
        let mut progress = false;
        for (node, events) in nodes.iter().zip(seen.iter_mut()) {
            loop {
                match node.eq.read() {
                    Ok(event) => {
                        events.push(event);
                        progress = true;
                    }
                    Err(Error::Again) => break,
                    Err(e) => panic!("eq read failed: {}", e),
                }
            }
        }
        if !progress && delivered() == before {
            return seen;
        }
    }
}

pub fn connected(events: &[EqEvent]) -> Vec<(u64, Vec<u8>)> {
    events
        .iter()
        .filter_map(|event| match event {
            EqEvent::Connected { fid, data } => Some((fid.0, data.clone())),
            _ => None,
        })
        .collect()
}

pub fn shutdowns(events: &[EqEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            EqEvent::Shutdown { fid } => Some(fid.0),
            _ => None,
        })
        .collect()
}

pub fn errors(events: &[EqEvent]) -> Vec<EqError> {
    events
        .iter()
        .filter_map(|event| match event {
            EqEvent::Error(err) => Some(err.clone()),
            _ => None,
        })
        .collect()
}

pub fn take_connreqs(events: &mut Vec<EqEvent>) -> Vec<ConnectionRequest> {
    let mut reqs = Vec::new();
    let mut rest = Vec::new();
    for event in events.drain(..) {
        match event {
            EqEvent::ConnReq(connreq) => reqs.push(connreq),
            other => rest.push(other),
        }
    }
    *events = rest;
    reqs
}

/// Connects a fresh endpoint of `a` to `b` and drives both EQs until the
/// connection is up.
pub fn connect_pair(a: &Node, b: &Node, attr: &EpAttr) -> (Arc<Endpoint>, Arc<Endpoint>) {
    let ep_a = a.endpoint_with(attr);
    ep_a.connect(b.addr, b"").unwrap();
    let ep_b = b.accept(b.expect_connreq(), b"");
    let events = pump(&[a, b]);
    assert_eq!(connected(&events[0]).len(), 1);
    assert_eq!(connected(&events[1]).len(), 1);
    (ep_a, ep_b)
}
