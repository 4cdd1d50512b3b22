//! XRC connection establishment.
//!
//! An XRC endpoint is connected in both directions by two RC-like
//! connections. The originating side connects its INI QP to a TGT QP of the
//! passive side; once that is established the passive side connects back
//! ("reciprocal" connection) to the listener of the originator's EQ,
//! carrying the connection tag the originator allocated. The originator
//! finds itself through the tag and accepts internally. The application
//! sees a single connected event per side, after both legs are up.
//!
//! INI QPs are shared by all endpoints of one domain that talk to the same
//! peer host through the same transmit CQ. Endpoints joining a connected
//! INI QP exchange a throwaway "reserved" QP number during their CM
//! handshake instead.
use std::net::SocketAddr;

use fabric_api::net::QpType;
use fabric_api::{AsHandle, Handle};
use rdma::ibv::{QueuePair, SharedReceiveQueue, SrqInitAttr};
use rdma::rdmacm::{CmEvent, CmEventType, CmId};

use crate::cm_data::{self, XrcCmData, XRC_PARAM_MAX};
use crate::connreq::ConnectionRequest;
use crate::ep::{EpInner, Endpoint};
use crate::eq::{CmOutcome, EqError, EqEvent};
use crate::ini_conn::{IniConnKey, IniConnState};
use crate::{Error, Result};

pub(crate) const XRC_EP_MAGIC: u32 = 0x1F3D5B79;

/// Only `Unconnected` and `Connected` are stable. The others are passed
/// through while both halves of the connection are set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrcConnState {
    Unconnected,
    OrigConnecting,
    OrigConnected,
    RecipConnecting,
    Connected,
}

#[derive(Debug)]
pub(crate) struct XrcEp {
    /// Cleared when the endpoint closes.
    pub(crate) magic: u32,
    pub(crate) conn_state: XrcConnState,
    pub(crate) srq: Option<SharedReceiveQueue>,
    pub(crate) peer_srqn: u32,
    pub(crate) ini_conn: Option<IniConnKey>,
    /// Handle and number of the shared INI QP.
    pub(crate) ini_qp: Option<(Handle, u32)>,
    pub(crate) tgt_id: Option<CmId>,
    pub(crate) tgt_qp: Option<QueuePair>,
    pub(crate) conn_setup: Option<ConnSetup>,
}

impl XrcEp {
    pub(crate) fn new() -> Self {
        XrcEp {
            magic: XRC_EP_MAGIC,
            conn_state: XrcConnState::Unconnected,
            srq: None,
            peer_srqn: 0,
            ini_conn: None,
            ini_qp: None,
            tgt_id: None,
            tgt_qp: None,
            conn_setup: None,
        }
    }
}

/// State that only lives while a connection is being set up.
#[derive(Debug)]
pub(crate) struct ConnSetup {
    conn_tag: u32,
    /// The tag was allocated by this endpoint, i.e. it originated the
    /// connection.
    created_conn_tag: bool,
    /// Destination of the INI connection.
    peer: SocketAddr,
    param: Vec<u8>,
    ini_creator: bool,
    ini_issued: bool,
    ini_connected: bool,
    tgt_connected: bool,
    rsvd_ini_qp: Option<QueuePair>,
    rsvd_tgt_qp: Option<QueuePair>,
    /// Accept data of the peer, reported with the connected event.
    event_data: Vec<u8>,
    /// A reciprocal request that arrived before our INI connection was
    /// established.
    pending_recip: Option<ConnectionRequest>,
}

impl ConnSetup {
    fn new(conn_tag: u32, created_conn_tag: bool, peer: SocketAddr, param: Vec<u8>) -> Self {
        ConnSetup {
            conn_tag,
            created_conn_tag,
            peer,
            param,
            ini_creator: false,
            ini_issued: false,
            ini_connected: false,
            tgt_connected: false,
            rsvd_ini_qp: None,
            rsvd_tgt_qp: None,
            event_data: Vec::new(),
            pending_recip: None,
        }
    }
}

fn xrc_mut(inner: &mut EpInner) -> Result<&mut XrcEp> {
    inner
        .xrc
        .as_mut()
        .ok_or(Error::InvalidState("endpoint is not using XRC"))
}

fn setup_mut(inner: &mut EpInner) -> Result<&mut ConnSetup> {
    xrc_mut(inner)?
        .conn_setup
        .as_mut()
        .ok_or(Error::InvalidState("no connection in progress"))
}

impl Endpoint {
    pub(crate) fn xrc_create_srq(&self, inner: &mut EpInner) -> Result<()> {
        let cq = match &inner.rx_cq {
            Some(cq) => cq.as_handle(),
            None => return Err(Error::InvalidState("no receive CQ bound")),
        };
        let xrc = xrc_mut(inner)?;
        if xrc.srq.is_some() {
            return Ok(());
        }
        let attr = SrqInitAttr {
            cq,
            max_wr: self.attr.rx_size,
            max_sge: 1,
        };
        let srq = SharedReceiveQueue::create(self.domain.device(), &attr).map_err(Error::Ibv)?;
        tracing::debug!("ep {} created SRQ {}", self.handle(), srq.srq_num());
        xrc.srq = Some(srq);
        Ok(())
    }

    fn srq_num(inner: &EpInner) -> Result<u32> {
        inner
            .xrc
            .as_ref()
            .and_then(|xrc| xrc.srq.as_ref())
            .map(SharedReceiveQueue::srq_num)
            .ok_or(Error::InvalidState("endpoint is not enabled"))
    }

    pub(crate) fn connect_xrc(
        &self,
        inner: &mut EpInner,
        addr: SocketAddr,
        param: &[u8],
        sched: &mut Vec<Handle>,
    ) -> Result<()> {
        if param.len() > XRC_PARAM_MAX {
            return Err(Error::InvalidArgument("XRC connection parameter too long"));
        }
        if inner.connreq.is_some() {
            return Err(Error::InvalidState("endpoint was opened to accept a request"));
        }
        {
            let xrc = xrc_mut(inner)?;
            if xrc.conn_state != XrcConnState::Unconnected
                || xrc.conn_setup.is_some()
                || xrc.ini_conn.is_some()
            {
                return Err(Error::InvalidState("endpoint already connecting"));
            }
        }
        self.enable_locked(inner)?;
        let eq = inner.bound_eq()?;

        let tag = eq.xrc.lock().tags.allocate(self.handle())?;
        tracing::debug!(
            "XRC connect, ep: {}, tag: {:#x}, peer: {}",
            self.handle(),
            tag,
            addr
        );
        let xrc = xrc_mut(inner)?;
        xrc.conn_setup = Some(ConnSetup::new(tag, true, addr, param.to_vec()));
        xrc.conn_state = XrcConnState::OrigConnecting;

        let res = self
            .join_ini_conn(inner)
            .and_then(|()| self.sched_ini_connect(inner));
        if res.is_err() {
            sched.extend(self.xrc_teardown(inner));
        }
        res
    }

    pub(crate) fn accept_xrc(
        &self,
        inner: &mut EpInner,
        param: &[u8],
        sched: &mut Vec<Handle>,
    ) -> Result<()> {
        if param.len() > XRC_PARAM_MAX {
            return Err(Error::InvalidArgument("XRC connection parameter too long"));
        }
        if xrc_mut(inner)?.conn_setup.is_some() {
            return Err(Error::InvalidState("endpoint already connecting"));
        }
        self.enable_locked(inner)?;
        let connreq = inner
            .connreq
            .take()
            .ok_or(Error::InvalidState("endpoint has no pending request"))?;
        let (info, peer) = match (connreq.xrc().copied(), connreq.peer_addr()) {
            (Some(info), Some(peer)) => (info, peer),
            _ => return Err(Error::InvalidArgument("request carries no XRC peer")),
        };

        let xrc = xrc_mut(inner)?;
        xrc.conn_setup = Some(ConnSetup::new(
            info.conn_tag,
            false,
            SocketAddr::new(peer.ip(), info.port),
            Vec::new(),
        ));
        xrc.conn_state = XrcConnState::OrigConnecting;

        let res = self.xrc_accept_tgt(inner, connreq, param);
        if res.is_err() {
            sched.extend(self.xrc_teardown(inner));
        }
        res
    }

    /// Joins (or creates) the shared INI connection towards the setup's
    /// peer.
    fn join_ini_conn(&self, inner: &mut EpInner) -> Result<()> {
        let tx_cq = match &inner.tx_cq {
            Some(cq) => cq.as_handle(),
            None => return Err(Error::InvalidState("no transmit CQ bound")),
        };
        let peer = setup_mut(inner)?.peer;
        let key = IniConnKey {
            peer: peer.ip(),
            tx_cq,
        };
        let view = self.domain.ini_mgmt_lock.lock().acquire(key, self.handle());
        tracing::trace!("ep {} joined INI connection {:?}: {:?}", self.handle(), key, view);
        xrc_mut(inner)?.ini_conn = Some(key);
        Ok(())
    }

    /// Issues the INI side CM connect if the shared INI connection allows
    /// it, otherwise leaves it to whoever completes that connection.
    fn sched_ini_connect(&self, inner: &mut EpInner) -> Result<()> {
        let key = xrc_mut(inner)?
            .ini_conn
            .ok_or(Error::InvalidState("no INI connection"))?;
        let view = self
            .domain
            .ini_mgmt_lock
            .lock()
            .view(&key, self.handle())
            .ok_or(Error::NotFound)?;

        match view.state {
            IniConnState::Connected => {
                let attr = self.qp_init_attr(inner, QpType::XrcSend);
                let rsvd = QueuePair::create(self.domain.device(), &attr).map_err(Error::Ibv)?;
                let qpn = rsvd.qp_num();
                let xrc = xrc_mut(inner)?;
                xrc.ini_qp = view.ini_qp;
                if let Some(setup) = xrc.conn_setup.as_mut() {
                    setup.rsvd_ini_qp = Some(rsvd);
                }
                self.issue_ini_connect(inner, qpn, view.tgt_qpn)
            }
            IniConnState::Unconnected if view.first_pending => {
                let attr = self.qp_init_attr(inner, QpType::XrcSend);
                let qp = QueuePair::create(self.domain.device(), &attr).map_err(Error::Ibv)?;
                let (handle, qpn) = (qp.as_handle(), qp.qp_num());
                let res = self.domain.ini_mgmt_lock.lock().set_connecting(&key, qp);
                if let Err(qp) = res {
                    tracing::debug!("INI connection {:?} changed state, deferring", key);
                    drop(qp);
                    return Ok(());
                }
                let xrc = xrc_mut(inner)?;
                xrc.ini_qp = Some((handle, qpn));
                if let Some(setup) = xrc.conn_setup.as_mut() {
                    setup.ini_creator = true;
                }
                self.issue_ini_connect(inner, qpn, 0)
            }
            _ => {
                tracing::debug!(
                    "ep {} waits for INI connection {:?} ({:?})",
                    self.handle(),
                    key,
                    view.state
                );
                Ok(())
            }
        }
    }

    fn issue_ini_connect(&self, inner: &mut EpInner, qpn: u32, tgt_qpn: u32) -> Result<()> {
        let eq = inner.bound_eq()?;
        let port = eq.xrc.lock().pep_port;
        let setup = setup_mut(inner)?;
        let hdr = XrcCmData::new(!setup.created_conn_tag, setup.conn_tag, port, tgt_qpn);
        let data = cm_data::xrc_private_data(&hdr, &setup.param)?;
        let peer = setup.peer;

        let id = self.create_active_id(&eq, &peer)?;
        id.connect(&self.conn_param(data, qpn, true))
            .map_err(Error::RdmaCm)?;
        tracing::debug!(
            "ep {} issued {} INI connect to {}, qpn: {:#x}, tgt_qpn: {:#x}",
            self.handle(),
            if hdr.reciprocal { "reciprocal" } else { "originating" },
            peer,
            qpn,
            tgt_qpn
        );
        inner.id = Some(id);
        setup_mut(inner)?.ini_issued = true;
        Ok(())
    }

    /// Accepts a request on a TGT QP: the one the peer already shares with
    /// this host when it names one, a new one otherwise.
    fn xrc_accept_tgt(
        &self,
        inner: &mut EpInner,
        connreq: ConnectionRequest,
        param: &[u8],
    ) -> Result<()> {
        let info = *connreq
            .xrc()
            .ok_or(Error::InvalidArgument("request carries no XRC data"))?;
        let srqn = Self::srq_num(inner)?;
        let dev = self.domain.device();

        let (tgt_qp, rsvd, qpn) = if info.conn_param != 0 {
            let tgt_qp = QueuePair::open(dev, info.conn_param).map_err(Error::Ibv)?;
            let rsvd = QueuePair::create(dev, &self.qp_init_attr(inner, QpType::XrcRecv))
                .map_err(Error::Ibv)?;
            let qpn = rsvd.qp_num();
            (tgt_qp, Some(rsvd), qpn)
        } else {
            let tgt_qp = QueuePair::create(dev, &self.qp_init_attr(inner, QpType::XrcRecv))
                .map_err(Error::Ibv)?;
            let qpn = tgt_qp.qp_num();
            (tgt_qp, None, qpn)
        };

        let hdr = XrcCmData::new(info.is_reciprocal, info.conn_tag, info.port, srqn);
        let data = cm_data::xrc_private_data(&hdr, param)?;
        let id = connreq.into_id();
        id.set_context(self.handle().0).map_err(Error::RdmaCm)?;
        id.accept(&self.conn_param(data, qpn, true))
            .map_err(Error::RdmaCm)?;
        tracing::debug!(
            "ep {} accepted {} connection on TGT QP {:#x}",
            self.handle(),
            if info.is_reciprocal { "reciprocal" } else { "originating" },
            tgt_qp.qp_num()
        );

        let xrc = xrc_mut(inner)?;
        xrc.tgt_id = Some(id);
        xrc.tgt_qp = Some(tgt_qp);
        if let Some(setup) = xrc.conn_setup.as_mut() {
            setup.rsvd_tgt_qp = rsvd;
        }
        Ok(())
    }

    /// A reciprocal request carrying a tag this endpoint allocated.
    pub(crate) fn accept_recip(&self, connreq: ConnectionRequest) -> CmOutcome {
        let mut out = CmOutcome::default();
        let mut inner = self.inner.lock();
        let tag = connreq.xrc().map(|xrc| xrc.conn_tag);

        let state = match inner.xrc.as_mut() {
            Some(xrc) if xrc.magic == XRC_EP_MAGIC => match xrc.conn_setup.as_mut() {
                Some(setup)
                    if setup.created_conn_tag
                        && Some(setup.conn_tag) == tag
                        && xrc.tgt_id.is_none() =>
                {
                    if xrc.conn_state == XrcConnState::OrigConnecting {
                        setup.pending_recip = Some(connreq);
                        tracing::debug!("ep {} holds early reciprocal request", self.handle());
                        return out;
                    }
                    Some(xrc.conn_state)
                }
                _ => None,
            },
            _ => None,
        };

        if state != Some(XrcConnState::OrigConnected) {
            tracing::warn!(
                "unexpected reciprocal request for ep {} in state {:?}, rejecting",
                self.handle(),
                state
            );
            if let Err(e) = connreq.reject(&[]) {
                tracing::debug!("reject of reciprocal request failed: {}", e);
            }
            return out;
        }
        if let Err(e) = self.xrc_accept_recip(&mut inner, connreq) {
            self.xrc_abort(&mut inner, &e, 0, Vec::new(), &mut out);
        }
        out
    }

    fn xrc_accept_recip(&self, inner: &mut EpInner, connreq: ConnectionRequest) -> Result<()> {
        xrc_mut(inner)?.conn_state = XrcConnState::RecipConnecting;
        self.xrc_accept_tgt(inner, connreq, &[])
    }

    /// Continues a connect that waited for the shared INI connection.
    /// Returns endpoints that can continue in turn.
    pub(crate) fn sched_deferred(&self) -> Vec<Handle> {
        let mut out = CmOutcome::default();
        let mut inner = self.inner.lock();
        let waiting = inner
            .xrc
            .as_ref()
            .and_then(|xrc| xrc.conn_setup.as_ref())
            .map_or(false, |setup| !setup.ini_issued);
        if waiting {
            if let Err(e) = self.sched_ini_connect(&mut inner) {
                tracing::debug!("deferred connect of ep {} failed: {}", self.handle(), e);
                self.xrc_abort(&mut inner, &e, 0, Vec::new(), &mut out);
            }
        }
        let eq = inner.eq.clone();
        drop(inner);
        if let Some(eq) = eq {
            eq.write_events(out.events);
        }
        out.sched
    }

    pub(crate) fn xrc_cm_event(&self, inner: &mut EpInner, event: &CmEvent, out: &mut CmOutcome) {
        let is_ini = inner.id.as_ref().map(|id| id.as_handle()) == Some(event.id);
        let is_tgt = inner
            .xrc
            .as_ref()
            .and_then(|xrc| xrc.tgt_id.as_ref())
            .map(|id| id.as_handle())
            == Some(event.id);
        if !is_ini && !is_tgt {
            tracing::debug!("ignoring {} for a previous id of ep {}", event, self.handle());
            return;
        }

        let res = match event.event {
            CmEventType::Established if is_ini => self.xrc_ini_established(inner, event, out),
            CmEventType::Established => self.xrc_tgt_established(inner, out),
            CmEventType::Rejected
            | CmEventType::Unreachable
            | CmEventType::ConnectError
            | CmEventType::AddrError
            | CmEventType::RouteError => {
                let err_data = cm_data::xrc_payload(event.private_data())
                    .map(|(_, data)| data.to_vec())
                    .unwrap_or_default();
                tracing::debug!("XRC connection of ep {} failed: {}", self.handle(), event);
                self.xrc_abort(inner, &Error::ConnectionRefused, event.status, err_data, out);
                Ok(())
            }
            CmEventType::Disconnected => {
                self.xrc_disconnected(inner, out);
                Ok(())
            }
            _ => {
                tracing::trace!("ignoring {} on ep {}", event, self.handle());
                Ok(())
            }
        };
        if let Err(e) = res {
            self.xrc_abort(inner, &e, 0, Vec::new(), out);
        }
    }

    fn xrc_ini_established(
        &self,
        inner: &mut EpInner,
        event: &CmEvent,
        out: &mut CmOutcome,
    ) -> Result<()> {
        let (hdr, payload) = cm_data::xrc_payload(event.private_data())?;
        let handle = self.handle();
        let xrc = xrc_mut(inner)?;
        let key = xrc.ini_conn.ok_or(Error::InvalidState("no INI connection"))?;
        xrc.peer_srqn = hdr.param;
        let setup = xrc
            .conn_setup
            .as_mut()
            .ok_or(Error::InvalidState("no connection in progress"))?;
        setup.ini_connected = true;

        if setup.ini_creator {
            let woken = self
                .domain
                .ini_mgmt_lock
                .lock()
                .complete(&key, event.param.qp_num)?;
            tracing::debug!(
                "INI connection {:?} established, tgt_qpn: {:#x}, waking {} endpoints",
                key,
                event.param.qp_num,
                woken.len().saturating_sub(1)
            );
            out.sched.extend(woken.into_iter().filter(|&ep| ep != handle));
        }

        let mut recip = None;
        if setup.created_conn_tag {
            setup.event_data = payload.to_vec();
            recip = setup.pending_recip.take();
            xrc.conn_state = XrcConnState::OrigConnected;
        }
        if let Some(connreq) = recip {
            self.xrc_accept_recip(inner, connreq)?;
        }
        self.xrc_check_connected(inner, out);
        Ok(())
    }

    fn xrc_tgt_established(&self, inner: &mut EpInner, out: &mut CmOutcome) -> Result<()> {
        let setup = setup_mut(inner)?;
        setup.tgt_connected = true;
        if setup.created_conn_tag {
            self.xrc_check_connected(inner, out);
            return Ok(());
        }

        // The originating connection towards us is up, connect back.
        xrc_mut(inner)?.conn_state = XrcConnState::RecipConnecting;
        tracing::debug!("ep {} starts reciprocal connection", self.handle());
        self.join_ini_conn(inner)?;
        self.sched_ini_connect(inner)
    }

    fn xrc_check_connected(&self, inner: &mut EpInner, out: &mut CmOutcome) {
        let eq = inner.eq.clone();
        let Some(xrc) = inner.xrc.as_mut() else {
            return;
        };
        let done = xrc
            .conn_setup
            .as_ref()
            .map_or(false, |setup| setup.ini_connected && setup.tgt_connected);
        if !done {
            return;
        }
        let Some(setup) = xrc.conn_setup.take() else {
            return;
        };
        xrc.conn_state = XrcConnState::Connected;
        if setup.created_conn_tag {
            if let Some(eq) = eq {
                eq.xrc.lock().tags.release(setup.conn_tag);
            }
        }
        tracing::debug!(
            "ep {} connected, tag: {:#x}, peer srqn: {:#x}",
            self.handle(),
            setup.conn_tag,
            xrc.peer_srqn
        );
        out.events.push(EqEvent::Connected {
            fid: self.handle(),
            data: setup.event_data,
        });
    }

    fn xrc_disconnected(&self, inner: &mut EpInner, out: &mut CmOutcome) {
        let in_setup = inner
            .xrc
            .as_ref()
            .map_or(false, |xrc| xrc.conn_setup.is_some());
        if in_setup {
            self.xrc_abort(inner, &Error::ConnectionAborted, 0, Vec::new(), out);
            return;
        }
        let Some(xrc) = inner.xrc.as_mut() else {
            return;
        };
        if xrc.conn_state == XrcConnState::Connected {
            xrc.conn_state = XrcConnState::Unconnected;
            if !inner.shutdown_reported {
                inner.shutdown_reported = true;
                out.events.push(EqEvent::Shutdown { fid: self.handle() });
            }
        }
    }

    /// Gives up a connection in progress and reports `err` once.
    fn xrc_abort(
        &self,
        inner: &mut EpInner,
        err: &Error,
        prov_errno: i32,
        err_data: Vec<u8>,
        out: &mut CmOutcome,
    ) {
        let in_setup = inner
            .xrc
            .as_ref()
            .map_or(false, |xrc| xrc.conn_setup.is_some());
        if !in_setup {
            return;
        }
        tracing::debug!("aborting connection of ep {}: {}", self.handle(), err);
        out.sched.extend(self.xrc_teardown(inner));
        out.events.push(EqEvent::Error(EqError {
            fid: self.handle(),
            err: -err.errno(),
            prov_errno,
            err_data,
        }));
    }

    /// Releases everything a connection attempt holds and returns the
    /// endpoint to `Unconnected`. Returns endpoints that should retry
    /// creating the shared INI connection this endpoint failed to create.
    pub(crate) fn xrc_teardown(&self, inner: &mut EpInner) -> Vec<Handle> {
        let handle = self.handle();
        let eq = inner.eq.clone();
        let Some(xrc) = inner.xrc.as_mut() else {
            return Vec::new();
        };
        let mut sched = Vec::new();
        let setup = xrc.conn_setup.take();

        if let (Some(setup), Some(eq)) = (&setup, &eq) {
            if setup.created_conn_tag {
                eq.xrc.lock().tags.release(setup.conn_tag);
            }
        }

        if let Some(key) = xrc.ini_conn.take() {
            let creator_failed = setup
                .as_ref()
                .map_or(false, |setup| setup.ini_creator && !setup.ini_connected);
            let (ini_qp, removed) = {
                let mut pool = self.domain.ini_mgmt_lock.lock();
                let (ini_qp, next) = if creator_failed {
                    pool.abort_connecting(&key, handle)
                } else {
                    (None, None)
                };
                sched.extend(next);
                let removed = pool.release(&key, handle).unwrap_or_else(|e| {
                    tracing::debug!("ep {} held no reference on {:?}: {}", handle, key, e);
                    None
                });
                (ini_qp, removed)
            };
            // Queue pairs are destroyed outside the pool lock.
            drop(ini_qp);
            if let Some(conn) = removed {
                tracing::debug!("destroying INI connection {:?}", conn.key());
                drop(conn);
            }
        }

        xrc.ini_qp = None;
        xrc.peer_srqn = 0;
        xrc.conn_state = XrcConnState::Unconnected;
        let tgt_id = xrc.tgt_id.take();
        let tgt_qp = xrc.tgt_qp.take();
        inner.id = None;
        drop(tgt_id);
        drop(tgt_qp);

        if let Some(mut setup) = setup {
            if let Some(connreq) = setup.pending_recip.take() {
                if let Err(e) = connreq.reject(&[]) {
                    tracing::debug!("reject of held reciprocal request failed: {}", e);
                }
            }
        }
        sched
    }

    pub(crate) fn xrc_close(&self, inner: &mut EpInner) -> Vec<Handle> {
        let sched = self.xrc_teardown(inner);
        if let Some(xrc) = inner.xrc.as_mut() {
            xrc.magic = 0;
            xrc.srq = None;
        }
        sched
    }
}
