mod common;

use rdma::loopback::Fabric;
use rdma::rdmacm::{CmEventType, CmId, EventChannel, PortSpace, REJ_CONSUMER_DEFINED};
use rdma::DeviceRef;

use fabric_api::net::ConnParam;
use fabric_api::AsHandle;
use transport_xrc::cm_data::{self, XrcCmData, XRC_PARAM_MAX};
use transport_xrc::ini_conn::{IniConnKey, IniConnState};
use transport_xrc::{EpAttr, EpType, Error, XrcConnState};

use common::*;

#[test]
fn handshake_connects_both_sides_once() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, xrc_config());
    let b = Node::new(&fabric, 2, xrc_config());

    let ep_a = a.endpoint();
    ep_a.connect(b.addr, b"ping").unwrap();
    assert_eq!(ep_a.conn_state(), Some(XrcConnState::OrigConnecting));
    assert_eq!(a.eq.outstanding_tags(), 1);

    let connreq = b.expect_connreq();
    assert_eq!(connreq.data(), b"ping");
    let xrc = *connreq.xrc().unwrap();
    assert!(!xrc.is_reciprocal);
    assert_eq!(xrc.port, a.addr.port());
    assert_eq!(xrc.conn_param, 0);
    let ep_b = b.accept(connreq, b"pong");

    let events = pump(&[&a, &b]);
    assert_eq!(connected(&events[0]), vec![(ep_a.handle().0, b"pong".to_vec())]);
    assert_eq!(connected(&events[1]), vec![(ep_b.handle().0, Vec::new())]);
    assert!(errors(&events[0]).is_empty() && errors(&events[1]).is_empty());

    assert_eq!(ep_a.conn_state(), Some(XrcConnState::Connected));
    assert_eq!(ep_b.conn_state(), Some(XrcConnState::Connected));
    // The tag is only needed to match the reciprocal connection.
    assert_eq!(a.eq.outstanding_tags(), 0);
    assert!(matches!(a.eq.read(), Err(Error::Again)));
    assert!(matches!(b.eq.read(), Err(Error::Again)));

    assert_eq!(ep_a.getpeer().unwrap().ip(), b.addr.ip());
    assert_eq!(ep_b.getpeer().unwrap().ip(), a.addr.ip());
}

#[test]
fn endpoints_share_one_ini_connection() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, xrc_config());
    let b = Node::new(&fabric, 2, xrc_config());
    let key = IniConnKey {
        peer: b.addr.ip(),
        tx_cq: a.cq.as_handle(),
    };

    let ep_a1 = a.endpoint();
    let ep_a2 = a.endpoint();
    ep_a1.connect(b.addr, b"1").unwrap();
    ep_a2.connect(b.addr, b"2").unwrap();

    let info = a.domain.ini_conn_info(&key).unwrap();
    assert_eq!(info.state, IniConnState::Connecting);
    assert_eq!(info.ref_cnt, 2);
    assert_eq!(info.pending, vec![ep_a1.handle(), ep_a2.handle()]);

    // Only the creator talks to the peer until the INI QP is connected.
    let req1 = b.expect_connreq();
    assert_eq!(req1.data(), b"1");
    assert!(matches!(b.eq.read(), Err(Error::Again)));
    let ep_b1 = b.accept(req1, b"");

    let mut events = pump(&[&a, &b]);
    assert_eq!(connected(&events[0]), vec![(ep_a1.handle().0, Vec::new())]);
    let mut reqs = take_connreqs(&mut events[1]);
    assert_eq!(reqs.len(), 1);
    let req2 = reqs.remove(0);
    assert_eq!(req2.data(), b"2");

    let info = a.domain.ini_conn_info(&key).unwrap();
    assert_eq!(info.state, IniConnState::Connected);
    assert_eq!(info.active, vec![ep_a1.handle(), ep_a2.handle()]);
    // The second request names the TGT QP the first one created.
    assert_eq!(req2.xrc().unwrap().conn_param, info.tgt_qpn);

    let ep_b2 = b.accept(req2, b"");
    let events = pump(&[&a, &b]);
    assert_eq!(connected(&events[0]), vec![(ep_a2.handle().0, Vec::new())]);
    assert_eq!(connected(&events[1]), vec![(ep_b2.handle().0, Vec::new())]);

    let ini_qpn = info.ini_qpn.unwrap();
    assert_eq!(ep_a1.qp_num(), Some(ini_qpn));
    assert_eq!(ep_a2.qp_num(), Some(ini_qpn));
    let back = IniConnKey {
        peer: a.addr.ip(),
        tx_cq: b.cq.as_handle(),
    };
    assert_eq!(b.domain.ini_conn_info(&back).unwrap().ref_cnt, 2);

    drop(ep_a1);
    let info = a.domain.ini_conn_info(&key).unwrap();
    assert_eq!(info.ref_cnt, 1);
    assert_eq!(info.active, vec![ep_a2.handle()]);
    assert!(a.lo.qp_alive(ini_qpn));

    drop(ep_a2);
    assert!(a.domain.ini_conn_info(&key).is_none());
    assert!(!a.lo.qp_alive(ini_qpn));
    drop((ep_b1, ep_b2));
}

#[test]
fn reject_releases_tag_and_connection() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, xrc_config());
    let b = Node::new(&fabric, 2, xrc_config());

    let ep = a.endpoint();
    ep.connect(b.addr, b"hello").unwrap();
    let connreq = b.expect_connreq();
    b.pep.reject(connreq, b"busy").unwrap();

    let events = pump(&[&a, &b]);
    let errs = errors(&events[0]);
    assert_eq!(errs.len(), 1);
    assert_eq!(errs[0].fid, ep.handle());
    assert_eq!(errs[0].err, libc::ECONNREFUSED);
    assert_eq!(errs[0].prov_errno, REJ_CONSUMER_DEFINED);
    assert_eq!(errs[0].err_data, b"busy");
    assert!(connected(&events[0]).is_empty());

    assert_eq!(ep.conn_state(), Some(XrcConnState::Unconnected));
    assert_eq!(a.eq.outstanding_tags(), 0);
    assert_eq!(a.domain.ini_conn_count(), 0);

    // A failed attempt leaves the endpoint ready for another one.
    ep.connect(b.addr, b"again").unwrap();
    let ep_b = b.accept(b.expect_connreq(), b"");
    let events = pump(&[&a, &b]);
    assert_eq!(connected(&events[0]).len(), 1);
    assert_eq!(connected(&events[1]), vec![(ep_b.handle().0, Vec::new())]);
}

#[test]
fn oversized_param_is_refused_up_front() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, xrc_config());
    let b = Node::new(&fabric, 2, xrc_config());

    let ep = a.endpoint();
    let param = vec![0u8; XRC_PARAM_MAX + 1];
    assert!(matches!(
        ep.connect(b.addr, &param),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(a.eq.outstanding_tags(), 0);
    assert_eq!(a.domain.ini_conn_count(), 0);
    assert!(matches!(b.eq.read(), Err(Error::Again)));

    ep.connect(b.addr, &param[..XRC_PARAM_MAX]).unwrap();
    assert_eq!(b.expect_connreq().data().len(), XRC_PARAM_MAX);
}

#[test]
fn stale_reciprocal_request_is_rejected() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, xrc_config());

    // A peer speaking the protocol by hand, claiming a tag A never issued.
    let dev: DeviceRef = fabric.device(ip(3));
    let channel = EventChannel::create_event_channel(&dev).unwrap();
    let id = CmId::create_id(&dev, &channel, 0, PortSpace::Tcp).unwrap();
    id.resolve_addr(&a.addr).unwrap();
    let hdr = XrcCmData::new(true, 0x0001_0005, 9999, 0);
    id.connect(&ConnParam {
        private_data: Some(cm_data::xrc_private_data(&hdr, &[]).unwrap()),
        qp_num: 0x77,
        ..ConnParam::default()
    })
    .unwrap();

    // Handled inside the EQ, never shown to the application.
    assert!(matches!(a.eq.read(), Err(Error::Again)));

    let event = channel.get_cm_event().unwrap();
    assert_eq!(event.event, CmEventType::Rejected);
    assert_eq!(event.status, REJ_CONSUMER_DEFINED);
    let (echo, _) = cm_data::xrc_payload(event.private_data()).unwrap();
    assert!(echo.reciprocal);
    assert_eq!(echo.conn_tag, 0x0001_0005);
    assert_eq!(echo.port, 9999);
}

#[test]
fn disconnect_during_setup_aborts() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, xrc_config());
    let b = Node::new(&fabric, 2, xrc_config());

    let ep_a = a.endpoint();
    ep_a.connect(b.addr, b"").unwrap();
    let ep_b = b.accept(b.expect_connreq(), b"");
    // The passive side goes away before connecting back.
    drop(ep_b);

    let events = pump(&[&a, &b]);
    let errs = errors(&events[0]);
    assert_eq!(errs.len(), 1);
    assert_eq!(errs[0].err, libc::ECONNABORTED);
    assert!(connected(&events[0]).is_empty());
    assert!(connected(&events[1]).is_empty());

    assert_eq!(ep_a.conn_state(), Some(XrcConnState::Unconnected));
    assert_eq!(a.eq.outstanding_tags(), 0);
    assert_eq!(a.domain.ini_conn_count(), 0);
    assert_eq!(b.domain.ini_conn_count(), 0);
}

#[test]
fn shutdown_reports_once_per_side() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, xrc_config());
    let b = Node::new(&fabric, 2, xrc_config());
    let (ep_a, ep_b) = connect_pair(&a, &b, &a.domain.ep_attr());

    ep_a.shutdown().unwrap();
    let events = pump(&[&a, &b]);
    assert_eq!(shutdowns(&events[0]), vec![ep_a.handle().0]);
    assert_eq!(shutdowns(&events[1]), vec![ep_b.handle().0]);
    assert!(errors(&events[0]).is_empty() && errors(&events[1]).is_empty());

    assert!(matches!(ep_a.inject(b"late"), Err(Error::InvalidState(_))));
}

#[test]
fn connected_endpoint_sends_on_shared_qp() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, xrc_config());
    let b = Node::new(&fabric, 2, xrc_config());
    let (ep_a, _ep_b) = connect_pair(&a, &b, &a.domain.ep_attr());

    static BUF: [u8; 512] = [7; 512];
    unsafe { ep_a.send(&BUF, 0, 42).unwrap() };
    let mut entries = [transport_xrc::CqEntry::default(); 2];
    let n = a.cq.read(&mut entries).unwrap();
    assert_eq!(n, 1);
    assert_eq!(entries[0].op_context, 42);
    assert_eq!(entries[0].len, BUF.len());
}

#[test]
fn failed_reject_hands_the_request_back() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, xrc_config());
    let b = Node::new(&fabric, 2, xrc_config());

    let ep = a.endpoint();
    ep.connect(b.addr, b"hello").unwrap();
    let connreq = b.expect_connreq();
    let err = b
        .pep
        .reject(connreq, &vec![0u8; XRC_PARAM_MAX + 1])
        .unwrap_err();
    assert!(matches!(err.error(), Error::InvalidArgument(_)));
    let (_, connreq) = err.into_parts();
    assert_eq!(connreq.data(), b"hello");

    // Still unanswered: the originator keeps waiting.
    let events = pump(&[&a, &b]);
    assert!(events[0].is_empty());
    assert_eq!(ep.conn_state(), Some(XrcConnState::OrigConnecting));

    b.pep.reject(connreq, b"full").unwrap();
    let events = pump(&[&a, &b]);
    let errs = errors(&events[0]);
    assert_eq!(errs.len(), 1);
    assert_eq!(errs[0].err, libc::ECONNREFUSED);
    assert_eq!(errs[0].err_data, b"full");
    assert_eq!(a.eq.outstanding_tags(), 0);
    assert_eq!(a.domain.ini_conn_count(), 0);
}

#[test]
fn unusable_endpoint_attr_hands_the_request_back() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, xrc_config());
    let b = Node::new(&fabric, 2, xrc_config());

    let ep_a = a.endpoint();
    ep_a.connect(b.addr, b"").unwrap();
    let connreq = b.expect_connreq();

    let msg = EpAttr {
        ep_type: EpType::Msg,
        ..b.domain.ep_attr()
    };
    let (e, connreq) = b
        .domain
        .endpoint_from_request(&msg, connreq)
        .unwrap_err()
        .into_parts();
    assert!(matches!(e, Error::InvalidArgument(_)));

    let empty = EpAttr {
        tx_size: 0,
        ..b.domain.ep_attr()
    };
    let (e, connreq) = b
        .domain
        .endpoint_from_request(&empty, connreq)
        .unwrap_err()
        .into_parts();
    assert!(matches!(e, Error::InvalidArgument(_)));

    let ep_b = b.accept(connreq, b"");
    let events = pump(&[&a, &b]);
    assert_eq!(connected(&events[0]), vec![(ep_a.handle().0, Vec::new())]);
    assert_eq!(connected(&events[1]), vec![(ep_b.handle().0, Vec::new())]);
}

#[test]
fn dropped_request_refuses_the_peer() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, xrc_config());
    let b = Node::new(&fabric, 2, xrc_config());

    let ep = a.endpoint();
    ep.connect(b.addr, b"").unwrap();
    drop(b.expect_connreq());

    let events = pump(&[&a, &b]);
    let errs = errors(&events[0]);
    assert_eq!(errs.len(), 1);
    assert_eq!(errs[0].fid, ep.handle());
    assert_eq!(errs[0].err, libc::ECONNREFUSED);
    assert_eq!(errs[0].prov_errno, REJ_CONSUMER_DEFINED);
    assert!(errs[0].err_data.is_empty());
    assert_eq!(ep.conn_state(), Some(XrcConnState::Unconnected));
    assert_eq!(a.eq.outstanding_tags(), 0);
    assert_eq!(a.domain.ini_conn_count(), 0);
}

#[test]
fn early_reciprocal_request_waits_for_ini_leg() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, xrc_config());
    let b = Node::new(&fabric, 2, xrc_config());

    // A learns late that its INI connection is up, so the reciprocal
    // request from B arrives first.
    a.lo.hold_next_event(CmEventType::Established);
    let ep_a = a.endpoint();
    ep_a.connect(b.addr, b"ping").unwrap();
    let ep_b = b.accept(b.expect_connreq(), b"pong");

    let events = pump(&[&a, &b]);
    assert!(events[0].is_empty() && events[1].is_empty());
    assert_eq!(ep_a.conn_state(), Some(XrcConnState::OrigConnecting));
    assert_eq!(ep_b.conn_state(), Some(XrcConnState::RecipConnecting));
    assert_eq!(a.eq.outstanding_tags(), 1);

    assert_eq!(a.lo.release_held(), 1);
    let events = pump(&[&a, &b]);
    assert_eq!(connected(&events[0]), vec![(ep_a.handle().0, b"pong".to_vec())]);
    assert_eq!(connected(&events[1]), vec![(ep_b.handle().0, Vec::new())]);
    assert!(errors(&events[0]).is_empty() && errors(&events[1]).is_empty());
    assert_eq!(ep_a.conn_state(), Some(XrcConnState::Connected));
    assert_eq!(ep_b.conn_state(), Some(XrcConnState::Connected));
    assert_eq!(a.eq.outstanding_tags(), 0);
}

#[test]
fn close_with_held_reciprocal_request_answers_it() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, xrc_config());
    let b = Node::new(&fabric, 2, xrc_config());

    a.lo.hold_next_event(CmEventType::Established);
    let ep_a = a.endpoint();
    ep_a.connect(b.addr, b"").unwrap();
    let ep_b = b.accept(b.expect_connreq(), b"");
    pump(&[&a, &b]);
    assert_eq!(ep_b.conn_state(), Some(XrcConnState::RecipConnecting));

    drop(ep_a);
    a.lo.release_held();
    let events = pump(&[&a, &b]);
    assert!(events[0].is_empty());
    let errs = errors(&events[1]);
    assert_eq!(errs.len(), 1);
    assert_eq!(errs[0].fid, ep_b.handle());
    assert!(connected(&events[1]).is_empty());

    assert_eq!(ep_b.conn_state(), Some(XrcConnState::Unconnected));
    assert_eq!(a.eq.outstanding_tags(), 0);
    assert_eq!(a.domain.ini_conn_count(), 0);
    assert_eq!(b.domain.ini_conn_count(), 0);
}
