mod common;

use rdma::loopback::Fabric;

use transport_xrc::{CompletionMode, CqAttr, CqEntry, EpAttr, Error, XrcTransportConfig};

use common::*;

static BUF: [u8; 512] = [0xab; 512];

fn small_tx(node: &Node, tx_size: u32) -> EpAttr {
    EpAttr {
        tx_size,
        ..node.domain.ep_attr()
    }
}

#[test]
fn full_send_queue_is_drained_and_retried() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, rc_config());
    let b = Node::new(&fabric, 2, rc_config());
    let (ep, _peer) = connect_pair(&a, &b, &small_tx(&a, 3));
    let qpn = ep.qp_num().unwrap();

    for _ in 0..3 {
        ep.inject(b"x").unwrap();
    }
    assert_eq!(a.lo.outstanding(qpn), Some(3));
    // The fourth post finds the send queue full, reaps and goes through.
    ep.inject(b"x").unwrap();
    assert_eq!(a.lo.outstanding(qpn), Some(1));
    assert_eq!(a.cq.credits(), a.cq.depth() - 1);
    assert_eq!(a.cq.cached(), 0);

    let mut entries = [CqEntry::default(); 4];
    assert!(matches!(a.cq.read(&mut entries), Err(Error::Again)));
    assert_eq!(a.cq.credits(), a.cq.depth());
}

#[test]
fn reaped_completions_are_read_back_in_order() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, rc_config());
    let b = Node::new(&fabric, 2, rc_config());
    let (ep, _peer) = connect_pair(&a, &b, &small_tx(&a, 3));

    for context in 1..=4 {
        unsafe { ep.send(&BUF, 0, context).unwrap() };
    }
    assert_eq!(a.cq.cached(), 3);

    let mut entries = [CqEntry::default(); 8];
    let n = a.cq.read(&mut entries).unwrap();
    assert_eq!(n, 4);
    let contexts: Vec<u64> = entries[..n].iter().map(|e| e.op_context).collect();
    assert_eq!(contexts, vec![1, 2, 3, 4]);
    assert!(entries[..n].iter().all(|e| e.len == BUF.len()));
    assert_eq!(a.cq.cached(), 0);
    assert_eq!(a.cq.credits(), a.cq.depth());
}

#[test]
fn failed_completion_goes_through_readerr() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, rc_config());
    let b = Node::new(&fabric, 2, rc_config());
    let (ep, _peer) = connect_pair(&a, &b, &a.domain.ep_attr());

    a.lo.fail_next_completion(0x15);
    unsafe { ep.send(&BUF, 0, 9).unwrap() };

    let mut entries = [CqEntry::default(); 4];
    assert!(matches!(a.cq.read(&mut entries), Err(Error::ErrAvail)));
    // Stays pending until taken.
    assert!(matches!(a.cq.read(&mut entries), Err(Error::ErrAvail)));

    let err = a.cq.readerr().unwrap();
    assert_eq!(err.op_context, 9);
    assert_eq!(err.err, libc::EIO);
    assert_eq!(err.prov_errno, 0x15);
    assert!(a.cq.readerr().is_none());
    assert!(matches!(a.cq.read(&mut entries), Err(Error::Again)));
    assert_eq!(a.cq.credits(), a.cq.depth());
}

#[test]
fn failed_unsignaled_send_still_surfaces() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, rc_config());
    let b = Node::new(&fabric, 2, rc_config());
    let (ep, _peer) = connect_pair(&a, &b, &a.domain.ep_attr());

    a.lo.fail_next_completion(3);
    ep.inject(b"lost").unwrap();

    let mut entries = [CqEntry::default(); 4];
    assert!(matches!(a.cq.read(&mut entries), Err(Error::ErrAvail)));
    let err = a.cq.readerr().unwrap();
    assert_eq!(err.op_context, 0);
    assert_eq!(err.prov_errno, 3);
}

#[test]
fn post_error_returns_credit() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, rc_config());
    let b = Node::new(&fabric, 2, rc_config());
    let (ep, _peer) = connect_pair(&a, &b, &a.domain.ep_attr());

    a.lo.fail_next_post(libc::EINVAL);
    let err = ep.inject(b"x").unwrap_err();
    assert!(matches!(err, Error::Ibv(_)));
    assert_eq!(err.errno(), -libc::EINVAL);
    assert_eq!(a.cq.credits(), a.cq.depth());

    ep.inject(b"x").unwrap();
    assert_eq!(a.cq.credits(), a.cq.depth() - 1);
}

#[test]
fn failed_reap_on_full_queue_is_transient() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, rc_config());
    let b = Node::new(&fabric, 2, rc_config());
    let (ep, _peer) = connect_pair(&a, &b, &small_tx(&a, 1));

    ep.inject(b"x").unwrap();
    a.lo.fail_next_poll(libc::EIO);
    assert!(matches!(ep.inject(b"x"), Err(Error::Again)));
    assert_eq!(a.cq.credits(), a.cq.depth() - 1);

    // Nothing was lost; the next attempt reaps and posts.
    ep.inject(b"x").unwrap();
    assert_eq!(a.lo.outstanding(ep.qp_num().unwrap()), Some(1));
}

#[test]
fn oversized_inject_is_refused() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, rc_config());
    let b = Node::new(&fabric, 2, rc_config());
    let (ep, _peer) = connect_pair(&a, &b, &a.domain.ep_attr());

    let big = vec![0u8; ep.attr().inject_size + 1];
    assert!(matches!(ep.inject(&big), Err(Error::InvalidArgument(_))));
    assert_eq!(a.cq.credits(), a.cq.depth());
}

#[test]
fn credits_never_exceed_a_small_cq() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, rc_config());
    let b = Node::new(&fabric, 2, rc_config());
    let cq = a.domain.cq_open(&CqAttr { size: Some(2) }).unwrap();
    let ep = a.domain.endpoint(&small_tx(&a, 8)).unwrap();
    ep.bind_eq(&a.eq).unwrap();
    ep.bind_cq(&cq, transport_xrc::BindFlags::TRANSMIT | transport_xrc::BindFlags::RECV)
        .unwrap();
    ep.connect(b.addr, b"").unwrap();
    let _peer = b.accept(b.expect_connreq(), b"");
    pump(&[&a, &b]);

    for _ in 0..5 {
        ep.inject(b"x").unwrap();
        assert!(cq.credits() <= cq.depth());
    }
    let mut entries = [CqEntry::default(); 4];
    assert!(matches!(cq.read(&mut entries), Err(Error::Again)));
    assert_eq!(cq.credits(), 2);
}

fn error_in_the_middle(mode: CompletionMode) {
    let fabric = Fabric::new();
    let config = XrcTransportConfig {
        completion_mode: mode,
        ..rc_config()
    };
    let a = Node::new(&fabric, 1, config);
    let b = Node::new(&fabric, 2, rc_config());
    let (ep, _peer) = connect_pair(&a, &b, &a.domain.ep_attr());
    assert_eq!(a.cq.mode(), mode);

    unsafe { ep.send(&BUF, 0, 1).unwrap() };
    a.lo.fail_next_completion(7);
    unsafe { ep.send(&BUF, 0, 2).unwrap() };
    unsafe { ep.send(&BUF, 0, 3).unwrap() };

    let mut entries = [CqEntry::default(); 8];
    assert_eq!(a.cq.read(&mut entries).unwrap(), 1);
    assert_eq!(entries[0].op_context, 1);
    assert!(matches!(a.cq.read(&mut entries), Err(Error::ErrAvail)));
    assert_eq!(a.cq.readerr().unwrap().op_context, 2);
    assert_eq!(a.cq.read(&mut entries).unwrap(), 1);
    assert_eq!(entries[0].op_context, 3);
    assert!(matches!(a.cq.read(&mut entries), Err(Error::Again)));
    assert_eq!(a.cq.credits(), a.cq.depth());
}

#[test]
fn discard_mode_stops_at_errors() {
    error_in_the_middle(CompletionMode::Discard);
}

#[test]
fn poll_new_mode_stops_at_errors() {
    error_in_the_middle(CompletionMode::PollNew);
}

#[test]
fn debug_output_shows_credits() {
    let fabric = Fabric::new();
    let a = Node::new(&fabric, 1, rc_config());
    let cq = a.domain.cq_open(&CqAttr { size: Some(4) }).unwrap();
    let out = format!("{:?}", cq);
    assert!(out.starts_with("CompletionQueue"));
    assert!(out.contains("depth: 4"));
    assert!(out.contains("credits: 4"));
}
