//! Physical XRC initiator connections shared by logical endpoints.
//!
//! All logical endpoints that reach the same peer host through the same
//! send CQ use one INI queue pair. The pool itself never calls into verbs:
//! records handed back by [`IniConnPool::release`] and
//! [`IniConnPool::abort_connecting`] own the queue pair and must be dropped
//! after the pool lock is released.
use std::collections::VecDeque;
use std::net::IpAddr;

use fnv::FnvHashMap;

use fabric_api::{AsHandle, Handle};
use rdma::ibv::QueuePair;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IniConnKey {
    pub peer: IpAddr,
    pub tx_cq: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IniConnState {
    Unconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
pub struct SharedIniConn {
    key: IniConnKey,
    state: IniConnState,
    ini_qp: Option<QueuePair>,
    tgt_qpn: u32,
    ref_cnt: usize,
    pending: VecDeque<Handle>,
    active: Vec<Handle>,
}

/// A copy of a pool record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniConnInfo {
    pub state: IniConnState,
    pub ini_qpn: Option<u32>,
    pub tgt_qpn: u32,
    pub ref_cnt: usize,
    pub pending: Vec<Handle>,
    pub active: Vec<Handle>,
}

/// What an endpoint needs to know about the connection it joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IniConnView {
    pub state: IniConnState,
    /// Handle and number of the INI QP, once one exists.
    pub ini_qp: Option<(Handle, u32)>,
    pub tgt_qpn: u32,
    /// The endpoint is first in line to create the physical connection.
    pub first_pending: bool,
}

impl SharedIniConn {
    fn new(key: IniConnKey) -> Self {
        SharedIniConn {
            key,
            state: IniConnState::Unconnected,
            ini_qp: None,
            tgt_qpn: 0,
            ref_cnt: 0,
            pending: VecDeque::new(),
            active: Vec::new(),
        }
    }

    #[inline]
    pub fn key(&self) -> IniConnKey {
        self.key
    }

    #[inline]
    pub fn state(&self) -> IniConnState {
        self.state
    }

    #[inline]
    pub fn ref_cnt(&self) -> usize {
        self.ref_cnt
    }

    pub fn info(&self) -> IniConnInfo {
        IniConnInfo {
            state: self.state,
            ini_qpn: self.ini_qp.as_ref().map(QueuePair::qp_num),
            tgt_qpn: self.tgt_qpn,
            ref_cnt: self.ref_cnt,
            pending: self.pending.iter().copied().collect(),
            active: self.active.clone(),
        }
    }

    fn view(&self, ep: Handle) -> IniConnView {
        IniConnView {
            state: self.state,
            ini_qp: self
                .ini_qp
                .as_ref()
                .map(|qp| (qp.as_handle(), qp.qp_num())),
            tgt_qpn: self.tgt_qpn,
            first_pending: self.pending.front() == Some(&ep),
        }
    }

    fn check(&self) {
        debug_assert_eq!(self.ref_cnt, self.pending.len() + self.active.len());
    }
}

#[derive(Debug, Default)]
pub struct IniConnPool {
    conns: FnvHashMap<IniConnKey, SharedIniConn>,
}

impl IniConnPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins `ep` to the connection for `key`, creating an unconnected
    /// record when there is none. An endpoint joining a connected record is
    /// active right away, otherwise it waits in the pending list.
    pub fn acquire(&mut self, key: IniConnKey, ep: Handle) -> IniConnView {
        let conn = self
            .conns
            .entry(key)
            .or_insert_with(|| SharedIniConn::new(key));
        conn.ref_cnt += 1;
        match conn.state {
            IniConnState::Connected => conn.active.push(ep),
            IniConnState::Unconnected | IniConnState::Connecting => conn.pending.push_back(ep),
        }
        conn.check();
        conn.view(ep)
    }

    pub fn view(&self, key: &IniConnKey, ep: Handle) -> Option<IniConnView> {
        self.conns.get(key).map(|conn| conn.view(ep))
    }

    /// Records the INI QP of a connection that is being established. Hands
    /// the QP back if the record is gone or no longer unconnected.
    pub fn set_connecting(
        &mut self,
        key: &IniConnKey,
        qp: QueuePair,
    ) -> std::result::Result<(), QueuePair> {
        match self.conns.get_mut(key) {
            Some(conn) if conn.state == IniConnState::Unconnected => {
                conn.state = IniConnState::Connecting;
                conn.ini_qp = Some(qp);
                Ok(())
            }
            _ => Err(qp),
        }
    }

    /// Marks the physical connection established and moves every pending
    /// endpoint to the active list, returning them in the order they joined.
    pub fn complete(&mut self, key: &IniConnKey, tgt_qpn: u32) -> Result<Vec<Handle>> {
        let conn = self.conns.get_mut(key).ok_or(Error::NotFound)?;
        conn.state = IniConnState::Connected;
        conn.tgt_qpn = tgt_qpn;
        let woken: Vec<Handle> = conn.pending.drain(..).collect();
        conn.active.extend_from_slice(&woken);
        conn.check();
        Ok(woken)
    }

    /// Resets a record whose physical connection failed. Returns the INI QP
    /// to destroy and the next pending endpoint other than `failed`, which
    /// should retry as the creator.
    pub fn abort_connecting(
        &mut self,
        key: &IniConnKey,
        failed: Handle,
    ) -> (Option<QueuePair>, Option<Handle>) {
        match self.conns.get_mut(key) {
            Some(conn) if conn.state != IniConnState::Connected => {
                conn.state = IniConnState::Unconnected;
                conn.tgt_qpn = 0;
                let qp = conn.ini_qp.take();
                let next = conn.pending.iter().copied().find(|&ep| ep != failed);
                (qp, next)
            }
            _ => (None, None),
        }
    }

    /// Drops the reference held by `ep`. The last reference removes the
    /// record and hands it back.
    pub fn release(&mut self, key: &IniConnKey, ep: Handle) -> Result<Option<SharedIniConn>> {
        let conn = self.conns.get_mut(key).ok_or(Error::NotFound)?;
        if let Some(pos) = conn.pending.iter().position(|&h| h == ep) {
            conn.pending.remove(pos);
        } else if let Some(pos) = conn.active.iter().position(|&h| h == ep) {
            conn.active.remove(pos);
        } else {
            return Err(Error::NotFound);
        }
        conn.ref_cnt -= 1;
        conn.check();
        if conn.ref_cnt == 0 {
            Ok(self.conns.remove(key))
        } else {
            Ok(None)
        }
    }

    pub fn get(&self, key: &IniConnKey) -> Option<&SharedIniConn> {
        self.conns.get(key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn key(host: u8, cq: u64) -> IniConnKey {
        IniConnKey {
            peer: IpAddr::V4(Ipv4Addr::new(192, 168, 0, host)),
            tx_cq: Handle(cq),
        }
    }

    #[test]
    fn pending_then_active_in_join_order() {
        let mut pool = IniConnPool::new();
        let k = key(1, 1);
        let v1 = pool.acquire(k, Handle(10));
        assert_eq!(v1.state, IniConnState::Unconnected);
        assert!(v1.first_pending);
        let v2 = pool.acquire(k, Handle(11));
        assert!(!v2.first_pending);
        let v3 = pool.acquire(k, Handle(12));
        assert_eq!(pool.len(), 1);
        assert_eq!(v3.state, IniConnState::Unconnected);

        let woken = pool.complete(&k, 77).unwrap();
        assert_eq!(woken, vec![Handle(10), Handle(11), Handle(12)]);
        let info = pool.get(&k).unwrap().info();
        assert_eq!(info.state, IniConnState::Connected);
        assert_eq!(info.tgt_qpn, 77);
        assert!(info.pending.is_empty());
        assert_eq!(info.active, woken);

        let v4 = pool.acquire(k, Handle(13));
        assert_eq!(v4.state, IniConnState::Connected);
        assert_eq!(pool.get(&k).unwrap().info().active.len(), 4);
    }

    #[test]
    fn one_record_per_key() {
        let mut pool = IniConnPool::new();
        pool.acquire(key(1, 1), Handle(1));
        pool.acquire(key(1, 1), Handle(2));
        pool.acquire(key(1, 2), Handle(3));
        pool.acquire(key(2, 1), Handle(4));
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.get(&key(1, 1)).unwrap().ref_cnt(), 2);
    }

    #[test]
    fn last_release_removes_record() {
        let mut pool = IniConnPool::new();
        let k = key(3, 3);
        pool.acquire(k, Handle(1));
        pool.acquire(k, Handle(2));
        pool.complete(&k, 5).unwrap();
        assert!(pool.release(&k, Handle(1)).unwrap().is_none());
        assert_eq!(pool.get(&k).unwrap().ref_cnt(), 1);
        let removed = pool.release(&k, Handle(2)).unwrap().unwrap();
        assert_eq!(removed.key(), k);
        assert_eq!(removed.ref_cnt(), 0);
        assert!(pool.is_empty());
        assert!(matches!(pool.release(&k, Handle(2)), Err(Error::NotFound)));
    }

    #[test]
    fn release_of_stranger_is_rejected() {
        let mut pool = IniConnPool::new();
        let k = key(4, 4);
        pool.acquire(k, Handle(1));
        assert!(matches!(pool.release(&k, Handle(9)), Err(Error::NotFound)));
        assert_eq!(pool.get(&k).unwrap().ref_cnt(), 1);
    }

    #[test]
    fn abort_promotes_next_pending() {
        let mut pool = IniConnPool::new();
        let k = key(5, 5);
        pool.acquire(k, Handle(1));
        pool.acquire(k, Handle(2));
        let (qp, next) = pool.abort_connecting(&k, Handle(1));
        assert!(qp.is_none());
        assert_eq!(next, Some(Handle(2)));
        pool.release(&k, Handle(1)).unwrap();
        let view = pool.view(&k, Handle(2)).unwrap();
        assert_eq!(view.state, IniConnState::Unconnected);
        assert!(view.first_pending);
    }

    #[test]
    fn ref_cnt_tracks_unreleased_endpoints() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut pool = IniConnPool::new();
        let keys = [key(1, 1), key(1, 2), key(2, 1)];
        let mut joined: Vec<(IniConnKey, Handle)> = Vec::new();
        for i in 0..5_000u64 {
            match rng.gen_range(0..10) {
                0..=4 => {
                    let k = keys[rng.gen_range(0..keys.len())];
                    pool.acquire(k, Handle(i));
                    joined.push((k, Handle(i)));
                }
                5 => {
                    let k = keys[rng.gen_range(0..keys.len())];
                    let _ = pool.complete(&k, 1);
                }
                _ if !joined.is_empty() => {
                    let (k, ep) = joined.swap_remove(rng.gen_range(0..joined.len()));
                    pool.release(&k, ep).unwrap();
                }
                _ => {}
            }
            for k in &keys {
                let expected = joined.iter().filter(|(jk, _)| jk == k).count();
                match pool.get(k) {
                    Some(conn) => {
                        let info = conn.info();
                        assert_eq!(info.ref_cnt, expected);
                        assert_eq!(info.ref_cnt, info.pending.len() + info.active.len());
                    }
                    None => assert_eq!(expected, 0),
                }
            }
        }
    }
}
