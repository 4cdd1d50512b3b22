//! An in-process software device.
//!
//! Every [`LoopbackDevice`] created from one [`Fabric`] owns an IP address
//! on that fabric. rdma_cm requests are routed to listeners by address and
//! answered with the same events a real CM would deliver. Sends complete
//! immediately into the send CQ; a send queue slot is retired only when its
//! completion is polled, so a full send queue refuses posts with `ENOMEM`.
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use fnv::FnvHashMap;
use spin::Mutex;

use fabric_api::net::{ConnParam, QpType, WcFlags, WcOpcode, WcStatus, WorkCompletion};
use fabric_api::Handle;

use crate::ibv::{QpInfo, QpInitAttr, SendWr, SrqInfo, SrqInitAttr, Verbs, WrOpcode};
use crate::rdmacm::{
    CmEvent, CmEventType, PortSpace, RdmaCm, REJ_CONSUMER_DEFINED, REJ_INVALID_SERVICE_ID,
};

const EPHEMERAL_PORT_BASE: u16 = 40000;

#[inline]
fn os_error(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

#[derive(Debug)]
struct IdState {
    channel: Handle,
    context: u64,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    remote: Option<Handle>,
    listening: bool,
    connected: bool,
    /// Passive side of a connect request not yet accepted or rejected.
    unanswered: bool,
    remote_qp_num: u32,
}

#[derive(Debug)]
struct QpState {
    qp_type: QpType,
    send_cq: Option<Handle>,
    max_send_wr: u32,
    outstanding: u32,
    refcnt: usize,
}

#[derive(Debug)]
struct CqState {
    device: IpAddr,
    cqe: usize,
    entries: VecDeque<WorkCompletion>,
}

#[derive(Debug)]
struct FabricInner {
    next_handle: u64,
    next_qpn: u32,
    next_srqn: u32,
    next_port: u16,
    channels: FnvHashMap<Handle, VecDeque<CmEvent>>,
    ids: FnvHashMap<Handle, IdState>,
    listeners: FnvHashMap<SocketAddr, Handle>,
    cqs: FnvHashMap<Handle, CqState>,
    qps: FnvHashMap<(IpAddr, u32), QpState>,
    qp_handles: FnvHashMap<Handle, (IpAddr, u32)>,
    srqs: FnvHashMap<Handle, u32>,
    channel_owner: FnvHashMap<Handle, IpAddr>,
    /// Event types to hold back on the next matching delivery, per device.
    holds: Vec<(IpAddr, CmEventType)>,
    held: Vec<(Handle, CmEvent)>,
    delivered: u64,
}

impl FabricInner {
    fn alloc_handle(&mut self) -> Handle {
        self.next_handle += 1;
        Handle(self.next_handle)
    }

    fn alloc_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_PORT_BASE);
        port
    }

    fn id_mut(&mut self, id: Handle) -> io::Result<&mut IdState> {
        self.ids.get_mut(&id).ok_or_else(|| os_error(libc::EINVAL))
    }

    fn push_event(&mut self, channel: Handle, event: CmEvent) {
        if let Some(&owner) = self.channel_owner.get(&channel) {
            let hold = self
                .holds
                .iter()
                .position(|&(ip, ty)| ip == owner && ty == event.event);
            if let Some(pos) = hold {
                self.holds.remove(pos);
                log::debug!("holding {} on {}", event, owner);
                self.held.push((channel, event));
                return;
            }
        }
        match self.channels.get_mut(&channel) {
            Some(queue) => queue.push_back(event),
            None => log::debug!("dropping {} for a closed event channel", event),
        }
    }

    fn event_for(
        &self,
        id: Handle,
        event: CmEventType,
        status: i32,
        param: ConnParam,
    ) -> Option<(Handle, CmEvent)> {
        let st = self.ids.get(&id)?;
        Some((
            st.channel,
            CmEvent {
                event,
                status,
                id,
                listen_id: None,
                context: st.context,
                param,
            },
        ))
    }

    fn notify(&mut self, id: Handle, event: CmEventType, status: i32, param: ConnParam) {
        if let Some((channel, event)) = self.event_for(id, event, status, param) {
            self.push_event(channel, event);
        }
    }
}

/// The wire shared by all loopback devices.
#[derive(Debug)]
pub struct Fabric {
    inner: Mutex<FabricInner>,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Fabric {
            inner: Mutex::new(FabricInner {
                next_handle: 0,
                next_qpn: 0x100,
                next_srqn: 0x10,
                next_port: EPHEMERAL_PORT_BASE,
                channels: FnvHashMap::default(),
                ids: FnvHashMap::default(),
                listeners: FnvHashMap::default(),
                cqs: FnvHashMap::default(),
                qps: FnvHashMap::default(),
                qp_handles: FnvHashMap::default(),
                srqs: FnvHashMap::default(),
                channel_owner: FnvHashMap::default(),
                holds: Vec::new(),
                held: Vec::new(),
                delivered: 0,
            }),
        })
    }

    pub fn device(self: &Arc<Self>, ip: IpAddr) -> Arc<LoopbackDevice> {
        Arc::new(LoopbackDevice {
            fabric: Arc::clone(self),
            ip,
            post_error: Mutex::new(None),
            poll_error: Mutex::new(None),
            wc_error: Mutex::new(None),
        })
    }

    /// Number of CM events handed out by `get_cm_event` so far.
    pub fn events_delivered(&self) -> u64 {
        self.inner.lock().delivered
    }
}

#[derive(Debug)]
pub struct LoopbackDevice {
    fabric: Arc<Fabric>,
    ip: IpAddr,
    post_error: Mutex<Option<i32>>,
    poll_error: Mutex<Option<i32>>,
    wc_error: Mutex<Option<u32>>,
}

impl LoopbackDevice {
    #[inline]
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// The next `post_send` fails with `errno`.
    pub fn fail_next_post(&self, errno: i32) {
        *self.post_error.lock() = Some(errno);
    }

    /// The next `poll_cq` fails with `errno`.
    pub fn fail_next_poll(&self, errno: i32) {
        *self.poll_error.lock() = Some(errno);
    }

    /// The completion of the next posted WR carries an error status.
    pub fn fail_next_completion(&self, vendor_err: u32) {
        *self.wc_error.lock() = Some(vendor_err);
    }

    pub fn qp_alive(&self, qp_num: u32) -> bool {
        self.fabric.inner.lock().qps.contains_key(&(self.ip, qp_num))
    }

    /// The next CM event of type `event` for this device is held back
    /// until [`LoopbackDevice::release_held`].
    pub fn hold_next_event(&self, event: CmEventType) {
        self.fabric.inner.lock().holds.push((self.ip, event));
    }

    /// Delivers the events held for this device, in the order they were
    /// held, and drops pending holds.
    pub fn release_held(&self) -> usize {
        let mut inner = self.fabric.inner.lock();
        let ip = self.ip;
        inner.holds.retain(|&(owner, _)| owner != ip);
        let held = std::mem::take(&mut inner.held);
        let mut released = 0;
        for (channel, event) in held {
            if inner.channel_owner.get(&channel) != Some(&ip) {
                inner.held.push((channel, event));
                continue;
            }
            if let Some(queue) = inner.channels.get_mut(&channel) {
                queue.push_back(event);
                released += 1;
            }
        }
        released
    }

    /// Number of posted WRs on `qp_num` whose completions are not polled yet.
    pub fn outstanding(&self, qp_num: u32) -> Option<u32> {
        self.fabric
            .inner
            .lock()
            .qps
            .get(&(self.ip, qp_num))
            .map(|qp| qp.outstanding)
    }

    fn local_ip(&self, addr: &SocketAddr) -> io::Result<SocketAddr> {
        if addr.ip().is_unspecified() || addr.ip() == self.ip {
            Ok(SocketAddr::new(self.ip, addr.port()))
        } else {
            Err(os_error(libc::EADDRNOTAVAIL))
        }
    }
}

impl RdmaCm for LoopbackDevice {
    fn create_event_channel(&self) -> io::Result<Handle> {
        let mut inner = self.fabric.inner.lock();
        let handle = inner.alloc_handle();
        inner.channels.insert(handle, VecDeque::new());
        inner.channel_owner.insert(handle, self.ip);
        Ok(handle)
    }

    fn destroy_event_channel(&self, channel: Handle) -> io::Result<()> {
        let mut inner = self.fabric.inner.lock();
        inner.channel_owner.remove(&channel);
        inner.held.retain(|(ch, _)| *ch != channel);
        inner
            .channels
            .remove(&channel)
            .map(|_| ())
            .ok_or_else(|| os_error(libc::EINVAL))
    }

    fn get_cm_event(&self, channel: Handle) -> io::Result<CmEvent> {
        let mut inner = self.fabric.inner.lock();
        let queue = inner
            .channels
            .get_mut(&channel)
            .ok_or_else(|| os_error(libc::EINVAL))?;
        let event = queue.pop_front().ok_or_else(|| os_error(libc::EAGAIN))?;
        inner.delivered += 1;
        Ok(event)
    }

    fn create_id(&self, channel: Handle, context: u64, _ps: PortSpace) -> io::Result<Handle> {
        let mut inner = self.fabric.inner.lock();
        if !inner.channels.contains_key(&channel) {
            return Err(os_error(libc::EINVAL));
        }
        let handle = inner.alloc_handle();
        inner.ids.insert(
            handle,
            IdState {
                channel,
                context,
                local: None,
                peer: None,
                remote: None,
                listening: false,
                connected: false,
                unanswered: false,
                remote_qp_num: 0,
            },
        );
        Ok(handle)
    }

    fn destroy_id(&self, id: Handle) -> io::Result<()> {
        let mut inner = self.fabric.inner.lock();
        let st = inner.ids.remove(&id).ok_or_else(|| os_error(libc::EINVAL))?;
        if st.listening {
            if let Some(local) = st.local {
                inner.listeners.remove(&local);
            }
        }
        if let Some(remote) = st.remote {
            let mut peer_was_connected = false;
            if let Some(r) = inner.ids.get_mut(&remote) {
                r.remote = None;
                peer_was_connected = r.connected;
                r.connected = false;
            }
            if st.connected && peer_was_connected {
                inner.notify(remote, CmEventType::Disconnected, 0, ConnParam::default());
            } else if st.unanswered {
                // A request destroyed without an answer is refused.
                inner.notify(
                    remote,
                    CmEventType::Rejected,
                    REJ_CONSUMER_DEFINED,
                    ConnParam::default(),
                );
            }
        }
        Ok(())
    }

    fn set_context(&self, id: Handle, context: u64) -> io::Result<()> {
        let mut inner = self.fabric.inner.lock();
        inner.id_mut(id)?.context = context;
        Ok(())
    }

    fn bind_addr(&self, id: Handle, addr: &SocketAddr) -> io::Result<()> {
        let mut addr = self.local_ip(addr)?;
        let mut inner = self.fabric.inner.lock();
        if addr.port() == 0 {
            addr.set_port(inner.alloc_port());
        } else if inner.listeners.contains_key(&addr) {
            return Err(os_error(libc::EADDRINUSE));
        }
        inner.id_mut(id)?.local = Some(addr);
        Ok(())
    }

    fn resolve_addr(&self, id: Handle, dst: &SocketAddr) -> io::Result<()> {
        let mut inner = self.fabric.inner.lock();
        let needs_port = inner.id_mut(id)?.local.is_none();
        let port = if needs_port { Some(inner.alloc_port()) } else { None };
        let st = inner.id_mut(id)?;
        st.peer = Some(*dst);
        if let Some(port) = port {
            st.local = Some(SocketAddr::new(self.ip, port));
        }
        Ok(())
    }

    fn listen(&self, id: Handle, _backlog: i32) -> io::Result<()> {
        let mut inner = self.fabric.inner.lock();
        let local = inner.id_mut(id)?.local.ok_or_else(|| os_error(libc::EINVAL))?;
        if inner.listeners.contains_key(&local) {
            return Err(os_error(libc::EADDRINUSE));
        }
        inner.listeners.insert(local, id);
        inner.id_mut(id)?.listening = true;
        Ok(())
    }

    fn connect(&self, id: Handle, conn_param: &ConnParam) -> io::Result<()> {
        let mut inner = self.fabric.inner.lock();
        let (peer, local) = {
            let st = inner.id_mut(id)?;
            if st.remote.is_some() || st.connected {
                return Err(os_error(libc::EISCONN));
            }
            let peer = st.peer.ok_or_else(|| os_error(libc::EINVAL))?;
            (peer, st.local)
        };

        let listener = inner.listeners.get(&peer).copied();
        let Some(listen_id) = listener else {
            inner.notify(
                id,
                CmEventType::Rejected,
                REJ_INVALID_SERVICE_ID,
                ConnParam::default(),
            );
            return Ok(());
        };
        let (channel, context) = match inner.ids.get(&listen_id) {
            Some(lst) => (lst.channel, lst.context),
            None => return Err(os_error(libc::ECONNREFUSED)),
        };

        let new_id = inner.alloc_handle();
        inner.ids.insert(
            new_id,
            IdState {
                channel,
                context,
                local: Some(peer),
                peer: local,
                remote: Some(id),
                listening: false,
                connected: false,
                unanswered: true,
                remote_qp_num: conn_param.qp_num,
            },
        );
        inner.id_mut(id)?.remote = Some(new_id);
        inner.push_event(
            channel,
            CmEvent {
                event: CmEventType::ConnectRequest,
                status: 0,
                id: new_id,
                listen_id: Some(listen_id),
                context,
                param: conn_param.clone(),
            },
        );
        Ok(())
    }

    fn accept(&self, id: Handle, conn_param: &ConnParam) -> io::Result<()> {
        let mut inner = self.fabric.inner.lock();
        let (remote, remote_qp_num) = {
            let st = inner.id_mut(id)?;
            let remote = st.remote.ok_or_else(|| os_error(libc::EINVAL))?;
            (remote, st.remote_qp_num)
        };
        match inner.ids.get_mut(&remote) {
            Some(r) => {
                r.connected = true;
                r.remote_qp_num = conn_param.qp_num;
            }
            None => return Err(os_error(libc::ECONNRESET)),
        }
        let st = inner.id_mut(id)?;
        st.connected = true;
        st.unanswered = false;

        let response = ConnParam {
            private_data: conn_param.private_data.clone(),
            qp_num: conn_param.qp_num,
            ..ConnParam::default()
        };
        inner.notify(remote, CmEventType::Established, 0, response);
        let established = ConnParam {
            qp_num: remote_qp_num,
            ..ConnParam::default()
        };
        inner.notify(id, CmEventType::Established, 0, established);
        Ok(())
    }

    fn reject(&self, id: Handle, private_data: &[u8]) -> io::Result<()> {
        let mut inner = self.fabric.inner.lock();
        let st = inner.id_mut(id)?;
        st.unanswered = false;
        let remote = st.remote.take().ok_or_else(|| os_error(libc::EINVAL))?;
        if let Some(r) = inner.ids.get_mut(&remote) {
            r.remote = None;
        }
        let param = ConnParam {
            private_data: Some(private_data.to_vec()),
            ..ConnParam::default()
        };
        inner.notify(remote, CmEventType::Rejected, REJ_CONSUMER_DEFINED, param);
        Ok(())
    }

    fn disconnect(&self, id: Handle) -> io::Result<()> {
        let mut inner = self.fabric.inner.lock();
        let st = inner.id_mut(id)?;
        if !st.connected {
            return Err(os_error(libc::EINVAL));
        }
        st.connected = false;
        let remote = st.remote;
        inner.notify(id, CmEventType::Disconnected, 0, ConnParam::default());
        if let Some(remote) = remote {
            if let Some(r) = inner.ids.get_mut(&remote) {
                r.connected = false;
            }
            inner.notify(remote, CmEventType::Disconnected, 0, ConnParam::default());
        }
        Ok(())
    }

    fn local_addr(&self, id: Handle) -> io::Result<SocketAddr> {
        let mut inner = self.fabric.inner.lock();
        inner.id_mut(id)?.local.ok_or_else(|| os_error(libc::ENOTCONN))
    }

    fn peer_addr(&self, id: Handle) -> io::Result<SocketAddr> {
        let mut inner = self.fabric.inner.lock();
        inner.id_mut(id)?.peer.ok_or_else(|| os_error(libc::ENOTCONN))
    }
}

impl Verbs for LoopbackDevice {
    fn create_cq(&self, cqe: usize) -> io::Result<Handle> {
        if cqe == 0 {
            return Err(os_error(libc::EINVAL));
        }
        let mut inner = self.fabric.inner.lock();
        let handle = inner.alloc_handle();
        inner.cqs.insert(
            handle,
            CqState {
                device: self.ip,
                cqe,
                entries: VecDeque::with_capacity(cqe),
            },
        );
        Ok(handle)
    }

    fn destroy_cq(&self, cq: Handle) -> io::Result<()> {
        let mut inner = self.fabric.inner.lock();
        inner
            .cqs
            .remove(&cq)
            .map(|_| ())
            .ok_or_else(|| os_error(libc::EINVAL))
    }

    fn create_qp(&self, attr: &QpInitAttr) -> io::Result<QpInfo> {
        let mut inner = self.fabric.inner.lock();
        if let Some(cq) = attr.send_cq {
            if !inner.cqs.contains_key(&cq) {
                return Err(os_error(libc::EINVAL));
            }
        }
        let qp_num = inner.next_qpn;
        inner.next_qpn += 1;
        let handle = inner.alloc_handle();
        inner.qps.insert(
            (self.ip, qp_num),
            QpState {
                qp_type: attr.qp_type,
                send_cq: attr.send_cq,
                max_send_wr: attr.cap.max_send_wr,
                outstanding: 0,
                refcnt: 1,
            },
        );
        inner.qp_handles.insert(handle, (self.ip, qp_num));
        Ok(QpInfo { handle, qp_num })
    }

    fn open_qp(&self, qp_num: u32) -> io::Result<QpInfo> {
        let mut inner = self.fabric.inner.lock();
        let qp = inner
            .qps
            .get_mut(&(self.ip, qp_num))
            .ok_or_else(|| os_error(libc::ENOENT))?;
        if qp.qp_type != QpType::XrcRecv {
            return Err(os_error(libc::EINVAL));
        }
        qp.refcnt += 1;
        let handle = inner.alloc_handle();
        inner.qp_handles.insert(handle, (self.ip, qp_num));
        Ok(QpInfo { handle, qp_num })
    }

    fn destroy_qp(&self, qp: Handle) -> io::Result<()> {
        let mut inner = self.fabric.inner.lock();
        let key = inner
            .qp_handles
            .remove(&qp)
            .ok_or_else(|| os_error(libc::EINVAL))?;
        let last = match inner.qps.get_mut(&key) {
            Some(st) => {
                st.refcnt -= 1;
                st.refcnt == 0
            }
            None => false,
        };
        if last {
            inner.qps.remove(&key);
        }
        Ok(())
    }

    fn create_srq(&self, attr: &SrqInitAttr) -> io::Result<SrqInfo> {
        let mut inner = self.fabric.inner.lock();
        if !inner.cqs.contains_key(&attr.cq) || attr.max_wr == 0 {
            return Err(os_error(libc::EINVAL));
        }
        let srq_num = inner.next_srqn;
        inner.next_srqn += 1;
        let handle = inner.alloc_handle();
        inner.srqs.insert(handle, srq_num);
        Ok(SrqInfo { handle, srq_num })
    }

    fn destroy_srq(&self, srq: Handle) -> io::Result<()> {
        let mut inner = self.fabric.inner.lock();
        inner
            .srqs
            .remove(&srq)
            .map(|_| ())
            .ok_or_else(|| os_error(libc::EINVAL))
    }

    fn post_send(&self, qp: Handle, wr: &SendWr) -> io::Result<()> {
        if let Some(errno) = self.post_error.lock().take() {
            return Err(os_error(errno));
        }
        let vendor_err = self.wc_error.lock().take();

        let mut guard = self.fabric.inner.lock();
        let inner = &mut *guard;
        let key = *inner.qp_handles.get(&qp).ok_or_else(|| os_error(libc::EINVAL))?;
        let st = inner.qps.get_mut(&key).ok_or_else(|| os_error(libc::EINVAL))?;
        if st.qp_type == QpType::XrcRecv {
            return Err(os_error(libc::EINVAL));
        }
        if st.outstanding >= st.max_send_wr {
            return Err(os_error(libc::ENOMEM));
        }
        let cq_handle = st.send_cq.ok_or_else(|| os_error(libc::EINVAL))?;
        let cq = inner.cqs.get_mut(&cq_handle).ok_or_else(|| os_error(libc::EINVAL))?;
        if cq.entries.len() >= cq.cqe {
            return Err(os_error(libc::EOVERFLOW));
        }

        let opcode = match wr.opcode {
            WrOpcode::Send | WrOpcode::SendWithImm(_) => WcOpcode::Send,
            WrOpcode::RdmaWrite { .. } | WrOpcode::RdmaWriteWithImm { .. } => WcOpcode::RdmaWrite,
            WrOpcode::RdmaRead { .. } => WcOpcode::RdmaRead,
        };
        cq.entries.push_back(WorkCompletion {
            wr_id: wr.wr_id,
            status: vendor_err.map_or(WcStatus::Success, WcStatus::Error),
            opcode,
            vendor_err: vendor_err.unwrap_or(0),
            byte_len: wr.total_len() as u32,
            imm_data: 0,
            qp_num: key.1,
            wc_flags: WcFlags::empty(),
        });
        st.outstanding += 1;
        Ok(())
    }

    fn poll_cq(&self, cq: Handle, wc: &mut [WorkCompletion]) -> io::Result<usize> {
        if let Some(errno) = self.poll_error.lock().take() {
            return Err(os_error(errno));
        }
        let mut guard = self.fabric.inner.lock();
        let inner = &mut *guard;
        let cq = inner.cqs.get_mut(&cq).ok_or_else(|| os_error(libc::EINVAL))?;
        let mut n = 0;
        while n < wc.len() {
            let Some(entry) = cq.entries.pop_front() else {
                break;
            };
            if entry.opcode.is_send_side() {
                if let Some(qp) = inner.qps.get_mut(&(cq.device, entry.qp_num)) {
                    qp.outstanding = qp.outstanding.saturating_sub(1);
                }
            }
            wc[n] = entry;
            n += 1;
        }
        Ok(n)
    }
}
