//! Message endpoints.
//!
//! An endpoint is either a plain RC endpoint, owning one queue pair and one
//! CM id, or an XRC endpoint (see `xrc.rs`) sending through a shared INI
//! queue pair and receiving through its own SRQ.
use std::net::SocketAddr;
use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use fabric_api::net::{ConnParam, QpCapability, QpType, RemoteKey, SendFlags};
use fabric_api::{AsHandle, Handle};
use rdma::ibv::{QpInitAttr, QueuePair, SendWr, Sge, WrOpcode};
use rdma::rdmacm::{CmEvent, CmEventType, CmId, PortSpace};

use crate::cm_data;
use crate::connreq::ConnectionRequest;
use crate::cq::{CompletionQueue, NO_COMP_FLAG};
use crate::domain::Domain;
use crate::eq::{run_deferred, CmOutcome, EqError, EqEvent, EventQueue, Fid};
use crate::resource::alloc_handle;
use crate::xrc::{XrcConnState, XrcEp};
use crate::{Error, Result};

const RDMA_MAX_RESP_RES: u8 = 0xff;
const RDMA_MAX_INIT_DEPTH: u8 = 0xff;

bitflags! {
    /// Per-operation flags.
    #[derive(Default)]
    pub struct OpFlags: u64 {
        /// Generate a completion the application can read.
        const COMPLETION = 1 << 0;
        /// The buffer can be reused as soon as the call returns.
        const INJECT = 1 << 1;
        const FENCE = 1 << 2;
        const REMOTE_CQ_DATA = 1 << 3;
    }

    pub struct BindFlags: u32 {
        const TRANSMIT = 1 << 0;
        const RECV = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpType {
    /// Reliable connected.
    Msg,
    /// Reliable connected over XRC queue pairs.
    Xrc,
}

#[derive(Debug, Clone)]
pub struct EpAttr {
    pub ep_type: EpType,
    pub tx_size: u32,
    pub rx_size: u32,
    /// Sends up to this size are posted inline.
    pub inject_size: usize,
    /// Flags applied to `send`, `write` and `read`.
    pub tx_op_flags: OpFlags,
    pub src_addr: Option<SocketAddr>,
}

impl Default for EpAttr {
    fn default() -> Self {
        EpAttr {
            ep_type: EpType::Msg,
            tx_size: 384,
            rx_size: 384,
            inject_size: 256,
            tx_op_flags: OpFlags::COMPLETION,
            src_addr: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct EpInner {
    pub(crate) eq: Option<Arc<EventQueue>>,
    pub(crate) tx_cq: Option<Arc<CompletionQueue>>,
    pub(crate) rx_cq: Option<Arc<CompletionQueue>>,
    /// RC: the connection. XRC: the INI side of the connection.
    pub(crate) id: Option<CmId>,
    pub(crate) qp: Option<QueuePair>,
    pub(crate) connreq: Option<ConnectionRequest>,
    pub(crate) connected: bool,
    pub(crate) shutdown_reported: bool,
    pub(crate) xrc: Option<XrcEp>,
}

impl EpInner {
    pub(crate) fn bound_eq(&self) -> Result<Arc<EventQueue>> {
        self.eq
            .clone()
            .ok_or(Error::InvalidState("no event queue bound"))
    }
}

pub struct Endpoint {
    handle: Handle,
    pub(crate) domain: Arc<Domain>,
    pub(crate) attr: EpAttr,
    pub(crate) inner: Mutex<EpInner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("handle", &self.handle)
            .field("attr", &self.attr)
            .finish()
    }
}

impl AsHandle for Endpoint {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

impl Endpoint {
    pub(crate) fn open(domain: &Arc<Domain>, attr: &EpAttr) -> Result<Arc<Self>> {
        if attr.tx_size == 0 || attr.rx_size == 0 {
            return Err(Error::InvalidArgument("queue sizes must be positive"));
        }
        let inner = EpInner {
            xrc: (attr.ep_type == EpType::Xrc).then(XrcEp::new),
            ..EpInner::default()
        };
        let ep = Arc::new(Endpoint {
            handle: alloc_handle(),
            domain: Arc::clone(domain),
            attr: attr.clone(),
            inner: Mutex::new(inner),
        });
        domain.eps.insert(ep.handle, Arc::downgrade(&ep))?;
        tracing::debug!("opened endpoint {}, type: {:?}", ep.handle, attr.ep_type);
        Ok(ep)
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn attr(&self) -> &EpAttr {
        &self.attr
    }

    /// Connection state of an XRC endpoint.
    pub fn conn_state(&self) -> Option<XrcConnState> {
        self.inner.lock().xrc.as_ref().map(|xrc| xrc.conn_state)
    }

    /// Number of the queue pair sends are posted on.
    pub fn qp_num(&self) -> Option<u32> {
        let inner = self.inner.lock();
        match &inner.xrc {
            Some(xrc) => xrc.ini_qp.map(|(_, qpn)| qpn),
            None => inner.qp.as_ref().map(QueuePair::qp_num),
        }
    }

    pub fn bind_eq(self: &Arc<Self>, eq: &Arc<EventQueue>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.eq.is_some() {
            return Err(Error::InvalidState("event queue already bound"));
        }
        if let Some(connreq) = &inner.connreq {
            if connreq.eq() != eq.as_handle() {
                return Err(Error::InvalidArgument(
                    "request arrived on a different event queue",
                ));
            }
        }
        eq.bind(self.handle, Fid::Ep(Arc::downgrade(self)))?;
        inner.eq = Some(Arc::clone(eq));
        Ok(())
    }

    pub fn bind_cq(&self, cq: &Arc<CompletionQueue>, flags: BindFlags) -> Result<()> {
        if flags.is_empty() {
            return Err(Error::InvalidArgument("no CQ direction given"));
        }
        let mut inner = self.inner.lock();
        if (flags.contains(BindFlags::TRANSMIT) && inner.tx_cq.is_some())
            || (flags.contains(BindFlags::RECV) && inner.rx_cq.is_some())
        {
            return Err(Error::InvalidState("CQ already bound"));
        }
        if flags.contains(BindFlags::TRANSMIT) {
            inner.tx_cq = Some(Arc::clone(cq));
        }
        if flags.contains(BindFlags::RECV) {
            inner.rx_cq = Some(Arc::clone(cq));
        }
        Ok(())
    }

    pub fn enable(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.enable_locked(&mut inner)
    }

    pub(crate) fn enable_locked(&self, inner: &mut EpInner) -> Result<()> {
        if inner.eq.is_none() || inner.tx_cq.is_none() || inner.rx_cq.is_none() {
            return Err(Error::InvalidState("endpoint is not bound"));
        }
        if inner.xrc.is_some() {
            self.xrc_create_srq(inner)?;
        }
        Ok(())
    }

    pub(crate) fn qp_init_attr(&self, inner: &EpInner, qp_type: QpType) -> QpInitAttr {
        let cap = QpCapability {
            max_send_wr: self.attr.tx_size,
            max_recv_wr: self.attr.rx_size,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: u32::try_from(self.attr.inject_size).unwrap_or(u32::MAX),
        };
        let tx_cq = inner.tx_cq.as_ref().map(|cq| cq.as_handle());
        match qp_type {
            QpType::RC => QpInitAttr {
                qp_type,
                send_cq: tx_cq,
                recv_cq: inner.rx_cq.as_ref().map(|cq| cq.as_handle()),
                srq: None,
                cap,
                sq_sig_all: false,
            },
            QpType::XrcSend => QpInitAttr {
                qp_type,
                send_cq: tx_cq,
                recv_cq: None,
                srq: None,
                cap: QpCapability {
                    max_recv_wr: 0,
                    max_recv_sge: 0,
                    ..cap
                },
                sq_sig_all: false,
            },
            QpType::XrcRecv => QpInitAttr {
                qp_type,
                send_cq: None,
                recv_cq: None,
                srq: inner
                    .xrc
                    .as_ref()
                    .and_then(|xrc| xrc.srq.as_ref())
                    .map(|srq| srq.as_handle()),
                cap: QpCapability::default(),
                sq_sig_all: false,
            },
        }
    }

    pub(crate) fn conn_param(&self, private_data: Vec<u8>, qp_num: u32, srq: bool) -> ConnParam {
        let config = self.domain.config();
        ConnParam {
            private_data: Some(private_data),
            responder_resources: RDMA_MAX_RESP_RES,
            initiator_depth: RDMA_MAX_INIT_DEPTH,
            flow_control: 1,
            retry_count: config.cm_retry_count,
            rnr_retry_count: config.rnr_retry_count,
            srq: srq as u8,
            qp_num,
        }
    }

    /// Creates a CM id on the bound EQ, bound to the source address if one
    /// is configured and resolved towards `dst`.
    pub(crate) fn create_active_id(&self, eq: &EventQueue, dst: &SocketAddr) -> Result<CmId> {
        let id = CmId::create_id(
            self.domain.device(),
            eq.channel(),
            self.handle.0,
            PortSpace::Tcp,
        )
        .map_err(Error::RdmaCm)?;
        if let Some(src) = self.attr.src_addr {
            id.bind_addr(&SocketAddr::new(src.ip(), 0))
                .map_err(Error::RdmaCm)?;
        }
        id.resolve_addr(dst).map_err(Error::RdmaCm)?;
        Ok(id)
    }

    pub fn connect(&self, addr: SocketAddr, param: &[u8]) -> Result<()> {
        tracing::debug!("Connect, ep: {}, addr: {}, paramlen: {}", self.handle, addr, param.len());
        let mut inner = self.inner.lock();
        if inner.xrc.is_none() {
            return self.connect_rc(&mut inner, addr, param);
        }
        let mut sched = Vec::new();
        let res = self.connect_xrc(&mut inner, addr, param, &mut sched);
        drop(inner);
        run_deferred(&self.domain, sched);
        res
    }

    fn connect_rc(&self, inner: &mut EpInner, addr: SocketAddr, param: &[u8]) -> Result<()> {
        if inner.id.is_some() || inner.connreq.is_some() {
            return Err(Error::InvalidState("endpoint already connecting"));
        }
        let data = cm_data::rc_private_data(param)?;
        self.enable_locked(inner)?;
        let eq = inner.bound_eq()?;

        let id = self.create_active_id(&eq, &addr)?;
        let qp = QueuePair::create(self.domain.device(), &self.qp_init_attr(inner, QpType::RC))
            .map_err(Error::Ibv)?;
        id.connect(&self.conn_param(data, qp.qp_num(), false))
            .map_err(Error::RdmaCm)?;
        inner.id = Some(id);
        inner.qp = Some(qp);
        Ok(())
    }

    /// Accepts the request this endpoint was opened for.
    pub fn accept(&self, param: &[u8]) -> Result<()> {
        tracing::debug!("Accept, ep: {}, paramlen: {}", self.handle, param.len());
        let mut inner = self.inner.lock();
        if inner.connreq.is_none() {
            return Err(Error::InvalidState("endpoint has no pending request"));
        }
        if inner.xrc.is_none() {
            return self.accept_rc(&mut inner, param);
        }
        let mut sched = Vec::new();
        let res = self.accept_xrc(&mut inner, param, &mut sched);
        drop(inner);
        run_deferred(&self.domain, sched);
        res
    }

    fn accept_rc(&self, inner: &mut EpInner, param: &[u8]) -> Result<()> {
        let data = cm_data::rc_private_data(param)?;
        self.enable_locked(inner)?;
        let connreq = inner
            .connreq
            .take()
            .ok_or(Error::InvalidState("endpoint has no pending request"))?;

        let id = connreq.into_id();
        id.set_context(self.handle.0).map_err(Error::RdmaCm)?;
        let qp = QueuePair::create(self.domain.device(), &self.qp_init_attr(inner, QpType::RC))
            .map_err(Error::Ibv)?;
        id.accept(&self.conn_param(data, qp.qp_num(), false))
            .map_err(Error::RdmaCm)?;
        inner.id = Some(id);
        inner.qp = Some(qp);
        Ok(())
    }

    /// Disconnects the endpoint. The peer and this endpoint each see one
    /// [`EqEvent::Shutdown`].
    pub fn shutdown(&self) -> Result<()> {
        tracing::debug!("Shutdown, ep: {}", self.handle);
        let inner = self.inner.lock();
        match &inner.xrc {
            Some(xrc) => {
                for id in inner.id.iter().chain(xrc.tgt_id.iter()) {
                    match id.disconnect() {
                        Ok(()) => {}
                        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                            tracing::trace!("{:?} is not connected", id);
                        }
                        Err(e) => return Err(Error::RdmaCm(e)),
                    }
                }
                Ok(())
            }
            None => match &inner.id {
                Some(id) => id.disconnect().map_err(Error::RdmaCm),
                None => Ok(()),
            },
        }
    }

    fn any_id<'a>(inner: &'a EpInner) -> Option<&'a CmId> {
        inner
            .id
            .as_ref()
            .or_else(|| inner.xrc.as_ref().and_then(|xrc| xrc.tgt_id.as_ref()))
    }

    pub fn getname(&self) -> Result<SocketAddr> {
        let inner = self.inner.lock();
        match Self::any_id(&inner) {
            Some(id) => id.get_local_addr().map_err(Error::RdmaCm),
            None => self
                .attr
                .src_addr
                .ok_or(Error::InvalidState("endpoint has no address")),
        }
    }

    pub fn getpeer(&self) -> Result<SocketAddr> {
        let inner = self.inner.lock();
        if let Some(connreq) = &inner.connreq {
            return connreq
                .peer_addr()
                .ok_or(Error::InvalidState("endpoint has no peer"));
        }
        match Self::any_id(&inner) {
            Some(id) => id.get_peer_addr().map_err(Error::RdmaCm),
            None => Err(Error::InvalidState("endpoint has no peer")),
        }
    }

    /// Runs on the EQ thread for every CM event of this endpoint's ids.
    pub(crate) fn handle_cm_event(&self, event: &CmEvent) -> CmOutcome {
        let mut out = CmOutcome::default();
        let mut inner = self.inner.lock();
        if inner.xrc.is_some() {
            self.xrc_cm_event(&mut inner, event, &mut out);
        } else {
            self.rc_cm_event(&mut inner, event, &mut out);
        }
        out
    }

    fn rc_cm_event(&self, inner: &mut EpInner, event: &CmEvent, out: &mut CmOutcome) {
        if inner.id.as_ref().map(|id| id.as_handle()) != Some(event.id) {
            tracing::debug!("ignoring {} for a previous id of ep {}", event, self.handle);
            return;
        }
        match event.event {
            CmEventType::Established => {
                inner.connected = true;
                out.events.push(EqEvent::Connected {
                    fid: self.handle,
                    data: cm_data::decode_hdr(event.private_data()).to_vec(),
                });
            }
            CmEventType::Rejected
            | CmEventType::Unreachable
            | CmEventType::ConnectError
            | CmEventType::AddrError
            | CmEventType::RouteError => {
                tracing::debug!("connection of ep {} failed: {}", self.handle, event);
                inner.id = None;
                inner.qp = None;
                out.events.push(EqEvent::Error(EqError {
                    fid: self.handle,
                    err: libc::ECONNREFUSED,
                    prov_errno: event.status,
                    err_data: cm_data::decode_hdr(event.private_data()).to_vec(),
                }));
            }
            CmEventType::Disconnected => {
                if inner.connected {
                    inner.connected = false;
                    if !inner.shutdown_reported {
                        inner.shutdown_reported = true;
                        out.events.push(EqEvent::Shutdown { fid: self.handle });
                    }
                } else if !inner.shutdown_reported {
                    inner.id = None;
                    inner.qp = None;
                    out.events.push(EqEvent::Error(EqError {
                        fid: self.handle,
                        err: libc::ECONNABORTED,
                        prov_errno: 0,
                        err_data: Vec::new(),
                    }));
                }
            }
            _ => tracing::trace!("ignoring {} on ep {}", event, self.handle),
        }
    }

    /// Resolves where a send WR goes: QP handle, transmit CQ and, for XRC,
    /// the remote SRQ.
    fn tx_target(&self) -> Result<(Handle, Arc<CompletionQueue>, Option<u32>)> {
        let inner = self.inner.lock();
        let cq = inner
            .tx_cq
            .clone()
            .ok_or(Error::InvalidState("no transmit CQ bound"))?;
        match &inner.xrc {
            Some(xrc) => {
                if xrc.conn_state != XrcConnState::Connected {
                    return Err(Error::InvalidState("endpoint is not connected"));
                }
                let (qp, _) = xrc
                    .ini_qp
                    .ok_or(Error::InvalidState("endpoint is not connected"))?;
                Ok((qp, cq, Some(xrc.peer_srqn)))
            }
            None => match &inner.qp {
                Some(qp) if inner.connected => Ok((qp.as_handle(), cq, None)),
                _ => Err(Error::InvalidState("endpoint is not connected")),
            },
        }
    }

    fn post(&self, opcode: WrOpcode, sg_list: Vec<Sge>, context: u64, flags: OpFlags) -> Result<()> {
        let (qp, cq, remote_srqn) = self.tx_target()?;
        let len: usize = sg_list.iter().map(|sge| sge.length as usize).sum();

        let mut send_flags = SendFlags::SIGNALED;
        let can_inline = !matches!(opcode, WrOpcode::RdmaRead { .. });
        if flags.contains(OpFlags::INJECT) {
            if !can_inline || len > self.attr.inject_size {
                return Err(Error::InvalidArgument("message too large to inject"));
            }
            send_flags |= SendFlags::INLINE;
        } else if can_inline && len <= self.attr.inject_size {
            send_flags |= SendFlags::INLINE;
        }
        if flags.contains(OpFlags::FENCE) {
            send_flags |= SendFlags::FENCE;
        }

        let wr = SendWr {
            wr_id: if flags.contains(OpFlags::COMPLETION) {
                context
            } else {
                NO_COMP_FLAG
            },
            sg_list,
            opcode,
            send_flags,
            remote_srqn,
        };
        cq.post_send(qp, &wr)
    }

    fn sge(addr: *const u8, len: usize, lkey: u32) -> Result<Sge> {
        let length = u32::try_from(len).map_err(|_| Error::InvalidArgument("buffer too large"))?;
        Ok(Sge {
            addr: addr as u64,
            length,
            lkey,
        })
    }

    /// # Safety
    ///
    /// `buf` must stay valid and unmodified until the completion for
    /// `context` has been read from the transmit CQ.
    pub unsafe fn send(&self, buf: &[u8], lkey: u32, context: u64) -> Result<()> {
        let sge = Self::sge(buf.as_ptr(), buf.len(), lkey)?;
        self.post(WrOpcode::Send, vec![sge], context, self.attr.tx_op_flags)
    }

    /// # Safety
    ///
    /// Every buffer in `sg_list` must stay valid until the completion for
    /// `context` has been read, unless `flags` contains
    /// [`OpFlags::INJECT`].
    pub unsafe fn sendmsg(
        &self,
        sg_list: &[Sge],
        imm: Option<u32>,
        context: u64,
        flags: OpFlags,
    ) -> Result<()> {
        let opcode = match imm {
            Some(imm) if flags.contains(OpFlags::REMOTE_CQ_DATA) => WrOpcode::SendWithImm(imm),
            Some(_) => return Err(Error::InvalidArgument("immediate data needs REMOTE_CQ_DATA")),
            None => WrOpcode::Send,
        };
        self.post(opcode, sg_list.to_vec(), context, flags)
    }

    /// Sends `buf` inline. No completion is generated and `buf` can be
    /// reused right away.
    pub fn inject(&self, buf: &[u8]) -> Result<()> {
        let sge = Self::sge(buf.as_ptr(), buf.len(), 0)?;
        self.post(WrOpcode::Send, vec![sge], 0, OpFlags::INJECT)
    }

    /// # Safety
    ///
    /// `buf` must stay valid until the completion for `context` has been
    /// read from the transmit CQ.
    pub unsafe fn write(
        &self,
        buf: &[u8],
        lkey: u32,
        remote: RemoteKey,
        context: u64,
    ) -> Result<()> {
        let sge = Self::sge(buf.as_ptr(), buf.len(), lkey)?;
        let opcode = WrOpcode::RdmaWrite {
            remote_addr: remote.addr,
            rkey: remote.rkey,
        };
        self.post(opcode, vec![sge], context, self.attr.tx_op_flags)
    }

    /// # Safety
    ///
    /// `buf` must stay valid, and must not be read, until the completion
    /// for `context` has been read from the transmit CQ.
    pub unsafe fn read(
        &self,
        buf: &mut [u8],
        lkey: u32,
        remote: RemoteKey,
        context: u64,
    ) -> Result<()> {
        let sge = Self::sge(buf.as_ptr(), buf.len(), lkey)?;
        let opcode = WrOpcode::RdmaRead {
            remote_addr: remote.addr,
            rkey: remote.rkey,
        };
        self.post(opcode, vec![sge], context, self.attr.tx_op_flags)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        tracing::debug!("closing endpoint {}", self.handle);
        let mut inner = self.inner.lock();
        let sched = if inner.xrc.is_some() {
            self.xrc_close(&mut inner)
        } else {
            Vec::new()
        };
        let eq = inner.eq.take();
        inner.id = None;
        inner.qp = None;
        drop(inner);

        if let Some(eq) = eq {
            eq.unbind(self.handle);
        }
        let _ = self.domain.eps.remove(self.handle);
        run_deferred(&self.domain, sched);
    }
}
