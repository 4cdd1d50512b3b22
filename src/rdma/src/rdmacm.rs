use std::fmt;
use std::io;
use std::net::SocketAddr;

use fabric_api::net::ConnParam;
use fabric_api::{AsHandle, Handle};

use crate::DeviceRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventType {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    TimewaitExit,
}

impl CmEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmEventType::AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            CmEventType::AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            CmEventType::RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            CmEventType::RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            CmEventType::ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            CmEventType::ConnectResponse => "RDMA_CM_EVENT_CONNECT_RESPONSE",
            CmEventType::ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            CmEventType::Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            CmEventType::Rejected => "RDMA_CM_EVENT_REJECTED",
            CmEventType::Established => "RDMA_CM_EVENT_ESTABLISHED",
            CmEventType::Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
            CmEventType::DeviceRemoval => "RDMA_CM_EVENT_DEVICE_REMOVAL",
            CmEventType::TimewaitExit => "RDMA_CM_EVENT_TIMEWAIT_EXIT",
        }
    }
}

/// An event retrieved from an [`EventChannel`].
///
/// `context` is the user context of `id` at the time the event was
/// generated. For a connect request it is the context of the listener.
#[derive(Debug, Clone)]
pub struct CmEvent {
    pub event: CmEventType,
    pub status: i32,
    pub id: Handle,
    pub listen_id: Option<Handle>,
    pub context: u64,
    /// Private data and remote QP number carried by connect requests,
    /// accepts (seen in ESTABLISHED on the active side) and rejects.
    pub param: ConnParam,
}

impl fmt::Display for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event.as_str())
    }
}

impl CmEvent {
    #[inline]
    pub fn private_data(&self) -> &[u8] {
        self.param.private_data()
    }

    /// Only valid for a new connect request. Takes ownership of the newly
    /// created rdma_cm_id; dropping the returned `CmId` destroys it.
    pub fn take_request(&self, dev: &DeviceRef) -> io::Result<CmId> {
        if self.event != CmEventType::ConnectRequest || self.status != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(CmId {
            handle: self.id,
            dev: DeviceRef::clone(dev),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpace {
    Tcp,
    Ib,
}

/// rdma_cm operations.
///
/// All calls are non-blocking. `get_cm_event` returns `WouldBlock` when the
/// channel has nothing to deliver.
pub trait RdmaCm {
    fn create_event_channel(&self) -> io::Result<Handle>;
    fn destroy_event_channel(&self, channel: Handle) -> io::Result<()>;
    fn get_cm_event(&self, channel: Handle) -> io::Result<CmEvent>;

    fn create_id(&self, channel: Handle, context: u64, ps: PortSpace) -> io::Result<Handle>;
    fn destroy_id(&self, id: Handle) -> io::Result<()>;
    fn set_context(&self, id: Handle, context: u64) -> io::Result<()>;

    fn bind_addr(&self, id: Handle, addr: &SocketAddr) -> io::Result<()>;
    fn resolve_addr(&self, id: Handle, dst: &SocketAddr) -> io::Result<()>;
    fn listen(&self, id: Handle, backlog: i32) -> io::Result<()>;

    fn connect(&self, id: Handle, conn_param: &ConnParam) -> io::Result<()>;
    fn accept(&self, id: Handle, conn_param: &ConnParam) -> io::Result<()>;
    fn reject(&self, id: Handle, private_data: &[u8]) -> io::Result<()>;
    fn disconnect(&self, id: Handle) -> io::Result<()>;

    fn local_addr(&self, id: Handle) -> io::Result<SocketAddr>;
    fn peer_addr(&self, id: Handle) -> io::Result<SocketAddr>;
}

pub struct EventChannel {
    handle: Handle,
    dev: DeviceRef,
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventChannel").field(&self.handle).finish()
    }
}

impl AsHandle for EventChannel {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

impl EventChannel {
    pub fn create_event_channel(dev: &DeviceRef) -> io::Result<Self> {
        let handle = dev.create_event_channel()?;
        Ok(EventChannel {
            handle,
            dev: DeviceRef::clone(dev),
        })
    }

    #[inline]
    pub fn get_cm_event(&self) -> io::Result<CmEvent> {
        self.dev.get_cm_event(self.handle)
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        if let Err(e) = self.dev.destroy_event_channel(self.handle) {
            log::debug!("error occured when destroying event channel: {:?}", e);
        }
    }
}

pub struct CmId {
    handle: Handle,
    dev: DeviceRef,
}

impl fmt::Debug for CmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CmId").field(&self.handle).finish()
    }
}

impl AsHandle for CmId {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

impl Drop for CmId {
    fn drop(&mut self) {
        log::debug!("dropping CmId {} in rdmacm", self.handle);
        if let Err(e) = self.dev.destroy_id(self.handle) {
            log::debug!("error occured when destroying cm_id: {:?}", e);
        }
    }
}

impl CmId {
    pub fn create_id(
        dev: &DeviceRef,
        channel: &EventChannel,
        context: u64,
        ps: PortSpace,
    ) -> io::Result<Self> {
        let handle = dev.create_id(channel.handle, context, ps)?;
        Ok(CmId {
            handle,
            dev: DeviceRef::clone(dev),
        })
    }

    #[inline]
    pub fn set_context(&self, context: u64) -> io::Result<()> {
        self.dev.set_context(self.handle, context)
    }

    #[inline]
    pub fn bind_addr(&self, sockaddr: &SocketAddr) -> io::Result<()> {
        self.dev.bind_addr(self.handle, sockaddr)
    }

    #[inline]
    pub fn resolve_addr(&self, sockaddr: &SocketAddr) -> io::Result<()> {
        self.dev.resolve_addr(self.handle, sockaddr)
    }

    #[inline]
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.dev.listen(self.handle, backlog)
    }

    #[inline]
    pub fn connect(&self, conn_param: &ConnParam) -> io::Result<()> {
        self.dev.connect(self.handle, conn_param)
    }

    #[inline]
    pub fn accept(&self, conn_param: &ConnParam) -> io::Result<()> {
        self.dev.accept(self.handle, conn_param)
    }

    #[inline]
    pub fn reject(&self, private_data: &[u8]) -> io::Result<()> {
        self.dev.reject(self.handle, private_data)
    }

    #[inline]
    pub fn disconnect(&self) -> io::Result<()> {
        self.dev.disconnect(self.handle)
    }

    #[inline]
    pub fn get_local_addr(&self) -> io::Result<SocketAddr> {
        self.dev.local_addr(self.handle)
    }

    #[inline]
    pub fn get_peer_addr(&self) -> io::Result<SocketAddr> {
        self.dev.peer_addr(self.handle)
    }
}

/// IB CM reject reason: no listener for the requested service.
pub const REJ_INVALID_SERVICE_ID: i32 = 8;
/// IB CM reject reason: rejected by the remote consumer, private data attached.
pub const REJ_CONSUMER_DEFINED: i32 = 28;
