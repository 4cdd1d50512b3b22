//! Passive endpoints: listen for connect requests.
use std::net::SocketAddr;
use std::sync::Arc;

use spin::Mutex;

use fabric_api::{AsHandle, Handle};
use rdma::rdmacm::{CmId, PortSpace};

use crate::connreq::{ConnectionRequest, RequestError};
use crate::domain::Domain;
use crate::eq::{EventQueue, Fid};
use crate::resource::alloc_handle;
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct PepAttr {
    pub src_addr: Option<SocketAddr>,
    /// Defaults to the configured listen backlog.
    pub backlog: Option<i32>,
    /// Defaults to the domain's XRC preference.
    pub xrc: Option<bool>,
}

#[derive(Debug, Default)]
struct PepInner {
    eq: Option<Arc<EventQueue>>,
    id: Option<CmId>,
    bound: bool,
    listening: bool,
}

pub struct PassiveEndpoint {
    handle: Handle,
    domain: Arc<Domain>,
    src_addr: Option<SocketAddr>,
    backlog: i32,
    xrc: bool,
    inner: Mutex<PepInner>,
}

impl std::fmt::Debug for PassiveEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassiveEndpoint")
            .field("handle", &self.handle)
            .field("xrc", &self.xrc)
            .finish()
    }
}

impl AsHandle for PassiveEndpoint {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

impl PassiveEndpoint {
    pub(crate) fn open(domain: &Arc<Domain>, attr: &PepAttr) -> Result<Arc<Self>> {
        let config = domain.config();
        Ok(Arc::new(PassiveEndpoint {
            handle: alloc_handle(),
            domain: Arc::clone(domain),
            src_addr: attr.src_addr,
            backlog: attr.backlog.unwrap_or(config.listen_backlog),
            xrc: attr.xrc.unwrap_or(config.prefer_xrc),
            inner: Mutex::new(PepInner::default()),
        }))
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Whether requests on this endpoint carry XRC connection data.
    #[inline]
    pub fn is_xrc(&self) -> bool {
        self.xrc
    }

    fn create_id(&self, eq: &EventQueue) -> Result<CmId> {
        CmId::create_id(
            self.domain.device(),
            eq.channel(),
            self.handle.0,
            PortSpace::Tcp,
        )
        .map_err(Error::RdmaCm)
    }

    pub fn bind_eq(self: &Arc<Self>, eq: &Arc<EventQueue>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.eq.is_some() {
            return Err(Error::InvalidState("event queue already bound"));
        }
        let id = self.create_id(eq)?;
        if let Some(addr) = self.src_addr {
            id.bind_addr(&addr).map_err(Error::RdmaCm)?;
            inner.bound = true;
        }
        eq.bind(self.handle, Fid::Pep(Arc::downgrade(self)))?;
        inner.id = Some(id);
        inner.eq = Some(Arc::clone(eq));
        Ok(())
    }

    /// Binds the listener to `addr`, re-creating the CM id when it is
    /// already bound.
    pub fn setname(&self, addr: SocketAddr) -> Result<()> {
        if let Some(src) = self.src_addr {
            if src.is_ipv4() != addr.is_ipv4() {
                tracing::info!("address family mismatch, expected: {}, got: {}", src, addr);
                return Err(Error::InvalidArgument("address family mismatch"));
            }
        }
        let mut inner = self.inner.lock();
        if inner.listening {
            return Err(Error::InvalidState("endpoint is listening"));
        }
        let eq = inner
            .eq
            .clone()
            .ok_or(Error::InvalidState("no event queue bound"))?;
        if inner.bound {
            inner.id = None;
            inner.bound = false;
            inner.id = Some(self.create_id(&eq)?);
        }
        let id = inner
            .id
            .as_ref()
            .ok_or(Error::InvalidState("no event queue bound"))?;
        id.bind_addr(&addr).map_err(Error::RdmaCm)?;
        inner.bound = true;
        Ok(())
    }

    pub fn getname(&self) -> Result<SocketAddr> {
        let inner = self.inner.lock();
        match &inner.id {
            Some(id) if inner.bound => id.get_local_addr().map_err(Error::RdmaCm),
            _ => Err(Error::InvalidState("endpoint is not bound")),
        }
    }

    /// Starts listening. Reciprocal XRC connections of endpoints on the
    /// same EQ are directed to this listener.
    pub fn listen(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let (id, eq) = match (&inner.id, &inner.eq) {
            (Some(id), Some(eq)) if inner.bound => (id, eq),
            _ => return Err(Error::InvalidState("endpoint is not bound")),
        };
        id.listen(self.backlog).map_err(Error::RdmaCm)?;
        let addr = id.get_local_addr().map_err(Error::RdmaCm)?;
        tracing::info!("Listening on {}", addr);
        if self.xrc {
            let mut xrc = eq.xrc.lock();
            if xrc.pep_port != 0 && xrc.pep_port != addr.port() {
                tracing::warn!(
                    "eq {} already has a listener on port {}, reciprocal connections now go to {}",
                    eq.as_handle(),
                    xrc.pep_port,
                    addr.port()
                );
            }
            xrc.pep_port = addr.port();
        }
        inner.listening = true;
        Ok(())
    }

    pub fn reject(
        &self,
        connreq: ConnectionRequest,
        param: &[u8],
    ) -> std::result::Result<(), RequestError> {
        if connreq.pep() != self.handle {
            return Err(RequestError::new(
                Error::InvalidArgument("request belongs to another endpoint"),
                connreq,
            ));
        }
        connreq.reject(param)
    }
}

impl Drop for PassiveEndpoint {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        let eq = inner.eq.take();
        let port = match (&inner.id, inner.listening) {
            (Some(id), true) => id.get_local_addr().ok().map(|addr| addr.port()),
            _ => None,
        };
        inner.id = None;
        drop(inner);
        if let Some(eq) = eq {
            eq.unbind(self.handle);
            let mut xrc = eq.xrc.lock();
            if port.is_some() && port == Some(xrc.pep_port) {
                xrc.pep_port = 0;
            }
        }
    }
}
