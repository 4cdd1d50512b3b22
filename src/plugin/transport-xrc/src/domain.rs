//! The resource domain: device, configuration and the shared INI
//! connection pool.
use std::sync::{Arc, Weak};

use spin::Mutex;

use fabric_api::Handle;
use rdma::DeviceRef;

use crate::config::XrcTransportConfig;
use crate::connreq::{ConnectionRequest, RequestError};
use crate::cq::{CompletionQueue, CqAttr};
use crate::ep::{Endpoint, EpAttr, EpType};
use crate::eq::EventQueue;
use crate::ini_conn::{IniConnInfo, IniConnKey, IniConnPool};
use crate::pep::{PassiveEndpoint, PepAttr};
use crate::resource::{alloc_handle, ResourceTable};
use crate::{Error, Result};

pub struct Domain {
    handle: Handle,
    dev: DeviceRef,
    config: XrcTransportConfig,
    /// Serializes every access to the shared INI connections. Never held
    /// across a verbs or rdma_cm call.
    pub(crate) ini_mgmt_lock: Mutex<IniConnPool>,
    pub(crate) eps: ResourceTable<Weak<Endpoint>>,
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("handle", &self.handle)
            .field("config", &self.config)
            .finish()
    }
}

impl Domain {
    pub fn open(dev: DeviceRef, config: XrcTransportConfig) -> Result<Arc<Self>> {
        if config.cq_size == 0 || config.reap_batch == 0 || config.cqread_bunch_size == 0 {
            return Err(Error::InvalidArgument("CQ sizes must be positive"));
        }
        if config.def_tx_size == 0 || config.def_rx_size == 0 {
            return Err(Error::InvalidArgument("queue sizes must be positive"));
        }
        let handle = alloc_handle();
        tracing::info!(
            "opened domain {}, xrc: {}, completion mode: {:?}",
            handle,
            config.prefer_xrc,
            config.completion_mode
        );
        Ok(Arc::new(Domain {
            handle,
            dev,
            config,
            ini_mgmt_lock: Mutex::new(IniConnPool::new()),
            eps: ResourceTable::default(),
        }))
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn device(&self) -> &DeviceRef {
        &self.dev
    }

    #[inline]
    pub fn config(&self) -> &XrcTransportConfig {
        &self.config
    }

    #[inline]
    pub fn use_xrc(&self) -> bool {
        self.config.prefer_xrc
    }

    pub fn cq_open(self: &Arc<Self>, attr: &CqAttr) -> Result<Arc<CompletionQueue>> {
        CompletionQueue::open(&self.dev, &self.config, attr)
    }

    pub fn eq_open(self: &Arc<Self>) -> Result<Arc<EventQueue>> {
        EventQueue::open(self)
    }

    /// Endpoint attributes filled in from the configuration.
    pub fn ep_attr(&self) -> EpAttr {
        EpAttr {
            ep_type: if self.use_xrc() { EpType::Xrc } else { EpType::Msg },
            tx_size: self.config.def_tx_size,
            rx_size: self.config.def_rx_size,
            inject_size: self.config.def_inline_size,
            ..EpAttr::default()
        }
    }

    pub fn endpoint(self: &Arc<Self>, attr: &EpAttr) -> Result<Arc<Endpoint>> {
        Endpoint::open(self, attr)
    }

    /// Opens the endpoint that will accept `connreq`. The request is
    /// handed back if the endpoint cannot take it.
    pub fn endpoint_from_request(
        self: &Arc<Self>,
        attr: &EpAttr,
        connreq: ConnectionRequest,
    ) -> std::result::Result<Arc<Endpoint>, RequestError> {
        let want = if connreq.xrc().is_some() { EpType::Xrc } else { EpType::Msg };
        if attr.ep_type != want {
            return Err(RequestError::new(
                Error::InvalidArgument("endpoint type does not match the request"),
                connreq,
            ));
        }
        if connreq.xrc().map_or(false, |xrc| xrc.is_reciprocal) {
            return Err(RequestError::new(
                Error::InvalidArgument("reciprocal requests are accepted internally"),
                connreq,
            ));
        }
        match Endpoint::open(self, attr) {
            Ok(ep) => {
                ep.inner.lock().connreq = Some(connreq);
                Ok(ep)
            }
            Err(e) => Err(RequestError::new(e, connreq)),
        }
    }

    pub fn passive_ep(self: &Arc<Self>, attr: &PepAttr) -> Result<Arc<PassiveEndpoint>> {
        PassiveEndpoint::open(self, attr)
    }

    pub(crate) fn endpoint_ref(&self, handle: Handle) -> Option<Arc<Endpoint>> {
        self.eps.get(handle).ok().and_then(|ep| ep.upgrade())
    }

    /// A copy of the shared INI connection record for `key`.
    pub fn ini_conn_info(&self, key: &IniConnKey) -> Option<IniConnInfo> {
        self.ini_mgmt_lock.lock().get(key).map(|conn| conn.info())
    }

    pub fn ini_conn_count(&self) -> usize {
        self.ini_mgmt_lock.lock().len()
    }
}
