//! The verbs and rdma_cm capability surface consumed by the transport.
//!
//! A [`Device`] is the pair of [`ibv::Verbs`] and [`rdmacm::RdmaCm`]. The
//! handle types in this crate own the objects they name and release them
//! through the device on drop.
use std::sync::Arc;

pub mod ibv;
pub mod rdmacm;

#[cfg(feature = "loopback")]
pub mod loopback;

pub trait Device: ibv::Verbs + rdmacm::RdmaCm + Send + Sync {}

impl<T: ibv::Verbs + rdmacm::RdmaCm + Send + Sync> Device for T {}

pub type DeviceRef = Arc<dyn Device>;
