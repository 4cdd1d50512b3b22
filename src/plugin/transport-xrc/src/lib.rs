//! A message transport over verbs with XRC connection sharing.
//!
//! The provider exposes domains, event queues, completion queues, active and
//! passive endpoints on top of an [`rdma::Device`]. XRC endpoints that talk
//! to the same peer host through the same send CQ share one physical INI
//! queue pair; each logical connection is still established in both
//! directions through rdma_cm, correlated by a connection tag.
pub mod config;
pub mod logging;

mod error;
pub use error::{Error, Result};

pub(crate) mod resource;

pub mod cm_data;
pub mod conn_tag;
pub mod connreq;
pub mod cq;
pub mod domain;
pub mod ep;
pub mod eq;
pub mod ini_conn;
pub mod pep;
mod xrc;

pub use config::{CompletionMode, XrcTransportConfig};
pub use connreq::{ConnectionRequest, RequestError, XrcConnInfo};
pub use cq::{CompletionFlags, CompletionQueue, CqAttr, CqEntry, CqErrEntry};
pub use domain::Domain;
pub use ep::{BindFlags, Endpoint, EpAttr, EpType, OpFlags};
pub use eq::{EqError, EqEvent, EventQueue};
pub use pep::{PassiveEndpoint, PepAttr};
pub use xrc::XrcConnState;
