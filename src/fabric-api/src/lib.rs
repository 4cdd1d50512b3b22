//! Plain data types shared by the verbs capability layer and the transport
//! provider built on top of it.
#![allow(missing_docs)]

pub mod handle;
pub use handle::{AsHandle, Handle};

pub mod net;
