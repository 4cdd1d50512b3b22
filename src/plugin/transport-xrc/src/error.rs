use std::io;

use thiserror::Error;

use crate::resource::Error as ResourceError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Resource temporarily unavailable")]
    Again,
    #[error("Operation not supported in current state: {0}")]
    InvalidState(&'static str),
    #[error("Resource not found in table")]
    NotFound,
    #[error("Resource exists in table")]
    Exists,
    #[error("Error completion available")]
    ErrAvail,
    #[error("rdmacm internal error: {0}")]
    RdmaCm(io::Error),
    #[error("ibv internal error: {0}")]
    Ibv(io::Error),
}

impl Error {
    /// The negated errno reported to applications.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -libc::EINVAL,
            Error::ResourceExhausted(_) => -libc::ENOSPC,
            Error::ConnectionRefused => -libc::ECONNREFUSED,
            Error::ConnectionAborted => -libc::ECONNABORTED,
            Error::Again => -libc::EAGAIN,
            Error::InvalidState(_) => -libc::EOPNOTSUPP,
            Error::NotFound => -libc::ENOENT,
            Error::Exists => -libc::EEXIST,
            Error::ErrAvail => -libc::EIO,
            Error::RdmaCm(e) | Error::Ibv(e) => -e.raw_os_error().unwrap_or(libc::EIO).abs(),
        }
    }
}

impl From<ResourceError> for Error {
    fn from(other: ResourceError) -> Self {
        match other {
            ResourceError::NotFound => Error::NotFound,
            ResourceError::Exists => Error::Exists,
        }
    }
}
