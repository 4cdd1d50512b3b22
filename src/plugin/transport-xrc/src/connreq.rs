//! Inbound connection requests.
use std::net::SocketAddr;

use fabric_api::{AsHandle, Handle};
use rdma::rdmacm::{CmEvent, CmId};
use rdma::DeviceRef;

use crate::cm_data::{self, XrcCmData};
use crate::{Error, Result};

/// XRC metadata carried by a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XrcConnInfo {
    pub conn_tag: u32,
    pub is_reciprocal: bool,
    /// Listener port of the originating side, target of the reciprocal
    /// connection.
    pub port: u16,
    /// TGT QP number the originator already shares with us, or 0.
    pub conn_param: u32,
    pub ini_qpn: u32,
}

/// A passive-side connect request, waiting to be accepted or rejected.
///
/// Accepting goes through [`crate::Domain::endpoint_from_request`] and
/// [`crate::Endpoint::accept`], rejecting through
/// [`crate::PassiveEndpoint::reject`]. Either call consumes the request
/// unless it fails, in which case [`RequestError`] hands it back.
/// Dropping it destroys the CM id, which refuses the peer.
#[derive(Debug)]
pub struct ConnectionRequest {
    id: CmId,
    eq: Handle,
    pep: Handle,
    peer_addr: Option<SocketAddr>,
    data: Vec<u8>,
    xrc: Option<XrcConnInfo>,
}

impl ConnectionRequest {
    /// Takes ownership of the CM id of a connect request and parses its
    /// private data. A request that cannot be parsed is rejected here.
    pub(crate) fn from_event(
        dev: &DeviceRef,
        eq: Handle,
        pep: Handle,
        xrc: bool,
        event: &CmEvent,
    ) -> Result<Self> {
        let id = event.take_request(dev).map_err(Error::RdmaCm)?;
        let peer_addr = id.get_peer_addr().ok();

        if !xrc {
            return Ok(ConnectionRequest {
                id,
                eq,
                pep,
                peer_addr,
                data: cm_data::decode_hdr(event.private_data()).to_vec(),
                xrc: None,
            });
        }

        let (hdr, payload) = match cm_data::xrc_payload(event.private_data()) {
            Ok(parsed) => parsed,
            Err(e) => {
                if let Err(e) = id.reject(&[]) {
                    tracing::debug!("rejecting malformed request {:?}: {}", id, e);
                }
                return Err(e);
            }
        };
        Ok(ConnectionRequest {
            id,
            eq,
            pep,
            peer_addr,
            data: payload.to_vec(),
            xrc: Some(XrcConnInfo {
                conn_tag: hdr.conn_tag,
                is_reciprocal: hdr.reciprocal,
                port: hdr.port,
                conn_param: hdr.param,
                ini_qpn: event.param.qp_num,
            }),
        })
    }

    /// The passive endpoint the request arrived on.
    #[inline]
    pub fn pep(&self) -> Handle {
        self.pep
    }

    #[inline]
    pub(crate) fn eq(&self) -> Handle {
        self.eq
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Application data sent with the request.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn xrc(&self) -> Option<&XrcConnInfo> {
        self.xrc.as_ref()
    }

    pub(crate) fn into_id(self) -> CmId {
        self.id
    }

    /// Private data of a reject carrying `param`.
    fn reject_data(&self, param: &[u8]) -> Result<Vec<u8>> {
        match &self.xrc {
            Some(xrc) => {
                let hdr = XrcCmData::new(xrc.is_reciprocal, xrc.conn_tag, xrc.port, 0);
                cm_data::xrc_private_data(&hdr, param)
            }
            None => cm_data::rc_private_data(param),
        }
    }

    /// Refuses the request. XRC rejects echo the tag, port and direction
    /// of the request so the originator can match them. On failure the
    /// request is handed back unanswered.
    pub(crate) fn reject(self, param: &[u8]) -> std::result::Result<(), RequestError> {
        let data = match self.reject_data(param) {
            Ok(data) => data,
            Err(e) => return Err(RequestError::new(e, self)),
        };
        tracing::debug!("Reject, cmid: {}, len: {}", self.id.as_handle(), data.len());
        match self.id.reject(&data) {
            Ok(()) => Ok(()),
            Err(e) => Err(RequestError::new(Error::RdmaCm(e), self)),
        }
    }
}

/// A call that would have consumed a [`ConnectionRequest`] failed. The
/// request is returned still pending; dropping it refuses the peer.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct RequestError {
    source: Error,
    connreq: ConnectionRequest,
}

impl RequestError {
    pub(crate) fn new(source: Error, connreq: ConnectionRequest) -> Self {
        RequestError { source, connreq }
    }

    #[inline]
    pub fn error(&self) -> &Error {
        &self.source
    }

    pub fn into_parts(self) -> (Error, ConnectionRequest) {
        (self.source, self.connreq)
    }
}

impl From<RequestError> for Error {
    fn from(other: RequestError) -> Self {
        other.source
    }
}
