//! CM private data layouts.
//!
//! Every message carries a one byte size header followed by the
//! application payload. XRC messages prefix that with a 12 byte block:
//!
//! ```text
//! | version: u8 | reciprocal: u8 | port: u16 | param: u32 | conn_tag: u32 |
//! ```
//!
//! Multi-byte fields are in network byte order.
use static_assertions::const_assert_eq;

use crate::{Error, Result};

/// Private data limit of an rdma_cm connect/accept/reject on RC.
pub const CM_DATA_SIZE: usize = 56;
pub const CM_HDR_SIZE: usize = 1;
/// Largest application payload of a non-XRC endpoint.
pub const VERBS_CM_DATA_SIZE: usize = CM_DATA_SIZE - CM_HDR_SIZE;

pub const XRC_VERSION: u8 = 1;
pub const XRC_CM_DATA_SIZE: usize = 12;
/// Largest application payload of an XRC endpoint.
pub const XRC_PARAM_MAX: usize = VERBS_CM_DATA_SIZE - XRC_CM_DATA_SIZE;

const_assert_eq!(XRC_CM_DATA_SIZE + CM_HDR_SIZE + XRC_PARAM_MAX, CM_DATA_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XrcCmData {
    pub version: u8,
    pub reciprocal: bool,
    pub port: u16,
    pub param: u32,
    pub conn_tag: u32,
}

impl XrcCmData {
    pub fn new(reciprocal: bool, conn_tag: u32, port: u16, param: u32) -> Self {
        XrcCmData {
            version: XRC_VERSION,
            reciprocal,
            port,
            param,
            conn_tag,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.push(self.reciprocal as u8);
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&self.param.to_be_bytes());
        out.extend_from_slice(&self.conn_tag.to_be_bytes());
    }

    /// Splits `data` into the XRC block and whatever follows it.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8])> {
        if data.len() < XRC_CM_DATA_SIZE {
            tracing::warn!("XRC CM data too short: {} bytes", data.len());
            return Err(Error::ConnectionRefused);
        }
        let (hdr, rest) = data.split_at(XRC_CM_DATA_SIZE);
        if hdr[0] != XRC_VERSION {
            tracing::warn!(
                "XRC MSG EP connection protocol mismatch (local {}, remote {})",
                XRC_VERSION,
                hdr[0]
            );
            return Err(Error::ConnectionRefused);
        }
        let xrc = XrcCmData {
            version: hdr[0],
            reciprocal: hdr[1] != 0,
            port: u16::from_be_bytes([hdr[2], hdr[3]]),
            param: u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]),
            conn_tag: u32::from_be_bytes([hdr[8], hdr[9], hdr[10], hdr[11]]),
        };
        Ok((xrc, rest))
    }
}

fn encode_hdr(param: &[u8], out: &mut Vec<u8>) -> Result<()> {
    if param.len() > VERBS_CM_DATA_SIZE {
        return Err(Error::InvalidArgument("connection parameter too long"));
    }
    out.push(param.len() as u8);
    out.extend_from_slice(param);
    Ok(())
}

/// Application payload of a size-prefixed block. Missing or truncated
/// blocks yield what is there.
pub fn decode_hdr(data: &[u8]) -> &[u8] {
    match data.split_first() {
        Some((&size, rest)) => &rest[..rest.len().min(size as usize)],
        None => &[],
    }
}

/// Private data of an RC connect, accept or reject.
pub fn rc_private_data(param: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(CM_HDR_SIZE + param.len());
    encode_hdr(param, &mut out)?;
    Ok(out)
}

/// Private data of an XRC connect, accept or reject.
pub fn xrc_private_data(xrc: &XrcCmData, param: &[u8]) -> Result<Vec<u8>> {
    if param.len() > XRC_PARAM_MAX {
        return Err(Error::InvalidArgument("XRC connection parameter too long"));
    }
    let mut out = Vec::with_capacity(XRC_CM_DATA_SIZE + CM_HDR_SIZE + param.len());
    xrc.encode(&mut out);
    encode_hdr(param, &mut out)?;
    debug_assert!(out.len() <= CM_DATA_SIZE);
    Ok(out)
}

/// Application payload of XRC private data.
pub fn xrc_payload(data: &[u8]) -> Result<(XrcCmData, &[u8])> {
    let (xrc, rest) = XrcCmData::decode(data)?;
    Ok((xrc, decode_hdr(rest)))
}
