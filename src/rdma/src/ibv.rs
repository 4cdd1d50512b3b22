use std::fmt;
use std::io;

use fabric_api::net::{QpCapability, QpType, SendFlags, WorkCompletion};
use fabric_api::{AsHandle, Handle};

use crate::DeviceRef;

#[derive(Debug, Clone, Copy)]
pub struct QpInitAttr {
    pub qp_type: QpType,
    pub send_cq: Option<Handle>,
    pub recv_cq: Option<Handle>,
    pub srq: Option<Handle>,
    pub cap: QpCapability,
    pub sq_sig_all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInfo {
    pub handle: Handle,
    pub qp_num: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SrqInitAttr {
    pub cq: Handle,
    pub max_wr: u32,
    pub max_sge: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrqInfo {
    pub handle: Handle,
    pub srq_num: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    Send,
    SendWithImm(u32),
    RdmaWrite { remote_addr: u64, rkey: u32 },
    RdmaWriteWithImm { remote_addr: u64, rkey: u32, imm: u32 },
    RdmaRead { remote_addr: u64, rkey: u32 },
}

/// A send work request.
#[derive(Debug, Clone)]
pub struct SendWr {
    pub wr_id: u64,
    pub sg_list: Vec<Sge>,
    pub opcode: WrOpcode,
    pub send_flags: SendFlags,
    /// Destination SRQ on the remote XRC target, ignored for RC.
    pub remote_srqn: Option<u32>,
}

impl SendWr {
    #[inline]
    pub fn total_len(&self) -> usize {
        self.sg_list.iter().map(|sge| sge.length as usize).sum()
    }
}

/// Verbs operations on queue pairs and completion queues.
///
/// Failures carry the OS error code the verbs library would have set, in
/// particular `post_send` reports a full send queue as `ENOMEM`.
pub trait Verbs {
    fn create_cq(&self, cqe: usize) -> io::Result<Handle>;
    fn destroy_cq(&self, cq: Handle) -> io::Result<()>;

    fn create_qp(&self, attr: &QpInitAttr) -> io::Result<QpInfo>;
    /// Open an existing XRC target QP by number.
    fn open_qp(&self, qp_num: u32) -> io::Result<QpInfo>;
    fn destroy_qp(&self, qp: Handle) -> io::Result<()>;

    fn create_srq(&self, attr: &SrqInitAttr) -> io::Result<SrqInfo>;
    fn destroy_srq(&self, srq: Handle) -> io::Result<()>;

    fn post_send(&self, qp: Handle, wr: &SendWr) -> io::Result<()>;
    /// Returns the number of completions written to `wc`.
    fn poll_cq(&self, cq: Handle, wc: &mut [WorkCompletion]) -> io::Result<usize>;
}

pub struct CompletionQueue {
    handle: Handle,
    dev: DeviceRef,
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("handle", &self.handle)
            .finish()
    }
}

impl AsHandle for CompletionQueue {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

impl CompletionQueue {
    pub fn create(dev: &DeviceRef, cqe: usize) -> io::Result<Self> {
        let handle = dev.create_cq(cqe)?;
        Ok(CompletionQueue {
            handle,
            dev: DeviceRef::clone(dev),
        })
    }

    #[inline]
    pub fn poll(&self, wc: &mut [WorkCompletion]) -> io::Result<usize> {
        self.dev.poll_cq(self.handle, wc)
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        if let Err(e) = self.dev.destroy_cq(self.handle) {
            log::debug!("error occured when destroying cq {}: {}", self.handle, e);
        }
    }
}

pub struct QueuePair {
    info: QpInfo,
    qp_type: QpType,
    dev: DeviceRef,
}

impl fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("handle", &self.info.handle)
            .field("qp_num", &self.info.qp_num)
            .field("qp_type", &self.qp_type)
            .finish()
    }
}

impl AsHandle for QueuePair {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.info.handle
    }
}

impl QueuePair {
    pub fn create(dev: &DeviceRef, attr: &QpInitAttr) -> io::Result<Self> {
        let info = dev.create_qp(attr)?;
        Ok(QueuePair {
            info,
            qp_type: attr.qp_type,
            dev: DeviceRef::clone(dev),
        })
    }

    /// Takes a reference on an XRC target QP created elsewhere.
    pub fn open(dev: &DeviceRef, qp_num: u32) -> io::Result<Self> {
        let info = dev.open_qp(qp_num)?;
        Ok(QueuePair {
            info,
            qp_type: QpType::XrcRecv,
            dev: DeviceRef::clone(dev),
        })
    }

    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.info.qp_num
    }

    #[inline]
    pub fn qp_type(&self) -> QpType {
        self.qp_type
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        if let Err(e) = self.dev.destroy_qp(self.info.handle) {
            log::debug!("error occured when destroying qp {}: {}", self.info.qp_num, e);
        }
    }
}

pub struct SharedReceiveQueue {
    info: SrqInfo,
    dev: DeviceRef,
}

impl fmt::Debug for SharedReceiveQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedReceiveQueue")
            .field("handle", &self.info.handle)
            .field("srq_num", &self.info.srq_num)
            .finish()
    }
}

impl AsHandle for SharedReceiveQueue {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.info.handle
    }
}

impl SharedReceiveQueue {
    pub fn create(dev: &DeviceRef, attr: &SrqInitAttr) -> io::Result<Self> {
        let info = dev.create_srq(attr)?;
        Ok(SharedReceiveQueue {
            info,
            dev: DeviceRef::clone(dev),
        })
    }

    #[inline]
    pub fn srq_num(&self) -> u32 {
        self.info.srq_num
    }
}

impl Drop for SharedReceiveQueue {
    fn drop(&mut self) {
        if let Err(e) = self.dev.destroy_srq(self.info.handle) {
            log::debug!("error occured when destroying srq {}: {}", self.info.srq_num, e);
        }
    }
}
