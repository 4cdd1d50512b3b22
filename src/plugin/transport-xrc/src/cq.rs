//! Completion queues.
//!
//! Every send WR consumes a credit that is given back when its completion
//! is polled, which keeps the number of outstanding sends within the CQ
//! depth. Completions found while draining the CQ to free send queue slots
//! are parked in a bounded cache until the application reads them.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use fabric_api::net::{WcFlags, WcOpcode, WcStatus, WorkCompletion};
use fabric_api::{AsHandle, Handle};
use rdma::ibv::{self, SendWr};
use rdma::DeviceRef;

use crate::config::{CompletionMode, XrcTransportConfig};
use crate::{Error, Result};

/// `wr_id` of work requests the application asked no completion for.
pub const NO_COMP_FLAG: u64 = u64::MAX;

bitflags! {
    #[derive(Default)]
    pub struct CompletionFlags: u64 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        const MSG = 1 << 2;
        const RMA = 1 << 3;
        const READ = 1 << 4;
        const WRITE = 1 << 5;
        const REMOTE_CQ_DATA = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CqEntry {
    pub op_context: u64,
    pub flags: CompletionFlags,
    pub len: usize,
    pub data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqErrEntry {
    pub op_context: u64,
    pub flags: CompletionFlags,
    pub len: usize,
    /// Positive errno.
    pub err: i32,
    pub prov_errno: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CqAttr {
    /// Defaults to the configured CQ size.
    pub size: Option<usize>,
}

fn comp_flags(opcode: WcOpcode) -> CompletionFlags {
    match opcode {
        WcOpcode::Send => CompletionFlags::SEND | CompletionFlags::MSG,
        WcOpcode::RdmaWrite => CompletionFlags::RMA | CompletionFlags::WRITE,
        WcOpcode::RdmaRead => CompletionFlags::RMA | CompletionFlags::READ,
        WcOpcode::Recv => CompletionFlags::RECV | CompletionFlags::MSG,
        WcOpcode::RecvRdmaWithImm => {
            CompletionFlags::RECV | CompletionFlags::RMA | CompletionFlags::REMOTE_CQ_DATA
        }
        WcOpcode::Invalid => CompletionFlags::empty(),
    }
}

impl From<&WorkCompletion> for CqEntry {
    fn from(wc: &WorkCompletion) -> Self {
        let mut flags = comp_flags(wc.opcode);
        let data = if wc.wc_flags.contains(WcFlags::WITH_IMM) {
            flags |= CompletionFlags::REMOTE_CQ_DATA;
            wc.imm_data as u64
        } else {
            0
        };
        CqEntry {
            op_context: wc.wr_id,
            flags,
            len: wc.byte_len as usize,
            data,
        }
    }
}

impl From<&WorkCompletion> for CqErrEntry {
    fn from(wc: &WorkCompletion) -> Self {
        CqErrEntry {
            op_context: if wc.wr_id == NO_COMP_FLAG { 0 } else { wc.wr_id },
            flags: comp_flags(wc.opcode),
            len: wc.byte_len as usize,
            err: libc::EIO,
            prov_errno: wc.vendor_err as i32,
        }
    }
}

#[derive(Debug, Default)]
struct CqState {
    wce: VecDeque<WorkCompletion>,
    err: Option<WorkCompletion>,
}

pub struct CompletionQueue {
    cq: ibv::CompletionQueue,
    dev: DeviceRef,
    mode: CompletionMode,
    depth: usize,
    wce_cnt: usize,
    reap_batch: usize,
    read_bunch: usize,
    credits: AtomicUsize,
    state: Mutex<CqState>,
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("cq", &self.cq)
            .field("mode", &self.mode)
            .field("depth", &self.depth)
            .field("credits", &self.credits)
            .finish()
    }
}

impl AsHandle for CompletionQueue {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.cq.as_handle()
    }
}

impl CompletionQueue {
    pub(crate) fn open(
        dev: &DeviceRef,
        config: &XrcTransportConfig,
        attr: &CqAttr,
    ) -> Result<Arc<Self>> {
        let depth = attr.size.unwrap_or(config.cq_size);
        if depth == 0 || config.reap_batch == 0 {
            return Err(Error::InvalidArgument("CQ size and reap batch must be positive"));
        }
        let cq = ibv::CompletionQueue::create(dev, depth).map_err(Error::Ibv)?;
        tracing::debug!("opened cq {} with depth {}", cq.as_handle(), depth);
        Ok(Arc::new(CompletionQueue {
            cq,
            dev: DeviceRef::clone(dev),
            mode: config.completion_mode,
            depth,
            wce_cnt: config.wce_cnt,
            reap_batch: config.reap_batch,
            read_bunch: config.cqread_bunch_size.max(1),
            credits: AtomicUsize::new(depth),
            state: Mutex::new(CqState::default()),
        }))
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn credits(&self) -> usize {
        self.credits.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// Completions parked by internal reaps and not read yet.
    pub fn cached(&self) -> usize {
        self.state.lock().wce.len()
    }

    fn try_take_credit(&self) -> bool {
        self.credits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_ok()
    }

    fn return_credit(&self) {
        let depth = self.depth;
        let _ = self
            .credits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some((c + 1).min(depth))
            });
    }

    fn retire(&self, wc: &WorkCompletion) {
        if wc.opcode.is_send_side() {
            self.return_credit();
        }
    }

    fn cache(&self, state: &mut CqState, wc: WorkCompletion) {
        if state.wce.len() >= self.wce_cnt {
            tracing::warn!(
                "completion cache of cq {} is full, dropping wr_id {:#x}",
                self.as_handle(),
                wc.wr_id
            );
            return;
        }
        state.wce.push_back(wc);
    }

    /// Drains the CQ, parking what the application will want to read.
    fn reap_locked(&self, state: &mut CqState) -> Result<usize> {
        let mut wc = vec![WorkCompletion::empty(); self.reap_batch];
        let mut reaped = 0;
        loop {
            let n = self.cq.poll(&mut wc).map_err(Error::Ibv)?;
            if n == 0 {
                break;
            }
            for w in &wc[..n] {
                self.retire(w);
                if w.wr_id == NO_COMP_FLAG && w.status == WcStatus::Success {
                    continue;
                }
                self.cache(state, *w);
            }
            reaped += n;
        }
        tracing::trace!("reaped {} completions from cq {}", reaped, self.as_handle());
        Ok(reaped)
    }

    fn reap(&self) -> Result<usize> {
        let mut state = self.state.lock();
        self.reap_locked(&mut state)
    }

    /// Posts a send WR on `qp`, whose send CQ must be this CQ.
    ///
    /// A full send queue is drained once and the post retried; if it is
    /// still full the caller sees [`Error::Again`].
    pub(crate) fn post_send(&self, qp: Handle, wr: &SendWr) -> Result<()> {
        if !self.try_take_credit() {
            if self.reap().is_err() || !self.try_take_credit() {
                return Err(Error::Again);
            }
        }

        let err = match self.dev.post_send(qp, wr) {
            Ok(()) => return Ok(()),
            Err(e) => handle_post(e),
        };
        if !matches!(err, Error::Again) {
            self.return_credit();
            return Err(err);
        }

        let mut state = self.state.lock();
        if let Err(e) = self.reap_locked(&mut state) {
            tracing::debug!("reap on cq {} failed: {}", self.as_handle(), e);
            self.return_credit();
            return Err(Error::Again);
        }
        match self.dev.post_send(qp, wr) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.return_credit();
                Err(handle_post(e))
            }
        }
    }

    /// Reads up to `buf.len()` completions.
    ///
    /// Returns [`Error::Again`] when there is nothing to read and
    /// [`Error::ErrAvail`] when a failed completion waits in
    /// [`CompletionQueue::readerr`].
    pub fn read(&self, buf: &mut [CqEntry]) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument("empty completion buffer"));
        }
        let mut state = self.state.lock();
        if state.err.is_some() {
            return Err(Error::ErrAvail);
        }

        let mut n = 0;
        while n < buf.len() {
            let Some(wc) = state.wce.pop_front() else {
                break;
            };
            if wc.status != WcStatus::Success {
                state.err = Some(wc);
                break;
            }
            buf[n] = CqEntry::from(&wc);
            n += 1;
        }

        if n < buf.len() && state.err.is_none() {
            n += match self.mode {
                CompletionMode::Discard => self.poll_discard(&mut state, &mut buf[n..])?,
                CompletionMode::PollNew => self.poll_new(&mut state, &mut buf[n..])?,
            };
        }

        match n {
            0 if state.err.is_some() => Err(Error::ErrAvail),
            0 => Err(Error::Again),
            n => Ok(n),
        }
    }

    fn poll_discard(&self, state: &mut CqState, out: &mut [CqEntry]) -> Result<usize> {
        let mut wc = vec![WorkCompletion::empty(); out.len().min(self.read_bunch)];
        let polled = self.cq.poll(&mut wc).map_err(Error::Ibv)?;
        let mut n = 0;
        for w in &wc[..polled] {
            self.retire(w);
            if state.err.is_some() {
                self.cache(state, *w);
            } else if w.status != WcStatus::Success {
                state.err = Some(*w);
            } else if w.wr_id != NO_COMP_FLAG {
                out[n] = CqEntry::from(w);
                n += 1;
            }
        }
        Ok(n)
    }

    fn poll_new(&self, state: &mut CqState, out: &mut [CqEntry]) -> Result<usize> {
        let mut wc = [WorkCompletion::empty(); 1];
        let mut n = 0;
        while n < out.len() {
            if self.cq.poll(&mut wc).map_err(Error::Ibv)? == 0 {
                break;
            }
            let w = &wc[0];
            self.retire(w);
            if w.status != WcStatus::Success {
                state.err = Some(*w);
                break;
            }
            if w.wr_id != NO_COMP_FLAG {
                out[n] = CqEntry::from(w);
                n += 1;
            }
        }
        Ok(n)
    }

    pub fn readerr(&self) -> Option<CqErrEntry> {
        self.state.lock().err.take().map(|wc| CqErrEntry::from(&wc))
    }
}

/// Normalizes a failed post: a full queue is transient, anything else is
/// reported with its errno.
fn handle_post(e: std::io::Error) -> Error {
    match e.raw_os_error() {
        Some(libc::ENOMEM) => Error::Again,
        _ => Error::Ibv(e),
    }
}
