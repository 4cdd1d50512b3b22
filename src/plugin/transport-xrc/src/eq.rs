//! Event queues.
//!
//! An event queue owns one rdma_cm event channel. CM events are turned into
//! [`EqEvent`]s on [`EventQueue::read`]; the CM id context of every event
//! is the handle of the endpoint or passive endpoint that owns the id.
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Weak};

use spin::Mutex;

use fabric_api::{AsHandle, Handle};
use rdma::rdmacm::{CmEvent, CmEventType, EventChannel};

use crate::conn_tag::ConnTagRegistry;
use crate::connreq::ConnectionRequest;
use crate::domain::Domain;
use crate::ep::Endpoint;
use crate::pep::PassiveEndpoint;
use crate::resource::{alloc_handle, ResourceTable};
use crate::{Error, Result};

/// An error entry, read in place of a regular event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EqError {
    pub fid: Handle,
    /// Positive errno.
    pub err: i32,
    pub prov_errno: i32,
    /// Private data of a reject, if the peer sent any.
    pub err_data: Vec<u8>,
}

#[derive(Debug)]
pub enum EqEvent {
    /// A new connect request on a passive endpoint.
    ConnReq(ConnectionRequest),
    /// The endpoint is connected in both directions. `data` is what the
    /// peer sent with its accept.
    Connected { fid: Handle, data: Vec<u8> },
    Shutdown { fid: Handle },
    Error(EqError),
    /// Written by the application with [`EventQueue::write_event`].
    User { fid: Handle, context: u64, data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub(crate) enum Fid {
    Ep(Weak<Endpoint>),
    Pep(Weak<PassiveEndpoint>),
}

/// XRC bookkeeping guarded by the EQ lock.
#[derive(Debug)]
pub(crate) struct EqXrc {
    pub(crate) tags: ConnTagRegistry,
    /// Port of the passive endpoint listening on this EQ; reciprocal
    /// connections are sent there.
    pub(crate) pep_port: u16,
}

/// Work left over by an endpoint's event handler: events to queue and
/// endpoints whose deferred connect can now proceed.
#[derive(Debug, Default)]
pub(crate) struct CmOutcome {
    pub(crate) events: Vec<EqEvent>,
    pub(crate) sched: Vec<Handle>,
}

pub struct EventQueue {
    handle: Handle,
    domain: Arc<Domain>,
    channel: EventChannel,
    fids: ResourceTable<Fid>,
    entries: Mutex<VecDeque<EqEvent>>,
    pub(crate) xrc: Mutex<EqXrc>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("handle", &self.handle)
            .field("channel", &self.channel)
            .finish()
    }
}

impl AsHandle for EventQueue {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

impl EventQueue {
    pub(crate) fn open(domain: &Arc<Domain>) -> Result<Arc<Self>> {
        let channel = EventChannel::create_event_channel(domain.device()).map_err(Error::RdmaCm)?;
        let handle = alloc_handle();
        tracing::debug!("opened eq {}, channel: {:?}", handle, channel);
        Ok(Arc::new(EventQueue {
            handle,
            domain: Arc::clone(domain),
            channel,
            fids: ResourceTable::default(),
            entries: Mutex::new(VecDeque::new()),
            xrc: Mutex::new(EqXrc {
                tags: ConnTagRegistry::new(),
                pep_port: 0,
            }),
        }))
    }

    #[inline]
    pub(crate) fn channel(&self) -> &EventChannel {
        &self.channel
    }

    pub(crate) fn bind(&self, handle: Handle, fid: Fid) -> Result<()> {
        self.fids.insert(handle, fid)?;
        Ok(())
    }

    pub(crate) fn unbind(&self, handle: Handle) {
        let _ = self.fids.remove(handle);
    }

    /// Port reciprocal connections of this EQ's endpoints are directed to.
    pub fn pep_port(&self) -> u16 {
        self.xrc.lock().pep_port
    }

    /// Connection tags currently held by originating connections.
    pub fn outstanding_tags(&self) -> usize {
        self.xrc.lock().tags.len()
    }

    /// Returns the next event. [`Error::Again`] means nothing is pending.
    pub fn read(&self) -> Result<EqEvent> {
        loop {
            if let Some(event) = self.entries.lock().pop_front() {
                return Ok(event);
            }
            let event = match self.channel.get_cm_event() {
                Ok(event) => event,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(Error::Again),
                Err(e) => return Err(Error::RdmaCm(e)),
            };
            self.process_cm_event(event);
        }
    }

    pub fn write_event(&self, event: EqEvent) {
        self.entries.lock().push_back(event);
    }

    fn process_cm_event(&self, event: CmEvent) {
        tracing::debug!(
            "eq {} got {}, status: {}, cmid: {}",
            self.handle,
            event,
            event.status,
            event.id
        );
        match self.fids.get(Handle(event.context)) {
            Ok(Fid::Pep(pep)) => match pep.upgrade() {
                Some(pep) => self.process_pep_event(&pep, event),
                None => self.drop_orphan(event),
            },
            Ok(Fid::Ep(ep)) => match ep.upgrade() {
                Some(ep) => {
                    let outcome = ep.handle_cm_event(&event);
                    self.apply(outcome);
                }
                None => self.drop_orphan(event),
            },
            Err(_) => self.drop_orphan(event),
        }
    }

    fn drop_orphan(&self, event: CmEvent) {
        tracing::debug!("dropping {} for closed fid {:#x}", event, event.context);
        if event.event == CmEventType::ConnectRequest {
            // Destroying the id refuses the request.
            let _ = event.take_request(self.domain.device());
        }
    }

    fn process_pep_event(&self, pep: &Arc<PassiveEndpoint>, event: CmEvent) {
        if event.event != CmEventType::ConnectRequest {
            tracing::debug!("ignoring {} on passive endpoint {}", event, pep.handle());
            return;
        }
        let connreq = match ConnectionRequest::from_event(
            self.domain.device(),
            self.handle,
            pep.handle(),
            pep.is_xrc(),
            &event,
        ) {
            Ok(connreq) => connreq,
            Err(e) => {
                tracing::warn!("dropping connect request on {}: {}", pep.handle(), e);
                return;
            }
        };

        match connreq.xrc().copied() {
            Some(xrc) if xrc.is_reciprocal => {
                let owner = self.xrc.lock().tags.lookup(xrc.conn_tag);
                match owner.and_then(|h| self.endpoint(h)) {
                    Some(ep) => {
                        let outcome = ep.accept_recip(connreq);
                        self.apply(outcome);
                    }
                    None => {
                        tracing::warn!(
                            "reciprocal request with unknown tag {:#x}, rejecting",
                            xrc.conn_tag
                        );
                        if let Err(e) = connreq.reject(&[]) {
                            tracing::debug!("reject of stale reciprocal request failed: {}", e);
                        }
                    }
                }
            }
            _ => self.write_event(EqEvent::ConnReq(connreq)),
        }
    }

    fn endpoint(&self, handle: Handle) -> Option<Arc<Endpoint>> {
        match self.fids.get(handle) {
            Ok(Fid::Ep(ep)) => ep.upgrade(),
            _ => None,
        }
    }

    pub(crate) fn write_events(&self, events: Vec<EqEvent>) {
        if !events.is_empty() {
            self.entries.lock().extend(events);
        }
    }

    /// Queues the events of `outcome` and runs the connects it unblocked.
    pub(crate) fn apply(&self, outcome: CmOutcome) {
        self.write_events(outcome.events);
        run_deferred(&self.domain, outcome.sched);
    }
}

/// Lets endpoints waiting on a shared INI connection proceed. Each endpoint
/// reports to its own EQ and may unblock further endpoints.
pub(crate) fn run_deferred(domain: &Domain, sched: Vec<Handle>) {
    let mut work = VecDeque::from(sched);
    while let Some(handle) = work.pop_front() {
        let Some(ep) = domain.endpoint_ref(handle) else {
            tracing::debug!("deferred connect of closed endpoint {}", handle);
            continue;
        };
        work.extend(ep.sched_deferred());
    }
}
