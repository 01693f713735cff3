// ABOUTME: Host pool - one task owning every connection slot for a single PoolKey
// ABOUTME: Selects slots, pipelines, retries connection failures and shuts down when idle

//! Host pool.
//!
//! A [`HostPool`] is a cheap, cloneable handle to a pool task. The task is the
//! only writer of slot state, so slot selection, queueing and retry decisions
//! for one key never interleave.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        PoolActor                             │
//! │                                                              │
//! │  requests ──▶ waiting (FIFO) ──select_slot──▶ slots[0..N]    │
//! │                    ▲                            │            │
//! │                    └──── retries ◀── Failed ────┤            │
//! │                                                 │            │
//! │  events ◀── connection tasks (one per slot generation)       │
//! │                                                              │
//! │  idle deadline ──▶ shutdown: close slots, fire signals       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let pool = HostPool::new(key, ConnectionPoolSettings::default(), Arc::new(TcpTransport))?;
//! let response = pool.send(Request::get("http://localhost:8080/health")).await?;
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::context::{Admission, Completion, Reply, RequestContext};
use super::error::PoolError;
use super::key::PoolKey;
use super::message::{Request, Response};
use super::metrics::PoolMetrics;
use super::settings::ConnectionPoolSettings;
use super::signal::{LifecycleSignals, Signal};
use super::slot::{ConnectionLauncher, Slot, SlotEvent, SlotEventKind};
use super::transport::Transport;

// === Pool ID ===

/// Unique identifier of one pool incarnation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub Uuid);

impl PoolId {
    /// Generate a new unique pool ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// === Handle ===

/// Handle to a running host pool
#[derive(Clone)]
pub struct HostPool {
    id: PoolId,
    key: PoolKey,
    requests: mpsc::UnboundedSender<RequestContext>,
    admission: Arc<Semaphore>,
    shutdown_requested: Signal,
    signals: LifecycleSignals,
    metrics: Arc<PoolMetrics>,
}

impl fmt::Debug for HostPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPool")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

impl HostPool {
    /// Start a stand-alone pool with its own admission limit and metrics
    ///
    /// Must be called inside a tokio runtime.
    pub fn new<X: Transport>(
        key: PoolKey,
        settings: ConnectionPoolSettings,
        transport: Arc<X>,
    ) -> Result<Self, PoolError> {
        settings.validate()?;
        let admission = Arc::new(Semaphore::new(settings.max_open_requests));
        Ok(Self::spawn(
            key,
            settings,
            transport,
            admission,
            LifecycleSignals::new(),
            Arc::new(PoolMetrics::new()),
        ))
    }

    /// Start a pool task sharing admission and metrics with its gateway
    pub(crate) fn spawn<X: Transport>(
        key: PoolKey,
        settings: ConnectionPoolSettings,
        transport: Arc<X>,
        admission: Arc<Semaphore>,
        signals: LifecycleSignals,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        let id = PoolId::new();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown_requested = Signal::new();

        let slots = (0..settings.max_connections)
            .map(|index| Slot::new(index, &settings))
            .collect();

        let actor = PoolActor {
            id,
            key: key.clone(),
            launcher: ConnectionLauncher::new(transport, key.clone(), settings.clone(), events_tx),
            settings,
            slots,
            waiting: VecDeque::new(),
            requests: requests_rx,
            requests_open: true,
            events: events_rx,
            shutdown_requested: shutdown_requested.clone(),
            signals: signals.clone(),
            metrics: Arc::clone(&metrics),
            idle_deadline: None,
            shutting_down: false,
            next_sequence: 0,
        };
        tokio::spawn(actor.run());

        Self {
            id,
            key,
            requests: requests_tx,
            admission,
            shutdown_requested,
            signals,
            metrics,
        }
    }

    /// Pool incarnation ID
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Key this pool serves
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Shutdown signals of this incarnation
    pub fn signals(&self) -> &LifecycleSignals {
        &self.signals
    }

    /// Metrics shared with the owning gateway
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// Whether the pool still takes new requests
    pub fn is_accepting(&self) -> bool {
        !self.requests.is_closed()
    }

    /// Dispatch a request, suspending while `max_open_requests` are outstanding
    ///
    /// `reply` runs exactly once with the outcome. A pool that has already
    /// shut down answers with [`PoolError::PoolShutDown`].
    pub async fn dispatch(&self, request: Request, reply: Reply) {
        let admission = match self.admit().await {
            Ok(admission) => admission,
            Err(err) => {
                reply(Completion::new(Err(err), 0, None));
                return;
            }
        };

        let ctx = RequestContext::new(request, reply, Some(admission));
        if let Err(ctx) = self.submit(ctx) {
            ctx.resolve(Err(PoolError::PoolShutDown));
        }
    }

    /// Dispatch a request and wait for its outcome
    pub async fn send(&self, request: Request) -> Result<Response, PoolError> {
        let (tx, rx) = oneshot::channel();
        let reply: Reply = Box::new(move |completion: Completion| {
            let _ = tx.send(completion.into_parts().0);
        });
        self.dispatch(request, reply).await;
        rx.await.map_err(|_| PoolError::PoolShutDown)?
    }

    /// Ask the pool to shut down once the work it already accepted is done
    pub fn shutdown(&self) {
        self.shutdown_requested.fire();
    }

    pub(crate) async fn admit(&self) -> Result<Admission, PoolError> {
        Admission::acquire(&self.admission).await
    }

    /// Hand an admitted request to the pool task; returns it if the pool closed
    pub(crate) fn submit(&self, ctx: RequestContext) -> Result<(), RequestContext> {
        self.requests.send(ctx).map_err(|rejected| rejected.0)
    }
}

// === Pool task ===

struct PoolActor<X: Transport> {
    id: PoolId,
    key: PoolKey,
    settings: ConnectionPoolSettings,
    launcher: ConnectionLauncher<X>,
    slots: Vec<Slot>,
    waiting: VecDeque<RequestContext>,
    requests: mpsc::UnboundedReceiver<RequestContext>,
    requests_open: bool,
    events: mpsc::UnboundedReceiver<SlotEvent>,
    shutdown_requested: Signal,
    signals: LifecycleSignals,
    metrics: Arc<PoolMetrics>,
    idle_deadline: Option<Instant>,
    shutting_down: bool,
    next_sequence: u64,
}

impl<X: Transport> PoolActor<X> {
    async fn run(mut self) {
        info!(pool = %self.key, id = %self.id, "Host pool started");
        self.refresh_idle_deadline();

        loop {
            let idle_deadline = self.idle_deadline;

            tokio::select! {
                request = self.requests.recv(), if self.requests_open => match request {
                    Some(ctx) => self.admit(ctx),
                    None => self.requests_open = false,
                },
                Some(event) = self.events.recv() => self.on_slot_event(event),
                () = tokio::time::sleep_until(idle_deadline.unwrap_or_else(Instant::now)),
                    if idle_deadline.is_some() => self.begin_shutdown("idle timeout"),
                () = self.shutdown_requested.wait(), if !self.shutting_down => {
                    self.begin_shutdown("requested");
                }
            }

            if !self.requests_open && !self.shutting_down {
                self.begin_shutdown("all handles dropped");
            }

            if self.shutting_down && !self.requests_open && self.outstanding() == 0 {
                self.close_idle_slots();
                if self.slots.iter().all(Slot::is_unconnected) {
                    break;
                }
            }
        }

        self.signals.shutdown_completed().fire();
        info!(pool = %self.key, id = %self.id, "Host pool shut down");
    }

    /// In-flight plus waiting requests
    fn outstanding(&self) -> usize {
        self.waiting.len() + self.slots.iter().map(Slot::in_flight_len).sum::<usize>()
    }

    fn admit(&mut self, mut ctx: RequestContext) {
        if ctx.retries == 0 {
            ctx.sequence = self.next_sequence;
            self.next_sequence += 1;
        }
        self.metrics.request_dispatched();
        trace!(pool = %self.key, sequence = ctx.sequence, uri = %ctx.request.uri(), "Request admitted");

        self.waiting.push_back(ctx);
        self.drain_waiting();
        self.refresh_idle_deadline();
    }

    /// Slot selection: idle open slot, then a new connection, then the
    /// shortest open pipeline with room left
    fn select_slot(&self) -> Option<usize> {
        if let Some(slot) = self.slots.iter().find(|slot| slot.is_idle()) {
            return Some(slot.index());
        }

        if let Some(slot) = self.slots.iter().find(|slot| slot.is_unconnected()) {
            return Some(slot.index());
        }

        self.slots
            .iter()
            .filter_map(|slot| {
                slot.open_queue_len()
                    .filter(|len| *len < self.settings.pipelining_limit)
                    .map(|len| (len, slot.index()))
            })
            .min()
            .map(|(_, index)| index)
    }

    fn drain_waiting(&mut self) {
        while !self.waiting.is_empty() {
            let Some(index) = self.select_slot() else {
                break;
            };
            let Some(ctx) = self.waiting.pop_front() else {
                break;
            };

            let sequence = ctx.sequence;
            if let Err(ctx) = self.slots[index].submit(ctx, &self.launcher) {
                self.waiting.push_front(ctx);
                break;
            }
            trace!(pool = %self.key, slot = index, sequence, "Request assigned");
        }
    }

    fn on_slot_event(&mut self, event: SlotEvent) {
        let index = event.slot;
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if slot.generation() != event.generation {
            trace!(pool = %self.key, slot = index, generation = event.generation, "Stale slot event");
            return;
        }

        match event.kind {
            SlotEventKind::Connected => {
                if slot.on_connected() {
                    self.metrics.connection_opened();
                    debug!(pool = %self.key, slot = index, generation = event.generation, "Connection open");
                }
            }
            SlotEventKind::Response(response) => match slot.on_response() {
                Some(ctx) => ctx.resolve(Ok(response)),
                None => {
                    self.on_connection_failed(
                        index,
                        PoolError::protocol("response arrived without a matching request"),
                    );
                }
            },
            SlotEventKind::Failed(err) => self.on_connection_failed(index, err),
            SlotEventKind::Closed => {
                if slot.on_closed() {
                    self.metrics.connection_closed();
                    debug!(pool = %self.key, slot = index, "Connection closed");
                }
            }
        }

        self.drain_waiting();
        self.refresh_idle_deadline();
    }

    /// Fail every request queued on the slot, requeueing those with retries left
    fn on_connection_failed(&mut self, index: usize, err: PoolError) {
        let teardown = self.slots[index].fail();
        if teardown.was_open {
            self.metrics.connection_closed();
        } else {
            self.metrics.connect_failed();
        }

        if !teardown.in_flight.is_empty() {
            warn!(
                pool = %self.key,
                slot = index,
                in_flight = teardown.in_flight.len(),
                error = %err,
                "Connection failed with requests in flight"
            );
        }

        let mut retries = Vec::new();
        for mut ctx in teardown.in_flight {
            if ctx.retries < self.settings.max_retries {
                ctx.retries += 1;
                self.metrics.request_retried();
                debug!(pool = %self.key, sequence = ctx.sequence, retries = ctx.retries, "Retrying request");
                retries.push(ctx);
            } else {
                self.metrics.request_failed();
                let retries = ctx.retries;
                ctx.resolve(Err(PoolError::RetriesExhausted {
                    retries,
                    source: Box::new(err.clone()),
                }));
            }
        }

        // Retries were admitted before anything still waiting
        for ctx in retries.into_iter().rev() {
            self.waiting.push_front(ctx);
        }
    }

    fn refresh_idle_deadline(&mut self) {
        if self.shutting_down || self.outstanding() > 0 {
            self.idle_deadline = None;
        } else if self.idle_deadline.is_none() {
            self.idle_deadline = Instant::now().checked_add(self.settings.idle_timeout);
        }
    }

    fn begin_shutdown(&mut self, reason: &str) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.idle_deadline = None;
        // Senders now get their request back; anything already buffered is still served
        self.requests.close();
        self.signals.shutdown_started().fire();
        info!(pool = %self.key, id = %self.id, reason, "Host pool shutting down");
    }

    fn close_idle_slots(&mut self) {
        for slot in &mut self.slots {
            if slot.close() {
                debug!(pool = %self.key, slot = slot.index(), "Closing connection");
            }
        }
    }
}
