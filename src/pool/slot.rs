// ABOUTME: Connection slot state machine and the task driving one physical connection
// ABOUTME: Slots are owned by the host pool task; connection tasks report back via SlotEvent

//! Connection slots.
//!
//! A [`Slot`] is one of the host pool's `max_connections` positions. Its
//! connection comes and goes; the slot stays. State lives entirely in the pool
//! task, while the socket work happens in a spawned connection task that
//! reports [`SlotEvent`]s tagged with the slot's generation, so events from a
//! connection that has already been torn down are recognisable and dropped.
//!
//! ```text
//!   Unconnected ──submit──▶ Connecting ──Connected──▶ Open(idle|busy)
//!        ▲                      │                        │      │
//!        └────────Failed────────┴────────Failed──────────┘    close
//!        ▲                                                      ▼
//!        └──────────────────────Closed──────────────────── Closing
//! ```

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::context::RequestContext;
use super::error::PoolError;
use super::key::PoolKey;
use super::message::{Request, Response};
use super::settings::ConnectionPoolSettings;
use super::transport::{RequestWriter, ResponseReader, Transport};

// === Events ===

/// What a connection task reports to its pool
#[derive(Debug)]
pub(crate) enum SlotEventKind {
    /// Transport connected; buffered requests are being flushed
    Connected,
    /// Next response in write order
    Response(Response),
    /// Connection broke; everything in flight on it is lost
    Failed(PoolError),
    /// Connection closed after the pool released it
    Closed,
}

/// A [`SlotEventKind`] addressed to one slot generation
#[derive(Debug)]
pub(crate) struct SlotEvent {
    pub slot: usize,
    pub generation: u64,
    pub kind: SlotEventKind,
}

// === Slot state ===

/// A live (or pending) connection's pool-side half
pub(crate) struct Connection {
    outbound: mpsc::UnboundedSender<Request>,
    in_flight: VecDeque<RequestContext>,
}

impl Connection {
    fn new(outbound: mpsc::UnboundedSender<Request>) -> Self {
        Self {
            outbound,
            in_flight: VecDeque::new(),
        }
    }

    fn push(&mut self, ctx: RequestContext) {
        // A closed channel means the task is exiting; its Failed event will
        // fail this request together with the rest of the queue.
        let _ = self.outbound.send(ctx.request.clone());
        self.in_flight.push_back(ctx);
    }
}

/// Slot lifecycle
pub(crate) enum SlotState {
    Unconnected,
    Connecting(Connection),
    Open(Connection),
    Closing,
}

/// What was left on a slot when its connection went away
pub(crate) struct Teardown {
    pub in_flight: VecDeque<RequestContext>,
    pub was_open: bool,
}

/// One position in a host pool
pub(crate) struct Slot {
    index: usize,
    generation: u64,
    state: SlotState,
    /// Consecutive connect attempts that failed on this slot
    connect_failures: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl Slot {
    pub fn new(index: usize, settings: &ConnectionPoolSettings) -> Self {
        Self {
            index,
            generation: 0,
            state: SlotState::Unconnected,
            connect_failures: 0,
            base_backoff: settings.base_connection_backoff,
            max_backoff: settings.max_connection_backoff,
        }
    }

    /// Wait before the next connect: `base * 2^(failures - 1)`, capped
    fn reconnect_delay(&self) -> Duration {
        match self.connect_failures {
            0 => Duration::ZERO,
            failures => {
                let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
                self.base_backoff.saturating_mul(factor).min(self.max_backoff)
            }
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_unconnected(&self) -> bool {
        matches!(self.state, SlotState::Unconnected)
    }

    /// Open with nothing in flight
    pub fn is_idle(&self) -> bool {
        matches!(&self.state, SlotState::Open(conn) if conn.in_flight.is_empty())
    }

    /// Queue length if the slot is Open
    pub fn open_queue_len(&self) -> Option<usize> {
        match &self.state {
            SlotState::Open(conn) => Some(conn.in_flight.len()),
            _ => None,
        }
    }

    /// Requests currently assigned to this slot
    pub fn in_flight_len(&self) -> usize {
        match &self.state {
            SlotState::Connecting(conn) | SlotState::Open(conn) => conn.in_flight.len(),
            SlotState::Unconnected | SlotState::Closing => 0,
        }
    }

    /// Assign a request, starting a connection first if there is none
    ///
    /// Hands the request back if the slot is closing.
    pub fn submit<X: Transport>(
        &mut self,
        ctx: RequestContext,
        launcher: &ConnectionLauncher<X>,
    ) -> Result<(), RequestContext> {
        if self.is_unconnected() {
            self.generation += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            launcher.launch(self.index, self.generation, self.reconnect_delay(), rx);
            self.state = SlotState::Connecting(Connection::new(tx));
        }

        match &mut self.state {
            SlotState::Connecting(conn) | SlotState::Open(conn) => {
                conn.push(ctx);
                Ok(())
            }
            SlotState::Unconnected | SlotState::Closing => Err(ctx),
        }
    }

    /// Connecting → Open. Returns false if the slot was not connecting.
    pub fn on_connected(&mut self) -> bool {
        match mem::replace(&mut self.state, SlotState::Unconnected) {
            SlotState::Connecting(conn) => {
                self.state = SlotState::Open(conn);
                self.connect_failures = 0;
                true
            }
            other => {
                self.state = other;
                false
            }
        }
    }

    /// Pop the request the arriving response belongs to
    pub fn on_response(&mut self) -> Option<RequestContext> {
        match &mut self.state {
            SlotState::Open(conn) => conn.in_flight.pop_front(),
            _ => None,
        }
    }

    /// Tear the connection down, returning every request still queued on it
    pub fn fail(&mut self) -> Teardown {
        let previous = mem::replace(&mut self.state, SlotState::Unconnected);
        match previous {
            SlotState::Connecting(conn) => {
                self.connect_failures = self.connect_failures.saturating_add(1);
                Teardown {
                    in_flight: conn.in_flight,
                    was_open: false,
                }
            }
            SlotState::Open(conn) => Teardown {
                in_flight: conn.in_flight,
                was_open: true,
            },
            SlotState::Closing => Teardown {
                in_flight: VecDeque::new(),
                was_open: true,
            },
            SlotState::Unconnected => Teardown {
                in_flight: VecDeque::new(),
                was_open: false,
            },
        }
    }

    /// Release an idle connection. Returns true if closing started.
    pub fn close(&mut self) -> bool {
        if self.is_idle() {
            // Dropping the sender ends the connection task's write loop
            self.state = SlotState::Closing;
            true
        } else {
            false
        }
    }

    /// Closing → Unconnected. Returns true if the slot was closing.
    pub fn on_closed(&mut self) -> bool {
        if matches!(self.state, SlotState::Closing) {
            self.state = SlotState::Unconnected;
            true
        } else {
            false
        }
    }
}

// === Connection task ===

/// Spawns connection tasks for one pool
pub(crate) struct ConnectionLauncher<X: Transport> {
    transport: Arc<X>,
    key: PoolKey,
    settings: ConnectionPoolSettings,
    events: mpsc::UnboundedSender<SlotEvent>,
}

impl<X: Transport> ConnectionLauncher<X> {
    pub fn new(
        transport: Arc<X>,
        key: PoolKey,
        settings: ConnectionPoolSettings,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> Self {
        Self {
            transport,
            key,
            settings,
            events,
        }
    }

    fn launch(
        &self,
        slot: usize,
        generation: u64,
        delay: Duration,
        outbound: mpsc::UnboundedReceiver<Request>,
    ) {
        let task = ConnectionTask {
            transport: Arc::clone(&self.transport),
            key: self.key.clone(),
            settings: self.settings.clone(),
            events: self.events.clone(),
            slot,
            generation,
        };
        let handle = tokio::spawn(task.run(delay, outbound));

        // A task that panics never reports; fail the slot on its behalf
        let events = self.events.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    warn!(pool = %key, slot, generation, "Connection task panicked");
                    let _ = events.send(SlotEvent {
                        slot,
                        generation,
                        kind: SlotEventKind::Failed(PoolError::transport(io::Error::other(
                            "connection task panicked",
                        ))),
                    });
                }
            }
        });
    }
}

struct ConnectionTask<X: Transport> {
    transport: Arc<X>,
    key: PoolKey,
    settings: ConnectionPoolSettings,
    events: mpsc::UnboundedSender<SlotEvent>,
    slot: usize,
    generation: u64,
}

impl<X: Transport> ConnectionTask<X> {
    fn report(&self, kind: SlotEventKind) -> bool {
        self.events
            .send(SlotEvent {
                slot: self.slot,
                generation: self.generation,
                kind,
            })
            .is_ok()
    }

    async fn run(self, delay: Duration, mut outbound: mpsc::UnboundedReceiver<Request>) {
        if !delay.is_zero() {
            debug!(pool = %self.key, slot = self.slot, ?delay, "Backing off before reconnect");
            tokio::time::sleep(delay).await;
        }

        let (mut writer, mut reader) = match self.transport.connect(&self.key, &self.settings).await
        {
            Ok(halves) => halves,
            Err(err) => {
                debug!(pool = %self.key, slot = self.slot, error = %err, "Connect failed");
                self.report(SlotEventKind::Failed(err));
                return;
            }
        };

        trace!(pool = %self.key, slot = self.slot, generation = self.generation, "Connected");
        if !self.report(SlotEventKind::Connected) {
            return;
        }

        let write_loop = async {
            while let Some(request) = outbound.recv().await {
                writer.write(request).await?;
            }
            Ok::<(), PoolError>(())
        };

        let read_loop = async {
            loop {
                let response = reader.read().await?;
                if !self.report(SlotEventKind::Response(response)) {
                    return Ok::<(), PoolError>(());
                }
            }
        };

        let outcome = tokio::select! {
            result = write_loop => result,
            result = read_loop => result,
        };

        // Release the transport before the slot can be handed a new connection
        drop(writer);
        drop(reader);

        match outcome {
            Ok(()) => {
                trace!(pool = %self.key, slot = self.slot, "Connection released");
                self.report(SlotEventKind::Closed);
            }
            Err(err) => {
                debug!(pool = %self.key, slot = self.slot, error = %err, "Connection failed");
                self.report(SlotEventKind::Failed(err));
            }
        }
    }
}
