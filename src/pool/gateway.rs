// ABOUTME: Gateway - long-lived handle for one PoolKey that restarts its host pool on demand
// ABOUTME: Swaps pool incarnations atomically and exposes their shutdown signals

//! Gateway.
//!
//! A host pool shuts itself down after `idle_timeout`. The [`Gateway`] hides
//! that: it keeps the current incarnation behind an [`ArcSwapOption`] and
//! starts a fresh one whenever a request arrives and the current pool is gone
//! or on its way out. Admission capacity and metrics belong to the gateway and
//! carry over between incarnations.
//!
//! While a restart is in progress the old incarnation may still be draining
//! connections next to the new one.

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info};

use super::context::{Admission, Completion, Reply, RequestContext};
use super::error::PoolError;
use super::host::HostPool;
use super::key::PoolKey;
use super::message::{Request, Response};
use super::metrics::PoolMetrics;
use super::settings::ConnectionPoolSettings;
use super::signal::LifecycleSignals;
use super::transport::Transport;

/// Observable lifecycle of a gateway's current pool
#[derive(Debug, Clone)]
pub enum GatewayState {
    /// No pool running; the next request starts one
    Idle,
    /// A pool is accepting requests
    Running(LifecycleSignals),
    /// The current pool stopped accepting requests and is closing connections
    ShuttingDown(LifecycleSignals),
}

impl GatewayState {
    /// Signals of the incarnation this state describes, if any
    pub fn signals(&self) -> Option<&LifecycleSignals> {
        match self {
            Self::Idle => None,
            Self::Running(signals) | Self::ShuttingDown(signals) => Some(signals),
        }
    }

    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }
}

/// Lifecycle owner of the host pool for one [`PoolKey`]
pub struct Gateway<X: Transport> {
    key: PoolKey,
    settings: ConnectionPoolSettings,
    transport: Arc<X>,
    admission: Arc<Semaphore>,
    metrics: Arc<PoolMetrics>,
    current: ArcSwapOption<HostPool>,
    restart_lock: Mutex<()>,
}

impl<X: Transport> Gateway<X> {
    /// Create a gateway; no pool is started until the first request
    pub fn new(
        key: PoolKey,
        settings: ConnectionPoolSettings,
        transport: Arc<X>,
    ) -> Result<Self, PoolError> {
        settings.validate()?;
        Ok(Self::with_validated(key, settings, transport))
    }

    pub(crate) fn with_validated(
        key: PoolKey,
        settings: ConnectionPoolSettings,
        transport: Arc<X>,
    ) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(settings.max_open_requests)),
            key,
            settings,
            transport,
            metrics: Arc::new(PoolMetrics::new()),
            current: ArcSwapOption::empty(),
            restart_lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn settings(&self) -> &ConnectionPoolSettings {
        &self.settings
    }

    /// Metrics accumulated across every incarnation
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// Current lifecycle state
    pub fn state(&self) -> GatewayState {
        let Some(pool) = self.current.load_full() else {
            return GatewayState::Idle;
        };

        let signals = pool.signals().clone();
        if signals.shutdown_completed().is_fired() {
            GatewayState::Idle
        } else if signals.shutdown_started().is_fired() {
            GatewayState::ShuttingDown(signals)
        } else {
            GatewayState::Running(signals)
        }
    }

    /// Dispatch a request, starting a pool if none is accepting
    ///
    /// Suspends while `max_open_requests` are outstanding. A request bounced by
    /// a pool that began shutting down is handed to its successor.
    pub async fn dispatch(&self, request: Request, reply: Reply) {
        let admission = match Admission::acquire(&self.admission).await {
            Ok(admission) => admission,
            Err(err) => {
                reply(Completion::new(Err(err), 0, None));
                return;
            }
        };

        let mut ctx = RequestContext::new(request, reply, Some(admission));
        loop {
            let pool = self.current_or_start();
            match pool.submit(ctx) {
                Ok(()) => return,
                Err(rejected) => {
                    debug!(pool = %self.key, id = %pool.id(), "Pool rejected request, restarting");
                    ctx = rejected;
                }
            }
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

    /// Shut the current pool down and wait until its connections are closed
    ///
    /// Accepted requests still complete. A later dispatch starts a new pool.
    pub async fn shutdown(&self) {
        if let Some(pool) = self.current.load_full() {
            pool.shutdown();
            pool.signals().shutdown_completed().wait().await;
        }
    }

    fn current_or_start(&self) -> Arc<HostPool> {
        if let Some(pool) = self.accepting_pool() {
            return pool;
        }

        let _guard = self
            .restart_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Another dispatcher may have restarted it while we waited
        if let Some(pool) = self.accepting_pool() {
            return pool;
        }

        let pool = Arc::new(HostPool::spawn(
            self.key.clone(),
            self.settings.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.admission),
            LifecycleSignals::new(),
            Arc::clone(&self.metrics),
        ));
        info!(pool = %self.key, id = %pool.id(), "Started pool incarnation");
        self.current.store(Some(Arc::clone(&pool)));
        pool
    }

    fn accepting_pool(&self) -> Option<Arc<HostPool>> {
        self.current
            .load_full()
            .filter(|pool| pool.is_accepting())
    }
}

impl<X: Transport> std::fmt::Debug for Gateway<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
