// ABOUTME: Router - maps absolute request URIs to gateways and multiplexes every result
// ABOUTME: into one stream of (result, caller context) pairs

//! Router.
//!
//! The [`Router`] is the caller-facing entry point. Each request carries an
//! opaque context value `T` that comes back untouched next to the result, so
//! callers can match responses to requests without relying on order.
//!
//! # Usage
//!
//! ```ignore
//! let (router, mut responses) = Router::builder(Arc::new(TcpTransport))
//!     .settings(ConnectionPoolSettings::default())
//!     .build()?;
//!
//! router.dispatch(Request::get("http://localhost:8080/a"), 1).await;
//! router.dispatch(Request::get("http://localhost:9090/b"), 2).await;
//!
//! while let Some((result, id)) = responses.next().await {
//!     println!("{id}: {:?}", result.map(|r| r.status()));
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::context::{Admission, Completion, Reply};
use super::error::PoolError;
use super::gateway::Gateway;
use super::key::{endpoint_of, PoolKey};
use super::message::{Request, Response};
use super::settings::ConnectionPoolSettings;
use super::transport::Transport;

/// A result waiting to be taken from [`Responses`]
struct Envelope<T> {
    result: Result<Response, PoolError>,
    context: T,
    // Held until the caller takes the result
    _admission: Option<Admission>,
}

/// Stream of `(result, context)` pairs for every request dispatched through a router
///
/// No ordering is guaranteed across requests.
pub struct Responses<T> {
    rx: mpsc::UnboundedReceiver<Envelope<T>>,
}

impl<T> Responses<T> {
    /// Take a result if one is ready
    pub fn try_next(&mut self) -> Option<(Result<Response, PoolError>, T)> {
        self.rx.try_recv().ok().map(|envelope| (envelope.result, envelope.context))
    }
}

impl<T> Stream for Responses<T> {
    type Item = (Result<Response, PoolError>, T);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|envelope| envelope.map(|envelope| (envelope.result, envelope.context)))
    }
}

impl<T> fmt::Debug for Responses<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responses").finish_non_exhaustive()
    }
}

// === Builder ===

/// Builder for [`Router`]
pub struct RouterBuilder<X: Transport> {
    transport: Arc<X>,
    settings: ConnectionPoolSettings,
    host_settings: HashMap<String, ConnectionPoolSettings>,
}

impl<X: Transport> RouterBuilder<X> {
    /// Default settings for hosts without an override
    #[must_use]
    pub fn settings(mut self, settings: ConnectionPoolSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Settings for one host name
    #[must_use]
    pub fn host_settings(mut self, host: impl Into<String>, settings: ConnectionPoolSettings) -> Self {
        self.host_settings
            .insert(host.into().to_ascii_lowercase(), settings);
        self
    }

    /// Settings for several host names
    #[must_use]
    pub fn hosts(mut self, hosts: HashMap<String, ConnectionPoolSettings>) -> Self {
        for (host, settings) in hosts {
            self = self.host_settings(host, settings);
        }
        self
    }

    /// Validate every settings block and build the router with its result stream
    pub fn build<T: Send + 'static>(self) -> Result<(Router<T, X>, Responses<T>), PoolError> {
        self.settings.validate()?;
        for (host, settings) in &self.host_settings {
            settings
                .validate()
                .map_err(|err| PoolError::InvalidSettings(format!("host `{host}`: {err}")))?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router {
            inner: Arc::new(RouterInner {
                transport: self.transport,
                settings: self.settings,
                host_settings: self.host_settings,
                gateways: DashMap::new(),
                output: tx,
            }),
        };
        Ok((router, Responses { rx }))
    }
}

// === Router ===

struct RouterInner<T, X: Transport> {
    transport: Arc<X>,
    settings: ConnectionPoolSettings,
    host_settings: HashMap<String, ConnectionPoolSettings>,
    gateways: DashMap<PoolKey, Arc<Gateway<X>>>,
    output: mpsc::UnboundedSender<Envelope<T>>,
}

/// Routes requests to one gateway per [`PoolKey`]
pub struct Router<T, X: Transport> {
    inner: Arc<RouterInner<T, X>>,
}

impl<T, X: Transport> Clone for Router<T, X> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, X: Transport> fmt::Debug for Router<T, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("gateways", &self.inner.gateways.len())
            .finish_non_exhaustive()
    }
}

impl<X: Transport> Router<(), X> {
    /// Start building a router over `transport`
    pub fn builder(transport: Arc<X>) -> RouterBuilder<X> {
        RouterBuilder {
            transport,
            settings: ConnectionPoolSettings::default(),
            host_settings: HashMap::new(),
        }
    }
}

impl<T: Send + 'static, X: Transport> Router<T, X> {
    /// Dispatch `request`; its result shows up on [`Responses`] paired with `context`
    ///
    /// Suspends while the target gateway is at `max_open_requests`. A request
    /// whose URI is not absolute fails at once with [`PoolError::Usage`] and
    /// never reaches a pool.
    pub async fn dispatch(&self, request: Request, context: T) {
        let (key, settings) = match self.resolve(request.uri()) {
            Ok(resolved) => resolved,
            Err(err) => {
                debug!(uri = %request.uri(), error = %err, "Rejected request");
                self.emit(Envelope {
                    result: Err(err),
                    context,
                    _admission: None,
                });
                return;
            }
        };

        let gateway = self.gateway_for(key, settings);
        let output = self.inner.output.clone();
        let reply: Reply = Box::new(move |completion: Completion| {
            let (result, admission) = completion.into_parts();
            let _ = output.send(Envelope {
                result,
                context,
                _admission: admission,
            });
        });
        gateway.dispatch(request, reply).await;
    }

    /// Gateway for `key`, if one has been created
    pub fn gateway(&self, key: &PoolKey) -> Option<Arc<Gateway<X>>> {
        self.inner
            .gateways
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Key a request URI would be routed to
    pub fn key_for(&self, uri: &str) -> Result<PoolKey, PoolError> {
        self.resolve(uri).map(|(key, _)| key)
    }

    /// Keys of every gateway created so far
    pub fn pool_keys(&self) -> Vec<PoolKey> {
        self.inner
            .gateways
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop the gateway for `key`; the next request creates a new one
    ///
    /// Requests already handed to the old gateway still complete.
    pub fn invalidate(&self, key: &PoolKey) -> Option<Arc<Gateway<X>>> {
        let removed = self.inner.gateways.remove(key).map(|(_, gateway)| gateway);
        if removed.is_some() {
            info!(pool = %key, "Gateway invalidated");
        }
        removed
    }

    /// Shut down every gateway's pool and wait for their connections to close
    pub async fn shutdown_all(&self) {
        let gateways: Vec<_> = self
            .inner
            .gateways
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        futures_util::future::join_all(gateways.iter().map(|gateway| gateway.shutdown())).await;
        info!(gateways = gateways.len(), "All pools shut down");
    }

    fn resolve(&self, uri: &str) -> Result<(PoolKey, ConnectionPoolSettings), PoolError> {
        let (scheme, host, port) = endpoint_of(uri)?;
        let settings = self
            .inner
            .host_settings
            .get(&host)
            .unwrap_or(&self.inner.settings)
            .clone();
        Ok((PoolKey::new(&scheme, &host, port, &settings), settings))
    }

    fn gateway_for(&self, key: PoolKey, settings: ConnectionPoolSettings) -> Arc<Gateway<X>> {
        if let Some(gateway) = self.inner.gateways.get(&key) {
            return Arc::clone(gateway.value());
        }

        let entry = self.inner.gateways.entry(key.clone()).or_insert_with(|| {
            debug!(pool = %key, "Creating gateway");
            Arc::new(Gateway::with_validated(
                key,
                settings,
                Arc::clone(&self.inner.transport),
            ))
        });
        Arc::clone(entry.value())
    }

    fn emit(&self, envelope: Envelope<T>) {
        // The receiving half lives as long as the caller keeps `Responses`
        let _ = self.inner.output.send(envelope);
    }
}
