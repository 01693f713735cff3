// ABOUTME: Client-side HTTP connection pooling keyed by endpoint and settings
//
// Requests go through a Router, which picks a Gateway per PoolKey. The gateway
// lazily (re)starts a HostPool, a single task owning up to max_connections
// slots with pipelining, retries and idle shutdown.
//
// Key components:
// - key: PoolKey derivation from absolute URIs
// - slot: per-connection state machine and connection task
// - host: host pool task with slot selection, retries and idle shutdown
// - gateway: pool incarnation swapping and lifecycle signals
// - router: PoolKey -> Gateway table and the multiplexed result stream
// - transport: the seam a connection implementation plugs into

pub mod context;
pub mod error;
pub mod gateway;
pub mod host;
pub mod key;
pub mod message;
pub mod metrics;
pub mod router;
pub mod settings;
pub mod signal;
mod slot;
pub mod transport;

// Re-exports for convenient access
pub use context::{Admission, Completion, Reply, RequestContext};
pub use error::PoolError;
pub use gateway::{Gateway, GatewayState};
pub use host::{HostPool, PoolId};
pub use key::PoolKey;
pub use message::{Request, Response};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use router::{Responses, Router, RouterBuilder};
pub use settings::ConnectionPoolSettings;
pub use signal::{LifecycleSignals, Signal};
pub use transport::{RequestWriter, ResponseReader, Transport};
