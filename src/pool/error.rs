// ABOUTME: Error taxonomy for the connection pool layer
//
// Connection-level failures (connect, transport, protocol) are retried by the
// host pool; usage errors and exhausted retries are terminal.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by pools, gateways, the router and transports
///
/// Cloneable so a single connection failure can be handed to every request
/// that was queued on the broken connection.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// Connection could not be established
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        /// Endpoint the transport tried to reach
        endpoint: String,
        /// Underlying I/O failure
        #[source]
        source: Arc<io::Error>,
    },

    /// Established connection broke (reset, abrupt close, write failure)
    #[error("connection failed: {0}")]
    Transport(#[source] Arc<io::Error>),

    /// Response could not be parsed; framing on the connection is lost
    #[error("malformed response: {0}")]
    Protocol(String),

    /// Request rejected locally before any I/O (e.g. relative URI)
    #[error("invalid request: {0}")]
    Usage(String),

    /// Connection-level failure persisted through every allowed retry
    #[error("request failed after {retries} retries: {source}")]
    RetriesExhausted {
        /// Retries performed before giving up
        retries: u32,
        /// Failure observed on the last attempt
        #[source]
        source: Box<PoolError>,
    },

    /// Pool stopped accepting work
    #[error("pool has shut down")]
    PoolShutDown,

    /// Pool settings are unusable
    #[error("invalid pool settings: {0}")]
    InvalidSettings(String),
}

impl PoolError {
    /// Build a connect failure for `endpoint`
    pub fn connect(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Connect {
            endpoint: endpoint.into(),
            source: Arc::new(source),
        }
    }

    /// Build a transport failure
    pub fn transport(source: io::Error) -> Self {
        Self::Transport(Arc::new(source))
    }

    /// Build a protocol failure
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Whether the failure concerns the connection rather than the request
    pub const fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Transport(_) | Self::Protocol(_)
        )
    }

    /// Innermost error, looking through `RetriesExhausted`
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::RetriesExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Number of retries spent before this error surfaced
    pub const fn retries(&self) -> u32 {
        match self {
            Self::RetriesExhausted { retries, .. } => *retries,
            _ => 0,
        }
    }
}

impl From<io::Error> for PoolError {
    fn from(err: io::Error) -> Self {
        Self::transport(err)
    }
}
