// ABOUTME: Tunable parameters for a single host connection pool
//
// Defines ConnectionPoolSettings with all knobs a host pool consults:
// - Connection and pipelining limits
// - Admission bound for in-flight plus waiting requests
// - Retry budget for connection-level failures
// - Idle timeout driving pool shutdown
// - Transport-level connect timeout and reconnect backoff

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use super::error::PoolError;

/// Settings for one host connection pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolSettings {
    /// Maximum number of simultaneously open (or opening) connections
    pub max_connections: usize,

    /// How many times a request is retried after a connection-level failure
    pub max_retries: u32,

    /// Maximum number of in-flight plus waiting requests before callers are suspended
    pub max_open_requests: usize,

    /// Maximum number of requests written to one connection before its first response
    pub pipelining_limit: usize,

    /// Pool shuts down after being completely idle for this long
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,

    // === Transport ===
    /// Maximum time the transport may take to establish a connection
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Initial delay before reconnecting a slot whose last connect failed
    #[serde(with = "duration_millis")]
    pub base_connection_backoff: Duration,

    /// Upper bound for the reconnect delay
    #[serde(with = "duration_millis")]
    pub max_connection_backoff: Duration,
}

impl Default for ConnectionPoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 4,
            max_retries: 5,
            max_open_requests: 32,
            pipelining_limit: 1,
            idle_timeout: Duration::from_secs(30),

            connect_timeout: Duration::from_secs(10),
            base_connection_backoff: Duration::from_millis(100),
            max_connection_backoff: Duration::from_secs(30),
        }
    }
}

impl ConnectionPoolSettings {
    /// Check that the limits describe a usable pool
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::InvalidSettings(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.pipelining_limit == 0 {
            return Err(PoolError::InvalidSettings(
                "pipelining_limit must be greater than 0".to_string(),
            ));
        }
        if self.max_open_requests == 0 {
            return Err(PoolError::InvalidSettings(
                "max_open_requests must be greater than 0".to_string(),
            ));
        }
        if self.base_connection_backoff > self.max_connection_backoff {
            return Err(PoolError::InvalidSettings(format!(
                "base_connection_backoff ({:?}) must not exceed max_connection_backoff ({:?})",
                self.base_connection_backoff, self.max_connection_backoff
            )));
        }
        Ok(())
    }

    /// Stable digest of every setting, used to keep differently tuned pools apart
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Builder-style override of `max_connections`
    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Builder-style override of `max_retries`
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder-style override of `max_open_requests`
    #[must_use]
    pub const fn with_max_open_requests(mut self, max_open_requests: usize) -> Self {
        self.max_open_requests = max_open_requests;
        self
    }

    /// Builder-style override of `pipelining_limit`
    #[must_use]
    pub const fn with_pipelining_limit(mut self, pipelining_limit: usize) -> Self {
        self.pipelining_limit = pipelining_limit;
        self
    }

    /// Builder-style override of `idle_timeout`
    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Builder-style override of both reconnect backoff bounds
    #[must_use]
    pub const fn with_connection_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_connection_backoff = base;
        self.max_connection_backoff = max;
        self
    }
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
