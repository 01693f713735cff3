// ABOUTME: Collaborator contract between host pools and the byte-level transport
//
// A transport turns a PoolKey into one connection, split into a writer that
// accepts encoded requests and a reader that yields responses in write order.

use std::future::Future;

use super::error::PoolError;
use super::key::PoolKey;
use super::message::{Request, Response};
use super::settings::ConnectionPoolSettings;

/// Factory for connections to a pool's endpoint
pub trait Transport: Send + Sync + 'static {
    /// Write half of an established connection
    type Writer: RequestWriter;
    /// Read half of an established connection
    type Reader: ResponseReader;

    /// Establish a connection to `key`
    ///
    /// Failures should be reported as [`PoolError::Connect`] so the pool
    /// treats them as retryable.
    fn connect(
        &self,
        key: &PoolKey,
        settings: &ConnectionPoolSettings,
    ) -> impl Future<Output = Result<(Self::Writer, Self::Reader), PoolError>> + Send;
}

/// Writes requests onto a connection in the order they are handed over
pub trait RequestWriter: Send + 'static {
    /// Encode and write one request; resolves once the transport accepted it
    fn write(&mut self, request: Request) -> impl Future<Output = Result<(), PoolError>> + Send;
}

/// Reads responses off a connection, one per written request, in write order
pub trait ResponseReader: Send + 'static {
    /// Wait for the next response
    ///
    /// Any error is treated as fatal for the whole connection.
    fn read(&mut self) -> impl Future<Output = Result<Response, PoolError>> + Send;
}
