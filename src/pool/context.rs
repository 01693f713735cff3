//! Per-request bookkeeping threaded through a host pool.
//!
//! A [`RequestContext`] owns everything the pool needs to finish a request
//! exactly once: the request itself (kept for retries), the retry count, the
//! caller's reply callback and the admission ticket that bounds how much work
//! the pool holds.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::error::PoolError;
use super::message::{Request, Response};

/// Callback receiving the final outcome of one request.
///
/// Invoked exactly once, from the pool's task; it must not block.
pub type Reply = Box<dyn FnOnce(Completion) + Send + 'static>;

/// One unit of admitted capacity.
///
/// Holding it counts against `max_open_requests`; dropping it frees the slot
/// for the next suspended caller.
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

impl Admission {
    /// Wait for capacity on `limit`.
    pub(crate) async fn acquire(limit: &Arc<Semaphore>) -> Result<Self, PoolError> {
        let permit = Arc::clone(limit)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::PoolShutDown)?;
        Ok(Self { _permit: permit })
    }
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission").finish_non_exhaustive()
    }
}

/// Final outcome of a request as handed to its [`Reply`].
#[derive(Debug)]
pub struct Completion {
    /// Response, or the terminal failure
    pub result: Result<Response, PoolError>,
    /// Connection-level retries spent on this request
    pub retries: u32,
    admission: Option<Admission>,
}

impl Completion {
    pub(crate) fn new(
        result: Result<Response, PoolError>,
        retries: u32,
        admission: Option<Admission>,
    ) -> Self {
        Self {
            result,
            retries,
            admission,
        }
    }

    /// Split into the result and the admission ticket.
    ///
    /// Keep the ticket alive while the result sits in a buffer so buffered
    /// results stay bounded; drop it once the caller has taken the result.
    pub fn into_parts(self) -> (Result<Response, PoolError>, Option<Admission>) {
        (self.result, self.admission)
    }
}

/// A request travelling through a pool.
pub struct RequestContext {
    pub(crate) request: Request,
    pub(crate) retries: u32,
    pub(crate) sequence: u64,
    reply: Reply,
    admission: Option<Admission>,
}

impl RequestContext {
    pub(crate) fn new(request: Request, reply: Reply, admission: Option<Admission>) -> Self {
        Self {
            request,
            retries: 0,
            sequence: 0,
            reply,
            admission,
        }
    }

    /// Retries spent so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Arrival order within the pool that first admitted the request.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The request being carried.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Finish the request, handing the outcome to the caller.
    pub(crate) fn resolve(self, result: Result<Response, PoolError>) {
        let completion = Completion::new(result, self.retries, self.admission);
        (self.reply)(completion);
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.request.method())
            .field("uri", &self.request.uri())
            .field("retries", &self.retries)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}
