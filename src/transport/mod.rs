// ABOUTME: Plain TCP transport speaking HTTP/1.1 through the codec in `codec`
// ABOUTME: One TcpStream per connection, split into framed read and write halves

pub mod codec;

use std::future::Future;
use std::io;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::pool::{
    ConnectionPoolSettings, PoolError, PoolKey, Request, RequestWriter, Response, ResponseReader,
    Transport,
};

pub use codec::{RequestEncoder, ResponseDecoder, DEFAULT_MAX_HEAD_SIZE};

/// HTTP/1.1 over plain TCP
///
/// `https` keys are refused with a connect error.
#[derive(Debug, Clone, Copy)]
pub struct TcpTransport {
    max_head_size: usize,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub const fn new() -> Self {
        Self {
            max_head_size: DEFAULT_MAX_HEAD_SIZE,
        }
    }

    /// Limit the size of response heads this transport accepts
    #[must_use]
    pub const fn with_max_head_size(mut self, max_head_size: usize) -> Self {
        self.max_head_size = max_head_size;
        self
    }
}

impl Transport for TcpTransport {
    type Writer = TcpRequestWriter;
    type Reader = TcpResponseReader;

    fn connect(
        &self,
        key: &PoolKey,
        settings: &ConnectionPoolSettings,
    ) -> impl Future<Output = Result<(Self::Writer, Self::Reader), PoolError>> + Send {
        let endpoint = format!("{}:{}", key.host(), key.port());
        let secure = key.is_secure();
        let connect_timeout = settings.connect_timeout;
        let max_head_size = self.max_head_size;

        async move {
            if secure {
                return Err(PoolError::connect(
                    endpoint,
                    io::Error::new(io::ErrorKind::Unsupported, "TLS is not supported by TcpTransport"),
                ));
            }

            let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&endpoint))
                .await
                .map_err(|_| {
                    PoolError::connect(
                        endpoint.clone(),
                        io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                    )
                })?
                .map_err(|err| PoolError::connect(endpoint.clone(), err))?;
            stream
                .set_nodelay(true)
                .map_err(|err| PoolError::connect(endpoint.clone(), err))?;
            debug!(endpoint = %endpoint, "TCP connection established");

            let (read_half, write_half) = stream.into_split();
            let (expect_tx, expect_rx) = mpsc::unbounded_channel();

            Ok((
                TcpRequestWriter {
                    frames: FramedWrite::new(write_half, RequestEncoder::new()),
                    expectations: expect_tx,
                },
                TcpResponseReader {
                    frames: FramedRead::new(read_half, ResponseDecoder::new(max_head_size)),
                    expectations: expect_rx,
                },
            ))
        }
    }
}

/// Write half of a [`TcpTransport`] connection
#[derive(Debug)]
pub struct TcpRequestWriter {
    frames: FramedWrite<OwnedWriteHalf, RequestEncoder>,
    // One entry per written request: whether it was a HEAD
    expectations: mpsc::UnboundedSender<bool>,
}

impl RequestWriter for TcpRequestWriter {
    fn write(&mut self, request: Request) -> impl Future<Output = Result<(), PoolError>> + Send {
        async move {
            self.expectations
                .send(request.method() == "HEAD")
                .map_err(|_| reader_gone())?;
            self.frames.send(request).await.map_err(PoolError::from)
        }
    }
}

/// Read half of a [`TcpTransport`] connection
#[derive(Debug)]
pub struct TcpResponseReader {
    frames: FramedRead<OwnedReadHalf, ResponseDecoder>,
    expectations: mpsc::UnboundedReceiver<bool>,
}

impl ResponseReader for TcpResponseReader {
    fn read(&mut self) -> impl Future<Output = Result<Response, PoolError>> + Send {
        async move {
            let head_only = self.expectations.recv().await.ok_or_else(reader_gone)?;
            self.frames.decoder_mut().expect_head_response(head_only);

            match self.frames.next().await {
                Some(Ok(response)) => Ok(response),
                Some(Err(err)) if err.kind() == io::ErrorKind::InvalidData => {
                    Err(PoolError::protocol(err.to_string()))
                }
                Some(Err(err)) => Err(PoolError::transport(err)),
                None => Err(PoolError::transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ))),
            }
        }
    }
}

fn reader_gone() -> PoolError {
    PoolError::transport(io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "connection half closed",
    ))
}
