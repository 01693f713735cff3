//! HTTP/1.1 client codec.
//!
//! [`RequestEncoder`] writes origin-form requests; [`ResponseDecoder`] parses
//! responses framed by `Content-Length`, chunked transfer coding or connection
//! close. Interim (1xx) responses are skipped. Both plug into
//! `tokio_util::codec::{FramedWrite, FramedRead}`.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;
use url::Url;

use crate::pool::{Request, Response};

/// Largest status line plus headers accepted (64KB default)
pub const DEFAULT_MAX_HEAD_SIZE: usize = 64 * 1024;

/// Upper bound on buffer growth per read while waiting for a declared body
const BODY_RESERVE_LIMIT: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

// === Encoder ===

/// Encodes [`Request`]s as HTTP/1.1 messages
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestEncoder;

impl RequestEncoder {
    pub const fn new() -> Self {
        Self
    }
}

impl Encoder<Request> for RequestEncoder {
    type Error = io::Error;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let url = Url::parse(request.uri())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;

        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        dst.reserve(256 + request.body().len());
        dst.put_slice(request.method().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(target.as_bytes());
        dst.put_slice(b" HTTP/1.1\r\n");

        if request.header("host").is_none() {
            let host = url.host_str().unwrap_or_default();
            match url.port() {
                Some(port) => put_header(dst, "Host", &format!("{host}:{port}")),
                None => put_header(dst, "Host", host),
            }
        }

        for (name, value) in request.headers() {
            put_header(dst, name, value);
        }

        let body = request.body();
        let sends_length = !body.is_empty() || matches!(request.method(), "POST" | "PUT" | "PATCH");
        if sends_length
            && request.header("content-length").is_none()
            && request.header("transfer-encoding").is_none()
        {
            put_header(dst, "Content-Length", &body.len().to_string());
        }

        dst.put_slice(CRLF);
        dst.put_slice(body);

        trace!(method = %request.method(), target = %target, bytes = body.len(), "Encoded request");
        Ok(())
    }
}

fn put_header(dst: &mut BytesMut, name: &str, value: &str) {
    dst.put_slice(name.as_bytes());
    dst.put_slice(b": ");
    dst.put_slice(value.as_bytes());
    dst.put_slice(CRLF);
}

// === Decoder ===

/// Parsed status line and headers
#[derive(Debug)]
struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// How the body following a head is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

#[derive(Debug)]
enum DecodeState {
    Head,
    Body(ResponseHead, BodyFraming),
}

/// Decodes HTTP/1.1 responses
#[derive(Debug)]
pub struct ResponseDecoder {
    max_head_size: usize,
    head_only: bool,
    state: DecodeState,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEAD_SIZE)
    }
}

impl ResponseDecoder {
    pub const fn new(max_head_size: usize) -> Self {
        Self {
            max_head_size,
            head_only: false,
            state: DecodeState::Head,
        }
    }

    /// Whether the next response answers a `HEAD` request and so has no body
    pub fn expect_head_response(&mut self, head_only: bool) {
        self.head_only = head_only;
    }

    fn parse_head(&self, src: &mut BytesMut) -> Result<Option<ResponseHead>, io::Error> {
        let Some(end) = find(src, HEAD_END) else {
            if src.len() > self.max_head_size {
                return Err(invalid(format!(
                    "response head exceeds {} bytes",
                    self.max_head_size
                )));
            }
            return Ok(None);
        };
        if end > self.max_head_size {
            return Err(invalid(format!(
                "response head exceeds {} bytes",
                self.max_head_size
            )));
        }

        let raw = src.split_to(end + HEAD_END.len());
        let text = std::str::from_utf8(&raw[..end])
            .map_err(|_| invalid("response head is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(invalid(format!("malformed status line `{status_line}`")));
        }
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .filter(|code| (100..=999).contains(code))
            .ok_or_else(|| invalid(format!("malformed status line `{status_line}`")))?;

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| invalid(format!("malformed header line `{line}`")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Some(ResponseHead { status, headers }))
    }

    fn framing(&self, head: &ResponseHead) -> Result<BodyFraming, io::Error> {
        if self.head_only || matches!(head.status, 100..=199 | 204 | 304) {
            return Ok(BodyFraming::Empty);
        }

        if head
            .header("transfer-encoding")
            .is_some_and(|coding| coding.to_ascii_lowercase().contains("chunked"))
        {
            return Ok(BodyFraming::Chunked);
        }

        match head.header("content-length") {
            Some(length) => length
                .parse::<usize>()
                .map(BodyFraming::Length)
                .map_err(|_| invalid(format!("invalid content-length `{length}`"))),
            None => Ok(BodyFraming::UntilClose),
        }
    }

    fn finish(&mut self, head: ResponseHead, body: Bytes) -> Response {
        self.state = DecodeState::Head;
        self.head_only = false;
        trace!(status = head.status, bytes = body.len(), "Decoded response");
        Response::from_parts(head.status, head.headers, body)
    }
}

impl Decoder for ResponseDecoder {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::Head) {
                DecodeState::Head => {
                    let Some(head) = self.parse_head(src)? else {
                        return Ok(None);
                    };
                    if (100..=199).contains(&head.status) {
                        trace!(status = head.status, "Skipping interim response");
                        continue;
                    }
                    let framing = self.framing(&head)?;
                    self.state = DecodeState::Body(head, framing);
                }
                DecodeState::Body(head, BodyFraming::Empty) => {
                    return Ok(Some(self.finish(head, Bytes::new())));
                }
                DecodeState::Body(head, BodyFraming::Length(length)) => {
                    if src.len() < length {
                        // The declared length is untrusted; grow the buffer as bytes arrive
                        src.reserve((length - src.len()).min(BODY_RESERVE_LIMIT));
                        self.state = DecodeState::Body(head, BodyFraming::Length(length));
                        return Ok(None);
                    }
                    let body = src.split_to(length).freeze();
                    return Ok(Some(self.finish(head, body)));
                }
                DecodeState::Body(head, BodyFraming::Chunked) => match decode_chunked(src)? {
                    Some(body) => return Ok(Some(self.finish(head, body))),
                    None => {
                        self.state = DecodeState::Body(head, BodyFraming::Chunked);
                        return Ok(None);
                    }
                },
                DecodeState::Body(head, BodyFraming::UntilClose) => {
                    self.state = DecodeState::Body(head, BodyFraming::UntilClose);
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(response) = self.decode(src)? {
            return Ok(Some(response));
        }

        match std::mem::replace(&mut self.state, DecodeState::Head) {
            DecodeState::Body(head, BodyFraming::UntilClose) => {
                let body = src.split().freeze();
                Ok(Some(self.finish(head, body)))
            }
            DecodeState::Head if src.is_empty() => Ok(None),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-response",
            )),
        }
    }
}

/// Decode a complete chunked body, consuming it from `src`
///
/// Returns `Ok(None)` without consuming anything until the terminating chunk
/// and trailers are buffered.
fn decode_chunked(src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
    let mut body = BytesMut::new();
    let mut pos = 0;

    loop {
        let Some(line_len) = find(&src[pos..], CRLF) else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&src[pos..pos + line_len])
            .map_err(|_| invalid("chunk size is not valid UTF-8"))?;
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| invalid(format!("invalid chunk size `{size_field}`")))?;
        pos += line_len + CRLF.len();

        if size == 0 {
            // Trailers run until an empty line
            loop {
                let Some(trailer_len) = find(&src[pos..], CRLF) else {
                    return Ok(None);
                };
                pos += trailer_len + CRLF.len();
                if trailer_len == 0 {
                    src.advance(pos);
                    return Ok(Some(body.freeze()));
                }
            }
        }

        let chunk_end = pos
            .checked_add(size)
            .and_then(|end| end.checked_add(CRLF.len()))
            .ok_or_else(|| invalid(format!("chunk size `{size_field}` out of range")))?;
        if src.len() < chunk_end {
            return Ok(None);
        }
        body.extend_from_slice(&src[pos..pos + size]);
        pos += size;
        if &src[pos..pos + CRLF.len()] != CRLF {
            return Err(invalid("chunk data not terminated by CRLF"));
        }
        pos += CRLF.len();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
