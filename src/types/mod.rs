use std::fmt;

use bytes::Bytes;
use http::{header, HeaderMap, Method, StatusCode, Uri, Version};
use tokio::sync::mpsc;

use crate::error::StreamError;
use crate::streamer::ByteStream;

/// The head of an HTTP request: everything except the body.
#[derive(Clone)]
pub struct RequestHead {
    pub method: Method,

    /// Requested entity
    pub uri: Uri,

    /// The HTTP version used
    pub version: Version,

    /// Request headers
    pub headers: HeaderMap,
}

impl Default for RequestHead {
    fn default() -> Self {
        Self {
            method: Method::GET,
            uri: "/".parse().unwrap(),
            version: Version::HTTP_11,
            headers: Default::default(),
        }
    }
}

impl fmt::Debug for RequestHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHead")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("headers", &self.headers.len())
            .finish()
    }
}

impl RequestHead {
    /// The announced `content-length`, if present and parseable.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked_transfer_encoding(&self) -> bool {
        self.headers
            .get(header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }

    /// Keep-alive eligibility per HTTP/1.1 semantics: 1.1 defaults to
    /// keep-alive unless the client said `connection: close`, 1.0 defaults
    /// to close unless it said `connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.version {
            Version::HTTP_10 => self.connection_has("keep-alive"),
            Version::HTTP_11 => !self.connection_has("close"),
            // HTTP/2 has no connection header; the connection outlives
            // any one stream.
            _ => true,
        }
    }

    fn connection_has(&self, token: &str) -> bool {
        self.headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
    }
}

/// An HTTP request, body included.
#[derive(Debug)]
pub struct Request {
    pub head: RequestHead,
    pub body: RequestBody,
}

/// A request body: fully buffered when it fit in a single read, streamed
/// when it didn't, empty when there was none.
///
/// A `Streamed` body keeps the same [`ByteStream`] for the duration of the
/// request and is consumed at most once; [`RequestBody::into_stream`]
/// moves the streamer out, so re-consumption is unrepresentable.
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Buffered(Bytes),
    Streamed(ByteStream),
}

impl RequestBody {
    /// Take the streamer out of a `Streamed` body.
    pub fn into_stream(self) -> Option<ByteStream> {
        match self {
            RequestBody::Streamed(s) => Some(s),
            _ => None,
        }
    }

    /// Collect the whole body into one buffer. Respects the stream's
    /// upload ceiling through the stream errors themselves.
    pub async fn collect(&mut self) -> Result<Bytes, StreamError> {
        match std::mem::take(self) {
            RequestBody::Empty => Ok(Bytes::new()),
            RequestBody::Buffered(b) => Ok(b),
            RequestBody::Streamed(mut s) => {
                let mut out = bytes::BytesMut::new();
                loop {
                    match s.next_chunk().await? {
                        BodyChunk::Chunk(b) => out.extend_from_slice(&b),
                        BodyChunk::Done => return Ok(out.freeze()),
                    }
                }
            }
        }
    }
}

impl Body for RequestBody {
    fn content_len(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Buffered(b) => Some(b.len() as u64),
            RequestBody::Streamed(s) => s.content_len(),
        }
    }

    fn eof(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Buffered(_) => false,
            RequestBody::Streamed(s) => s.eof(),
        }
    }

    async fn next_chunk(&mut self) -> Result<BodyChunk, StreamError> {
        match self {
            RequestBody::Empty => Ok(BodyChunk::Done),
            RequestBody::Buffered(_) => {
                let RequestBody::Buffered(b) = std::mem::take(self) else {
                    unreachable!()
                };
                Ok(BodyChunk::Chunk(b))
            }
            RequestBody::Streamed(s) => s.next_chunk().await,
        }
    }
}

/// A body chunk
#[derive(Debug)]
pub enum BodyChunk {
    Chunk(Bytes),

    /// The body finished; the terminator is delivered once and then
    /// sticks.
    Done,
}

/// A source of body chunks, pulled by whoever writes them out.
#[allow(async_fn_in_trait)] // we never require Send
pub trait Body: fmt::Debug {
    fn content_len(&self) -> Option<u64>;
    fn eof(&self) -> bool;
    async fn next_chunk(&mut self) -> Result<BodyChunk, StreamError>;
}

/// An HTTP response
#[derive(Debug)]
pub struct Response {
    /// Status code (1xx-5xx)
    pub status: StatusCode,

    /// Response headers
    pub headers: HeaderMap,

    pub body: ResponseBody,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Default::default(),
            body: ResponseBody::Empty,
        }
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// A 200 with a fixed body. The writer announces `content-length`
    /// from the buffer's length.
    pub fn with_body(body: impl Into<Bytes>) -> Self {
        Self {
            body: ResponseBody::Buffered(body.into()),
            ..Default::default()
        }
    }

    /// A 200 with a streamed body, plus the sender half the responder (or
    /// a task it spawns) feeds. On HTTP/1.1 a streamed body goes out with
    /// chunked framing.
    pub fn streamed() -> (Self, BodySender) {
        let (tx, rx) = body_pair();
        (
            Self {
                body: ResponseBody::Streamed(rx),
                ..Default::default()
            },
            tx,
        )
    }

    /// 204 and 304 responses must not have a body
    pub fn means_empty_body(&self) -> bool {
        matches!(
            self.status,
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED
        )
    }
}

/// A response body: a fixed buffer, a streamed producer, or nothing.
#[derive(Debug, Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Buffered(Bytes),
    Streamed(BodyReceiver),
}

/// The producer aborted the body mid-stream. Headers are out by then, so
/// the error cannot be signaled at the HTTP level; the writer terminates
/// the body and closes the connection.
#[derive(Debug, Clone, Copy)]
pub struct BodyAborted;

fn body_pair() -> (BodySender, BodyReceiver) {
    // small on purpose: the channel is a hand-off, backpressure comes
    // from the writer awaiting flushes
    let (tx, rx) = mpsc::channel(8);
    (BodySender { tx }, BodyReceiver { rx })
}

/// Feeds a streamed response body.
#[derive(Clone)]
pub struct BodySender {
    tx: mpsc::Sender<Result<Bytes, BodyAborted>>,
}

impl BodySender {
    /// Queue one chunk. Errors if the connection went away.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> Result<(), BodyAborted> {
        self.tx
            .send(Ok(chunk.into()))
            .await
            .map_err(|_| BodyAborted)
    }

    /// Signal that the body cannot be completed.
    pub async fn abort(&self) {
        let _ = self.tx.send(Err(BodyAborted)).await;
    }

    // Dropping the last sender ends the body.
}

impl fmt::Debug for BodySender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodySender").finish_non_exhaustive()
    }
}

/// The writer's half of a streamed response body.
pub struct BodyReceiver {
    rx: mpsc::Receiver<Result<Bytes, BodyAborted>>,
}

impl BodyReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Result<Bytes, BodyAborted>> {
        self.rx.recv().await
    }
}

impl fmt::Debug for BodyReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyReceiver").finish_non_exhaustive()
    }
}

/// How a connection's serve loop came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// HTTP/1.1 only: the request we handled had a `connection: close`
    /// header
    ClientRequestedConnectionClose,

    /// The server decided to close: quiesce, fatal mid-response error, or
    /// a non-keep-alive-eligible request
    ServerRequestedConnectionClose,

    /// Client closed the connection before sending another request
    /// (without requesting connection close)
    ClientClosedConnectionBetweenRequests,

    /// Client didn't speak the protocol (missing/invalid request line)
    MalformedRequest,

    /// Request headers exceeded the configured cap
    RequestHeadersTooLarge,

    /// A request body ran past the upload ceiling
    RequestBodyTooLarge,

    /// An idle timeout fired
    IdleTimeout,

    /// HTTP/2: the connection drained after GOAWAY
    ConnectionDrained,
}
