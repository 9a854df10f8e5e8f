//! Error taxonomy: lifecycle errors, per-connection serve errors, and the
//! body stream error that responders observe while consuming an upload.

use std::fmt;

use bytes::Bytes;
use http::StatusCode;

use crate::{Response, ResponseBody};

/// Why [`crate::Server::start`] refused or failed.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// `start` was called while the server was already starting or
    /// running. A contract violation, not a recoverable condition.
    #[error("server already started")]
    AlreadyStarted,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("server already shut down")]
    Shutdown,

    /// Binding the listener failed; the server is back in its initial
    /// state and `start` may be retried.
    #[error("could not bind listener: {0}")]
    Bind(#[source] std::io::Error),
}

/// Why [`crate::Server::wait`] could not wait.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("server is not running")]
    NotRunning,
}

/// What a request-body stream can fail with, observed by the consumer on
/// its next read.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The body exceeded the configured upload ceiling. The transport is
    /// closed after the in-flight response (if any) is written.
    #[error("request body exceeded maximum upload size of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    /// The transport errored below HTTP while the body was streaming.
    #[error("transport error while streaming request body: {0}")]
    Transport(#[source] std::io::Error),

    /// The peer reset the stream / closed the connection mid-body.
    #[error("peer went away mid request body")]
    Closed,

    /// The codec could not make sense of the body framing.
    #[error("malformed request body: {0}")]
    Malformed(&'static str),
}

/// Any error that can occur while servicing a connection.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ServeError<ResponderError> {
    /// An error occurred while writing to the downstream
    #[error("error writing to downstream: {0}")]
    DownstreamWrite(#[from] std::io::Error),

    /// The responder errored out and no response could be synthesized
    #[error("responder error: {0:?}")]
    Responder(ResponderError),

    /// An error occurred while handling an HTTP/2 connection
    #[error("HTTP/2 connection error: {0}")]
    H2(#[from] h2::Error),

    /// The TLS handshake at pipeline head failed
    #[error("TLS handshake error: {0}")]
    Tls(#[source] std::io::Error),
}

/// Inbound parse failures on the HTTP/1.1 path.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),

    #[error("request headers larger than {limit} bytes")]
    HeadersTooLarge { limit: usize },
}

impl HttpError {
    /// The auto-reply emitted when `http_error_handling` is on.
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            HttpError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::HeadersTooLarge { .. } => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
        }
    }
}

/// Contract for errors a [`crate::Responder`] surfaces.
///
/// Response-bearing errors (an HTTP status plus body) are written as-is
/// and logged at debug level; anything else becomes a plain
/// `500 Internal Server Error` logged at info level.
pub trait ResponderError: fmt::Debug + fmt::Display {
    /// The response to send for this error; `None` means a plain 500.
    fn as_response(&self) -> Option<Response> {
        None
    }
}

impl ResponderError for std::convert::Infallible {}
impl ResponderError for std::io::Error {}
impl ResponderError for StreamError {}

/// Turn a responder error into the response that goes on the wire.
pub(crate) fn error_to_response<E: ResponderError>(e: &E) -> Response {
    match e.as_response() {
        Some(response) => {
            tracing::debug!(error = %e, "responder error carried a response");
            response
        }
        None => {
            tracing::info!(error = %e, "responder error, replying 500");
            Response::new(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// A ready-made response-bearing responder error.
#[derive(thiserror::Error)]
#[error("request failed with status {status}")]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub message: Bytes,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, message: impl Into<Bytes>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Debug for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ErrorResponse");
        s.field("status", &self.status);
        match std::str::from_utf8(&self.message[..]) {
            Ok(body) => s.field("body", &body),
            Err(_) => s.field("body", &"(not utf-8)"),
        };
        s.finish()
    }
}

impl ResponderError for ErrorResponse {
    fn as_response(&self) -> Option<Response> {
        let mut res = Response::new(self.status);
        res.body = ResponseBody::Buffered(self.message.clone());
        Some(res)
    }
}
