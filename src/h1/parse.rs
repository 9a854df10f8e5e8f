//! Incremental HTTP/1.1 request decoding: head parsing over `httparse`,
//! then content-length or chunked body framing, surfaced as codec events.

use bytes::BytesMut;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::assemble::CodecEvent;
use crate::error::HttpError;
use crate::types::RequestHead;

/// Max number of header records we hand to httparse.
const MAX_HEADER_RECORDS: usize = 128;

/// Max length of a chunk-size line, hex digits plus extensions.
const MAX_CHUNK_SIZE_LINE: usize = 128;

/// How much we try to read from the transport at a time.
const READ_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub(crate) enum DecodeError {
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(HttpError),

    #[error("peer closed the connection mid-message")]
    UnexpectedEof,
}

#[derive(Debug)]
enum DecodeState {
    /// waiting for (more of) the request line + headers
    Head,

    /// reading a content-length body
    FixedBody { remain: u64 },

    /// reading a chunk-size line
    ChunkHeader,

    /// reading chunk data
    ChunkData { remain: u64 },

    /// reading the CRLF after a chunk's data
    ChunkTerminator,

    /// after the zero chunk: discarding trailer lines until the blank one
    ChunkTrailer,

    /// the body is complete; emit `End` and start over
    BodyDone,
}

/// Pull-driven request decoder. One instance per connection; the caller
/// owns the read half and the pace (which is what backpressure hangs on).
pub(crate) struct Decoder {
    buf: BytesMut,
    state: DecodeState,
    max_header_bytes: usize,
}

impl Decoder {
    pub(crate) fn new(max_header_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_SIZE),
            state: DecodeState::Head,
            max_header_bytes,
        }
    }

    /// Between requests, with nothing buffered: a clean EOF is a normal
    /// way for the connection to end.
    pub(crate) fn is_between_requests(&self) -> bool {
        matches!(self.state, DecodeState::Head) && self.buf.is_empty()
    }

    /// Decode the next codec event, reading from `rd` as needed.
    ///
    /// Returns `None` on a clean EOF between requests. Cancel-safe: any
    /// bytes read stay buffered.
    pub(crate) async fn next_event<R>(
        &mut self,
        rd: &mut R,
    ) -> Result<Option<CodecEvent>, DecodeError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(event) = self.decode()? {
                return Ok(Some(event));
            }

            self.buf.reserve(READ_SIZE);
            let n = rd.read_buf(&mut self.buf).await?;
            trace!(n, buffered = self.buf.len(), "read from transport");
            if n == 0 {
                if self.is_between_requests() {
                    return Ok(None);
                }
                return Err(DecodeError::UnexpectedEof);
            }
        }
    }

    /// Try to produce one event from what's buffered.
    fn decode(&mut self) -> Result<Option<CodecEvent>, DecodeError> {
        loop {
            match &mut self.state {
                DecodeState::Head => {
                    let Some((head, consumed)) =
                        parse_head(&self.buf, self.max_header_bytes)?
                    else {
                        return Ok(None);
                    };
                    let _ = self.buf.split_to(consumed);

                    self.state = if head.is_chunked_transfer_encoding() {
                        DecodeState::ChunkHeader
                    } else {
                        match head.content_length() {
                            Some(len) if len > 0 => DecodeState::FixedBody { remain: len },
                            _ => DecodeState::BodyDone,
                        }
                    };
                    return Ok(Some(CodecEvent::Head(head)));
                }

                DecodeState::FixedBody { remain } => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = (*remain).min(self.buf.len() as u64) as usize;
                    let chunk = self.buf.split_to(take).freeze();
                    *remain -= take as u64;
                    if *remain == 0 {
                        self.state = DecodeState::BodyDone;
                    }
                    return Ok(Some(CodecEvent::Body(chunk)));
                }

                DecodeState::ChunkHeader => {
                    let Some((size, consumed)) = parse_chunk_size(&self.buf)? else {
                        return Ok(None);
                    };
                    let _ = self.buf.split_to(consumed);
                    self.state = if size == 0 {
                        DecodeState::ChunkTrailer
                    } else {
                        DecodeState::ChunkData { remain: size }
                    };
                }

                DecodeState::ChunkData { remain } => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = (*remain).min(self.buf.len() as u64) as usize;
                    let chunk = self.buf.split_to(take).freeze();
                    *remain -= take as u64;
                    if *remain == 0 {
                        self.state = DecodeState::ChunkTerminator;
                    }
                    return Ok(Some(CodecEvent::Body(chunk)));
                }

                DecodeState::ChunkTerminator => {
                    if self.buf.len() < 2 {
                        return Ok(None);
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(DecodeError::Http(HttpError::MalformedRequest(
                            "chunk data not followed by CRLF",
                        )));
                    }
                    let _ = self.buf.split_to(2);
                    self.state = DecodeState::ChunkHeader;
                }

                DecodeState::ChunkTrailer => {
                    // trailer section: lines until a blank one; we accept
                    // and discard them
                    let Some(line_end) = find_crlf(&self.buf) else {
                        if self.buf.len() > self.max_header_bytes {
                            return Err(DecodeError::Http(HttpError::MalformedRequest(
                                "unterminated chunked trailer",
                            )));
                        }
                        return Ok(None);
                    };
                    let blank = line_end == 0;
                    let _ = self.buf.split_to(line_end + 2);
                    if blank {
                        self.state = DecodeState::BodyDone;
                    }
                }

                DecodeState::BodyDone => {
                    self.state = DecodeState::Head;
                    return Ok(Some(CodecEvent::End));
                }
            }
        }
    }
}

/// Parse a request head out of `buf`. `Ok(None)` means incomplete.
fn parse_head(
    buf: &[u8],
    max_header_bytes: usize,
) -> Result<Option<(RequestHead, usize)>, DecodeError> {
    let mut records = [httparse::EMPTY_HEADER; MAX_HEADER_RECORDS];
    let mut parsed = httparse::Request::new(&mut records);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            if consumed > max_header_bytes {
                return Err(DecodeError::Http(HttpError::HeadersTooLarge {
                    limit: max_header_bytes,
                }));
            }

            let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
                .map_err(|_| malformed("unknown method"))?;
            let uri: Uri = parsed
                .path
                .unwrap_or("")
                .parse()
                .map_err(|_| malformed("invalid request target"))?;
            let version = match parsed.version {
                Some(0) => Version::HTTP_10,
                Some(1) => Version::HTTP_11,
                _ => return Err(malformed("unsupported HTTP version")),
            };

            let mut headers = HeaderMap::with_capacity(parsed.headers.len());
            for record in parsed.headers.iter() {
                let name = HeaderName::from_bytes(record.name.as_bytes())
                    .map_err(|_| malformed("invalid header name"))?;
                let value = HeaderValue::from_bytes(record.value)
                    .map_err(|_| malformed("invalid header value"))?;
                headers.append(name, value);
            }

            Ok(Some((
                RequestHead {
                    method,
                    uri,
                    version,
                    headers,
                },
                consumed,
            )))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() >= max_header_bytes {
                return Err(DecodeError::Http(HttpError::HeadersTooLarge {
                    limit: max_header_bytes,
                }));
            }
            Ok(None)
        }
        Err(_) => Err(malformed("invalid request line or headers")),
    }
}

/// Parse a `chunk-size [;extensions] CRLF` line. `Ok(None)` means
/// incomplete.
fn parse_chunk_size(buf: &[u8]) -> Result<Option<(u64, usize)>, DecodeError> {
    let Some(line_end) = find_crlf(buf) else {
        if buf.len() > MAX_CHUNK_SIZE_LINE {
            return Err(malformed("chunk size line too long"));
        }
        return Ok(None);
    };
    let line = &buf[..line_end];
    let digits = match line.iter().position(|&b| b == b';') {
        Some(ext) => &line[..ext],
        None => line,
    };
    let digits = std::str::from_utf8(digits)
        .map_err(|_| malformed("chunk size not ascii"))?
        .trim();
    if digits.is_empty() {
        return Err(malformed("empty chunk size"));
    }
    let size = u64::from_str_radix(digits, 16).map_err(|_| malformed("invalid chunk size"))?;
    Ok(Some((size, line_end + 2)))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn malformed(what: &'static str) -> DecodeError {
    DecodeError::Http(HttpError::MalformedRequest(what))
}
