//! HTTP/1.1 response serialization: status line, headers, fixed and
//! chunked bodies.

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use tracing::debug;

/// Serialize the status line and header block, final CRLF included.
pub(crate) fn encode_head(status: StatusCode, version: Version, headers: &HeaderMap) -> Bytes {
    let mut out = BytesMut::with_capacity(256);
    match version {
        Version::HTTP_10 => out.put_slice(b"HTTP/1.0 "),
        _ => out.put_slice(b"HTTP/1.1 "),
    }
    out.put_slice(status.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    out.put_slice(b"\r\n");

    for (name, value) in headers {
        out.put_slice(name.as_str().as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
    out.freeze()
}

/// One chunk of a chunked-framing body.
pub(crate) fn encode_chunk(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
    out.freeze()
}

/// The last-chunk marker ending a chunked body.
pub(crate) const CHUNKED_END: &[u8] = b"0\r\n\r\n";

/// Drop headers that would corrupt the wire if written. `http`'s typed
/// values already refuse CR/LF and NUL, so this only catches values
/// smuggled in through unchecked construction.
pub(crate) fn strip_invalid_headers(headers: &mut HeaderMap) {
    let bad: Vec<http::HeaderName> = headers
        .iter()
        .filter(|(_, value)| {
            value
                .as_bytes()
                .iter()
                .any(|&b| b == b'\r' || b == b'\n' || b == 0)
        })
        .map(|(name, _)| name.clone())
        .collect();
    for name in bad {
        debug!(%name, "dropping outbound header with invalid value");
        headers.remove(name);
    }
}
