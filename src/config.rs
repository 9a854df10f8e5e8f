#[cfg(unix)]
use std::path::PathBuf;
use std::{sync::Arc, time::Duration};

/// Where the server listens.
#[derive(Debug, Clone)]
pub enum BindAddr {
    /// Host and port. Port 0 asks the OS for an ephemeral port, resolved
    /// at bind time and observable through [`crate::Server::port`].
    Tcp { host: String, port: u16 },

    /// Path to a Unix domain socket.
    #[cfg(unix)]
    Unix { path: PathBuf },
}

impl BindAddr {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl Default for BindAddr {
    fn default() -> Self {
        Self::Tcp {
            host: "127.0.0.1".into(),
            port: 0,
        }
    }
}

/// Which protocol a plaintext listener speaks. With TLS configured the
/// protocol is negotiated per connection through ALPN instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Http1,
    /// Prior-knowledge HTTP/2 (no upgrade dance).
    Http2,
}

/// Read/write inactivity limits for one connection.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout {
    /// Close when nothing has been read for this long while the peer owes
    /// us bytes (HTTP/1.1: waiting between requests; HTTP/2: streams open).
    pub read: Duration,

    /// Close when nothing has been written for this long and no work is
    /// outstanding (HTTP/2: no open streams).
    pub write: Duration,
}

/// TLS front handler configuration. Certificate loading and cipher policy
/// belong to the rustls config the caller hands in; loach only installs
/// the handler at pipeline head and reads the ALPN result.
#[derive(Clone)]
pub struct TlsOptions {
    pub server_config: Arc<rustls::ServerConfig>,
}

impl std::fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsOptions").finish_non_exhaustive()
    }
}

/// Server configuration. Immutable once the server is built.
#[derive(Debug, Clone)]
pub struct ServerConf {
    pub address: BindAddr,

    /// Plaintext protocol selection; ignored when `tls` is set.
    pub protocol: Protocol,

    /// When set, emitted as the `Server` header on every response.
    pub server_name: Option<String>,

    /// Upper bound on an accepted request body. A body that would exceed
    /// it fails the request's body stream with payload-too-large and the
    /// connection is closed once the response (if any) is written.
    pub max_upload_size: u64,

    /// Soft ceiling on buffered streaming-body bytes. At or above it the
    /// connection stops issuing transport reads until the consumer drains
    /// back below.
    pub max_streaming_buffer_size: u64,

    /// Max length of the request line + headers, `431` beyond that.
    pub max_header_bytes: usize,

    /// Listener backlog. Ignored on platforms that manage it themselves
    /// (Unix domain sockets among them).
    pub backlog: u32,

    /// Whether to set SO_REUSEADDR on the listener.
    pub reuse_address: bool,

    /// Whether to disable Nagle on accepted connections. Applied to TCP
    /// sockets only; silently ignored on other transports.
    pub tcp_nodelay: bool,

    /// Whether responses to pipelined requests are serialized so response
    /// N+1 can never overtake response N on the same connection.
    pub with_pipelining_assistance: bool,

    /// Whether malformed requests are answered with a `400` before the
    /// connection closes, instead of closing silently.
    pub http_error_handling: bool,

    /// Whether outbound header names/values are checked for CR/LF/NUL
    /// before being written.
    pub outbound_header_validation: bool,

    pub h1_idle_timeout: Option<IdleTimeout>,
    pub h2_idle_timeout: Option<IdleTimeout>,

    pub tls: Option<TlsOptions>,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            address: BindAddr::default(),
            protocol: Protocol::default(),
            server_name: None,
            max_upload_size: 2 * 1024 * 1024,
            max_streaming_buffer_size: 64 * 1024,
            max_header_bytes: 64 * 1024,
            backlog: 256,
            reuse_address: true,
            tcp_nodelay: true,
            with_pipelining_assistance: true,
            http_error_handling: true,
            outbound_header_validation: false,
            h1_idle_timeout: None,
            h2_idle_timeout: None,
            tls: None,
        }
    }
}
