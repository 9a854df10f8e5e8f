//! loach is the connection-and-request core of an embeddable HTTP server:
//! it accepts TCP (optionally TLS) connections, parses HTTP/1.1 and HTTP/2
//! traffic into a uniform request representation, hands each request to a
//! user-supplied [`Responder`], writes the response, and shepherds every
//! connection from accept through graceful shutdown.
//!
//! The crate never requires `Send` futures: a server and all its
//! connections are pinned to one current-thread executor, and must be
//! driven from inside a [`tokio::task::LocalSet`]. Per-connection ordering
//! comes from executor serialization, not from locks.
//!
//! ```no_run
//! use loach::{Request, Response, Responder, RespondContext, Server, ServerConf};
//!
//! struct Hello;
//!
//! impl Responder for Hello {
//!     type Error = std::convert::Infallible;
//!
//!     async fn respond(&self, _req: Request, _cx: &RespondContext) -> Result<Response, Self::Error> {
//!         Ok(Response::with_body("hello\n"))
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rt = tokio::runtime::Builder::new_current_thread()
//!         .enable_all()
//!         .build()?;
//!     let local = tokio::task::LocalSet::new();
//!     local.block_on(&rt, async {
//!         let server = Server::new(ServerConf::default());
//!         server.start(Hello).await?;
//!         server.wait().await?;
//!         Ok(())
//!     })
//! }
//! ```

use std::net::SocketAddr;

mod types;
pub use types::*;

pub mod error;

mod assemble;
mod config;
mod init;
mod server;
mod streamer;

pub mod h1;
pub mod h2;

pub use config::*;
pub use init::{Middleware, MiddlewareFactory};
pub use server::Server;
pub use streamer::ByteStream;

/// re-exported so consumers can use the same version we do
pub use http;

/// What a request was received over, and where from.
///
/// Handed to [`Responder::respond`] alongside the request. Buffers are
/// plain [`bytes::Bytes`]; the executor is the connection's own local
/// task, so anything awaited inside `respond` completes there.
#[derive(Debug, Clone)]
pub struct RespondContext {
    /// Peer address for TCP connections, `None` over Unix domain sockets.
    pub peer_addr: Option<SocketAddr>,

    /// Whether the connection came in through the TLS front handler.
    pub tls: bool,
}

/// The application half of the server: turns requests into responses.
///
/// A responder may freely drive async work, and may consume the request
/// body (through its streamer) at most once. Its future is awaited on the
/// connection's executor, so completions marshal back there naturally.
#[allow(async_fn_in_trait)] // we never require Send
pub trait Responder {
    type Error: error::ResponderError;

    async fn respond(&self, req: Request, cx: &RespondContext) -> Result<Response, Self::Error>;
}
