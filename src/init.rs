//! Per-connection pipeline assembly: protocol selection (plain HTTP/1.1,
//! prior-knowledge HTTP/2, or TLS with ALPN), a fresh middleware stack
//! per connection, and the hand-off into the matching serve loop.

use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::{h1, h2, Protocol, Request, RespondContext, Responder, Response, ServerConf};

/// A per-connection hook around the responder. Instances are built fresh
/// for every accepted connection, in registration order, so no handler
/// state is ever shared across connections.
pub trait Middleware {
    /// Runs before the responder, in registration order.
    fn on_request(&mut self, _req: &mut Request) {}

    /// Runs after the responder, in reverse registration order.
    fn on_response(&mut self, _res: &mut Response) {}
}

/// Builds one [`Middleware`] instance per connection.
pub type MiddlewareFactory = Box<dyn Fn() -> Box<dyn Middleware>>;

/// Deterministic per-connection setup: two initializers built from the
/// same configuration assemble equivalent pipelines. The TLS handler,
/// when configured, sits at pipeline head and its ALPN result picks the
/// protocol.
pub(crate) struct ConnInitializer {
    conf: Rc<ServerConf>,
    tls: Option<TlsAcceptor>,
    middleware: Vec<MiddlewareFactory>,
}

impl ConnInitializer {
    pub(crate) fn new(conf: Rc<ServerConf>, middleware: Vec<MiddlewareFactory>) -> Self {
        let tls = conf
            .tls
            .as_ref()
            .map(|t| TlsAcceptor::from(t.server_config.clone()));
        Self {
            conf,
            tls,
            middleware,
        }
    }

    fn fresh_middleware(&self) -> Vec<Box<dyn Middleware>> {
        self.middleware.iter().map(|factory| factory()).collect()
    }

    /// Drive one accepted connection to completion. Errors end the
    /// connection and are logged, never propagated: one bad connection
    /// must not take the listener down.
    pub(crate) async fn run<IO, R>(
        &self,
        io: IO,
        responder: Rc<R>,
        quiesce: watch::Receiver<bool>,
        mut rcx: RespondContext,
    ) where
        IO: AsyncRead + AsyncWrite + Unpin,
        R: Responder + 'static,
        R::Error: 'static,
    {
        let middleware = self.fresh_middleware();
        let conf = self.conf.clone();

        match &self.tls {
            Some(acceptor) => {
                let stream = match acceptor.accept(io).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(error = %e, "TLS handshake failed");
                        return;
                    }
                };
                rcx.tls = true;
                let alpn = stream
                    .get_ref()
                    .1
                    .alpn_protocol()
                    .map(|p| p.to_vec());
                debug!(alpn = ?alpn.as_deref().map(String::from_utf8_lossy), "TLS handshake done");

                let result = match alpn.as_deref() {
                    Some(b"h2") => {
                        h2::serve(stream, conf, responder, middleware, quiesce, rcx).await
                    }
                    // `http/1.1`, or no ALPN at all: default to HTTP/1.1
                    _ => h1::serve(stream, conf, responder, middleware, quiesce, rcx).await,
                };
                log_outcome(result);
            }
            None => {
                let result = match self.conf.protocol {
                    Protocol::Http1 => {
                        h1::serve(io, conf, responder, middleware, quiesce, rcx).await
                    }
                    Protocol::Http2 => {
                        h2::serve(io, conf, responder, middleware, quiesce, rcx).await
                    }
                };
                log_outcome(result);
            }
        }
    }
}

fn log_outcome<E: std::fmt::Display>(result: Result<crate::ServeOutcome, E>) {
    match result {
        Ok(outcome) => debug!(?outcome, "connection closed"),
        Err(e) => debug!(error = %e, "connection errored"),
    }
}
