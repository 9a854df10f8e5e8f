#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;

use loach::{Responder, Server, ServerConf};

pub(crate) mod client;
pub(crate) mod tracing_common;

/// Drive a test on a current-thread runtime inside a LocalSet, the way
/// the server expects to be run.
pub(crate) fn run(test: impl Future<Output = ()>) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async {
        tracing_common::setup_tracing();
        test.await;
    });
}

/// Start a server on an ephemeral port and hand back its address.
pub(crate) async fn start_server<R>(conf: ServerConf, responder: R) -> (Server, SocketAddr)
where
    R: Responder + 'static,
    R::Error: 'static,
{
    let server = Server::new(conf);
    server.start(responder).await.expect("server starts");
    let addr = server.local_addr().expect("bound address");
    (server, addr)
}
