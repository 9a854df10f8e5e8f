//! The outer lifecycle state machine: bind, accept, graceful shutdown.

use std::{
    cell::{Cell, RefCell},
    net::SocketAddr,
    rc::Rc,
};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{StartError, WaitError};
use crate::init::{ConnInitializer, Middleware, MiddlewareFactory};
use crate::{BindAddr, RespondContext, Responder, ServerConf};

/// Transitions run strictly forward; there is no way back out of
/// `Shutdown`.
enum ServerState {
    Initial,
    Starting,
    Running {
        local_addr: Option<SocketAddr>,
        accept: Option<JoinHandle<()>>,
    },
    ShuttingDown,
    Shutdown,
}

/// An embeddable HTTP server.
///
/// Owns the listener, hands every accepted connection to the
/// per-connection initializer, and coordinates graceful shutdown: once
/// [`Server::stop`] is called no new connections are accepted, live ones
/// are told to quiesce, and the stop future resolves only after the last
/// of them has closed.
///
/// Must be driven from inside a [`tokio::task::LocalSet`] on a
/// current-thread runtime; connections are pinned to that executor for
/// their whole lifetime.
pub struct Server {
    conf: Rc<ServerConf>,
    state: Rc<RefCell<ServerState>>,
    middleware: RefCell<Vec<MiddlewareFactory>>,
    quiesce: watch::Sender<bool>,
    conns: Rc<ConnCounter>,
    done: watch::Sender<bool>,
}

impl Server {
    pub fn new(conf: ServerConf) -> Self {
        let (quiesce, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        Self {
            conf: Rc::new(conf),
            state: Rc::new(RefCell::new(ServerState::Initial)),
            middleware: RefCell::new(Vec::new()),
            quiesce,
            conns: Rc::new(ConnCounter::default()),
            done,
        }
    }

    pub fn conf(&self) -> &ServerConf {
        &self.conf
    }

    /// Register a middleware factory. Factories run once per accepted
    /// connection, in registration order, so every connection gets fresh
    /// handler instances. Only factories registered before
    /// [`Server::start`] take effect.
    pub fn add_middleware<M, F>(&self, factory: F)
    where
        M: Middleware + 'static,
        F: Fn() -> M + 'static,
    {
        self.middleware
            .borrow_mut()
            .push(Box::new(move || Box::new(factory())));
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Calling `start` on a server that is already starting or running is
    /// a contract violation and fails with
    /// [`StartError::AlreadyStarted`]; a stopped server stays stopped.
    pub async fn start<R>(&self, responder: R) -> Result<(), StartError>
    where
        R: Responder + 'static,
        R::Error: 'static,
    {
        {
            let mut state = self.state.borrow_mut();
            match &*state {
                ServerState::Initial => *state = ServerState::Starting,
                ServerState::Starting | ServerState::Running { .. } => {
                    return Err(StartError::AlreadyStarted)
                }
                ServerState::ShuttingDown => return Err(StartError::ShuttingDown),
                ServerState::Shutdown => return Err(StartError::Shutdown),
            }
        }

        let listener = match bind(&self.conf).await {
            Ok(listener) => listener,
            Err(e) => {
                // back to square one; start may be retried
                *self.state.borrow_mut() = ServerState::Initial;
                return Err(StartError::Bind(e));
            }
        };

        // stop() may have run while we were binding
        if !matches!(&*self.state.borrow(), ServerState::Starting) {
            debug!("server stopped while binding, closing fresh listener");
            drop(listener);
            return Err(StartError::Shutdown);
        }

        let local_addr = listener.local_addr();
        if let Some(addr) = local_addr {
            info!(%addr, "listening");
        }

        let init = Rc::new(ConnInitializer::new(
            self.conf.clone(),
            std::mem::take(&mut *self.middleware.borrow_mut()),
        ));
        let accept = tokio::task::spawn_local(accept_loop(
            listener,
            self.conf.clone(),
            init,
            Rc::new(responder),
            self.quiesce.subscribe(),
            self.conns.clone(),
        ));

        *self.state.borrow_mut() = ServerState::Running {
            local_addr,
            accept: Some(accept),
        };
        Ok(())
    }

    /// Stop the server: close the listener, quiesce live connections,
    /// resolve once the last one is gone. Idempotent; concurrent callers
    /// all resolve when shutdown completes. Before `start`, transitions
    /// straight to shutdown.
    pub async fn stop(&self) {
        enum Plan {
            Done,
            Await,
            Drive(Option<JoinHandle<()>>),
        }

        let plan = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                ServerState::Initial | ServerState::Starting => {
                    *state = ServerState::Shutdown;
                    Plan::Done
                }
                ServerState::Running { accept, .. } => {
                    let accept = accept.take();
                    *state = ServerState::ShuttingDown;
                    Plan::Drive(accept)
                }
                ServerState::ShuttingDown => Plan::Await,
                ServerState::Shutdown => return,
            }
        };

        match plan {
            Plan::Done => {
                let _ = self.done.send(true);
            }
            Plan::Drive(accept) => {
                debug!("initiating quiesce");
                let _ = self.quiesce.send(true);
                if let Some(accept) = accept {
                    let _ = accept.await;
                }
                self.conns.drained().await;
                *self.state.borrow_mut() = ServerState::Shutdown;
                let _ = self.done.send(true);
                info!("server stopped");
            }
            Plan::Await => self.await_done().await,
        }
    }

    /// Wait until the server has fully shut down.
    pub async fn wait(&self) -> Result<(), WaitError> {
        match &*self.state.borrow() {
            ServerState::Initial | ServerState::Starting => return Err(WaitError::NotRunning),
            ServerState::Shutdown => return Ok(()),
            _ => {}
        }
        self.await_done().await;
        Ok(())
    }

    async fn await_done(&self) {
        let mut done = self.done.subscribe();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    /// The bound address while running; `None` over Unix domain sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.borrow() {
            ServerState::Running { local_addr, .. } => *local_addr,
            _ => None,
        }
    }

    /// The port requests arrive on: the bound port while running
    /// (ephemeral port 0 resolved at bind), otherwise the configured
    /// nonzero port if there is one.
    pub fn port(&self) -> Option<u16> {
        if let Some(addr) = self.local_addr() {
            return Some(addr.port());
        }
        match &self.conf.address {
            BindAddr::Tcp { port, .. } if *port != 0 => Some(*port),
            _ => None,
        }
    }
}

#[derive(Default)]
struct ConnCounter {
    count: Cell<usize>,
    zero: Notify,
}

impl ConnCounter {
    fn guard(self: &Rc<Self>) -> ConnGuard {
        self.count.set(self.count.get() + 1);
        ConnGuard(self.clone())
    }

    async fn drained(&self) {
        loop {
            let notified = self.zero.notified();
            if self.count.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct ConnGuard(Rc<ConnCounter>);

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let count = self.0.count.get() - 1;
        self.0.count.set(count);
        if count == 0 {
            self.0.zero.notify_waiters();
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

enum Accepted {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<(Accepted, Option<SocketAddr>)> {
        match self {
            Listener::Tcp(listener) => listener
                .accept()
                .await
                .map(|(stream, peer)| (Accepted::Tcp(stream), Some(peer))),
            #[cfg(unix)]
            Listener::Unix(listener) => listener
                .accept()
                .await
                .map(|(stream, _)| (Accepted::Unix(stream), None)),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(_) => None,
        }
    }
}

async fn bind(conf: &ServerConf) -> std::io::Result<Listener> {
    match &conf.address {
        BindAddr::Tcp { host, port } => {
            let mut last_err = None;
            for addr in tokio::net::lookup_host((host.as_str(), *port)).await? {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                if conf.reuse_address {
                    socket.set_reuseaddr(true)?;
                }
                if let Err(e) = socket.bind(addr) {
                    last_err = Some(e);
                    continue;
                }
                match socket.listen(conf.backlog) {
                    Ok(listener) => return Ok(Listener::Tcp(listener)),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "bind address resolved to nothing",
                )
            }))
        }
        #[cfg(unix)]
        BindAddr::Unix { path } => {
            // a stale socket file from a previous run would fail the bind
            let _ = std::fs::remove_file(path);
            UnixListener::bind(path).map(Listener::Unix)
        }
    }
}

async fn accept_loop<R>(
    listener: Listener,
    conf: Rc<ServerConf>,
    init: Rc<ConnInitializer>,
    responder: Rc<R>,
    mut quiesce: watch::Receiver<bool>,
    conns: Rc<ConnCounter>,
) where
    R: Responder + 'static,
    R::Error: 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = quiesce.changed() => {
                if *quiesce.borrow() || quiesce.has_changed().is_err() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((accepted, peer_addr)) => {
                    let guard = conns.guard();
                    let conf = conf.clone();
                    let init = init.clone();
                    let responder = responder.clone();
                    let quiesce = quiesce.clone();
                    let rcx = RespondContext {
                        peer_addr,
                        tls: false,
                    };
                    debug!(?peer_addr, "accepted connection");
                    tokio::task::spawn_local(async move {
                        let _guard = guard;
                        match accepted {
                            Accepted::Tcp(stream) => {
                                if conf.tcp_nodelay {
                                    let _ = stream.set_nodelay(true);
                                }
                                init.run(stream, responder, quiesce, rcx).await;
                            }
                            #[cfg(unix)]
                            Accepted::Unix(stream) => {
                                init.run(stream, responder, quiesce, rcx).await;
                            }
                        }
                    });
                }
                Err(e) => {
                    // transient accept failures (EMFILE and friends) must
                    // not kill the listener
                    warn!(error = %e, "accept error");
                }
            },
        }
    }
    debug!("listener closed");
}
