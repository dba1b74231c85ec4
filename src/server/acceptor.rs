use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ServerError;
use crate::http::response::{HttpResponse, StatusCode};
use crate::server::connection::Connection;
use crate::server::handler::{Context, EventHandler, Handler, Op, Status};
use crate::server::poller::Interest;

/// A bound socket and the virtual servers that share its address.
pub struct BoundListener {
    pub listener: TcpListener,
    pub servers: Rc<[usize]>,
}

/// One non-blocking listening socket per distinct address. Servers that
/// list the same address share it and are told apart by `Host`.
pub fn bind_listeners(config: &Config) -> Result<Vec<BoundListener>, ServerError> {
    let mut by_addr: BTreeMap<SocketAddr, Vec<usize>> = BTreeMap::new();
    for (index, server) in config.servers.iter().enumerate() {
        for addr in server.listen_addrs()? {
            let servers = by_addr.entry(addr).or_default();
            if !servers.contains(&index) {
                servers.push(index);
            }
        }
    }

    let mut bound = Vec::with_capacity(by_addr.len());
    for (addr, servers) in by_addr {
        // std sets SO_REUSEADDR on unix listeners.
        let listener = TcpListener::bind(addr).map_err(|e| {
            error!(%addr, "bind failed: {}", e);
            ServerError::Io(e)
        })?;
        listener.set_nonblocking(true)?;
        bound.push(BoundListener {
            listener,
            servers: servers.into(),
        });
    }
    Ok(bound)
}

pub struct Acceptor {
    listener: TcpListener,
    local: SocketAddr,
    servers: Rc<[usize]>,
    config: Rc<Config>,
}

impl Acceptor {
    pub fn new(listener: TcpListener, local: SocketAddr, servers: Rc<[usize]>, config: Rc<Config>) -> Self {
        Acceptor {
            listener,
            local,
            servers,
            config,
        }
    }

    fn reject(&self, stream: TcpStream, peer: SocketAddr) {
        warn!(
            %peer,
            limit = self.config.runtime.max_connections,
            "connection limit reached, rejecting"
        );
        if let Err(e) = stream.set_nonblocking(true) {
            debug!(%peer, "fcntl on rejected connection failed: {}", e);
            return;
        }
        let response = HttpResponse::error(StatusCode::ServiceUnavailable).to_bytes();
        match (&stream).write(&response) {
            Ok(n) if n < response.len() => debug!(%peer, sent = n, "503 truncated"),
            Ok(_) => {}
            Err(e) => debug!(%peer, "writing 503 failed: {}", e),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

impl EventHandler for Acceptor {
    fn fd(&self) -> Option<RawFd> {
        Some(self.listener.as_raw_fd())
    }

    /// Accepts at most one connection; a backlog keeps the fd readable.
    fn on_readable(&mut self, ctx: &mut Context) -> Status {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if is_transient(&e) => {
                debug!(local = %self.local, "accept: {}", e);
                return Status::Continue;
            }
            Err(e) => {
                error!(local = %self.local, "accept failed: {}", e);
                return Status::Fatal(ServerError::Fatal("accept", e));
            }
        };

        if ctx.live_connections() >= self.config.runtime.max_connections {
            self.reject(stream, peer);
            return Status::Continue;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            return Status::Fatal(ServerError::Fatal("fcntl", e));
        }

        let local = stream.local_addr().unwrap_or(self.local);
        let token = ctx.allocate_token();
        info!(%peer, %local, ?token, "new connection");
        let connection = Connection::new(
            stream,
            peer,
            local,
            Rc::clone(&self.servers),
            Rc::clone(&self.config),
            ctx.now(),
        );
        ctx.push(Op::Register {
            token,
            interest: Interest::READABLE,
            handler: Handler::Connection(Box::new(connection)),
        });
        Status::Continue
    }

    fn on_poll_error(&mut self, _ctx: &mut Context) -> Status {
        let err = self
            .listener
            .take_error()
            .ok()
            .flatten()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "listening socket error"));
        error!(local = %self.local, "{}", err);
        Status::Fatal(ServerError::Fatal("epoll_wait", err))
    }
}
