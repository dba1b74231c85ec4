//! The event loop and everything registered in it.
//!
//! - **`poller`**: epoll wrapper keyed by handler tokens
//! - **`handler`**: the handler contract, tokens and queued reactor ops
//! - **`acceptor`**: listening sockets and connection admission
//! - **`connection`**: the per-client state machine
//! - **`reactor`**: dispatch loop, deadlines and handler table
//! - **`shutdown`**: signal-driven stop flag

pub mod acceptor;
pub mod connection;
pub mod handler;
pub mod poller;
pub mod reactor;
pub mod shutdown;

use std::net::SocketAddr;
use std::rc::Rc;

use tracing::info;

use crate::config::Config;
use crate::error::ServerError;
use acceptor::{bind_listeners, Acceptor};
use handler::Handler;
use poller::Interest;
use reactor::Reactor;

pub use shutdown::ShutdownToken;

pub struct Server {
    reactor: Reactor,
    local_addrs: Vec<SocketAddr>,
}

impl Server {
    /// Binds every configured listen address and registers the acceptors.
    pub fn bind(config: Config, shutdown: ShutdownToken) -> Result<Server, ServerError> {
        config.validate()?;
        let config = Rc::new(config);
        let mut reactor = Reactor::new(config.runtime.max_events, shutdown)?;

        let mut local_addrs = Vec::new();
        for bound in bind_listeners(&config)? {
            let local = bound.listener.local_addr()?;
            info!(%local, servers = ?bound.servers, "listening");
            let acceptor = Acceptor::new(bound.listener, local, bound.servers, Rc::clone(&config));
            reactor.register(Handler::Acceptor(acceptor), Interest::READABLE)?;
            local_addrs.push(local);
        }

        Ok(Server {
            reactor,
            local_addrs,
        })
    }

    /// Actual bound addresses, useful when a port of 0 was configured.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn run(mut self) -> Result<(), ServerError> {
        self.reactor.run()
    }
}
