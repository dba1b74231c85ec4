//! The contract between the reactor and everything it polls.
//!
//! Handlers never reach into the reactor. They report a [`Status`] for the
//! event they were given and queue [`Op`]s on the [`Context`]; the reactor
//! applies both once the call returns, so the handler table and the poll set
//! are only ever mutated from the loop itself.

use std::os::fd::RawFd;
use std::time::Instant;

use crate::cgi::io::{CgiInput, CgiOutput, CgiReply};
use crate::error::ServerError;
use crate::server::acceptor::Acceptor;
use crate::server::connection::Connection;
use crate::server::poller::Interest;

/// Stable handler id, never reused for the lifetime of a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

#[derive(Debug)]
pub enum Status {
    Continue,
    Close,
    Fatal(ServerError),
}

impl Status {
    pub fn is_continue(&self) -> bool {
        matches!(self, Status::Continue)
    }
}

pub enum Op {
    /// Add a handler; its fd (if any) joins the poll set with `interest`.
    Register {
        token: Token,
        interest: Interest,
        handler: Handler,
    },
    Rearm {
        token: Token,
        interest: Interest,
    },
    /// Leave the poll set but keep the entry, which then lives on its
    /// deadline alone.
    Deregister { token: Token },
    /// Hand the outcome of a CGI run to the connection that started it.
    Deliver { connection: Token, reply: CgiReply },
}

/// Per-dispatch view of the reactor handed to handlers.
pub struct Context {
    now: Instant,
    current: Token,
    next_token: u64,
    live_connections: usize,
    ops: Vec<Op>,
}

impl Context {
    pub(crate) fn new() -> Self {
        Context {
            now: Instant::now(),
            current: Token(0),
            next_token: 1,
            live_connections: 0,
            ops: Vec::new(),
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn token(&self) -> Token {
        self.current
    }

    pub fn live_connections(&self) -> usize {
        self.live_connections
    }

    pub fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub(crate) fn begin(&mut self, now: Instant, current: Token) {
        self.now = now;
        self.current = current;
    }

    pub(crate) fn take_ops(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.ops)
    }

    pub(crate) fn connection_opened(&mut self) {
        self.live_connections += 1;
    }

    pub(crate) fn connection_closed(&mut self) {
        self.live_connections = self.live_connections.saturating_sub(1);
    }
}

pub trait EventHandler {
    /// The descriptor this handler is polled on, `None` once it has let go.
    fn fd(&self) -> Option<RawFd>;

    fn on_readable(&mut self, _ctx: &mut Context) -> Status {
        Status::Continue
    }

    fn on_writable(&mut self, _ctx: &mut Context) -> Status {
        Status::Continue
    }

    /// Error condition with no readable/writable readiness attached.
    fn on_poll_error(&mut self, _ctx: &mut Context) -> Status {
        Status::Close
    }

    fn deadline(&self) -> Option<Instant> {
        None
    }

    fn on_timeout(&mut self, _ctx: &mut Context) -> Status {
        Status::Close
    }
}

pub enum Handler {
    Acceptor(Acceptor),
    Connection(Box<Connection>),
    CgiInput(CgiInput),
    CgiOutput(CgiOutput),
}

impl Handler {
    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Acceptor(_) => "acceptor",
            Handler::Connection(_) => "connection",
            Handler::CgiInput(_) => "cgi-input",
            Handler::CgiOutput(_) => "cgi-output",
        }
    }

    fn inner(&self) -> &dyn EventHandler {
        match self {
            Handler::Acceptor(h) => h,
            Handler::Connection(h) => h.as_ref(),
            Handler::CgiInput(h) => h,
            Handler::CgiOutput(h) => h,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn EventHandler {
        match self {
            Handler::Acceptor(h) => h,
            Handler::Connection(h) => h.as_mut(),
            Handler::CgiInput(h) => h,
            Handler::CgiOutput(h) => h,
        }
    }
}

impl EventHandler for Handler {
    fn fd(&self) -> Option<RawFd> {
        self.inner().fd()
    }

    fn on_readable(&mut self, ctx: &mut Context) -> Status {
        self.inner_mut().on_readable(ctx)
    }

    fn on_writable(&mut self, ctx: &mut Context) -> Status {
        self.inner_mut().on_writable(ctx)
    }

    fn on_poll_error(&mut self, ctx: &mut Context) -> Status {
        self.inner_mut().on_poll_error(ctx)
    }

    fn deadline(&self) -> Option<Instant> {
        self.inner().deadline()
    }

    fn on_timeout(&mut self, ctx: &mut Context) -> Status {
        self.inner_mut().on_timeout(ctx)
    }
}
