use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::error::ServerError;
use crate::server::handler::{Context, EventHandler, Handler, Op, Status, Token};
use crate::server::poller::{Event, Interest, Poller};
use crate::server::shutdown::ShutdownToken;

struct Entry {
    /// The fd as registered; kept so the poll set can be cleaned up even
    /// after the handler has let go of it.
    fd: Option<RawFd>,
    registered: bool,
    handler: Handler,
}

/// Single-threaded readiness loop owning every handler and the poll set.
pub struct Reactor {
    poller: Poller,
    entries: HashMap<Token, Entry>,
    ctx: Context,
    shutdown: ShutdownToken,
}

impl Reactor {
    pub fn new(max_events: usize, shutdown: ShutdownToken) -> Result<Reactor, ServerError> {
        let poller = Poller::new(max_events).map_err(|e| ServerError::Fatal("epoll_create1", e))?;
        Ok(Reactor {
            poller,
            entries: HashMap::new(),
            ctx: Context::new(),
            shutdown,
        })
    }

    pub fn register(&mut self, handler: Handler, interest: Interest) -> Result<Token, ServerError> {
        let token = self.ctx.allocate_token();
        self.insert(token, interest, handler)?;
        Ok(token)
    }

    /// Runs until the shutdown token is triggered or a handler reports a
    /// fatal error. Every handler is dropped on the way out, which kills
    /// any script still running.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(handlers = self.entries.len(), "reactor running");
        let result = loop {
            if self.shutdown.is_triggered() {
                break Ok(());
            }
            if let Err(e) = self.turn() {
                error!("{}", e);
                break Err(e);
            }
        };
        info!(
            handlers = self.entries.len(),
            connections = self.ctx.live_connections(),
            "reactor stopping"
        );
        self.entries.clear();
        result
    }

    /// One iteration: wait, dispatch readiness, then fire expired deadlines.
    pub fn turn(&mut self) -> Result<(), ServerError> {
        let timeout = self
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let events = self
            .poller
            .wait(timeout)
            .map_err(|e| ServerError::Fatal("epoll_wait", e))?;
        for event in events {
            self.dispatch(event)?;
        }
        self.expire_deadlines()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|entry| entry.handler.deadline())
            .min()
    }

    fn dispatch(&mut self, event: Event) -> Result<(), ServerError> {
        let Some(entry) = self.entries.get_mut(&event.token) else {
            // Removed earlier in this batch.
            debug!(token = ?event.token, "stale event");
            return Ok(());
        };
        if !entry.registered {
            return Ok(());
        }
        self.ctx.begin(Instant::now(), event.token);
        let handler = &mut entry.handler;
        let status = if event.error && !event.readable && !event.writable {
            handler.on_poll_error(&mut self.ctx)
        } else {
            let mut status = Status::Continue;
            if event.readable || event.hangup {
                status = handler.on_readable(&mut self.ctx);
            }
            if status.is_continue() && event.writable {
                status = handler.on_writable(&mut self.ctx);
            }
            status
        };
        self.settle(event.token, status)
    }

    fn expire_deadlines(&mut self) -> Result<(), ServerError> {
        let now = Instant::now();
        let mut expired: Vec<Token> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.handler.deadline().is_some_and(|d| d <= now))
            .map(|(token, _)| *token)
            .collect();
        expired.sort();

        for token in expired {
            // An earlier timeout in this pass may have removed or delivered to it.
            let Some(entry) = self.entries.get_mut(&token) else {
                continue;
            };
            if !entry.handler.deadline().is_some_and(|d| d <= now) {
                continue;
            }
            debug!(?token, kind = entry.handler.kind(), "deadline expired");
            self.ctx.begin(now, token);
            let status = entry.handler.on_timeout(&mut self.ctx);
            self.settle(token, status)?;
        }
        Ok(())
    }

    /// Applies a handler's status, then the ops it queued.
    fn settle(&mut self, token: Token, status: Status) -> Result<(), ServerError> {
        let ops = self.ctx.take_ops();
        match status {
            Status::Continue => {}
            Status::Close => self.remove(token),
            Status::Fatal(e) => return Err(e),
        }
        for op in ops {
            self.apply(op)?;
        }
        Ok(())
    }

    fn apply(&mut self, op: Op) -> Result<(), ServerError> {
        match op {
            Op::Register {
                token,
                interest,
                handler,
            } => self.insert(token, interest, handler),
            Op::Rearm { token, interest } => self.rearm(token, interest),
            Op::Deregister { token } => {
                if let Some(entry) = self.entries.get_mut(&token) {
                    if entry.registered {
                        if let Some(fd) = entry.fd {
                            if let Err(e) = self.poller.delete(fd) {
                                warn!(?token, "epoll_ctl(DEL) failed: {}", e);
                            }
                        }
                        entry.registered = false;
                    }
                }
                Ok(())
            }
            Op::Deliver { connection, reply } => {
                let now = Instant::now();
                let interest = match self.entries.get_mut(&connection) {
                    Some(Entry {
                        handler: Handler::Connection(conn),
                        ..
                    }) => conn.deliver_cgi_response(reply, now),
                    _ => {
                        debug!(token = ?connection, "connection gone, dropping CGI response");
                        return Ok(());
                    }
                };
                self.rearm(connection, interest)
            }
        }
    }

    fn insert(&mut self, token: Token, interest: Interest, handler: Handler) -> Result<(), ServerError> {
        let fd = handler.fd();
        if let Some(fd) = fd {
            self.poller
                .add(fd, token, interest)
                .map_err(|e| ServerError::Fatal("epoll_ctl", e))?;
        }
        if let Handler::Connection(_) = handler {
            self.ctx.connection_opened();
        }
        debug!(?token, kind = handler.kind(), ?fd, "registered");
        self.entries.insert(
            token,
            Entry {
                fd,
                registered: fd.is_some(),
                handler,
            },
        );
        Ok(())
    }

    fn rearm(&mut self, token: Token, interest: Interest) -> Result<(), ServerError> {
        let Some(entry) = self.entries.get_mut(&token) else {
            return Ok(());
        };
        let Some(fd) = entry.fd else {
            return Ok(());
        };
        let result = if entry.registered {
            self.poller.modify(fd, token, interest)
        } else {
            self.poller.add(fd, token, interest)
        };
        result.map_err(|e| ServerError::Fatal("epoll_ctl", e))?;
        entry.registered = true;
        Ok(())
    }

    fn remove(&mut self, token: Token) {
        let Some(entry) = self.entries.remove(&token) else {
            return;
        };
        if entry.registered {
            if let Some(fd) = entry.fd {
                if let Err(e) = self.poller.delete(fd) {
                    debug!(?token, "epoll_ctl(DEL) failed: {}", e);
                }
            }
        }
        if let Handler::Connection(_) = entry.handler {
            self.ctx.connection_closed();
        }
        debug!(?token, kind = entry.handler.kind(), "removed");
    }
}
