//! Per-client state machine.
//!
//! `Receiving` feeds socket bytes to the parser until it reaches a terminal
//! status. The request then either yields a response right away
//! (`SendingResponse`) or starts a script (`ExecutingCgi`). A connection
//! running a script is parked in the poll set and only moves on when the
//! reactor delivers the script's reply. One response per connection, then
//! close.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cgi::gateway::{self, GatewayInfo, SpawnedCgi};
use crate::cgi::io::{CgiInput, CgiOutput, CgiReply};
use crate::config::{Config, ServerContext};
use crate::http::parser::{ByteStreamParser, ParseStatus, DEFAULT_MAX_BODY_SIZE};
use crate::http::processor::{Outcome, RequestProcessor};
use crate::http::request::Request;
use crate::http::response::{HttpResponse, StatusCode};
use crate::server::handler::{Context, EventHandler, Handler, Op, Status};
use crate::server::poller::Interest;

const READ_BUFFER: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Receiving,
    ExecutingCgi,
    SendingResponse,
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    servers: Rc<[usize]>,
    config: Rc<Config>,
    parser: ByteStreamParser,
    /// Host of the request being served, kept to pick error pages later.
    host: Option<String>,
    request_line: String,
    response: Vec<u8>,
    response_status: u16,
    sent: usize,
    state: ConnectionState,
    timeout: Duration,
    deadline: Instant,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
        servers: Rc<[usize]>,
        config: Rc<Config>,
        now: Instant,
    ) -> Self {
        // The exact per-server limit is enforced once Host is known.
        let max_body = servers
            .iter()
            .map(|&idx| config.servers[idx].client_max_body_size)
            .max()
            .unwrap_or(DEFAULT_MAX_BODY_SIZE);
        let timeout = config.runtime.client_timeout();
        Connection {
            stream,
            peer,
            local,
            servers,
            config,
            parser: ByteStreamParser::with_max_body_size(max_body),
            host: None,
            request_line: String::from("-"),
            response: Vec::new(),
            response_status: 0,
            sent: 0,
            state: ConnectionState::Receiving,
            timeout,
            deadline: now + timeout,
        }
    }

    /// Takes the reply of this connection's script as the pending response.
    /// Returns the interest the client socket must be re-armed with.
    pub fn deliver_cgi_response(&mut self, reply: CgiReply, now: Instant) -> Interest {
        if self.state != ConnectionState::ExecutingCgi {
            warn!(peer = %self.peer, state = ?self.state, "unexpected CGI reply");
        }
        match reply {
            CgiReply::Translated(bytes) => {
                self.response_status = status_of(&bytes);
                self.response = bytes;
            }
            CgiReply::Failed(status) => {
                let config = Rc::clone(&self.config);
                let server = config.select_server(&self.servers, self.host.as_deref());
                self.set_response(RequestProcessor::new(server).error_response(status));
            }
        }
        self.sent = 0;
        self.state = ConnectionState::SendingResponse;
        self.deadline = now + self.timeout;
        Interest::WRITABLE
    }

    fn set_response(&mut self, response: HttpResponse) {
        self.response_status = response.status.as_u16();
        self.response = response.to_bytes();
    }

    fn respond(&mut self, ctx: &mut Context, response: HttpResponse) -> Status {
        self.set_response(response);
        self.sent = 0;
        self.state = ConnectionState::SendingResponse;
        self.deadline = ctx.now() + self.timeout;
        ctx.push(Op::Rearm {
            token: ctx.token(),
            interest: Interest::WRITABLE,
        });
        Status::Continue
    }

    fn receive(&mut self, ctx: &mut Context) -> Status {
        let mut buf = [0u8; READ_BUFFER];
        match self.stream.read(&mut buf) {
            Ok(0) => {
                debug!(peer = %self.peer, "client closed before sending a full request");
                Status::Close
            }
            Ok(n) => {
                self.deadline = ctx.now() + self.timeout;
                let status = self.parser.feed(&buf[..n]);
                if status.is_terminal() {
                    self.handle_request(ctx, status)
                } else {
                    Status::Continue
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                Status::Continue
            }
            Err(e) => {
                debug!(peer = %self.peer, "read failed: {}", e);
                Status::Close
            }
        }
    }

    fn handle_request(&mut self, ctx: &mut Context, status: ParseStatus) -> Status {
        let request = self.parser.take_request();
        self.host = request.host().map(str::to_string);
        self.request_line = format!("{} {} {}", request.method.as_str(), request.target, request.version.as_str());
        if let ParseStatus::Error(e) = status {
            debug!(peer = %self.peer, "bad request: {:?}", e);
        }

        let config = Rc::clone(&self.config);
        let server = config.select_server(&self.servers, self.host.as_deref());
        match RequestProcessor::new(server).process(status, &request) {
            Outcome::Respond(response) => self.respond(ctx, response),
            Outcome::ExecuteCgi { script_path } => self.start_cgi(ctx, server, &script_path, request),
        }
    }

    fn start_cgi(&mut self, ctx: &mut Context, server: &ServerContext, script: &Path, request: Request) -> Status {
        let info = GatewayInfo {
            server_name: server
                .server_name
                .first()
                .cloned()
                .unwrap_or_else(|| self.local.ip().to_string()),
            server_addr: self.local,
            remote_addr: self.peer,
        };
        let SpawnedCgi {
            stdin,
            stdout,
            process,
        } = match gateway::spawn(script, &request, &info) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(peer = %self.peer, script = %script.display(), "{}", e);
                let response = RequestProcessor::new(server).error_response(StatusCode::InternalServerError);
                return self.respond(ctx, response);
            }
        };

        let me = ctx.token();
        let runtime = &self.config.runtime;
        self.state = ConnectionState::ExecutingCgi;
        ctx.push(Op::Rearm {
            token: me,
            interest: Interest::NONE,
        });

        let input = CgiInput::new(stdin, request.body, runtime.cgi_input_timeout(), ctx.now());
        let token = ctx.allocate_token();
        ctx.push(Op::Register {
            token,
            interest: Interest::WRITABLE,
            handler: Handler::CgiInput(input),
        });

        let output = CgiOutput::new(stdout, process, me, runtime.cgi_output_timeout(), ctx.now());
        let token = ctx.allocate_token();
        ctx.push(Op::Register {
            token,
            interest: Interest::READABLE,
            handler: Handler::CgiOutput(output),
        });
        Status::Continue
    }

    fn send(&mut self, ctx: &mut Context) -> Status {
        match self.stream.write(&self.response[self.sent..]) {
            Ok(0) => Status::Close,
            Ok(n) => {
                self.sent += n;
                self.deadline = ctx.now() + self.timeout;
                if self.sent < self.response.len() {
                    return Status::Continue;
                }
                info!(
                    peer = %self.peer,
                    request = %self.request_line,
                    status = self.response_status,
                    bytes = self.response.len(),
                    "response sent"
                );
                Status::Close
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                Status::Continue
            }
            Err(e) => {
                debug!(peer = %self.peer, "write failed: {}", e);
                Status::Close
            }
        }
    }
}

impl EventHandler for Connection {
    fn fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }

    fn on_readable(&mut self, ctx: &mut Context) -> Status {
        match self.state {
            ConnectionState::Receiving => self.receive(ctx),
            ConnectionState::ExecutingCgi => {
                // Parked: only a hangup gets us here. Surplus bytes are
                // dropped since requests are not pipelined.
                let mut buf = [0u8; READ_BUFFER];
                match self.stream.read(&mut buf) {
                    Ok(0) => {
                        debug!(peer = %self.peer, "client left while CGI was running");
                        Status::Close
                    }
                    Ok(_) => Status::Continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Status::Continue,
                    Err(_) => Status::Close,
                }
            }
            ConnectionState::SendingResponse => Status::Continue,
        }
    }

    fn on_writable(&mut self, ctx: &mut Context) -> Status {
        match self.state {
            ConnectionState::SendingResponse => self.send(ctx),
            _ => Status::Continue,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::ExecutingCgi => None,
            _ => Some(self.deadline),
        }
    }

    fn on_timeout(&mut self, ctx: &mut Context) -> Status {
        match self.state {
            ConnectionState::Receiving => {
                debug!(peer = %self.peer, "request timed out");
                self.host = self.parser.request().host().map(str::to_string);
                let config = Rc::clone(&self.config);
                let server = config.select_server(&self.servers, self.host.as_deref());
                let response = RequestProcessor::new(server).error_response(StatusCode::RequestTimeout);
                self.respond(ctx, response)
            }
            ConnectionState::SendingResponse => {
                debug!(peer = %self.peer, sent = self.sent, "send timed out");
                Status::Close
            }
            ConnectionState::ExecutingCgi => Status::Continue,
        }
    }
}

/// Status code from an already serialized `HTTP/1.1 NNN ...` response.
fn status_of(response: &[u8]) -> u16 {
    response
        .get(9..12)
        .and_then(|code| std::str::from_utf8(code).ok())
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_status_from_serialized_response() {
        assert_eq!(status_of(b"HTTP/1.1 302 Found\r\n\r\n"), 302);
        assert_eq!(status_of(b"garbage"), 0);
    }
}
