use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::process::{ChildStdin, ChildStdout, ExitStatus};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cgi::process::{describe_failure, CgiProcess};
use crate::cgi::translate::parse_cgi_output;
use crate::http::response::StatusCode;
use crate::server::handler::{Context, EventHandler, Op, Status, Token};

const READ_CHUNK: usize = 4096;
/// Scripts producing more than this are treated as broken.
pub const MAX_CGI_OUTPUT: usize = 16 * 1024 * 1024;
/// How often a child that closed stdout is checked for exit.
const REAP_INTERVAL: Duration = Duration::from_millis(20);

/// What the output side hands back to its connection, exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CgiReply {
    /// A complete HTTP response built from the script's output.
    Translated(Vec<u8>),
    /// The run failed; the connection renders the error page.
    Failed(StatusCode),
}

/// Streams the request body into the script's stdin.
pub struct CgiInput {
    stdin: ChildStdin,
    body: Vec<u8>,
    written: usize,
    timeout: Duration,
    deadline: Instant,
}

impl CgiInput {
    pub fn new(stdin: ChildStdin, body: Vec<u8>, timeout: Duration, now: Instant) -> Self {
        CgiInput {
            stdin,
            body,
            written: 0,
            timeout,
            deadline: now + timeout,
        }
    }
}

impl EventHandler for CgiInput {
    fn fd(&self) -> Option<RawFd> {
        Some(self.stdin.as_raw_fd())
    }

    fn on_writable(&mut self, ctx: &mut Context) -> Status {
        if self.written >= self.body.len() {
            debug!(bytes = self.written, "CGI stdin complete");
            return Status::Close;
        }
        match self.stdin.write(&self.body[self.written..]) {
            Ok(0) => Status::Close,
            Ok(n) => {
                self.written += n;
                self.deadline = ctx.now() + self.timeout;
                if self.written == self.body.len() {
                    debug!(bytes = self.written, "CGI stdin complete");
                    return Status::Close;
                }
                Status::Continue
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                Status::Continue
            }
            Err(e) => {
                // Scripts may exit without reading their input.
                debug!(written = self.written, "CGI stdin closed early: {}", e);
                Status::Close
            }
        }
    }

    fn on_poll_error(&mut self, _ctx: &mut Context) -> Status {
        debug!(written = self.written, "CGI stdin reader went away");
        Status::Close
    }

    fn deadline(&self) -> Option<Instant> {
        Some(self.deadline)
    }

    fn on_timeout(&mut self, _ctx: &mut Context) -> Status {
        warn!(
            written = self.written,
            total = self.body.len(),
            "CGI stdin write timed out"
        );
        Status::Close
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputState {
    Reading,
    /// Stdout hit EOF but the child has not exited yet.
    Reaping { next_check: Instant },
    Finished,
}

/// Drains the script's stdout, reaps it and delivers the response.
pub struct CgiOutput {
    stdout: ChildStdout,
    process: CgiProcess,
    connection: Token,
    output: Vec<u8>,
    timeout: Duration,
    deadline: Instant,
    state: OutputState,
}

impl CgiOutput {
    pub fn new(
        stdout: ChildStdout,
        process: CgiProcess,
        connection: Token,
        timeout: Duration,
        now: Instant,
    ) -> Self {
        CgiOutput {
            stdout,
            process,
            connection,
            output: Vec::new(),
            timeout,
            deadline: now + timeout,
            state: OutputState::Reading,
        }
    }

    fn deliver(&mut self, ctx: &mut Context, reply: CgiReply) -> Status {
        self.state = OutputState::Finished;
        ctx.push(Op::Deliver {
            connection: self.connection,
            reply,
        });
        Status::Close
    }

    fn end_of_stream(&mut self, ctx: &mut Context) -> Status {
        match self.process.try_reap() {
            Ok(Some(status)) => self.complete(ctx, status),
            Ok(None) => {
                debug!(pid = self.process.pid(), "CGI closed stdout, waiting for exit");
                self.state = OutputState::Reaping {
                    next_check: ctx.now() + REAP_INTERVAL,
                };
                ctx.push(Op::Deregister { token: ctx.token() });
                Status::Continue
            }
            Err(e) => {
                warn!(pid = self.process.pid(), "waitpid failed: {}", e);
                self.deliver(ctx, CgiReply::Failed(StatusCode::BadGateway))
            }
        }
    }

    fn complete(&mut self, ctx: &mut Context, status: ExitStatus) -> Status {
        let elapsed = self.process.started().elapsed();
        if let Some(reason) = describe_failure(status) {
            warn!(pid = self.process.pid(), ?elapsed, "CGI {}", reason);
            return self.deliver(ctx, CgiReply::Failed(StatusCode::BadGateway));
        }
        let reply = match parse_cgi_output(&self.output) {
            Ok(response) => {
                debug!(
                    pid = self.process.pid(),
                    ?elapsed,
                    status = %response.status,
                    bytes = self.output.len(),
                    "CGI finished"
                );
                CgiReply::Translated(response.to_bytes())
            }
            Err(e) => {
                warn!(pid = self.process.pid(), "{}", e);
                CgiReply::Failed(StatusCode::BadGateway)
            }
        };
        self.deliver(ctx, reply)
    }

    fn kill(&mut self, ctx: &mut Context, status: StatusCode) -> Status {
        if let Err(e) = self.process.kill_and_reap() {
            warn!(pid = self.process.pid(), "failed to kill CGI: {}", e);
        }
        self.deliver(ctx, CgiReply::Failed(status))
    }
}

impl EventHandler for CgiOutput {
    fn fd(&self) -> Option<RawFd> {
        Some(self.stdout.as_raw_fd())
    }

    fn on_readable(&mut self, ctx: &mut Context) -> Status {
        if self.state != OutputState::Reading {
            return Status::Continue;
        }
        let mut buf = [0u8; READ_CHUNK];
        match self.stdout.read(&mut buf) {
            Ok(0) => self.end_of_stream(ctx),
            Ok(n) => {
                self.output.extend_from_slice(&buf[..n]);
                self.deadline = ctx.now() + self.timeout;
                if self.output.len() > MAX_CGI_OUTPUT {
                    warn!(pid = self.process.pid(), "CGI output exceeds {} bytes", MAX_CGI_OUTPUT);
                    return self.kill(ctx, StatusCode::BadGateway);
                }
                Status::Continue
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                Status::Continue
            }
            Err(e) => {
                warn!(pid = self.process.pid(), "reading CGI stdout failed: {}", e);
                self.kill(ctx, StatusCode::BadGateway)
            }
        }
    }

    fn on_poll_error(&mut self, ctx: &mut Context) -> Status {
        if self.state != OutputState::Reading {
            return Status::Continue;
        }
        self.end_of_stream(ctx)
    }

    fn deadline(&self) -> Option<Instant> {
        match self.state {
            OutputState::Reading => Some(self.deadline),
            OutputState::Reaping { next_check } => Some(next_check.min(self.deadline)),
            OutputState::Finished => None,
        }
    }

    fn on_timeout(&mut self, ctx: &mut Context) -> Status {
        match self.state {
            OutputState::Finished => Status::Close,
            OutputState::Reaping { .. } if ctx.now() < self.deadline => match self.process.try_reap() {
                Ok(Some(status)) => self.complete(ctx, status),
                Ok(None) => {
                    self.state = OutputState::Reaping {
                        next_check: ctx.now() + REAP_INTERVAL,
                    };
                    Status::Continue
                }
                Err(e) => {
                    warn!(pid = self.process.pid(), "waitpid failed: {}", e);
                    self.kill(ctx, StatusCode::BadGateway)
                }
            },
            _ => {
                warn!(
                    pid = self.process.pid(),
                    elapsed = ?self.process.started().elapsed(),
                    "CGI timed out, killing it"
                );
                self.kill(ctx, StatusCode::GatewayTimeout)
            }
        }
    }
}
