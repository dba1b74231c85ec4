use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};
use std::time::Instant;

use tracing::{debug, warn};

/// A running CGI child. Owning this value is the right to reap the pid:
/// whichever path gets there first stores the exit status, and a process
/// still unreaped on drop is killed and waited for.
#[derive(Debug)]
pub struct CgiProcess {
    child: Child,
    started: Instant,
    status: Option<ExitStatus>,
}

impl CgiProcess {
    pub fn new(child: Child) -> Self {
        CgiProcess {
            child,
            started: Instant::now(),
            status: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Non-blocking reap. `Ok(None)` while the child is still running.
    pub fn try_reap(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let status = self.child.try_wait()?;
        if let Some(status) = status {
            debug!(pid = self.pid(), %status, "CGI reaped");
            self.status = Some(status);
        }
        Ok(status)
    }

    /// SIGKILL then a blocking wait, which returns promptly after the kill.
    pub fn kill_and_reap(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.try_reap()? {
            return Ok(status);
        }
        if let Err(e) = self.child.kill() {
            // Already exited between the two calls; the wait below reaps it.
            debug!(pid = self.pid(), "kill failed: {}", e);
        }
        let status = self.child.wait()?;
        debug!(pid = self.pid(), %status, "CGI killed and reaped");
        self.status = Some(status);
        Ok(status)
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        if self.status.is_none() {
            if let Err(e) = self.kill_and_reap() {
                warn!(pid = self.pid(), "failed to reap CGI process: {}", e);
            }
        }
    }
}

/// Human-readable reason for an abnormal exit, `None` on success.
pub fn describe_failure(status: ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    match (status.code(), status.signal()) {
        (Some(code), _) => Some(format!("exited with status {}", code)),
        (None, Some(signal)) => Some(format!("killed by signal {}", signal)),
        _ => Some(status.to_string()),
    }
}
