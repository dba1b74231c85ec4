use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag as signal_flag;

/// Shared stop request polled by the reactor once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        ShutdownToken::default()
    }

    /// SIGINT and SIGTERM set the token. The signal also interrupts a
    /// pending `epoll_wait`, so the loop notices without a poll timeout.
    pub fn register_signals(&self) -> io::Result<()> {
        signal_flag::register(SIGINT, Arc::clone(&self.0))?;
        signal_flag::register(SIGTERM, Arc::clone(&self.0))?;
        Ok(())
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = ShutdownToken::new();
        let other = token.clone();
        assert!(!other.is_triggered());
        token.trigger();
        assert!(other.is_triggered());
    }
}
