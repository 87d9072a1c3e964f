//! Process-wide cooperative shutdown signal.
//!
//! A single flag is handed to the accept loop and to every connection
//! worker. Once set it is never cleared; every component re-checks it at
//! least once per poll timeout.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, set-once shutdown flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown.
    ///
    /// Returns `true` only for the call that actually flipped the flag.
    pub fn request(&self) -> bool {
        !self.requested.swap(true, Ordering::SeqCst)
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Set the flag on SIGINT and SIGTERM.
    #[cfg(unix)]
    pub fn register_signals(&self) -> io::Result<()> {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};

        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.requested))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn register_signals(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_starts_clear() {
        assert!(!ShutdownFlag::new().is_requested());
    }

    #[test]
    fn test_request_is_idempotent() {
        let flag = ShutdownFlag::new();
        assert!(flag.request());
        assert!(!flag.request());
        assert!(flag.is_requested());
    }

    #[test]
    fn test_visible_across_clones_and_threads() {
        let flag = ShutdownFlag::new();
        let other = flag.clone();

        thread::spawn(move || {
            other.request();
        })
        .join()
        .unwrap();

        assert!(flag.is_requested());
    }
}
