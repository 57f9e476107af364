//! Cooperative shutdown token shared by every worker loop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing::info;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cloneable flag flipped once when the process should stop.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    /// Creates a token in the running state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers SIGINT/SIGTERM so that either one triggers this token.
    pub fn install_signal_handlers(&self) -> io::Result<()> {
        signal_hook::flag::register(SIGINT, Arc::clone(&self.requested))?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&self.requested))?;
        Ok(())
    }

    /// Requests shutdown.
    pub fn trigger(&self) {
        if !self.requested.swap(true, Ordering::AcqRel) {
            info!("shutdown requested");
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Sleeps for `duration` unless shutdown is requested first.
    ///
    /// Returns `false` when the sleep was cut short by shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
