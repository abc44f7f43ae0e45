//! Operator signals for unattended runs: SIGTERM/SIGINT abort the current
//! attempt, SIGUSR1 requests a counted restart.
//!
//! The tick loop polls these flags between evaluations; no work happens in
//! signal context.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

// ──────────────────── signal handler ────────────────────

#[derive(Clone)]
pub struct SignalHandler {
    abort_flag: Arc<AtomicBool>,
    restart_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register OS hooks. Registration failures are
    /// reported on stderr and otherwise ignored.
    pub fn new() -> Self {
        let handler = Self::detached();
        handler.register_signals();
        handler
    }

    /// A handler with no OS hooks, driven only by the `request_*` methods.
    pub fn detached() -> Self {
        Self {
            abort_flag: Arc::new(AtomicBool::new(false)),
            restart_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sticky: once set, every later attempt is skipped as well.
    pub fn should_abort(&self) -> bool {
        self.abort_flag.load(Ordering::Relaxed)
    }

    /// Check and clear.
    pub fn should_restart(&self) -> bool {
        self.restart_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_abort(&self) {
        self.abort_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_restart(&self) {
        self.restart_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.abort_flag)) {
            eprintln!("[ARIG-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.abort_flag)) {
            eprintln!("[ARIG-SIGNAL] failed to register SIGINT: {e}");
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::SIGUSR1;
            if let Err(e) = signal_hook::flag::register(SIGUSR1, Arc::clone(&self.restart_flag)) {
                eprintln!("[ARIG-SIGNAL] failed to register SIGUSR1: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
