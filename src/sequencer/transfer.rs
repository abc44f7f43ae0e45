//! USB test-image transfer polled at the start of an attempt.
//!
//! The bootloader's USB utility announces itself with a banner. Once it is up,
//! the test command is sent and resent every interval until the utility
//! prints anything in answer; the stage ends when the done marker shows up.
//! A banner that never appears fails the stage.

#![allow(missing_docs)]

use std::time::{Duration, Instant};

use crate::script::TransferSpec;
use crate::terminal::TerminalPair;
use crate::transport::Transport;

/// What one poll of the transfer stage observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    Waiting,
    /// The done marker arrived; `sends` commands went out.
    Done { sends: u32 },
    /// No banner within the timeout.
    BannerTimeout,
}

/// Per-attempt transfer state. Starts its clock on the first poll.
#[derive(Debug, Default, Clone)]
pub struct TransferProgress {
    started: Option<Instant>,
    banner_seen: bool,
    last_send: Option<Instant>,
    log_len_at_send: usize,
    responding: bool,
    sends: u32,
    finished: bool,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    pub const fn banner_seen(&self) -> bool {
        self.banner_seen
    }

    pub const fn sends(&self) -> u32 {
        self.sends
    }

    pub fn poll(
        &mut self,
        spec: &TransferSpec,
        terminals: &TerminalPair,
        transport: &dyn Transport,
        now: Instant,
    ) -> TransferStep {
        if self.finished {
            return TransferStep::Done { sends: self.sends };
        }
        let started = *self.started.get_or_insert(now);
        let buffer = terminals.buffer(spec.channel);

        if !self.banner_seen {
            if !buffer.contains(&spec.banner) {
                let timeout = Duration::from_millis(spec.banner_timeout_ms);
                return if now.duration_since(started) >= timeout {
                    TransferStep::BannerTimeout
                } else {
                    TransferStep::Waiting
                };
            }
            self.banner_seen = true;
            eprintln!("[ARIG-RUN] USB utility up on {}", spec.channel);
        }

        if buffer.contains(&spec.done_marker) {
            // Transfer chatter must not satisfy a later step.
            buffer.suppress_all(&spec.banner);
            buffer.suppress_all(&spec.done_marker);
            self.finished = true;
            return TransferStep::Done { sends: self.sends };
        }

        let log_len = terminals.terminal(spec.channel).log().len();
        if self.last_send.is_some() && log_len > self.log_len_at_send {
            self.responding = true;
        }
        let interval = Duration::from_millis(spec.resend_interval_ms);
        let due = self
            .last_send
            .is_none_or(|sent| now.duration_since(sent) >= interval);
        if !self.responding && due {
            self.last_send = Some(now);
            self.log_len_at_send = log_len;
            match transport.send(spec.channel, &spec.command) {
                Ok(()) => self.sends += 1,
                Err(e) => eprintln!("[ARIG-RUN] transfer command on {} failed: {e}", spec.channel),
            }
        }
        TransferStep::Waiting
    }
}
