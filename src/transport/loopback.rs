//! In-memory transport: records what the engine sends and lets callers
//! script link state. Drives `arig replay` and the integration tests.

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::core::errors::{Result, RigError};
use crate::terminal::ChannelId;
use crate::transport::{LinkFlags, LinkSnapshot, Transport};

#[derive(Debug, Default)]
pub struct LoopbackTransport {
    main: LinkFlags,
    boot: LinkFlags,
    sent: Mutex<Vec<(ChannelId, String)>>,
    /// Queued answers for `reconnect`; empty means "still down".
    reconnect_script: Mutex<VecDeque<bool>>,
    reconnect_calls: Mutex<Vec<ChannelId>>,
    fail_sends: AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both links up from the start.
    pub fn connected() -> Self {
        let t = Self::default();
        t.set_link(ChannelId::Main, true);
        t.set_link(ChannelId::Boot, true);
        t
    }

    const fn flags(&self, channel: ChannelId) -> &LinkFlags {
        match channel {
            ChannelId::Main => &self.main,
            ChannelId::Boot => &self.boot,
        }
    }

    /// Returns whether the state changed.
    pub fn set_link(&self, channel: ChannelId, connected: bool) -> bool {
        self.flags(channel).set(connected)
    }

    /// Queue the outcome of the next `reconnect` call.
    pub fn script_reconnect(&self, succeeds: bool) {
        self.reconnect_script.lock().push_back(succeeds);
    }

    pub fn reconnect_calls(&self) -> Vec<ChannelId> {
        self.reconnect_calls.lock().clone()
    }

    pub fn sent(&self) -> Vec<(ChannelId, String)> {
        self.sent.lock().clone()
    }

    pub fn sent_on(&self, channel: ChannelId) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(ch, _)| *ch == channel)
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Make every following `send` fail, as a dead port would.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, channel: ChannelId, text: &str) -> Result<()> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(RigError::transport(channel, "loopback send disabled"));
        }
        self.sent.lock().push((channel, text.to_string()));
        Ok(())
    }

    fn reconnect(&self, channel: ChannelId) -> Result<bool> {
        self.reconnect_calls.lock().push(channel);
        let up = self.reconnect_script.lock().pop_front().unwrap_or(false);
        if up {
            self.set_link(channel, true);
        }
        Ok(up)
    }

    fn links(&self) -> LinkSnapshot {
        LinkSnapshot {
            main: self.main.state(),
            boot: self.boot.state(),
        }
    }
}
