//! Link layer contract between the engine and the device's serial ports.
//!
//! The engine only ever reads an immutable [`LinkSnapshot`]; it never owns
//! the connect/disconnect lifecycle beyond asking for a `reconnect`.

#![allow(missing_docs)]

pub mod loopback;
#[cfg(feature = "serial")]
pub mod serial;

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::core::errors::Result;
use crate::terminal::ChannelId;

/// Connectivity of one channel at the moment of the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkState {
    pub connected: bool,
    /// The link has been up at least once this session.
    pub seen_before: bool,
}

/// Read-only view of both links, passed to the sequencer every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkSnapshot {
    pub main: LinkState,
    pub boot: LinkState,
}

impl LinkSnapshot {
    pub const fn all_up() -> Self {
        let up = LinkState {
            connected: true,
            seen_before: true,
        };
        Self { main: up, boot: up }
    }

    pub const fn get(&self, channel: ChannelId) -> LinkState {
        match channel {
            ChannelId::Main => self.main,
            ChannelId::Boot => self.boot,
        }
    }
}

/// What the engine needs from a link implementation.
pub trait Transport: Send + Sync {
    /// Write one line of text to the device, appending the line ending.
    fn send(&self, channel: ChannelId, text: &str) -> Result<()>;

    /// Try to re-establish a dropped link. `Ok(false)` means the attempt ran
    /// but the port is still unavailable.
    fn reconnect(&self, channel: ChannelId) -> Result<bool>;

    fn links(&self) -> LinkSnapshot;
}

/// Atomic up/seen flags for one channel, shared with reader threads.
#[derive(Debug, Default)]
pub(crate) struct LinkFlags {
    connected: AtomicBool,
    seen_before: AtomicBool,
}

impl LinkFlags {
    pub(crate) fn set(&self, connected: bool) -> bool {
        if connected {
            self.seen_before.store(true, Ordering::Release);
        }
        self.connected.swap(connected, Ordering::AcqRel) != connected
    }

    pub(crate) fn state(&self) -> LinkState {
        LinkState {
            connected: self.connected.load(Ordering::Acquire),
            seen_before: self.seen_before.load(Ordering::Acquire),
        }
    }
}
