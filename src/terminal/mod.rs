//! Per-channel terminals: reassembly, bounded history, and running logs.

#![allow(missing_docs)]

pub mod buffer;
pub mod framer;
pub mod ingest;
pub mod log;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::Result;
use crate::terminal::buffer::ChannelBuffer;
use crate::terminal::framer::LineReassembler;
use crate::terminal::log::TerminalLog;

/// One of the two physical serial links on the device under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelId {
    #[serde(alias = "MAIN")]
    Main,
    #[serde(alias = "BOOT")]
    Boot,
}

impl ChannelId {
    pub const ALL: [Self; 2] = [Self::Main, Self::Boot];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "MAIN",
            Self::Boot => "BOOT",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the engine keeps for one channel.
#[derive(Debug)]
pub struct Terminal {
    channel: ChannelId,
    framer: Mutex<LineReassembler>,
    buffer: ChannelBuffer,
    log: TerminalLog,
}

impl Terminal {
    pub fn new(channel: ChannelId, capacity: usize) -> Self {
        Self {
            channel,
            framer: Mutex::new(LineReassembler::new()),
            buffer: ChannelBuffer::new(capacity),
            log: TerminalLog::new(),
        }
    }

    pub const fn channel(&self) -> ChannelId {
        self.channel
    }

    pub const fn buffer(&self) -> &ChannelBuffer {
        &self.buffer
    }

    pub const fn log(&self) -> &TerminalLog {
        &self.log
    }

    fn accept(&self, bytes: &[u8], capture: bool) -> usize {
        let lines = self.framer.lock().feed_bytes(bytes);
        self.record(&lines, capture);
        lines.len()
    }

    fn finish(&self, capture: bool) -> usize {
        let tail = self.framer.lock().flush_pending();
        tail.map_or(0, |line| {
            self.record(std::slice::from_ref(&line), capture);
            1
        })
    }

    fn record(&self, lines: &[String], capture: bool) {
        for line in lines {
            self.log.append(line);
            if capture {
                self.buffer.push(line.as_str());
            }
        }
    }
}

/// The MAIN and BOOT terminals plus the capture gate shared by both.
///
/// Lines always reach the running log; they reach the channel buffers only
/// while capture is enabled, which the test run switches on for the duration
/// of an attempt.
#[derive(Debug)]
pub struct TerminalPair {
    main: Terminal,
    boot: Terminal,
    capture: AtomicBool,
}

impl TerminalPair {
    pub fn new(capacity: usize) -> Self {
        Self {
            main: Terminal::new(ChannelId::Main, capacity),
            boot: Terminal::new(ChannelId::Boot, capacity),
            capture: AtomicBool::new(false),
        }
    }

    pub const fn terminal(&self, channel: ChannelId) -> &Terminal {
        match channel {
            ChannelId::Main => &self.main,
            ChannelId::Boot => &self.boot,
        }
    }

    pub const fn buffer(&self, channel: ChannelId) -> &ChannelBuffer {
        self.terminal(channel).buffer()
    }

    /// Attribute a raw chunk to its channel. Returns the number of completed lines.
    pub fn ingest(&self, channel: ChannelId, bytes: &[u8]) -> usize {
        self.terminal(channel)
            .accept(bytes, self.capture.load(Ordering::Acquire))
    }

    /// End-of-stream for a channel: emit any unterminated tail as a line.
    pub fn finish(&self, channel: ChannelId) -> usize {
        self.terminal(channel)
            .finish(self.capture.load(Ordering::Acquire))
    }

    pub fn set_capture(&self, enabled: bool) {
        self.capture.store(enabled, Ordering::Release);
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.load(Ordering::Acquire)
    }

    pub fn clear_buffers(&self) {
        self.main.buffer.clear();
        self.boot.buffer.clear();
    }

    /// Write both running logs under `dir`, then clear them.
    pub fn flush_logs(&self, dir: &Path, test_name: &str) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(2);
        for channel in ChannelId::ALL {
            let log = self.terminal(channel).log();
            if !log.is_empty() {
                written.push(log.export(dir, test_name, channel)?);
            }
            log.clear();
        }
        Ok(written)
    }

    pub fn clear_logs(&self) {
        self.main.log.clear();
        self.boot.log.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_parse_from_either_case() {
        #[derive(Deserialize)]
        struct Pair {
            a: ChannelId,
            b: ChannelId,
        }
        let parsed: Pair = toml::from_str("a = \"main\"\nb = \"BOOT\"").unwrap();
        assert_eq!(parsed.a, ChannelId::Main);
        assert_eq!(parsed.b, ChannelId::Boot);
        assert_eq!(ChannelId::Boot.to_string(), "BOOT");
    }

    #[test]
    fn chunks_are_attributed_to_their_channel() {
        let pair = TerminalPair::new(8);
        pair.set_capture(true);
        pair.ingest(ChannelId::Main, b"main says hi\r\nBOOT");
        pair.ingest(ChannelId::Boot, b"boot says hi\n");
        pair.ingest(ChannelId::Main, b" partial\r\n");

        assert_eq!(
            pair.buffer(ChannelId::Main).snapshot(),
            vec!["main says hi", "BOOT partial"]
        );
        assert_eq!(pair.buffer(ChannelId::Boot).snapshot(), vec!["boot says hi"]);
    }

    #[test]
    fn capture_gate_only_affects_buffers() {
        let pair = TerminalPair::new(8);
        pair.ingest(ChannelId::Boot, b"before start\n");
        assert!(pair.buffer(ChannelId::Boot).is_empty());
        assert_eq!(pair.terminal(ChannelId::Boot).log().len(), 1);

        pair.set_capture(true);
        pair.ingest(ChannelId::Boot, b"after start\n");
        assert_eq!(pair.buffer(ChannelId::Boot).snapshot(), vec!["after start"]);
        assert_eq!(pair.terminal(ChannelId::Boot).log().len(), 2);
    }

    #[test]
    fn flush_logs_exports_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let pair = TerminalPair::new(8);
        pair.ingest(ChannelId::Main, b"one\ntwo\n");

        let written = pair.flush_logs(dir.path(), "Firmware").unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with("Firmware_MAIN.txt"));
        assert!(pair.terminal(ChannelId::Main).log().is_empty());
    }

    #[test]
    fn finish_flushes_unterminated_tail() {
        let pair = TerminalPair::new(8);
        pair.set_capture(true);
        pair.ingest(ChannelId::Main, b"Enter any key...");
        assert!(pair.buffer(ChannelId::Main).is_empty());
        assert_eq!(pair.finish(ChannelId::Main), 1);
        assert!(pair.buffer(ChannelId::Main).contains("Enter any key"));
    }
}
