//! Unbounded running log of every completed line, exported per run attempt.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::core::errors::{Result, RigError};
use crate::terminal::ChannelId;

/// Full history for one channel; unlike the channel buffer it never evicts.
#[derive(Debug, Default)]
pub struct TerminalLog {
    lines: Mutex<Vec<String>>,
}

impl TerminalLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    /// Write `{test}_{CHANNEL}.txt` under `dir`, one entry per line.
    pub fn export(&self, dir: &Path, test_name: &str, channel: ChannelId) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|source| RigError::io(dir, source))?;
        let path = dir.join(export_file_name(test_name, channel));
        let mut body = self.lines.lock().join("\n");
        body.push('\n');
        fs::write(&path, body).map_err(|source| RigError::io(&path, source))?;
        Ok(path)
    }
}

/// Test names come from scripts; keep them from escaping the log directory.
pub fn export_file_name(test_name: &str, channel: ChannelId) -> String {
    let safe: String = test_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{channel}.txt", safe.trim())
}
