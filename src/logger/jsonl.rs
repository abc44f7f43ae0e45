//! Append-only JSONL results log.
//!
//! One JSON object per line, built in memory and written with a single
//! `write_all` so a tailing reader never sees a torn record. When the primary
//! file cannot be written the writer steps down: fallback file, then stderr
//! (`[ARIG-JSONL]` prefix), then silent discard. A bench run never stops
//! because its results log went away.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, RigError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    SessionStop,
    TestStart,
    TestPoint,
    RunFinished,
    RestartRequested,
    AbortRequested,
    LinkChange,
    Diagnostic,
    Error,
}

/// One results-log record. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC, millisecond precision.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: utc_timestamp(),
            event,
            severity,
            test: None,
            attempt: None,
            step: None,
            channel: None,
            expected: None,
            actual: None,
            verdict: None,
            status: None,
            error_code: None,
            details: None,
        }
    }

    #[must_use]
    pub fn for_test(mut self, test: &str, attempt: u32) -> Self {
        self.test = Some(test.to_string());
        self.attempt = Some(attempt);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would exceed this size.
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    pub fsync_interval: Duration,
}

impl JsonlConfig {
    /// Defaults around a primary path, with a fallback in the temp dir.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback_path: Some(std::env::temp_dir().join("arig-results.jsonl")),
            max_size_bytes: 16 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval: Duration::from_secs(5),
        }
    }
}

/// Where lines currently go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterTier {
    Primary,
    Fallback,
    Stderr,
    Discard,
}

impl WriterTier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
            Self::Stderr => "stderr",
            Self::Discard => "discard",
        }
    }
}

pub struct JsonlWriter {
    config: JsonlConfig,
    out: Option<BufWriter<File>>,
    tier: WriterTier,
    size: u64,
    last_sync: Instant,
}

impl JsonlWriter {
    /// Open the primary file, stepping down the chain on failure. Never fails.
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            out: None,
            tier: WriterTier::Discard,
            size: 0,
            last_sync: Instant::now(),
        };
        writer.open_tier(WriterTier::Primary);
        writer
    }

    pub const fn tier(&self) -> WriterTier {
        self.tier
    }

    pub const fn bytes_written(&self) -> u64 {
        self.size
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(mut line) => {
                line.push('\n');
                self.write_line(&line);
            }
            Err(e) => eprintln!("[ARIG-JSONL] dropping unserializable entry: {e}"),
        }
    }

    pub fn flush(&mut self) {
        if let Some(out) = self.out.as_mut() {
            let _ = out.flush();
        }
    }

    pub fn sync(&mut self) {
        if let Some(out) = self.out.as_mut() {
            let _ = out.flush();
            let _ = out.get_ref().sync_data();
        }
        self.last_sync = Instant::now();
    }

    /// Return to the primary file if it has become writable again.
    pub fn try_recover(&mut self) {
        if self.tier == WriterTier::Primary {
            return;
        }
        if let Ok((file, size)) = open_append(&self.config.path) {
            self.install(file, size, WriterTier::Primary);
            eprintln!(
                "[ARIG-JSONL] recovered primary results log {}",
                self.config.path.display()
            );
        }
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if matches!(self.tier, WriterTier::Primary | WriterTier::Fallback)
            && self.size + len > self.config.max_size_bytes
        {
            self.rotate();
        }
        loop {
            match self.tier {
                WriterTier::Primary | WriterTier::Fallback => {
                    let written = self
                        .out
                        .as_mut()
                        .is_some_and(|out| out.write_all(line.as_bytes()).is_ok());
                    if written {
                        self.size += len;
                        if self.last_sync.elapsed() >= self.config.fsync_interval {
                            self.sync();
                        }
                        return;
                    }
                    self.step_down();
                }
                WriterTier::Stderr => {
                    if write!(io::stderr(), "[ARIG-JSONL] {line}").is_err() {
                        self.tier = WriterTier::Discard;
                    }
                    return;
                }
                WriterTier::Discard => return,
            }
        }
    }

    fn step_down(&mut self) {
        self.out = None;
        let next = match self.tier {
            WriterTier::Primary => WriterTier::Fallback,
            WriterTier::Fallback => WriterTier::Stderr,
            WriterTier::Stderr | WriterTier::Discard => WriterTier::Discard,
        };
        self.open_tier(next);
    }

    fn open_tier(&mut self, tier: WriterTier) {
        let path = match tier {
            WriterTier::Primary => Some(self.config.path.clone()),
            WriterTier::Fallback => self.config.fallback_path.clone(),
            WriterTier::Stderr | WriterTier::Discard => {
                self.out = None;
                self.tier = tier;
                if tier == WriterTier::Stderr {
                    eprintln!("[ARIG-JSONL] no writable results file, logging to stderr");
                }
                return;
            }
        };
        match path.map(|p| open_append(&p).map(|opened| (p, opened))) {
            Some(Ok((p, (file, size)))) => {
                if tier == WriterTier::Fallback {
                    eprintln!("[ARIG-JSONL] using fallback results log {}", p.display());
                }
                self.install(file, size, tier);
            }
            Some(Err(e)) => {
                eprintln!("[ARIG-JSONL] {e}");
                self.tier = tier;
                self.step_down();
            }
            None => {
                self.tier = tier;
                self.step_down();
            }
        }
    }

    fn install(&mut self, file: File, size: u64, tier: WriterTier) {
        self.out = Some(BufWriter::new(file));
        self.size = size;
        self.tier = tier;
    }

    fn rotate(&mut self) {
        self.flush();
        self.out = None;
        let base = match self.tier {
            WriterTier::Primary => self.config.path.clone(),
            WriterTier::Fallback => match &self.config.fallback_path {
                Some(p) => p.clone(),
                None => return,
            },
            WriterTier::Stderr | WriterTier::Discard => return,
        };
        shift_rotations(&base, self.config.max_rotated_files);
        match open_append(&base) {
            Ok((file, _)) => self.install(file, 0, self.tier),
            Err(_) => self.step_down(),
        }
    }
}

/// `log.jsonl` -> `log.jsonl.1`, `.1` -> `.2`, dropping anything past `keep`.
fn shift_rotations(base: &Path, keep: u32) {
    if keep == 0 {
        let _ = fs::remove_file(base);
        return;
    }
    let _ = fs::remove_file(rotated_path(base, keep));
    for i in (1..keep).rev() {
        let _ = fs::rename(rotated_path(base, i), rotated_path(base, i + 1));
    }
    let _ = fs::rename(base, rotated_path(base, 1));
}

fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| RigError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| RigError::io(path, source))?;
    let size = file.metadata().map_or(0, |m| m.len());
    Ok((file, size))
}

pub fn utc_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path: PathBuf) -> JsonlConfig {
        JsonlConfig {
            path,
            fallback_path: None,
            max_size_bytes: 1024 * 1024,
            max_rotated_files: 3,
            fsync_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn entries_are_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let mut writer = JsonlWriter::open(config(path.clone()));
        let mut point = LogEntry::new(EventType::TestPoint, Severity::Info).for_test("ADC", 2);
        point.verdict = Some("pass".to_string());
        writer.write_entry(&point);
        writer.write_entry(&LogEntry::new(EventType::SessionStop, Severity::Info));
        writer.flush();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "test_point");
        assert_eq!(first["test"], "ADC");
        assert_eq!(first["attempt"], 2);
        assert!(first["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn unset_fields_are_omitted() {
        let line =
            serde_json::to_string(&LogEntry::new(EventType::Diagnostic, Severity::Warning))
                .unwrap();
        assert!(!line.contains("\"test\""));
        assert!(!line.contains("\"verdict\""));
        assert!(line.contains("\"severity\":\"warning\""));
    }

    #[test]
    fn rotation_keeps_bounded_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rot.jsonl");
        let mut cfg = config(path.clone());
        cfg.max_size_bytes = 120;
        let mut writer = JsonlWriter::open(cfg);
        for _ in 0..12 {
            writer.write_entry(&LogEntry::new(EventType::Diagnostic, Severity::Info));
        }
        writer.flush();
        assert!(path.exists());
        assert!(rotated_path(&path, 1).exists());
        assert!(!rotated_path(&path, 4).exists());
    }

    #[test]
    fn unwritable_primary_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "file").unwrap();
        let fallback = dir.path().join("fallback.jsonl");
        let mut cfg = config(blocker.join("results.jsonl"));
        cfg.fallback_path = Some(fallback.clone());

        let mut writer = JsonlWriter::open(cfg);
        assert_eq!(writer.tier(), WriterTier::Fallback);
        writer.write_entry(&LogEntry::new(EventType::Error, Severity::Error));
        writer.flush();
        assert!(!fs::read_to_string(&fallback).unwrap().is_empty());
    }

    #[test]
    fn no_file_at_all_degrades_to_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file").unwrap();
        let writer = JsonlWriter::open(config(blocker.join("x.jsonl")));
        assert_eq!(writer.tier(), WriterTier::Stderr);
        assert_eq!(writer.tier().as_str(), "stderr");
    }
}
