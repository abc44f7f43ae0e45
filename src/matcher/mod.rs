//! Stateless checks composed from channel-buffer primitives.
//!
//! Numeric extraction that cannot find a value is never a panic; it yields
//! [`CheckResult::Unverifiable`] and the sequencer decides what that means.

#![allow(missing_docs)]

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::terminal::buffer::ChannelBuffer;

/// Default confirmation line printed after a successful file lookup.
pub const FILE_FOUND_CONFIRMATION: &str = "File found!";

/// Tokens in a section result tail that mean the section passed.
const SECTION_PASS_TOKENS: [&str; 2] = ["PASS", "(match)"];

/// Outcome of one numeric or textual verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CheckResult {
    /// Evidence found and within bounds.
    Pass { actual: String },
    /// Evidence found but out of bounds.
    Fail { actual: String },
    /// Evidence found but no value could be read from it.
    Unverifiable { actual: String },
}

impl CheckResult {
    pub fn actual(&self) -> &str {
        match self {
            Self::Pass { actual } | Self::Fail { actual } | Self::Unverifiable { actual } => {
                actual
            }
        }
    }

    pub const fn is_pass(&self) -> bool {
        matches!(self, Self::Pass { .. })
    }
}

/// Result of the cumulative mismatch scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MismatchReport {
    pub count: usize,
    pub threshold: usize,
}

impl MismatchReport {
    /// Strictly greater than the threshold fails; equal is tolerated.
    pub const fn exceeded(&self) -> bool {
        self.count > self.threshold
    }
}

/// A colon followed by an integer; the label is checked against the text
/// before the colon so one compiled pattern serves every label.
static VALUE_AFTER_COLON: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r":\s*(\d+)").ok());

/// Read the integer following `label:` (whitespace allowed after the colon).
pub fn extract_labeled_number(text: &str, label: &str) -> Option<u64> {
    let re = VALUE_AFTER_COLON.as_ref()?;
    re.captures_iter(text)
        .find(|caps| caps.get(0).is_some_and(|m| text[..m.start()].ends_with(label)))
        .and_then(|caps| caps.get(1)?.as_str().parse().ok())
}

/// `"... voltage: 1225mV"` style reading checked against an inclusive range.
pub fn range_check(text: &str, label: &str, min: u64, max: u64) -> CheckResult {
    let actual = text.to_string();
    match extract_labeled_number(text, label) {
        Some(value) if (min..=max).contains(&value) => CheckResult::Pass { actual },
        Some(_) => CheckResult::Fail { actual },
        None => CheckResult::Unverifiable { actual },
    }
}

/// `"... copied: 4096"` style confirmation; valid when strictly positive.
pub fn byte_count_check(text: &str, label: &str) -> (CheckResult, Option<u64>) {
    let actual = text.to_string();
    match extract_labeled_number(text, label) {
        Some(0) => (CheckResult::Fail { actual }, Some(0)),
        Some(n) => (CheckResult::Pass { actual }, Some(n)),
        None => (CheckResult::Unverifiable { actual }, None),
    }
}

/// Count `marker` across the whole buffer and compare with `threshold`.
pub fn mismatch_count(buffer: &ChannelBuffer, marker: &str, threshold: usize) -> MismatchReport {
    MismatchReport {
        count: buffer.count_occurrences(marker),
        threshold,
    }
}

/// Self-test section result: the text after `pattern` on its line must carry
/// a pass token. `None` while the section line has not been printed yet.
pub fn section_status(buffer: &ChannelBuffer, pattern: &str) -> Option<CheckResult> {
    let tail = buffer.text_after(pattern)?;
    let actual = format!("{pattern}{tail}");
    if SECTION_PASS_TOKENS.iter().any(|t| tail.contains(t)) {
        Some(CheckResult::Pass { actual })
    } else {
        Some(CheckResult::Fail { actual })
    }
}

/// The line after `pattern` must equal `confirmation`.
///
/// `None` while the lookup line or its answer has not arrived yet.
pub fn file_found(buffer: &ChannelBuffer, pattern: &str, confirmation: &str) -> Option<bool> {
    if !buffer.contains(pattern) {
        return None;
    }
    let next = buffer.next_line_after(pattern);
    if next.is_empty() {
        return None;
    }
    Some(next.trim() == confirmation)
}

/// First forbidden token currently visible, once the buffer holds at least
/// `min_lines` lines of context.
pub fn forbidden_seen<'a>(
    buffer: &ChannelBuffer,
    forbidden: &'a [String],
    min_lines: usize,
) -> Option<&'a str> {
    if buffer.len() < min_lines {
        return None;
    }
    forbidden
        .iter()
        .find(|token| buffer.contains(token))
        .map(String::as_str)
}
