//! Bounded per-channel line history with one-way suppression marks.
//!
//! Writers take the deque's write lock only for the push/evict step; readers
//! work on a consistent view under the read lock. A line's `suppressed` flag is
//! an atomic so marking it never needs the write lock and racing marks are
//! harmless.

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use memchr::memmem;
use parking_lot::RwLock;

/// Default history depth per channel.
pub const DEFAULT_CAPACITY: usize = 256;

/// One reassembled unit of device output.
#[derive(Debug)]
pub struct Line {
    text: String,
    suppressed: AtomicBool,
}

impl Line {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            suppressed: AtomicBool::new(false),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::Acquire)
    }

    /// Mark as consumed. Returns `true` only for the call that flipped it.
    pub fn suppress(&self) -> bool {
        !self.suppressed.swap(true, Ordering::AcqRel)
    }

    fn visible_match(&self, pattern: &str) -> bool {
        !self.is_suppressed() && self.text.contains(pattern)
    }
}

/// Thread-safe bounded history of lines for one channel.
#[derive(Debug)]
pub struct ChannelBuffer {
    lines: RwLock<VecDeque<Arc<Line>>>,
    capacity: usize,
}

impl Default for ChannelBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChannelBuffer {
    /// Create a buffer holding at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.read().is_empty()
    }

    /// Append a line, evicting the oldest when over capacity.
    pub fn push(&self, text: impl Into<String>) {
        let line = Arc::new(Line::new(text));
        let mut lines = self.lines.write();
        lines.push_back(line);
        while lines.len() > self.capacity {
            lines.pop_front();
        }
    }

    /// Drop all history.
    pub fn clear(&self) {
        self.lines.write().clear();
    }

    /// Any visible line contains `pattern`.
    pub fn contains(&self, pattern: &str) -> bool {
        self.lines.read().iter().any(|l| l.visible_match(pattern))
    }

    /// First visible line containing `pattern`, in arrival order.
    pub fn first_match(&self, pattern: &str) -> Option<Arc<Line>> {
        self.lines
            .read()
            .iter()
            .find(|l| l.visible_match(pattern))
            .cloned()
    }

    /// Hide the first visible match. Returns whether one was found.
    pub fn suppress_first(&self, pattern: &str) -> bool {
        self.first_match(pattern).is_some_and(|line| {
            line.suppress();
            true
        })
    }

    /// Hide every visible match. Returns how many lines were newly hidden.
    pub fn suppress_all(&self, pattern: &str) -> usize {
        self.lines
            .read()
            .iter()
            .filter(|l| l.visible_match(pattern))
            .filter(|l| l.suppress())
            .count()
    }

    /// Text of the first visible non-empty line after the first visible match.
    ///
    /// Returns `pattern` unchanged when nothing matches, and an empty string
    /// when the match is the newest visible line.
    pub fn next_line_after(&self, pattern: &str) -> String {
        let lines = self.lines.read();
        let mut visible = lines.iter().filter(|l| !l.is_suppressed());
        if !visible.any(|l| l.text.contains(pattern)) {
            return pattern.to_string();
        }
        visible
            .find(|l| !l.text.trim().is_empty())
            .map(|l| l.text.clone())
            .unwrap_or_default()
    }

    /// Remainder of the first visible matching line after `pattern`.
    pub fn text_after(&self, pattern: &str) -> Option<String> {
        self.first_match(pattern).and_then(|line| {
            line.text
                .find(pattern)
                .map(|at| line.text[at + pattern.len()..].to_string())
        })
    }

    /// Substring occurrences of `pattern` across every line, suppressed or not.
    pub fn count_occurrences(&self, pattern: &str) -> usize {
        if pattern.is_empty() {
            return 0;
        }
        let finder = memmem::Finder::new(pattern.as_bytes());
        self.lines
            .read()
            .iter()
            .map(|l| finder.find_iter(l.text.as_bytes()).count())
            .sum()
    }

    /// Copy of every line's text, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.read().iter().map(|l| l.text.clone()).collect()
    }
}
