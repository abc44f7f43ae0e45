//! Failure taxonomy and the bounded-attempt policy.

#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::terminal::ChannelId;

// ──────────────────── run status ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    /// Operator abort; resets like a failure but is not counted.
    Restarting,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Restarting => "restarting",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ──────────────────── failures ────────────────────

/// Why a run failed. Each kind carries a fixed operator-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    ErrorMarker,
    MismatchThreshold,
    WrongSource,
    ParseFailure,
    SpecialCheckFailed,
    LinkDown { channel: ChannelId },
    FileNotFound,
    /// Operator asked for a restart; counted like a hardware failure.
    OperatorRestart,
    /// The USB utility never came up to load the test image. Resets the run
    /// without counting an attempt.
    UsbTransfer,
}

impl FailureKind {
    /// Human-readable cause attached to the active instruction.
    pub fn message(&self, expected: &str, actual: &str) -> String {
        match self {
            Self::ErrorMarker => {
                "Test aborted: error marker present (check log for more info)".to_string()
            }
            Self::MismatchThreshold => "ERROR : Too many MISMATCH".to_string(),
            Self::WrongSource => "ERROR: Loading from unknown/wrong device".to_string(),
            Self::ParseFailure => format!("Could not verify {expected}: {actual}"),
            Self::SpecialCheckFailed => actual.to_string(),
            Self::LinkDown { channel } => format!("{channel} terminal not connected"),
            Self::FileNotFound => "File not found!".to_string(),
            Self::OperatorRestart => "Test restarted by operator".to_string(),
            Self::UsbTransfer => "Failed to Load USB application !".to_string(),
        }
    }
}

/// A latched run failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    /// Instruction that was active when the failure fired.
    pub instruction_index: usize,
    pub message: String,
    /// Evidence text, when there is any.
    pub actual: String,
}

impl Failure {
    pub fn new(kind: FailureKind, instruction_index: usize, expected: &str, actual: &str) -> Self {
        Self {
            message: kind.message(expected, actual),
            kind,
            instruction_index,
            actual: actual.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {}: {}", self.instruction_index, self.message)
    }
}

// ──────────────────── attempt policy ────────────────────

/// Default bound on counted failures before a test is inhibited.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Counts failed attempts and inhibits the test once the bound is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptPolicy {
    max_attempts: u32,
    failures: u32,
}

impl Default for AttemptPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl AttemptPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            failures: 0,
        }
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Counted failures so far.
    pub const fn attempts(&self) -> u32 {
        self.failures
    }

    /// 1-based number of the attempt that is running or about to run.
    pub const fn current_attempt(&self) -> u32 {
        self.failures + 1
    }

    pub const fn is_inhibited(&self) -> bool {
        self.failures >= self.max_attempts
    }

    pub const fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.failures)
    }

    /// Count a failure. Returns whether another attempt is allowed.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1).min(self.max_attempts);
        !self.is_inhibited()
    }

    /// External override: clear the count so the test may run again.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// What `conclude()` decided after an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "conclusion", rename_all = "snake_case")]
pub enum RunConclusion {
    /// Nothing to conclude; the run is not in a terminal status.
    Pending,
    Passed { attempt: u32 },
    /// Failed, but attempts remain.
    Retry { attempts: u32, remaining: u32 },
    /// Failed and the attempt bound is reached.
    Exhausted { attempts: u32 },
    /// Aborted; state reset without counting.
    Reset,
}

impl RunConclusion {
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Passed { .. } | Self::Exhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_messages_match_failure_kind() {
        assert_eq!(
            FailureKind::MismatchThreshold.message("", ""),
            "ERROR : Too many MISMATCH"
        );
        assert_eq!(
            FailureKind::LinkDown {
                channel: ChannelId::Boot
            }
            .message("", ""),
            "BOOT terminal not connected"
        );
        assert_eq!(
            FailureKind::ParseFailure.message("voltage:", "voltage: --mV"),
            "Could not verify voltage:: voltage: --mV"
        );
        assert_eq!(
            FailureKind::UsbTransfer.message("*** USB Utility Application", ""),
            "Failed to Load USB application !"
        );
        let f = Failure::new(FailureKind::SpecialCheckFailed, 3, "x", "RAM walk FAIL");
        assert_eq!(f.message, "RAM walk FAIL");
        assert_eq!(f.to_string(), "step 3: RAM walk FAIL");
    }

    #[test]
    fn policy_inhibits_at_bound() {
        let mut policy = AttemptPolicy::new(3);
        assert!(policy.record_failure());
        assert!(policy.record_failure());
        assert_eq!(policy.remaining(), 1);
        assert!(!policy.record_failure());
        assert!(policy.is_inhibited());
        assert_eq!(policy.attempts(), 3);
        assert!(!policy.record_failure(), "stays capped");
        assert_eq!(policy.attempts(), 3);
        policy.reset();
        assert!(!policy.is_inhibited());
        assert_eq!(policy.current_attempt(), 1);
    }

    #[test]
    fn zero_bound_is_clamped_to_one() {
        let mut policy = AttemptPolicy::new(0);
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.record_failure());
    }
}
