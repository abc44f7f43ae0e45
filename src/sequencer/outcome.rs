//! Structured results handed to the external logger.

#![allow(missing_docs)]

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::sequencer::policy::RunStatus;
use crate::terminal::ChannelId;

/// Verdict column of a result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// Informational measurement such as an execution time.
    Additional,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("PASS"),
            Self::Fail => f.write_str("FAIL"),
            Self::Additional => f.write_str("ADDITIONAL"),
        }
    }
}

/// One instruction's result, emitted at most once per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPointOutcome {
    pub test_name: String,
    pub instruction_index: usize,
    pub expected_output: String,
    pub actual_output: String,
    pub verdict: Verdict,
    pub attempt_number: u32,
}

/// Summary written when an attempt concludes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub test_name: String,
    pub attempt_number: u32,
    pub status: RunStatus,
    pub failure: Option<String>,
    pub completed_steps: usize,
    pub total_steps: usize,
}

/// Consumer of engine results. Implementations must not block for long; they
/// are called with the run state locked.
pub trait ResultSink: Send + Sync {
    fn record_point(&self, outcome: &TestPointOutcome);

    fn record_run(&self, record: &RunRecord);

    fn run_started(&self, _test_name: &str, _attempt_number: u32) {}

    fn link_changed(&self, _channel: ChannelId, _connected: bool) {}

    /// The operator asked for a counted restart.
    fn restart_requested(&self, _test_name: &str) {}

    /// The attempt was stopped without counting.
    fn abort_requested(&self, _test_name: &str, _reason: &str) {}

    /// Free-form operator diagnostic.
    fn note(&self, _test_name: &str, _message: &str) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ResultSink for NullSink {
    fn record_point(&self, _outcome: &TestPointOutcome) {}
    fn record_run(&self, _record: &RunRecord) {}
}

/// Keeps every result in memory; used by replay output and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    points: Mutex<Vec<TestPointOutcome>>,
    runs: Mutex<Vec<RunRecord>>,
    notes: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<TestPointOutcome> {
        self.points.lock().clone()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().clone()
    }

    pub fn notes(&self) -> Vec<String> {
        self.notes.lock().clone()
    }
}

impl ResultSink for MemorySink {
    fn record_point(&self, outcome: &TestPointOutcome) {
        self.points.lock().push(outcome.clone());
    }

    fn record_run(&self, record: &RunRecord) {
        self.runs.lock().push(record.clone());
    }

    fn note(&self, _test_name: &str, message: &str) {
        self.notes.lock().push(message.to_string());
    }
}

/// Fan results out to several sinks.
pub struct TeeSink(pub Vec<Arc<dyn ResultSink>>);

impl ResultSink for TeeSink {
    fn record_point(&self, outcome: &TestPointOutcome) {
        self.0.iter().for_each(|s| s.record_point(outcome));
    }

    fn record_run(&self, record: &RunRecord) {
        self.0.iter().for_each(|s| s.record_run(record));
    }

    fn run_started(&self, test_name: &str, attempt_number: u32) {
        self.0
            .iter()
            .for_each(|s| s.run_started(test_name, attempt_number));
    }

    fn link_changed(&self, channel: ChannelId, connected: bool) {
        self.0.iter().for_each(|s| s.link_changed(channel, connected));
    }

    fn restart_requested(&self, test_name: &str) {
        self.0.iter().for_each(|s| s.restart_requested(test_name));
    }

    fn abort_requested(&self, test_name: &str, reason: &str) {
        self.0.iter().for_each(|s| s.abort_requested(test_name, reason));
    }

    fn note(&self, test_name: &str, message: &str) {
        self.0.iter().for_each(|s| s.note(test_name, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(verdict: Verdict) -> TestPointOutcome {
        TestPointOutcome {
            test_name: "ADC".to_string(),
            instruction_index: 2,
            expected_output: "voltage:".to_string(),
            actual_output: "ADC0 AIN6 voltage: 1225mV".to_string(),
            verdict,
            attempt_number: 1,
        }
    }

    #[test]
    fn outcome_serializes_with_snake_case_verdict() {
        let json = serde_json::to_string(&point(Verdict::Additional)).unwrap();
        assert!(json.contains("\"verdict\":\"additional\""));
        assert!(json.contains("\"attempt_number\":1"));
    }

    #[test]
    fn tee_forwards_to_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let tee = TeeSink(vec![a.clone() as Arc<dyn ResultSink>, b.clone()]);
        tee.record_point(&point(Verdict::Pass));
        tee.note("ADC", "waiting");
        assert_eq!(a.points().len(), 1);
        assert_eq!(b.points()[0].verdict, Verdict::Pass);
        assert_eq!(b.notes(), vec!["waiting"]);
    }
}
