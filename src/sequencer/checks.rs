//! Per-test capabilities: special checks and run-wide termination conditions.
//!
//! A test type is a script plus a [`SpecialCheckHandler`] and a list of
//! [`TerminationCondition`]s; there is no per-test subclassing.

#![allow(missing_docs)]

use crate::matcher::{self, CheckResult};
use crate::script::instruction::{Instruction, SpecialCheck};
use crate::sequencer::policy::FailureKind;
use crate::terminal::buffer::ChannelBuffer;
use crate::terminal::{ChannelId, TerminalPair};

/// Result of one special-check evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialOutcome {
    /// Evidence not there yet; keep waiting.
    Pending,
    Passed {
        actual: String,
        /// Run variable to set, as `(name, value)`.
        capture: Option<(String, String)>,
    },
    Failed {
        kind: FailureKind,
        actual: String,
    },
}

/// Evaluates instructions whose `special` field is set.
pub trait SpecialCheckHandler: Send + Sync {
    /// `pattern` is the instruction's desired output with run variables expanded.
    fn evaluate(
        &self,
        instruction: &Instruction,
        pattern: &str,
        buffer: &ChannelBuffer,
    ) -> SpecialOutcome;
}

/// Dispatches on the instruction's [`SpecialCheck`] data.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinChecks;

impl SpecialCheckHandler for BuiltinChecks {
    fn evaluate(
        &self,
        instruction: &Instruction,
        pattern: &str,
        buffer: &ChannelBuffer,
    ) -> SpecialOutcome {
        let Some(special) = &instruction.special else {
            return match buffer.first_match(pattern) {
                Some(line) => SpecialOutcome::Passed {
                    actual: line.text().to_string(),
                    capture: None,
                },
                None => SpecialOutcome::Pending,
            };
        };
        match special {
            SpecialCheck::Range { label, min, max } => {
                let Some(line) = buffer.first_match(pattern) else {
                    return SpecialOutcome::Pending;
                };
                from_check(matcher::range_check(line.text(), label, *min, *max), None)
            }
            SpecialCheck::ByteCount { label, capture_as } => {
                let Some(line) = buffer.first_match(pattern) else {
                    return SpecialOutcome::Pending;
                };
                let (result, count) = matcher::byte_count_check(line.text(), label);
                let capture = capture_as
                    .as_ref()
                    .zip(count)
                    .map(|(name, n)| (name.clone(), n.to_string()));
                from_check(result, capture)
            }
            SpecialCheck::SectionStatus => matcher::section_status(buffer, pattern)
                .map_or(SpecialOutcome::Pending, |r| from_check(r, None)),
            SpecialCheck::FileFound { confirmation } => {
                match matcher::file_found(buffer, pattern, confirmation) {
                    None => SpecialOutcome::Pending,
                    Some(true) => SpecialOutcome::Passed {
                        actual: confirmation.clone(),
                        capture: None,
                    },
                    Some(false) => SpecialOutcome::Failed {
                        kind: FailureKind::FileNotFound,
                        actual: buffer.next_line_after(pattern),
                    },
                }
            }
        }
    }
}

fn from_check(result: CheckResult, capture: Option<(String, String)>) -> SpecialOutcome {
    match result {
        CheckResult::Pass { actual } => SpecialOutcome::Passed { actual, capture },
        CheckResult::Fail { actual } => SpecialOutcome::Failed {
            kind: FailureKind::SpecialCheckFailed,
            actual,
        },
        CheckResult::Unverifiable { actual } => SpecialOutcome::Failed {
            kind: FailureKind::ParseFailure,
            actual,
        },
    }
}

// ──────────────────── termination conditions ────────────────────

/// A run-wide condition that fails the run, evaluated every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub kind: FailureKind,
    pub evidence: String,
}

pub trait TerminationCondition: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, terminals: &TerminalPair) -> Option<Termination>;
}

/// Any visible line on either channel containing one of the markers.
#[derive(Debug, Clone)]
pub struct ErrorMarkerScan {
    markers: Vec<String>,
}

impl ErrorMarkerScan {
    pub fn new(markers: Vec<String>) -> Self {
        Self {
            markers: markers.into_iter().filter(|m| !m.is_empty()).collect(),
        }
    }
}

impl TerminationCondition for ErrorMarkerScan {
    fn name(&self) -> &'static str {
        "error_marker_scan"
    }

    fn check(&self, terminals: &TerminalPair) -> Option<Termination> {
        ChannelId::ALL.into_iter().find_map(|channel| {
            let buffer = terminals.buffer(channel);
            self.markers.iter().find_map(|marker| {
                buffer.first_match(marker).map(|line| Termination {
                    kind: FailureKind::ErrorMarker,
                    evidence: line.text().to_string(),
                })
            })
        })
    }
}

/// Cumulative marker count on one channel above a threshold.
#[derive(Debug, Clone)]
pub struct MismatchThreshold {
    pub channel: ChannelId,
    pub marker: String,
    pub threshold: usize,
}

impl TerminationCondition for MismatchThreshold {
    fn name(&self) -> &'static str {
        "mismatch_threshold"
    }

    fn check(&self, terminals: &TerminalPair) -> Option<Termination> {
        let report = matcher::mismatch_count(
            terminals.buffer(self.channel),
            &self.marker,
            self.threshold,
        );
        report.exceeded().then(|| Termination {
            kind: FailureKind::MismatchThreshold,
            evidence: format!(
                "{} x {} on {} (limit {})",
                report.count, self.marker, self.channel, report.threshold
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(lines: &[&str]) -> ChannelBuffer {
        let buf = ChannelBuffer::new(64);
        for l in lines {
            buf.push(*l);
        }
        buf
    }

    #[test]
    fn range_check_dispatches_on_instruction_data() {
        let step = Instruction::expect("ADC", ChannelId::Main, "ADC0 AIN6").with_special(
            SpecialCheck::Range {
                label: "voltage".to_string(),
                min: 1215,
                max: 1235,
            },
        );
        let checks = BuiltinChecks;
        assert_eq!(
            checks.evaluate(&step, "ADC0 AIN6", &buffer_with(&["boot"])),
            SpecialOutcome::Pending
        );
        let ok = checks.evaluate(&step, "ADC0 AIN6", &buffer_with(&["ADC0 AIN6 voltage: 1225mV"]));
        assert!(matches!(ok, SpecialOutcome::Passed { .. }));
        let low = checks.evaluate(&step, "ADC0 AIN6", &buffer_with(&["ADC0 AIN6 voltage: 1200mV"]));
        assert_eq!(
            low,
            SpecialOutcome::Failed {
                kind: FailureKind::SpecialCheckFailed,
                actual: "ADC0 AIN6 voltage: 1200mV".to_string()
            }
        );
        let garbled = checks.evaluate(&step, "ADC0 AIN6", &buffer_with(&["ADC0 AIN6 voltage: ?"]));
        assert!(matches!(
            garbled,
            SpecialOutcome::Failed {
                kind: FailureKind::ParseFailure,
                ..
            }
        ));
    }

    #[test]
    fn byte_count_captures_run_variable() {
        let step = Instruction::expect("Copy", ChannelId::Boot, "Bytes copied").with_special(
            SpecialCheck::ByteCount {
                label: "copied".to_string(),
                capture_as: Some("bytes".to_string()),
            },
        );
        let out = BuiltinChecks.evaluate(
            &step,
            "Bytes copied",
            &buffer_with(&["Bytes copied: 4096"]),
        );
        assert_eq!(
            out,
            SpecialOutcome::Passed {
                actual: "Bytes copied: 4096".to_string(),
                capture: Some(("bytes".to_string(), "4096".to_string())),
            }
        );
    }

    #[test]
    fn missing_file_fails_with_file_not_found() {
        let step = Instruction::expect("Lookup", ChannelId::Main, "Looking for file")
            .with_special(SpecialCheck::FileFound {
                confirmation: "File found!".to_string(),
            });
        let out = BuiltinChecks.evaluate(
            &step,
            "Looking for file",
            &buffer_with(&["Looking for file '/app'", "No such file"]),
        );
        assert_eq!(
            out,
            SpecialOutcome::Failed {
                kind: FailureKind::FileNotFound,
                actual: "No such file".to_string()
            }
        );
    }

    #[test]
    fn error_marker_scan_checks_both_channels() {
        let pair = TerminalPair::new(16);
        pair.set_capture(true);
        pair.ingest(ChannelId::Main, b"all good\n");
        let scan = ErrorMarkerScan::new(vec!["ERROR".to_string(), String::new()]);
        assert!(scan.check(&pair).is_none());
        pair.ingest(ChannelId::Boot, b"DDR ERROR at 0x8000\n");
        let hit = scan.check(&pair).unwrap();
        assert_eq!(hit.kind, FailureKind::ErrorMarker);
        assert_eq!(hit.evidence, "DDR ERROR at 0x8000");
    }

    #[test]
    fn mismatch_threshold_fires_above_limit_only() {
        let pair = TerminalPair::new(256);
        pair.set_capture(true);
        let cond = MismatchThreshold {
            channel: ChannelId::Main,
            marker: "(MISMATCH)".to_string(),
            threshold: 64,
        };
        for _ in 0..64 {
            pair.ingest(ChannelId::Main, b"addr (MISMATCH)\n");
        }
        assert!(cond.check(&pair).is_none());
        pair.ingest(ChannelId::Main, b"addr (MISMATCH)\n");
        assert_eq!(
            cond.check(&pair).unwrap().kind,
            FailureKind::MismatchThreshold
        );
    }
}
