//! One scripted step: what to show the operator, what to wait for, and where.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::matcher::FILE_FOUND_CONFIRMATION;
use crate::terminal::ChannelId;

/// Non-substring evaluation routed to the test's special-check handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpecialCheck {
    /// Number after `label:` on the matched line must lie in `[min, max]`.
    Range {
        #[serde(default = "default_range_label")]
        label: String,
        min: u64,
        max: u64,
    },
    /// Number after `label:` must be positive; optionally kept as a run variable.
    ByteCount {
        #[serde(default = "default_byte_label")]
        label: String,
        #[serde(default)]
        capture_as: Option<String>,
    },
    /// Text after the desired output must contain `PASS` or `(match)`.
    SectionStatus,
    /// Line after the desired output must equal `confirmation`.
    FileFound {
        #[serde(default = "default_confirmation")]
        confirmation: String,
    },
}

fn default_range_label() -> String {
    "voltage".to_string()
}

fn default_byte_label() -> String {
    "copied".to_string()
}

fn default_confirmation() -> String {
    FILE_FOUND_CONFIRMATION.to_string()
}

/// Elapsed-time measurement between two instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMark {
    /// Stamp the instant this instruction completes.
    Start,
    /// Report seconds since the last `Start` as an additional result.
    Stop,
}

/// Mutable evaluation state, rebuilt whenever the run restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionState {
    pub check_completed: bool,
    pub actual_output: Option<String>,
    pub error_text: Option<String>,
    /// Consecutive misses; reset when it reaches the stall warning threshold.
    pub attempts_left: u32,
    pub result_emitted: bool,
    pub replies_sent: bool,
    pub acknowledged: bool,
    pub reconnect_failures: u32,
    /// `sample_delay_ms` already waited out for this attempt.
    pub delay_elapsed: bool,
    /// Power-on evidence already observed.
    pub activity_seen: bool,
}

/// A scripted step. Script fields are immutable once a run starts; only
/// [`InstructionState`] changes during evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Instruction {
    /// Operator-facing description.
    pub text: String,
    /// Substring to await; may contain `{var}` placeholders.
    pub desired_output: Option<String>,
    /// `false` marks a pure display step that completes on first evaluation.
    pub check_required: bool,
    /// Buffer consulted for `desired_output`.
    pub terminal: Option<ChannelId>,
    pub check_main_connected: bool,
    pub check_boot_connected: bool,
    pub special: Option<SpecialCheck>,
    pub user_ack_required: bool,
    /// Hide the evidence line after a successful match.
    pub suppress_on_match: bool,
    /// Lines written to the device once, on completion.
    pub reply: Vec<String>,
    /// Channel for `reply`; defaults to `terminal`.
    pub reply_to: Option<ChannelId>,
    /// Tokens whose presence (without `desired_output`) means the wrong source booted.
    pub forbidden: Vec<String>,
    /// Buffer depth required before `forbidden` is judged.
    pub forbidden_grace_lines: usize,
    pub timing: Option<TimingMark>,
    /// Wait this long before sampling the buffer.
    pub sample_delay_ms: u64,
    /// Wait for any output on `terminal` as power-on evidence.
    pub await_activity: bool,
    /// Milestone label shown to the operator.
    pub checkpoint: Option<String>,
    #[serde(skip)]
    pub state: InstructionState,
}

impl Default for Instruction {
    fn default() -> Self {
        Self {
            text: String::new(),
            desired_output: None,
            check_required: true,
            terminal: None,
            check_main_connected: false,
            check_boot_connected: false,
            special: None,
            user_ack_required: false,
            suppress_on_match: false,
            reply: Vec::new(),
            reply_to: None,
            forbidden: Vec::new(),
            forbidden_grace_lines: 0,
            timing: None,
            sample_delay_ms: 0,
            await_activity: false,
            checkpoint: None,
            state: InstructionState::default(),
        }
    }
}

impl Instruction {
    /// Operator-only step; completes without evidence.
    pub fn display(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            check_required: false,
            ..Self::default()
        }
    }

    /// Wait for `desired` to appear on `channel`.
    pub fn expect(text: impl Into<String>, channel: ChannelId, desired: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            desired_output: Some(desired.into()),
            terminal: Some(channel),
            ..Self::default()
        }
    }

    /// Wait for `channel`'s link to come up.
    pub fn link_gate(text: impl Into<String>, channel: ChannelId) -> Self {
        Self {
            text: text.into(),
            check_main_connected: channel == ChannelId::Main,
            check_boot_connected: channel == ChannelId::Boot,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_special(mut self, special: SpecialCheck) -> Self {
        self.special = Some(special);
        self
    }

    #[must_use]
    pub fn suppressing(mut self) -> Self {
        self.suppress_on_match = true;
        self
    }

    #[must_use]
    pub fn with_reply<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reply = lines.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn requiring_ack(mut self) -> Self {
        self.user_ack_required = true;
        self
    }

    #[must_use]
    pub fn with_timing(mut self, mark: TimingMark) -> Self {
        self.timing = Some(mark);
        self
    }

    #[must_use]
    pub fn forbidding<I, S>(mut self, tokens: I, grace_lines: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forbidden = tokens.into_iter().map(Into::into).collect();
        self.forbidden_grace_lines = grace_lines;
        self
    }

    #[must_use]
    pub fn awaiting_activity(mut self) -> Self {
        self.await_activity = true;
        self
    }

    #[must_use]
    pub fn with_sample_delay(mut self, millis: u64) -> Self {
        self.sample_delay_ms = millis;
        self
    }

    #[must_use]
    pub fn with_checkpoint(mut self, label: impl Into<String>) -> Self {
        self.checkpoint = Some(label.into());
        self
    }

    pub const fn has_special_check(&self) -> bool {
        self.special.is_some()
    }

    pub const fn gates_on_link(&self) -> bool {
        self.check_main_connected || self.check_boot_connected
    }

    /// Channels this step waits to see connected.
    pub fn gated_channels(&self) -> impl Iterator<Item = ChannelId> {
        [
            (self.check_main_connected, ChannelId::Main),
            (self.check_boot_connected, ChannelId::Boot),
        ]
        .into_iter()
        .filter_map(|(gated, channel)| gated.then_some(channel))
    }

    pub const fn is_complete(&self) -> bool {
        self.state.check_completed
    }

    pub fn reply_channel(&self) -> Option<ChannelId> {
        self.reply_to.or(self.terminal)
    }

    /// Desired output with `{name}` placeholders filled from `vars`.
    ///
    /// Unknown placeholders are left in place, so the step keeps waiting
    /// rather than matching a half-expanded pattern.
    pub fn resolved_desired(&self, vars: &BTreeMap<String, String>) -> Option<String> {
        self.desired_output
            .as_deref()
            .map(|raw| expand_placeholders(raw, vars))
    }

    pub fn reset_state(&mut self) {
        self.state = InstructionState::default();
    }
}

pub(crate) fn expand_placeholders(raw: &str, vars: &BTreeMap<String, String>) -> String {
    if !raw.contains('{') {
        return raw.to_string();
    }
    vars.iter().fold(raw.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_expected_flags() {
        let show = Instruction::display("Connect the harness");
        assert!(!show.check_required);
        assert!(show.desired_output.is_none());

        let wait = Instruction::expect("Power on", ChannelId::Boot, "MMCSD boot");
        assert!(wait.check_required);
        assert_eq!(wait.terminal, Some(ChannelId::Boot));
        assert_eq!(wait.reply_channel(), Some(ChannelId::Boot));

        let gate = Instruction::link_gate("Connect BOOT", ChannelId::Boot);
        assert!(gate.gates_on_link());
        assert_eq!(gate.gated_channels().collect::<Vec<_>>(), vec![ChannelId::Boot]);
    }

    #[test]
    fn placeholders_expand_from_run_variables() {
        let step = Instruction::expect(
            "Copy",
            ChannelId::Boot,
            "Copied bytes: {bytes}  of  {bytes}",
        );
        let mut vars = BTreeMap::new();
        assert_eq!(
            step.resolved_desired(&vars).as_deref(),
            Some("Copied bytes: {bytes}  of  {bytes}")
        );
        vars.insert("bytes".to_string(), "4096".to_string());
        assert_eq!(
            step.resolved_desired(&vars).as_deref(),
            Some("Copied bytes: 4096  of  4096")
        );
    }

    #[test]
    fn special_checks_deserialize_with_defaults() {
        #[derive(Deserialize)]
        struct Fields {
            a: SpecialCheck,
            b: SpecialCheck,
            c: SpecialCheck,
        }
        let parsed: Fields = toml::from_str(
            r#"
            a = { kind = "range", min = 1215, max = 1235 }
            b = { kind = "byte_count", capture_as = "bytes" }
            c = { kind = "file_found" }
            "#,
        )
        .unwrap();
        assert_eq!(
            parsed.a,
            SpecialCheck::Range {
                label: "voltage".to_string(),
                min: 1215,
                max: 1235
            }
        );
        assert_eq!(
            parsed.b,
            SpecialCheck::ByteCount {
                label: "copied".to_string(),
                capture_as: Some("bytes".to_string())
            }
        );
        assert_eq!(
            parsed.c,
            SpecialCheck::FileFound {
                confirmation: "File found!".to_string()
            }
        );
    }

    #[test]
    fn reset_state_clears_outcome() {
        let mut step = Instruction::display("x");
        step.state.check_completed = true;
        step.state.error_text = Some("boom".to_string());
        step.reset_state();
        assert_eq!(step.state, InstructionState::default());
    }
}
