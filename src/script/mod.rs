//! Test scripts: instruction tables supplied as TOML data.
//!
//! ```toml
//! name = "ADC"
//!
//! [checks]
//! error_scan = false
//!
//! [transfer]
//! command = "rc /ADC"
//!
//! [[instruction]]
//! text = "Power on the board"
//! desired_output = "ADC0 AIN6 voltage:"
//! terminal = "main"
//! special = { kind = "range", min = 1215, max = 1235 }
//! ```

#![allow(missing_docs)]

pub mod instruction;
pub mod list;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, RigError};
use crate::script::instruction::{Instruction, SpecialCheck};
use crate::script::list::InstructionList;
use crate::terminal::ChannelId;

/// Cumulative checks evaluated every tick regardless of the current step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ChecksSpec {
    /// Fail the run when an error marker appears on either channel.
    pub error_scan: bool,
    /// Markers for `error_scan`; empty means the configured engine defaults.
    pub error_markers: Vec<String>,
    pub mismatch: Option<MismatchSpec>,
}

/// Occurrence-count limit on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MismatchSpec {
    #[serde(default = "default_mismatch_channel")]
    pub channel: ChannelId,
    /// Falls back to `engine.mismatch_marker`.
    #[serde(default)]
    pub marker: Option<String>,
    /// Falls back to `engine.mismatch_threshold`.
    #[serde(default)]
    pub threshold: Option<usize>,
}

const fn default_mismatch_channel() -> ChannelId {
    ChannelId::Main
}

/// Banner the bootloader's USB utility prints once it is ready for commands.
pub const USB_UTILITY_BANNER: &str = "*** USB Utility Application";
/// Line the utility prints after the test image is copied.
pub const USB_TRANSFER_DONE: &str = "DONE!";

/// Copy the test image from USB through the bootloader utility before the
/// first step runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferSpec {
    /// Utility command that selects the test, e.g. `rc /FIRM`.
    pub command: String,
    #[serde(default = "default_transfer_channel")]
    pub channel: ChannelId,
    #[serde(default = "default_banner")]
    pub banner: String,
    #[serde(default = "default_done_marker")]
    pub done_marker: String,
    /// How long to wait for the banner before giving up.
    #[serde(default = "default_banner_timeout_ms")]
    pub banner_timeout_ms: u64,
    /// Resend period while the utility stays silent after a command.
    #[serde(default = "default_resend_interval_ms")]
    pub resend_interval_ms: u64,
}

impl TransferSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            channel: default_transfer_channel(),
            banner: default_banner(),
            done_marker: default_done_marker(),
            banner_timeout_ms: default_banner_timeout_ms(),
            resend_interval_ms: default_resend_interval_ms(),
        }
    }
}

const fn default_transfer_channel() -> ChannelId {
    ChannelId::Boot
}

fn default_banner() -> String {
    USB_UTILITY_BANNER.to_string()
}

fn default_done_marker() -> String {
    USB_TRANSFER_DONE.to_string()
}

// Five polls of ten seconds each.
const fn default_banner_timeout_ms() -> u64 {
    50_000
}

const fn default_resend_interval_ms() -> u64 {
    3_000
}

/// A parsed, validated test script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub checks: ChecksSpec,
    #[serde(default)]
    pub transfer: Option<TransferSpec>,
    /// Initial run variables for `{name}` placeholders.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(rename = "instruction")]
    pub instructions: Vec<Instruction>,
}

impl Script {
    /// Read and validate a script file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| RigError::io(path, source))?;
        let script: Self = toml::from_str(&raw).map_err(|e| RigError::ScriptParse {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;
        script.validate()?;
        Ok(script)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let script: Self = toml::from_str(raw).map_err(|e| RigError::ScriptParse {
            path: "<inline>".into(),
            details: e.to_string(),
        })?;
        script.validate()?;
        Ok(script)
    }

    /// Build from instructions in code.
    pub fn new(name: impl Into<String>, instructions: Vec<Instruction>) -> Result<Self> {
        let script = Self {
            name: name.into(),
            description: None,
            checks: ChecksSpec::default(),
            transfer: None,
            vars: BTreeMap::new(),
            instructions,
        };
        script.validate()?;
        Ok(script)
    }

    #[must_use]
    pub fn with_checks(mut self, checks: ChecksSpec) -> Self {
        self.checks = checks;
        self
    }

    #[must_use]
    pub fn with_transfer(mut self, transfer: TransferSpec) -> Self {
        self.transfer = Some(transfer);
        self
    }

    pub fn instruction_list(&self) -> Result<InstructionList> {
        InstructionList::new(self.instructions.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("script name must not be empty".to_string()));
        }
        if self.instructions.is_empty() {
            return Err(invalid(format!(
                "script {} has no [[instruction]] entries",
                self.name
            )));
        }
        for (idx, step) in self.instructions.iter().enumerate() {
            validate_instruction(idx, step)?;
        }
        if let Some(transfer) = &self.transfer {
            if transfer.command.trim().is_empty() {
                return Err(invalid("transfer.command must not be empty".to_string()));
            }
            if transfer.banner.is_empty() || transfer.done_marker.is_empty() {
                return Err(invalid(
                    "transfer.banner and transfer.done_marker must not be empty".to_string(),
                ));
            }
        }
        if let Some(mismatch) = &self.checks.mismatch {
            if mismatch.marker.as_deref() == Some("") {
                return Err(invalid("checks.mismatch.marker must not be empty".to_string()));
            }
        }
        Ok(())
    }
}

fn validate_instruction(idx: usize, step: &Instruction) -> Result<()> {
    if step.text.trim().is_empty() {
        return Err(invalid(format!("instruction {idx} has no text")));
    }
    if step.desired_output.as_deref() == Some("") {
        return Err(invalid(format!(
            "instruction {idx} has an empty desired_output"
        )));
    }
    if step.desired_output.is_some() && step.terminal.is_none() {
        return Err(invalid(format!(
            "instruction {idx} awaits output but names no terminal"
        )));
    }
    if step.special.is_some() && step.desired_output.is_none() {
        return Err(invalid(format!(
            "instruction {idx} has a special check but no desired_output to anchor it"
        )));
    }
    if step.await_activity && step.terminal.is_none() {
        return Err(invalid(format!(
            "instruction {idx} awaits activity but names no terminal"
        )));
    }
    if !step.reply.is_empty() && step.reply_channel().is_none() {
        return Err(invalid(format!(
            "instruction {idx} has a reply but no channel to send it on"
        )));
    }
    if let Some(SpecialCheck::Range { min, max, .. }) = &step.special {
        if min > max {
            return Err(invalid(format!(
                "instruction {idx} range is empty: {min} > {max}"
            )));
        }
    }
    Ok(())
}

fn invalid(details: String) -> RigError {
    RigError::InvalidScript { details }
}
