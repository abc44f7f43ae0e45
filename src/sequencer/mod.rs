//! Per-test state machine evaluated once per external tick.

#![allow(missing_docs)]

pub mod checks;
pub mod outcome;
pub mod policy;
pub mod run;
pub mod transfer;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::script::{Script, TransferSpec};
use crate::script::list::InstructionList;
use crate::sequencer::checks::{
    BuiltinChecks, ErrorMarkerScan, MismatchThreshold, SpecialCheckHandler, TerminationCondition,
};
use crate::sequencer::policy::DEFAULT_MAX_ATTEMPTS;

/// Engine tunables for one run, usually taken from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub max_attempts: u32,
    pub power_on_timeout: Duration,
    /// Consecutive misses on one step before a stall diagnostic; 0 disables.
    pub stall_warning_misses: u32,
    pub reconnect_attempts: u32,
    /// Where running logs are exported on reset; `None` discards them.
    pub log_dir: Option<PathBuf>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            power_on_timeout: Duration::from_secs(5),
            stall_warning_misses: 256,
            reconnect_attempts: 3,
            log_dir: None,
        }
    }
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.engine.max_attempts,
            power_on_timeout: Duration::from_millis(config.engine.power_on_timeout_ms),
            stall_warning_misses: config.engine.stall_warning_misses,
            reconnect_attempts: config.serial.reconnect_attempts,
            log_dir: Some(config.paths.log_dir.clone()),
        }
    }
}

/// Everything that distinguishes one test type from another.
pub struct TestProfile {
    pub name: String,
    pub instructions: InstructionList,
    pub vars: BTreeMap<String, String>,
    pub special: Arc<dyn SpecialCheckHandler>,
    pub terminations: Vec<Box<dyn TerminationCondition>>,
    /// USB image transfer run at the start of every attempt.
    pub transfer: Option<TransferSpec>,
    pub settings: RunSettings,
}

impl TestProfile {
    pub fn new(name: impl Into<String>, instructions: InstructionList) -> Self {
        Self {
            name: name.into(),
            instructions,
            vars: BTreeMap::new(),
            special: Arc::new(BuiltinChecks),
            terminations: Vec::new(),
            transfer: None,
            settings: RunSettings::default(),
        }
    }

    /// Resolve a script's `[checks]` against engine defaults.
    pub fn from_script(script: &Script, config: &Config) -> Result<Self> {
        let mut profile = Self::new(script.name.clone(), script.instruction_list()?)
            .with_settings(RunSettings::from_config(config));
        profile.vars.clone_from(&script.vars);
        profile.transfer.clone_from(&script.transfer);

        let checks = &script.checks;
        if checks.error_scan {
            let markers = if checks.error_markers.is_empty() {
                config.engine.error_markers.clone()
            } else {
                checks.error_markers.clone()
            };
            profile = profile.with_termination(ErrorMarkerScan::new(markers));
        }
        if let Some(mismatch) = &checks.mismatch {
            profile = profile.with_termination(MismatchThreshold {
                channel: mismatch.channel,
                marker: mismatch
                    .marker
                    .clone()
                    .unwrap_or_else(|| config.engine.mismatch_marker.clone()),
                threshold: mismatch
                    .threshold
                    .unwrap_or(config.engine.mismatch_threshold),
            });
        }
        Ok(profile)
    }

    #[must_use]
    pub fn with_special_handler(mut self, handler: Arc<dyn SpecialCheckHandler>) -> Self {
        self.special = handler;
        self
    }

    #[must_use]
    pub fn with_termination(mut self, condition: impl TerminationCondition + 'static) -> Self {
        self.terminations.push(Box::new(condition));
        self
    }

    #[must_use]
    pub fn with_transfer(mut self, transfer: TransferSpec) -> Self {
        self.transfer = Some(transfer);
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}
