//! ARIG-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, RigError>;

/// Top-level error type for the acceptance rig.
///
/// Per-tick test failures are not errors; they surface as
/// [`crate::sequencer::run::TickOutcome`] values. This enum covers
/// environment failures and API misuse.
#[derive(Debug, Error)]
pub enum RigError {
    #[error("[ARIG-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[ARIG-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[ARIG-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[ARIG-1101] invalid test script: {details}")]
    InvalidScript { details: String },

    #[error("[ARIG-1102] test script parse failure in {path}: {details}")]
    ScriptParse { path: PathBuf, details: String },

    #[error("[ARIG-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[ARIG-3001] transport failure on {channel}: {details}")]
    Transport { channel: String, details: String },

    #[error("[ARIG-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[ARIG-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[ARIG-3004] serial port unavailable: {port}: {details}")]
    PortUnavailable { port: String, details: String },

    #[error("[ARIG-4001] test {test} is inhibited after {attempts} attempts")]
    TestInhibited { test: String, attempts: u32 },

    #[error("[ARIG-4002] invalid run transition for {test}: {from} -> {to}")]
    InvalidTransition {
        test: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("[ARIG-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl RigError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "ARIG-1001",
            Self::MissingConfig { .. } => "ARIG-1002",
            Self::ConfigParse { .. } => "ARIG-1003",
            Self::InvalidScript { .. } => "ARIG-1101",
            Self::ScriptParse { .. } => "ARIG-1102",
            Self::Serialization { .. } => "ARIG-2101",
            Self::Transport { .. } => "ARIG-3001",
            Self::Io { .. } => "ARIG-3002",
            Self::ChannelClosed { .. } => "ARIG-3003",
            Self::PortUnavailable { .. } => "ARIG-3004",
            Self::TestInhibited { .. } => "ARIG-4001",
            Self::InvalidTransition { .. } => "ARIG-4002",
            Self::Runtime { .. } => "ARIG-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Transport { .. }
                | Self::ChannelClosed { .. }
                | Self::PortUnavailable { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for transport errors on a named channel.
    #[must_use]
    pub fn transport(channel: impl ToString, details: impl Into<String>) -> Self {
        Self::Transport {
            channel: channel.to_string(),
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for RigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for RigError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(feature = "serial")]
impl From<serialport::Error> for RigError {
    fn from(value: serialport::Error) -> Self {
        Self::PortUnavailable {
            port: String::from("<unknown>"),
            details: value.to_string(),
        }
    }
}
