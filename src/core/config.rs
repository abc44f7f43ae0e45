//! Configuration system: TOML file + env var overrides + bench defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, RigError};

/// Full rig configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub engine: EngineConfig,
    pub paths: PathsConfig,
}

/// Physical link settings for the MAIN and BOOT processors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name for the MAIN processor console (e.g. `/dev/ttyUSB0`, `COM3`).
    pub main_port: Option<String>,
    /// Port name for the BOOT processor console.
    pub boot_port: Option<String>,
    pub baud_rate: u32,
    /// Per-read timeout; short so reader threads notice shutdown quickly.
    pub read_timeout_ms: u64,
    /// Terminator appended to every line written to the device.
    pub write_line_ending: String,
    /// Consecutive failed reconnects before a link-gated step fails the run.
    pub reconnect_attempts: u32,
}

/// Sequencer tuning shared by every test script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_interval_ms: u64,
    /// History depth per channel. Older lines are evicted first.
    pub buffer_capacity: usize,
    pub max_attempts: u32,
    pub mismatch_marker: String,
    pub mismatch_threshold: usize,
    pub error_markers: Vec<String>,
    pub power_on_timeout_ms: u64,
    /// Consecutive misses on one instruction before a stall diagnostic.
    pub stall_warning_misses: u32,
}

/// Filesystem paths used by arig.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    /// Directory receiving `{test}_{CHANNEL}.txt` terminal exports.
    pub log_dir: PathBuf,
    pub results_jsonl: PathBuf,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            main_port: None,
            boot_port: None,
            baud_rate: 115_200,
            read_timeout_ms: 10,
            write_line_ending: "\r\n".to_string(),
            reconnect_attempts: 3,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            buffer_capacity: 256,
            max_attempts: 3,
            mismatch_marker: "(MISMATCH)".to_string(),
            mismatch_threshold: 64,
            error_markers: vec!["Error".to_string(), "ERROR".to_string()],
            power_on_timeout_ms: 5_000,
            stall_warning_misses: 256,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[ARIG-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("arig").join("config.toml");
        let data = home_dir.join(".local").join("share").join("arig");
        Self {
            config_file: cfg,
            log_dir: data.join("terminal-logs"),
            results_jsonl: data.join("results.jsonl"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| RigError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(RigError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the session log.
    ///
    /// FNV-1a over canonical JSON, stable across processes and releases.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // serial
        if let Some(raw) = lookup("ARIG_SERIAL_MAIN_PORT") {
            self.serial.main_port = Some(raw);
        }
        if let Some(raw) = lookup("ARIG_SERIAL_BOOT_PORT") {
            self.serial.boot_port = Some(raw);
        }
        set_env_u32(
            &mut lookup,
            "ARIG_SERIAL_BAUD_RATE",
            &mut self.serial.baud_rate,
        )?;
        set_env_u64(
            &mut lookup,
            "ARIG_SERIAL_READ_TIMEOUT_MS",
            &mut self.serial.read_timeout_ms,
        )?;
        set_env_u32(
            &mut lookup,
            "ARIG_SERIAL_RECONNECT_ATTEMPTS",
            &mut self.serial.reconnect_attempts,
        )?;

        // engine
        set_env_u64(
            &mut lookup,
            "ARIG_ENGINE_TICK_INTERVAL_MS",
            &mut self.engine.tick_interval_ms,
        )?;
        set_env_usize(
            &mut lookup,
            "ARIG_ENGINE_BUFFER_CAPACITY",
            &mut self.engine.buffer_capacity,
        )?;
        set_env_u32(
            &mut lookup,
            "ARIG_ENGINE_MAX_ATTEMPTS",
            &mut self.engine.max_attempts,
        )?;
        set_env_usize(
            &mut lookup,
            "ARIG_ENGINE_MISMATCH_THRESHOLD",
            &mut self.engine.mismatch_threshold,
        )?;
        set_env_u64(
            &mut lookup,
            "ARIG_ENGINE_POWER_ON_TIMEOUT_MS",
            &mut self.engine.power_on_timeout_ms,
        )?;
        if let Some(raw) = lookup("ARIG_ENGINE_ERROR_MARKERS") {
            self.engine.error_markers = raw
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
        }

        // paths
        if let Some(raw) = lookup("ARIG_PATHS_LOG_DIR") {
            self.paths.log_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("ARIG_PATHS_RESULTS_JSONL") {
            self.paths.results_jsonl = PathBuf::from(raw);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.buffer_capacity == 0 {
            return Err(RigError::InvalidConfig {
                details: "engine.buffer_capacity must be >= 1".to_string(),
            });
        }
        if self.engine.tick_interval_ms < 10 {
            return Err(RigError::InvalidConfig {
                details: format!(
                    "engine.tick_interval_ms must be >= 10, got {}",
                    self.engine.tick_interval_ms
                ),
            });
        }
        if self.engine.max_attempts == 0 {
            return Err(RigError::InvalidConfig {
                details: "engine.max_attempts must be >= 1".to_string(),
            });
        }
        if self.engine.mismatch_marker.is_empty() {
            return Err(RigError::InvalidConfig {
                details: "engine.mismatch_marker must not be empty".to_string(),
            });
        }
        if self.engine.error_markers.iter().any(String::is_empty) {
            return Err(RigError::InvalidConfig {
                details: "engine.error_markers must not contain empty strings".to_string(),
            });
        }
        if self.serial.baud_rate == 0 {
            return Err(RigError::InvalidConfig {
                details: "serial.baud_rate must be > 0".to_string(),
            });
        }
        if let (Some(main), Some(boot)) = (&self.serial.main_port, &self.serial.boot_port) {
            if main == boot {
                return Err(RigError::InvalidConfig {
                    details: format!("serial.main_port and serial.boot_port are both {main}"),
                });
            }
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| RigError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

fn set_env_u64<F>(lookup: &mut F, name: &str, slot: &mut u64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env(name, &raw)?;
    }
    Ok(())
}

fn set_env_u32<F>(lookup: &mut F, name: &str, slot: &mut u32) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env(name, &raw)?;
    }
    Ok(())
}

fn set_env_usize<F>(lookup: &mut F, name: &str, slot: &mut usize) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env(name, &raw)?;
    }
    Ok(())
}
