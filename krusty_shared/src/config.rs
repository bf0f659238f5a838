//! Configuration for the job runtime and the simulated protocol.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::gcode_utils::AxisOffsets;
use crate::print_job::JobVariant;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub offsets: AxisOffsets,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: f64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

impl JobConfig {
    pub fn status_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.status_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_simulator_name")]
    pub name: String,
    #[serde(default = "default_supported_jobs")]
    pub supported_jobs: HashSet<JobVariant>,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default = "default_true")]
    pub file_aware: bool,
    #[serde(default = "default_bytes_per_status")]
    pub bytes_per_status: u64,
    /// Files present on the simulated device, name to size in bytes.
    #[serde(default)]
    pub files: BTreeMap<String, u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            name: default_simulator_name(),
            supported_jobs: default_supported_jobs(),
            streaming: true,
            file_aware: true,
            bytes_per_status: default_bytes_per_status(),
            files: BTreeMap::new(),
        }
    }
}

impl JobsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.job.status_interval_secs > 0.0) || !self.job.status_interval_secs.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "status_interval_secs must be > 0, got {}",
                self.job.status_interval_secs
            )));
        }
        if !is_known_encoding(&self.job.encoding) {
            return Err(ConfigError::Invalid(format!("unknown encoding '{}'", self.job.encoding)));
        }
        if self.simulator.bytes_per_status == 0 {
            return Err(ConfigError::Invalid("simulator.bytes_per_status must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Encoding labels understood by the local file jobs.
pub fn is_known_encoding(label: &str) -> bool {
    matches!(
        label.trim().to_ascii_lowercase().as_str(),
        "utf-8" | "utf8" | "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1"
    )
}

fn default_encoding() -> String { "utf-8".to_string() }
fn default_status_interval_secs() -> f64 { 2.0 }
fn default_simulator_name() -> String { "simulated".to_string() }
fn default_bytes_per_status() -> u64 { 512 }
fn default_true() -> bool { true }
fn default_supported_jobs() -> HashSet<JobVariant> {
    [
        JobVariant::LocalFile,
        JobVariant::LocalGcodeFile,
        JobVariant::LocalGcodeStream,
        JobVariant::DeviceFile,
    ]
    .into_iter()
    .collect()
}

pub fn load_config(path: &str) -> Result<JobsConfig, ConfigError> {
    let config: JobsConfig = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}
