//! YAML Configuration for the Baseband Unit
//!
//! One file configures the whole process: the PHY engine section maps
//! directly onto the engine's own configuration type, the rest controls the
//! synthetic radio driver and logging.

use serde::{Deserialize, Serialize};

use baseband::config::PhyConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BbuConfig {
    /// Baseband engine configuration
    #[serde(default)]
    pub phy: PhyConfig,
    /// Synthetic radio driver configuration
    #[serde(default)]
    pub driver: DriverConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Synthetic radio driver configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverConfig {
    /// Number of frames to push through the pipeline
    #[serde(default = "default_num_frames")]
    pub num_frames: u32,
    /// Per-frame completion deadline in milliseconds; exceeding it means the
    /// pipeline has stalled
    #[serde(default = "default_frame_deadline_ms")]
    pub frame_deadline_ms: u64,
}

fn default_num_frames() -> u32 {
    128
}

fn default_frame_deadline_ms() -> u64 {
    5000
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { num_frames: default_num_frames(), frame_deadline_ms: default_frame_deadline_ms() }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Default log level, overridable through the environment filter
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl BbuConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BbuConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}
