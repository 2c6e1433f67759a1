//! Configuration for the pad bridge
//!
//! Loaded from a YAML file; every field has a default so an empty file (or
//! no file at all) yields the reference device setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub leds: LedConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Device matching and grid dimensions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Port name patterns, matched case-insensitively as substrings
    #[serde(default = "default_name_patterns")]
    pub name_patterns: Vec<String>,
    #[serde(default = "default_step_count")]
    pub step_count: usize,
    #[serde(default = "default_track_count")]
    pub track_count: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name_patterns: default_name_patterns(),
            step_count: default_step_count(),
            track_count: default_track_count(),
        }
    }
}

/// LED write coalescing
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_ms: default_batch_window_ms(),
            max_batch: default_max_batch(),
        }
    }
}

/// Heartbeat monitoring thresholds (milliseconds)
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Elapsed time past which staleness deductions begin
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// Elapsed time treated as a heartbeat-timeout failure
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Clock synchronization
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TimingConfig {
    /// How far ahead of the playhead to pre-illuminate, in milliseconds
    #[serde(default = "default_lookahead_ms")]
    pub lookahead_ms: u64,
    /// Tick latency above which a warning is logged, in milliseconds
    #[serde(default = "default_latency_warn_ms")]
    pub latency_warn_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: default_lookahead_ms(),
            latency_warn_ms: default_latency_warn_ms(),
        }
    }
}

/// LED output behavior
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct LedConfig {
    /// Emit batched writes in descending address order. Matches the
    /// reference wiring; flip if your device scans the other way.
    #[serde(default = "default_reverse_output_order")]
    pub reverse_output_order: bool,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            reverse_output_order: default_reverse_output_order(),
        }
    }
}

/// Error recovery tuning
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RecoveryConfig {
    /// Attempts per error key before the fallback phase runs
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for the delayed phase; grows linearly per attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_name_patterns() -> Vec<String> {
    crate::protocol::DeviceDescriptor::pad_controller().name_patterns
}
fn default_step_count() -> usize {
    16
}
fn default_track_count() -> usize {
    4
}
fn default_batch_window_ms() -> u64 {
    10
}
fn default_max_batch() -> usize {
    32
}
fn default_check_interval_ms() -> u64 {
    1000
}
fn default_stale_after_ms() -> u64 {
    2000
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_lookahead_ms() -> u64 {
    120
}
fn default_latency_warn_ms() -> u64 {
    15
}
fn default_reverse_output_order() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}

impl BridgeConfig {
    /// Load configuration from a YAML file; a missing file yields defaults.
    pub async fn load(path: &str) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(content) => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Config file {} not found, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read config file: {}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.batch.window_ms, 10);
        assert_eq!(config.device.step_count, 16);
        assert_eq!(config.recovery.max_attempts, 3);
        assert!(config.leds.reverse_output_order);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "batch:\n  window_ms: 25\n";
        let config: BridgeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.batch.window_ms, 25);
        assert_eq!(config.batch.max_batch, 32);
        assert_eq!(config.health.timeout_ms, 10_000);
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let config = BridgeConfig::load("/nonexistent/padbridge.yaml")
            .await
            .unwrap();
        assert_eq!(config.device.track_count, 4);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timing:\n  lookahead_ms: 200").unwrap();
        let config = BridgeConfig::load(file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.timing.lookahead_ms, 200);
    }
}
