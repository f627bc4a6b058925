//! Configuration loading for dispersy-engine.
//!
//! Configuration is loaded from a TOML file (default: `dispersy.toml`).
//! Every field has a default, so an empty file is a valid configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the engine.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    /// Scheduler thread configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Bloom-filter sync configuration.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Delay queue configuration.
    #[serde(default)]
    pub delay: DelayConfig,
    /// Multi-member signature configuration.
    #[serde(default)]
    pub signature: SignatureConfig,
}

/// Scheduler thread configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Name of the worker thread (default: "Dispersy").
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    /// How long `stop` waits for the worker in milliseconds (default: 10 000).
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Longest idle sleep when nothing is scheduled, in milliseconds (default: 300 000).
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
}

/// Bloom-filter sync configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Interval between sync rounds in milliseconds (default: 20 000).
    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,
    /// Global-time range covered by one bloom bucket (default: 1000).
    #[serde(default = "default_bloom_step")]
    pub bloom_step: u64,
    /// Hash slices per bloom filter (default: 10).
    #[serde(default = "default_bloom_slices")]
    pub bloom_slices: u8,
    /// Bits per slice (default: 512).
    #[serde(default = "default_bloom_bits_per_slice")]
    pub bloom_bits_per_slice: u32,
    /// Candidates a sync round is sent to (default: 10).
    #[serde(default = "default_member_count")]
    pub member_count: usize,
    /// Bytes returned in reply to one sync (default: 5 * 1025).
    #[serde(default = "default_response_limit")]
    pub response_limit: usize,
    /// Bytes returned in reply to one missing-sequence request (default: 10 * 1025).
    #[serde(default = "default_missing_sequence_response_limit")]
    pub missing_sequence_response_limit: usize,
    /// How far ahead of our clock a received global time may be (default: 10 000).
    #[serde(default = "default_acceptable_global_time_range")]
    pub acceptable_global_time_range: u64,
}

/// Delay queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DelayConfig {
    /// Parked packets per community (default: 1024).
    #[serde(default = "default_max_delayed")]
    pub max_delayed: usize,
}

/// Multi-member signature configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SignatureConfig {
    /// Default signature request timeout in milliseconds (default: 10 000).
    #[serde(default = "default_signature_timeout_ms")]
    pub timeout_ms: u64,
}

// Default value functions
fn default_thread_name() -> String {
    "Dispersy".to_string()
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

fn default_idle_wait_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_sync_interval_ms() -> u64 {
    20_000
}

fn default_bloom_step() -> u64 {
    1000
}

fn default_bloom_slices() -> u8 {
    10
}

fn default_bloom_bits_per_slice() -> u32 {
    512 // 10 * 512 bits = 640 bytes
}

fn default_member_count() -> usize {
    10
}

fn default_response_limit() -> usize {
    5 * 1025
}

fn default_missing_sequence_response_limit() -> usize {
    10 * 1025
}

fn default_acceptable_global_time_range() -> u64 {
    10_000
}

fn default_max_delayed() -> usize {
    1024
}

fn default_signature_timeout_ms() -> u64 {
    10_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
            stop_timeout_ms: default_stop_timeout_ms(),
            idle_wait_ms: default_idle_wait_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sync_interval_ms(),
            bloom_step: default_bloom_step(),
            bloom_slices: default_bloom_slices(),
            bloom_bits_per_slice: default_bloom_bits_per_slice(),
            member_count: default_member_count(),
            response_limit: default_response_limit(),
            missing_sequence_response_limit: default_missing_sequence_response_limit(),
            acceptable_global_time_range: default_acceptable_global_time_range(),
        }
    }
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            max_delayed: default_max_delayed(),
        }
    }
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_signature_timeout_ms(),
        }
    }
}

impl SchedulerConfig {
    /// `stop_timeout_ms` as a duration.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// `idle_wait_ms` as a duration.
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

impl SyncConfig {
    /// `interval_ms` as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl SignatureConfig {
    /// `timeout_ms` as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Largest bloom filter we build or accept, in bytes.
pub const MAX_BLOOM_BYTES: usize = dispersy_core::BloomFilter::MAX_BYTES;

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a value
    /// is out of range.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - the bloom filter has no slices or no bits per slice
    /// - the bloom filter is larger than [`MAX_BLOOM_BYTES`]
    /// - `bloom_step` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sync = &self.sync;
        if sync.bloom_slices == 0 {
            return Err(ConfigError::Invalid("sync.bloom_slices must be at least 1".to_string()));
        }
        if sync.bloom_bits_per_slice == 0 {
            return Err(ConfigError::Invalid(
                "sync.bloom_bits_per_slice must be at least 1".to_string(),
            ));
        }
        if dispersy_core::BloomFilter::byte_len(sync.bloom_slices, sync.bloom_bits_per_slice)
            .is_none()
        {
            return Err(ConfigError::Invalid(format!(
                "bloom filter of {} x {} bits exceeds {} bytes",
                sync.bloom_slices, sync.bloom_bits_per_slice, MAX_BLOOM_BYTES
            )));
        }
        if sync.bloom_step == 0 {
            return Err(ConfigError::Invalid("sync.bloom_step must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.scheduler.thread_name, "Dispersy");
        assert_eq!(config.sync.bloom_step, 1000);
        assert_eq!(config.sync.response_limit, 5 * 1025);
        assert_eq!(config.delay.max_delayed, 1024);
        assert_eq!(config.signature.timeout(), Duration::from_secs(10));
        assert_eq!(config.sync.acceptable_global_time_range, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[scheduler]
thread_name = "worker"

[sync]
interval_ms = 500
member_count = 3

[signature]
timeout_ms = 1000
"#;

        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.scheduler.thread_name, "worker");
        assert_eq!(config.sync.interval(), Duration::from_millis(500));
        assert_eq!(config.sync.member_count, 3);
        assert_eq!(config.sync.bloom_slices, 10);
        assert_eq!(config.signature.timeout_ms, 1000);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.stop_timeout_ms, 10_000);
        assert_eq!(config.sync.missing_sequence_response_limit, 10 * 1025);
    }

    #[test]
    fn config_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[delay]\nmax_delayed = 8").unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.delay.max_delayed, 8);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = EngineConfig::from_file(std::path::Path::new("/nonexistent/dispersy.toml"))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/dispersy.toml"));
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\ninterval_ms = \"soon\"").unwrap();
        assert!(matches!(
            EngineConfig::from_file(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn zero_bloom_shape_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\nbloom_bits_per_slice = 0").unwrap();
        assert!(matches!(
            EngineConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = EngineConfig::default();
        config.sync.bloom_slices = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn oversized_bloom_filter_is_rejected() {
        let mut config = EngineConfig::default();
        config.sync.bloom_slices = 255;
        config.sync.bloom_bits_per_slice = u32::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }
}
