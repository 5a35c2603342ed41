//! Central manager configuration
//!
//! Serialized to/from JSON. Every duration is in milliseconds so the file
//! stays readable by hand.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// Deadline for discover, read, write, subscribe, unsubscribe and RSSI reads
    pub operation_timeout_ms: u64,

    /// Connect deadline for callers that do not pass their own
    pub connect_timeout_ms: u64,

    /// Per-peripheral bound on queued acknowledged writes
    pub max_queued_writes: usize,

    /// Split write payloads longer than this into sequential chunks
    pub write_chunk_size: Option<usize>,

    /// Gap between chunks of an unacknowledged write; unset sends them back
    /// to back
    pub write_without_response_interval_ms: Option<u64>,

    /// Capacity of the caller command channel
    pub command_buffer: usize,

    /// Capacity of the application event broadcast
    pub event_buffer: usize,

    /// Forget peripherals that are not linked whenever a scan starts
    pub clear_stale_on_scan: bool,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
            max_queued_writes: 64,
            write_chunk_size: None,
            write_without_response_interval_ms: None,
            command_buffer: 256,
            event_buffer: 256,
            clear_stale_on_scan: true,
        }
    }
}

impl CentralConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_without_response_interval(&self) -> Option<Duration> {
        self.write_without_response_interval_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operation_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".to_string()));
        }

        if self.max_queued_writes == 0 {
            return Err(ConfigError::Invalid(
                "max_queued_writes must be >= 1".to_string(),
            ));
        }

        if self.write_chunk_size == Some(0) {
            return Err(ConfigError::Invalid(
                "write_chunk_size cannot be 0".to_string(),
            ));
        }

        if self.write_without_response_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "write_without_response_interval_ms cannot be 0".to_string(),
            ));
        }

        if self.command_buffer == 0 || self.event_buffer == 0 {
            return Err(ConfigError::Invalid("channel buffers must be > 0".to_string()));
        }

        Ok(())
    }

    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: CentralConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        self.validate()?;
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
