//! Flow-control configuration.
//!
//! # Example
//! ```rust,ignore
//! use docflow_stream::FlowConfig;
//!
//! // From environment, falling back to defaults
//! let config = FlowConfig::from_env()?;
//!
//! // Or explicit configuration
//! let config = FlowConfig {
//!     batch_size: 100,
//!     ..Default::default()
//! };
//! ```

use std::str::FromStr;

use docflow_common::{DocFlowError, Result};
use serde::{Deserialize, Serialize};

/// Window and buffer sizes used by the adapters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Items requested per credit window, and cursor page size
    pub batch_size: u32,
    /// Chunks requested per window by the download bridge
    pub download_window: u64,
    /// Upload bridge occupancy (bytes) at which writers are told to pause
    pub upload_queue_size: usize,
    /// Buffered items before the delivery queue reports pressure
    pub queue_high_water_mark: usize,
    /// Bytes per chunk read from files and driver download streams
    pub file_chunk_size: usize,
    /// Pending bytes before a file write stream reports a full queue
    pub file_write_queue_size: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            download_window: 16,
            upload_queue_size: 8192,
            queue_high_water_mark: 16,
            file_chunk_size: 8192,
            file_write_queue_size: 64 * 1024,
        }
    }
}

impl FlowConfig {
    /// Create configuration from environment variables.
    ///
    /// Reads `DOCFLOW_BATCH_SIZE`, `DOCFLOW_DOWNLOAD_WINDOW`,
    /// `DOCFLOW_UPLOAD_QUEUE_SIZE`, `DOCFLOW_QUEUE_HIGH_WATER_MARK`,
    /// `DOCFLOW_FILE_CHUNK_SIZE` and `DOCFLOW_FILE_WRITE_QUEUE_SIZE`.
    /// Unset variables keep their default.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            batch_size: parse_var(&lookup, "DOCFLOW_BATCH_SIZE", defaults.batch_size)?,
            download_window: parse_var(&lookup, "DOCFLOW_DOWNLOAD_WINDOW", defaults.download_window)?,
            upload_queue_size: parse_var(
                &lookup,
                "DOCFLOW_UPLOAD_QUEUE_SIZE",
                defaults.upload_queue_size,
            )?,
            queue_high_water_mark: parse_var(
                &lookup,
                "DOCFLOW_QUEUE_HIGH_WATER_MARK",
                defaults.queue_high_water_mark,
            )?,
            file_chunk_size: parse_var(&lookup, "DOCFLOW_FILE_CHUNK_SIZE", defaults.file_chunk_size)?,
            file_write_queue_size: parse_var(
                &lookup,
                "DOCFLOW_FILE_WRITE_QUEUE_SIZE",
                defaults.file_write_queue_size,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject zero-sized windows and buffers
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("batch_size", self.batch_size == 0),
            ("download_window", self.download_window == 0),
            ("upload_queue_size", self.upload_queue_size == 0),
            ("queue_high_water_mark", self.queue_high_water_mark == 0),
            ("file_chunk_size", self.file_chunk_size == 0),
            ("file_write_queue_size", self.file_write_queue_size == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((name, _)) => Err(DocFlowError::Configuration(format!(
                "{} must be greater than zero",
                name
            ))),
            None => Ok(()),
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            DocFlowError::Configuration(format!("Invalid value for {}: '{}'", key, raw))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = FlowConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, FlowConfig::default());
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.download_window, 16);
    }

    #[test]
    fn test_overrides() {
        let config = FlowConfig::from_lookup(lookup(&[
            ("DOCFLOW_BATCH_SIZE", "100"),
            ("DOCFLOW_UPLOAD_QUEUE_SIZE", " 4096 "),
        ]))
        .unwrap();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.upload_queue_size, 4096);
        assert_eq!(config.file_chunk_size, 8192);
    }

    #[test]
    fn test_invalid_value_is_configuration_error() {
        let err = FlowConfig::from_lookup(lookup(&[("DOCFLOW_DOWNLOAD_WINDOW", "lots")]))
            .unwrap_err();
        assert!(matches!(err, DocFlowError::Configuration(_)));
        assert!(err.to_string().contains("DOCFLOW_DOWNLOAD_WINDOW"));
    }

    #[test]
    fn test_zero_is_rejected() {
        let err = FlowConfig::from_lookup(lookup(&[("DOCFLOW_BATCH_SIZE", "0")])).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: FlowConfig = serde_json::from_str(r#"{"batch_size": 5}"#).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.queue_high_water_mark, 16);
    }
}
