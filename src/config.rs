//! Pipeline configuration
//!
//! All knobs recognized by the pipeline, with the documented defaults. The
//! struct is serde-derived so a host can load it straight from JSON; every
//! field falls back to its default when absent.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logship::LogLevel;

/// Configuration surface of the telemetry pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Base URL of the remote collector (e.g. `https://collector.example.com`)
    pub endpoint: String,
    /// Sample budget for the batch axis
    pub batch_sample_budget: usize,
    /// Sample budget for the epoch axis
    pub epoch_sample_budget: usize,
    /// Age in seconds after which a non-empty command queue is flushed
    pub dispatch_interval_seconds: u64,
    /// Retry attempts per batch before it is dropped
    pub max_retries: u32,
    /// Sleep between retry attempts, in seconds
    pub retry_interval_seconds: u64,
    /// Session keep-alive interval, in seconds
    pub keep_alive_interval_seconds: u64,
    /// Per-logger-name level filter, `name:level;name:level`
    pub log_filters: String,
    /// Capacity of the pre-connect log buffer; oldest records are evicted
    pub log_buffer_capacity: usize,
    /// Queue length that forces a flush regardless of age
    pub max_queue_len: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            batch_sample_budget: 1000,
            epoch_sample_budget: 5000,
            dispatch_interval_seconds: 5,
            max_retries: 3,
            retry_interval_seconds: 1,
            keep_alive_interval_seconds: 3600,
            log_filters: String::new(),
            log_buffer_capacity: 1024,
            max_queue_len: 400,
        }
    }
}

impl TelemetryConfig {
    /// Flush-age trigger as a [`Duration`].
    #[must_use]
    pub const fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_seconds)
    }

    /// Sleep between retry attempts as a [`Duration`].
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds)
    }

    /// Session keep-alive interval as a [`Duration`].
    #[must_use]
    pub const fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_seconds)
    }

    /// Parse the `log_filters` string into `(logger-name, level)` pairs.
    ///
    /// The format is `name:level;name:level`, e.g.
    /// `trainer:warning;trainer.io:debug`. Empty segments are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a segment without a `:` separator or an
    /// unknown level name.
    pub fn parsed_log_filters(&self) -> Result<Vec<(String, LogLevel)>> {
        parse_log_filters(&self.log_filters)
    }

    /// Sanity-check values that would break the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a sample budget or the queue bound is
    /// zero, or when the filter string fails to parse.
    pub fn validate(&self) -> Result<()> {
        if self.batch_sample_budget == 0 {
            return Err(Error::Config("batch_sample_budget must be > 0".into()));
        }
        if self.epoch_sample_budget == 0 {
            return Err(Error::Config("epoch_sample_budget must be > 0".into()));
        }
        if self.max_queue_len == 0 {
            return Err(Error::Config("max_queue_len must be > 0".into()));
        }
        self.parsed_log_filters()?;
        Ok(())
    }
}

/// Parse a `name:level;name:level` filter string.
///
/// # Errors
///
/// Returns [`Error::Config`] on a malformed segment or unknown level.
pub fn parse_log_filters(spec: &str) -> Result<Vec<(String, LogLevel)>> {
    let mut filters = Vec::new();
    for segment in spec.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (name, level) = segment
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("filter segment missing ':': {segment}")))?;
        let level: LogLevel = level
            .trim()
            .parse()
            .map_err(|()| Error::Config(format!("unknown log level: {level}")))?;
        filters.push((name.trim().to_string(), level));
    }
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.batch_sample_budget, 1000);
        assert_eq!(config.epoch_sample_budget, 5000);
        assert_eq!(config.dispatch_interval_seconds, 5);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_interval_seconds, 1);
        assert_eq!(config.keep_alive_interval_seconds, 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_filter_parsing() {
        let filters = parse_log_filters("trainer:warning;trainer.io:debug").unwrap();
        assert_eq!(
            filters,
            vec![
                ("trainer".to_string(), LogLevel::Warning),
                ("trainer.io".to_string(), LogLevel::Debug),
            ]
        );
    }

    #[test]
    fn test_filter_parsing_empty_segments() {
        let filters = parse_log_filters("a:info;;b:error;").unwrap();
        assert_eq!(filters.len(), 2);
    }

    #[test]
    fn test_filter_parsing_rejects_malformed() {
        assert!(parse_log_filters("no-separator").is_err());
        assert!(parse_log_filters("a:not-a-level").is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = TelemetryConfig {
            endpoint: "https://collector.example.com".into(),
            log_filters: "a:info".into(),
            ..TelemetryConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: TelemetryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: TelemetryConfig =
            serde_json::from_str(r#"{"batch_sample_budget": 10}"#).unwrap();
        assert_eq!(config.batch_sample_budget, 10);
        assert_eq!(config.epoch_sample_budget, 5000);
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let config = TelemetryConfig {
            batch_sample_budget: 0,
            ..TelemetryConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
