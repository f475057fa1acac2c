//! Configuration file support.
//!
//! A config file is a JSON document whose fields all have defaults, e.g.
//!
//! ```json
//! {
//!   "parallelism": 8,
//!   "retry": { "policy": "fixed", "try_timeout": "2m", "retry_delay": "10s", "max_retry_delay": "1m" }
//! }
//! ```
//!
//! Durations are written in humantime notation (`"500ms"`, `"4s"`, `"2m"`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::TransferError;
use crate::retry::{RetryOptions, RetryPolicyKind};
use crate::types::TransferOptions;

/// Serde adapter for humantime duration strings.
mod humantime_duration {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(de::Error::custom)
    }
}

/// Retry settings as written in a config file. Zero values select the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub policy: RetryPolicyKind,
    pub max_tries: u32,
    #[serde(with = "humantime_duration")]
    pub try_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub retry_delay: Duration,
    #[serde(with = "humantime_duration")]
    pub max_retry_delay: Duration,
}

/// Transfer settings loaded from `--config` and overridden by CLI flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Bytes per ranged request (0 = 4 MiB).
    pub range_size: u64,
    /// Concurrent ranges (0 = 5).
    pub parallelism: usize,
    /// Extra GETs each download range may issue after a broken body.
    pub max_retry_requests_per_range: u32,
    /// Paging window for file uploads (0 = 256 MiB).
    pub segment_size: u64,
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            range_size: 0,
            parallelism: 0,
            max_retry_requests_per_range: 3,
            segment_size: 0,
            retry: RetryConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Reads a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, TransferError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Validated retry options with defaults applied.
    pub fn retry_options(&self) -> Result<RetryOptions, TransferError> {
        RetryOptions {
            policy: self.retry.policy,
            max_tries: self.retry.max_tries,
            try_timeout: self.retry.try_timeout,
            retry_delay: self.retry.retry_delay,
            max_retry_delay: self.retry.max_retry_delay,
        }
        .with_defaults()
    }

    /// Transfer options without a progress sink.
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            range_size: self.range_size,
            parallelism: self.parallelism,
            max_retry_requests_per_range: self.max_retry_requests_per_range,
            segment_size: self.segment_size,
            progress: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = TransferConfig::from_json("{}").unwrap();
        assert_eq!(config, TransferConfig::default());

        let retry = config.retry_options().unwrap();
        assert_eq!(retry.max_tries, 4);
        assert_eq!(retry.try_timeout, Duration::from_secs(60));
        assert_eq!(retry.retry_delay, Duration::from_secs(4));
        assert_eq!(retry.max_retry_delay, Duration::from_secs(120));
        assert_eq!(config.transfer_options().max_retry_requests_per_range, 3);
    }

    #[test]
    fn durations_parse_as_humantime() {
        let config = TransferConfig::from_json(
            r#"{
                "parallelism": 8,
                "retry": { "policy": "fixed", "max_tries": 2, "try_timeout": "2m",
                           "retry_delay": "500ms", "max_retry_delay": "10s" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.parallelism, 8);
        let retry = config.retry_options().unwrap();
        assert_eq!(retry.policy, RetryPolicyKind::Fixed);
        assert_eq!(retry.max_tries, 2);
        assert_eq!(retry.try_timeout, Duration::from_secs(120));
        assert_eq!(retry.retry_delay, Duration::from_millis(500));
        assert_eq!(retry.max_retry_delay, Duration::from_secs(10));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            TransferConfig::from_json(r#"{ "paralelism": 3 }"#),
            Err(TransferError::SerdeJsonError(_))
        ));
    }

    #[test]
    fn inconsistent_delays_are_rejected() {
        let config =
            TransferConfig::from_json(r#"{ "retry": { "retry_delay": "1s" } }"#).unwrap();
        assert!(matches!(
            config.retry_options(),
            Err(TransferError::InvalidConfig(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rangesync.json");
        std::fs::write(&path, r#"{ "range_size": 1048576 }"#).unwrap();

        let config = TransferConfig::load(&path).unwrap();
        assert_eq!(config.transfer_options().range_size, 1_048_576);
    }
}
