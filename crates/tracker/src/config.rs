//! Configuration of the slashers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    constants::{
        DEFAULT_CHECK_DELEGATIONS_INTERVAL, DEFAULT_MAX_RETRY_TIMES,
        DEFAULT_MAX_SLASHING_CONCURRENCY, DEFAULT_NEW_DELEGATIONS_BUFFER, DEFAULT_RETRY_SLEEP,
        DEFAULT_SLASHING_KEY_BUFFER,
    },
    errors::TrackerError,
};

/// The configuration values that dictate the behavior of the slashers.
///
/// You should construct a [`TrackerConfig`] with [`Default::default`] and adjust it with the
/// `with_*` methods, or deserialize it from the operator's config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// How often the atomic slasher re-syncs its delegation index with the staking chain.
    pub check_delegations_interval: Duration,

    /// Maximum number of delegations slashed concurrently by one slasher.
    ///
    /// Each slashing task performs several Bitcoin RPCs, so this bounds the load put on the
    /// Bitcoin node.
    pub max_slashing_concurrency: usize,

    /// Delay between retries of a failed chain query.
    pub retry_sleep: Duration,

    /// Number of times a failed chain query is retried before giving up.
    pub max_retry_times: usize,

    /// Capacity of the queue of selective slashing incidents awaiting a report.
    pub new_delegations_buffer: usize,

    /// Capacity of the queue of extracted finality provider keys awaiting enforcement.
    pub slashing_key_buffer: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            check_delegations_interval: DEFAULT_CHECK_DELEGATIONS_INTERVAL,
            max_slashing_concurrency: DEFAULT_MAX_SLASHING_CONCURRENCY,
            retry_sleep: DEFAULT_RETRY_SLEEP,
            max_retry_times: DEFAULT_MAX_RETRY_TIMES,
            new_delegations_buffer: DEFAULT_NEW_DELEGATIONS_BUFFER,
            slashing_key_buffer: DEFAULT_SLASHING_KEY_BUFFER,
        }
    }
}

impl TrackerConfig {
    /// Updates the delegation sync interval and returns the updated config.
    pub fn with_check_delegations_interval(mut self, interval: Duration) -> Self {
        self.check_delegations_interval = interval;
        self
    }

    /// Updates the slashing concurrency bound and returns the updated config.
    pub fn with_max_slashing_concurrency(mut self, n: usize) -> Self {
        self.max_slashing_concurrency = n;
        self
    }

    /// Updates the retry policy for chain queries and returns the updated config.
    pub fn with_retries(mut self, max_retry_times: usize, retry_sleep: Duration) -> Self {
        self.max_retry_times = max_retry_times;
        self.retry_sleep = retry_sleep;
        self
    }

    /// Updates the queue capacities and returns the updated config.
    pub fn with_buffers(mut self, new_delegations: usize, slashing_keys: usize) -> Self {
        self.new_delegations_buffer = new_delegations;
        self.slashing_key_buffer = slashing_keys;
        self
    }

    /// Checks that the config can drive the slashers.
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.check_delegations_interval.is_zero() {
            return Err(TrackerError::Config(
                "check_delegations_interval must be positive".to_string(),
            ));
        }

        if self.max_slashing_concurrency == 0 {
            return Err(TrackerError::Config(
                "max_slashing_concurrency must be positive".to_string(),
            ));
        }

        if self.new_delegations_buffer == 0 || self.slashing_key_buffer == 0 {
            return Err(TrackerError::Config(
                "queue capacities must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serde_toml() {
        let config = r#"
            check_delegations_interval = { secs = 60, nanos = 0 }
            max_slashing_concurrency = 20
            retry_sleep = { secs = 5, nanos = 0 }
            max_retry_times = 5
            new_delegations_buffer = 100
            slashing_key_buffer = 10
        "#;

        let config = toml::from_str::<TrackerConfig>(config);
        assert!(
            config.is_ok(),
            "must be able to deserialize config from toml but got: {}",
            config.unwrap_err()
        );

        let config = config.unwrap();
        assert_eq!(config, TrackerConfig::default());

        let serialized = toml::to_string(&config).unwrap();
        let deserialized = toml::from_str::<TrackerConfig>(&serialized).unwrap();
        assert_eq!(
            deserialized, config,
            "must be able to serialize and deserialize config to toml"
        );
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        assert!(TrackerConfig::default().validate().is_ok());
        assert!(matches!(
            TrackerConfig::default()
                .with_max_slashing_concurrency(0)
                .validate(),
            Err(TrackerError::Config(_))
        ));
        assert!(TrackerConfig::default()
            .with_check_delegations_interval(Duration::ZERO)
            .validate()
            .is_err());
    }
}
