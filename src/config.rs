//! Protocol tunables.
//!
//! The defaults are the timings the card firmware is built around; override
//! them only for unusual hosts or bridges. A TOML file may set any subset of
//! fields, durations are given in milliseconds:
//!
//! ```toml
//! segment_delay_ms = 250
//! transaction_retries = 5
//! debug = true
//! ```

use std::{path::Path, time::Duration};

use serde::Deserialize;

/// Largest slice of a request written before pausing for the card to drain
/// its receive interrupt buffer.
pub const SEGMENT_MAX_LEN: usize = 250;
pub const SEGMENT_DELAY_MS: u64 = 250;
pub const I2C_CHUNK_DELAY_MS: u64 = 20;
pub const I2C_MAX_TRANSFER: u8 = 255;
pub const RESET_DRAIN_MS: u64 = 500;
pub const RESET_RETRIES: u32 = 10;
pub const TRANSACTION_RETRIES: u32 = 5;
pub const INTER_TRANSACTION_TIMEOUT_MS: u64 = 30_000;
pub const WEB_TRANSACTION_TIMEOUT_MS: u64 = 90_000;
pub const BINARY_RETRIES: u32 = 2;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub segment_max_len: usize,
    pub segment_delay_ms: u64,
    pub i2c_chunk_delay_ms: u64,
    pub i2c_max_transfer: u8,
    pub i2c_lock_attempts: u32,
    pub i2c_lock_retry_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub reset_drain_ms: u64,
    pub reset_retries: u32,
    pub transaction_retries: u32,
    pub retry_delay_ms: u64,
    pub inter_transaction_timeout_ms: u64,
    pub web_transaction_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub binary_retries: u32,
    pub stage_retries: u32,
    pub post_retries: u32,
    pub post_retry_delay_ms: u64,
    /// Log every request and response line at `debug` instead of `trace`.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_max_len: SEGMENT_MAX_LEN,
            segment_delay_ms: SEGMENT_DELAY_MS,
            i2c_chunk_delay_ms: I2C_CHUNK_DELAY_MS,
            i2c_max_transfer: I2C_MAX_TRANSFER,
            i2c_lock_attempts: 5,
            i2c_lock_retry_delay_ms: 100,
            poll_interval_ms: 1,
            reset_drain_ms: RESET_DRAIN_MS,
            reset_retries: RESET_RETRIES,
            transaction_retries: TRANSACTION_RETRIES,
            retry_delay_ms: 500,
            inter_transaction_timeout_ms: INTER_TRANSACTION_TIMEOUT_MS,
            web_transaction_timeout_ms: WEB_TRANSACTION_TIMEOUT_MS,
            lock_timeout_ms: INTER_TRANSACTION_TIMEOUT_MS,
            binary_retries: BINARY_RETRIES,
            stage_retries: 3,
            post_retries: 3,
            post_retry_delay_ms: 1_000,
            debug: false,
        }
    }
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self, crate::Error> {
        let config: Self =
            toml::from_str(contents).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, crate::Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        log::debug!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&contents)
    }

    /// Reject settings that would make a transport loop forever or never try.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.segment_max_len == 0 {
            return Err(crate::Error::Config("segment_max_len must be nonzero".into()));
        }
        if self.i2c_max_transfer == 0 {
            return Err(crate::Error::Config("i2c_max_transfer must be nonzero".into()));
        }
        let budgets = [
            ("reset_retries", self.reset_retries),
            ("transaction_retries", self.transaction_retries),
            ("i2c_lock_attempts", self.i2c_lock_attempts),
            ("stage_retries", self.stage_retries),
            ("post_retries", self.post_retries),
        ];
        if let Some((name, _)) = budgets.iter().find(|(_, value)| *value == 0) {
            return Err(crate::Error::Config(format!("{} must be at least 1", name)));
        }
        Ok(())
    }

    pub fn segment_delay(&self) -> Duration {
        Duration::from_millis(self.segment_delay_ms)
    }

    pub fn i2c_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.i2c_chunk_delay_ms)
    }

    pub fn i2c_lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.i2c_lock_retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reset_drain(&self) -> Duration {
        Duration::from_millis(self.reset_drain_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn inter_transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.inter_transaction_timeout_ms)
    }

    pub fn web_transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.web_transaction_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn post_retry_delay(&self) -> Duration {
        Duration::from_millis(self.post_retry_delay_ms)
    }
}
