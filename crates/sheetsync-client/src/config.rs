//! Client configuration.
//!
//! Every field has a default (see [`constants`](crate::constants)), so a RON
//! file only names what it overrides:
//!
//! ```ron
//! (
//!     api_url: "https://sheets.example.com",
//!     ws_url: "wss://sheets.example.com",
//!     write_retries: 2,
//! )
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants;
use crate::retry::RetryPolicy;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

/// Tunables for the sync core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Row-store base URL (without the `/api/v1` prefix).
    pub api_url: String,
    /// Push-channel base URL; sheet channels live at `<ws_url>/ws/sheet/<id>`.
    pub ws_url: String,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub write_retries: u32,
    pub refetch_retries: u32,
    pub retry_delay_ms: u64,
    pub stale_after_ms: u64,
    pub log_capacity: usize,
    pub request_timeout_ms: u64,
    pub change_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: constants::DEFAULT_API_URL.to_string(),
            ws_url: constants::DEFAULT_WS_URL.to_string(),
            backoff_base_ms: constants::BACKOFF_BASE.as_millis() as u64,
            backoff_cap_ms: constants::BACKOFF_CAP.as_millis() as u64,
            write_retries: constants::WRITE_RETRIES,
            refetch_retries: constants::REFETCH_RETRIES,
            retry_delay_ms: constants::RETRY_DELAY.as_millis() as u64,
            stale_after_ms: constants::STALE_AFTER.as_millis() as u64,
            log_capacity: constants::LOG_CAPACITY,
            request_timeout_ms: constants::REQUEST_TIMEOUT.as_millis() as u64,
            change_buffer: constants::CHANGE_BUFFER,
        }
    }
}

impl SyncConfig {
    /// Parse from RON text.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    /// Load from a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn write_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.write_retries, Duration::from_millis(self.retry_delay_ms))
    }

    pub fn refetch_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.refetch_retries, Duration::from_millis(self.retry_delay_ms))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Push-channel address for one sheet.
    pub fn sheet_channel_url(&self, sheet_id: &str) -> String {
        format!("{}/ws/sheet/{}", self.ws_url.trim_end_matches('/'), sheet_id)
    }
}
