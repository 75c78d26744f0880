//! Client configuration defaults.
//!
//! Centralizes hardcoded values; [`SyncConfig`](crate::SyncConfig) starts from
//! these and a RON file can override any of them.

use std::time::Duration;

/// Default row-store base URL for local development.
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Path prefix every row-store route lives under.
pub const API_PREFIX: &str = "/api/v1";

/// Default push-channel base URL for local development.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000";

/// First reconnect delay. Doubles per failed attempt.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Reconnect delay never exceeds this.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Extra attempts for a failed write before the failure is surfaced.
pub const WRITE_RETRIES: u32 = 1;

/// Extra attempts for a failed refetch before the failure is surfaced.
pub const REFETCH_RETRIES: u32 = 1;

/// Pause before the first retry of a transient failure. Doubles per retry.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Retry pause never exceeds this.
pub const RETRY_DELAY_CAP: Duration = Duration::from_secs(30);

/// Cached collections older than this are refetched on next read.
pub const STALE_AFTER: Duration = Duration::from_secs(30);

/// Agent log entries kept per sheet channel (oldest dropped first).
pub const LOG_CAPACITY: usize = 50;

/// Row-store HTTP request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the cache change broadcast. Slow subscribers see `Lagged`.
pub const CHANGE_BUFFER: usize = 256;
