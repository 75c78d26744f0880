//! Notification types the sync core publishes to the rendering layer.
//!
//! - [`CacheChange`]: broadcast after every effective cache mutation.
//! - [`ConnectionStatus`]: `watch` value per sheet channel; the only way a
//!   dropped push channel is ever visible.

use std::fmt;
use std::time::Duration;

use sheetsync_types::{EntityId, QueryKey};

/// What happened to a cached collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Whole collection replaced (fetch, refetch, rollback).
    Replaced,
    /// One record patched in place (optimistic write).
    Patched(EntityId),
    /// One record inserted or replaced by id.
    Upserted(EntityId),
    /// One record removed.
    Removed(EntityId),
    /// Marked stale; data unchanged.
    Invalidated,
}

/// Emitted by the cache after every effective change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheChange {
    pub key: QueryKey,
    /// Entry version after the change.
    pub version: u64,
    pub kind: ChangeKind,
}

/// Push channel lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        })
    }
}

/// Connectivity indicator for one sheet channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Failed attempts since the last successful connect.
    pub retry_count: u32,
    /// Delay before the next attempt, while waiting out a backoff.
    pub retry_in: Option<Duration>,
    /// Bumped on every successful connect.
    pub generation: SyncGeneration,
    /// Set once teardown has run; no further attempts will be made.
    pub closed: bool,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Monotonic generation counter, bumped on reconnect.
///
/// Consumers can compare generations to detect that a resync happened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SyncGeneration(pub u64);
