//! Client-side synchronization core for sheetsync.
//!
//! Keeps a local cache of server-owned records (workspaces, sheets, rows,
//! automation rules) consistent under optimistic user edits, a server push
//! channel, and network loss.
//!
//! # Architecture
//!
//! ```text
//!   rendering layer
//!        │ read / subscribe / update_row / watch_sheet
//!        ▼
//!   ┌───────────┐   patch/rollback   ┌────────────┐   append/upsert/remove
//!   │ Mutation  │──────────────────▶│ CacheStore │◀──────────────────────┐
//!   │Coordinator│                    └────────────┘                       │
//!   └─────┬─────┘                         ▲ replace                  ┌────┴────────┐
//!         │ update/create/delete          │                          │ EventStream │
//!         ▼                          ┌────┴──────┐  resync on connect│   Client    │
//!   ┌───────────┐      list          │Reconciler │◀──────────────────┤ (backoff)   │
//!   │ RowStore  │◀───────────────────┤           │                   └────┬────────┘
//!   └───────────┘                    └───────────┘                        │ connect
//!                                                                   EventTransport
//! ```
//!
//! Everything runs on one `tokio::task::LocalSet`: shared state is
//! `Rc<RefCell<_>>`, and every cache mutation is a single synchronous call
//! that never spans an `.await`.

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod constants;
pub mod memory;
pub mod mutation;
pub mod reconcile;
pub mod retry;
pub mod stream;
pub mod subscriptions;
pub mod transport;

pub use api::{HttpRowStore, RowStore, StoreError};
pub use cache::{CacheEntry, CacheStore, SharedCache};
pub use client::SheetSync;
pub use config::{ConfigError, SyncConfig};
pub use memory::{MemoryRowStore, MemoryTransport, PushSender, StoreCall};
pub use mutation::{
    MutationCoordinator, MutationError, MutationId, MutationOutcome, MutationRecord, MutationState,
};
pub use reconcile::{ReconcilePolicy, Reconciler, RefetchReason};
pub use retry::RetryPolicy;
pub use stream::{Backoff, EventStreamClient, LogBuffer, SheetWatch, StreamState, apply_event};
pub use subscriptions::{CacheChange, ChangeKind, ConnectionState, ConnectionStatus, SyncGeneration};
pub use transport::{ChannelError, DisabledTransport, EventChannel, EventTransport};

pub use sheetsync_types as types;
