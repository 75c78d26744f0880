//! Optimistic mutation coordinator.
//!
//! Every write follows the same protocol:
//!
//! ```text
//! mutate(key, id, delta, commit)
//!   1. snapshot = cache.read(key)          (before anything changes)
//!   2. cache.patch(key, id, delta)         (user sees the edit now)
//!      cache.begin_write(key)              (in-flight refetches get discarded)
//!   3. commit()  ── transient failure ──▶ retry (bounded)
//!   4. ok  ─▶ cache.invalidate(key)                       → Committed
//!      err ─▶ cache.replace(key, snapshot); invalidate    → RolledBack
//! ```
//!
//! The snapshot belongs to one [`MutationRecord`] and is never shared, so a
//! rollback restores exactly the state immediately before *that* mutation.
//! Two overlapping writes to one row each restore their own snapshot; the
//! invalidation after settle lets the next refetch repair whatever that
//! leaves behind.
//!
//! Once issued, a write is not cancelable. Commit and settle run as a task on
//! the current `LocalSet`; the future returned by `mutate` only waits for
//! it, so a caller that stops waiting (a timeout, a `select!`) leaves the
//! write to settle in the background. Only tearing down the `LocalSet`
//! drops an unsettled write, and that rolls it back like a failed commit.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;

use sheetsync_types::{EntityId, FieldDelta, QueryKey, Record};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::StoreError;
use crate::cache::{SharedCache, SyncMark};
use crate::retry::{RetryPolicy, with_retries};

/// Monotonic per-coordinator mutation id.
pub type MutationId = u64;

/// Lifecycle of a [`MutationRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    Committed,
    RolledBack,
}

/// One optimistic write and the state it would roll back to.
#[derive(Clone, Debug)]
pub struct MutationRecord {
    id: MutationId,
    key: QueryKey,
    entity_id: EntityId,
    delta: FieldDelta,
    /// `None` when the collection was not loaded at mutation time.
    snapshot: Option<Vec<Record>>,
    state: MutationState,
}

impl MutationRecord {
    pub fn id(&self) -> MutationId {
        self.id
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn delta(&self) -> &FieldDelta {
        &self.delta
    }

    /// The collection as it was before this mutation's patch.
    pub fn snapshot(&self) -> Option<&[Record]> {
        self.snapshot.as_deref()
    }

    pub fn state(&self) -> MutationState {
        self.state
    }
}

/// A settled, successful write.
#[derive(Debug)]
pub struct MutationOutcome<T> {
    pub record: MutationRecord,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// What the server returned.
    pub response: T,
}

/// A write that failed and was rolled back.
///
/// In both variants the mutation's own snapshot has already been restored
/// and the key invalidated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("write failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    /// Newer writes to the same entity were still pending when this one
    /// rolled back; their optimistic effect was reverted by the restore and
    /// will only come back from the server.
    #[error("write failed and rolled back over {overlapping} newer pending write(s): {source}")]
    RollbackConflict {
        overlapping: usize,
        #[source]
        source: StoreError,
    },
}

impl MutationError {
    pub fn store_error(&self) -> &StoreError {
        match self {
            MutationError::Failed { source, .. }
            | MutationError::RollbackConflict { source, .. } => source,
        }
    }

    /// Server-provided reason for the failure.
    pub fn reason(&self) -> &str {
        self.store_error().reason()
    }
}

#[derive(Clone, Debug)]
struct PendingWrite {
    id: MutationId,
    key: QueryKey,
    entity_id: EntityId,
}

/// Wraps writes with the optimistic protocol.
///
/// Cheap to clone; clones share the id counter and the pending list.
#[derive(Clone)]
pub struct MutationCoordinator {
    cache: SharedCache,
    retry: RetryPolicy,
    next_id: Rc<Cell<MutationId>>,
    pending: Rc<RefCell<Vec<PendingWrite>>>,
}

impl MutationCoordinator {
    pub fn new(cache: SharedCache, retry: RetryPolicy) -> Self {
        Self {
            cache,
            retry,
            next_id: Rc::new(Cell::new(1)),
            pending: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Writes started but not yet settled.
    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Whether a write to this entity is still in flight.
    pub fn is_pending(&self, key: &QueryKey, entity_id: &EntityId) -> bool {
        self.pending
            .borrow()
            .iter()
            .any(|p| &p.key == key && &p.entity_id == entity_id)
    }

    /// Apply `delta` to the cache now, then run `commit` against the server.
    ///
    /// `commit` may be invoked more than once (transient retry), so it must
    /// build a fresh request each call. The write settles even if the
    /// returned future is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a `LocalSet` (like `tokio::task::spawn_local`).
    pub async fn mutate<T, F, Fut>(
        &self,
        key: &QueryKey,
        entity_id: &EntityId,
        delta: FieldDelta,
        commit: F,
    ) -> Result<MutationOutcome<T>, MutationError>
    where
        T: 'static,
        F: FnMut() -> Fut + 'static,
        Fut: Future<Output = Result<T, StoreError>> + 'static,
    {
        let record = self.begin(key, entity_id, delta);
        let coordinator = self.clone();
        let task = tokio::task::spawn_local(async move {
            let unsettled = Unsettled {
                coordinator: &coordinator,
                record: &record,
                armed: true,
            };
            let (result, attempts) = with_retries(coordinator.retry, "write", commit).await;
            unsettled.disarm();
            coordinator.settle(record, result, attempts)
        });
        join_write(task).await
    }

    /// Run a write with no optimistic patch; invalidate the key on success.
    ///
    /// Used for creates and deletes, where the cache only learns the result
    /// from the server. Like [`mutate`](Self::mutate), the write runs to
    /// completion on the current `LocalSet` whether or not it is awaited.
    pub async fn write_through<T, F, Fut>(
        &self,
        key: &QueryKey,
        commit: F,
    ) -> Result<T, MutationError>
    where
        T: 'static,
        F: FnMut() -> Fut + 'static,
        Fut: Future<Output = Result<T, StoreError>> + 'static,
    {
        let mark = SyncMark::begin(&self.cache, key);
        let cache = self.cache.clone();
        let key = key.clone();
        let retry = self.retry;
        let task = tokio::task::spawn_local(async move {
            let (result, attempts) = with_retries(retry, "write", commit).await;
            drop(mark);
            let mut cache = cache.borrow_mut();
            match result {
                Ok(response) => {
                    cache.invalidate(&key);
                    debug!(%key, attempts, "write-through committed");
                    Ok(response)
                }
                Err(source) => {
                    warn!(%key, attempts, error = %source, "write-through failed");
                    Err(MutationError::Failed { attempts, source })
                }
            }
        });
        join_write(task).await
    }

    fn begin(&self, key: &QueryKey, entity_id: &EntityId, delta: FieldDelta) -> MutationRecord {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let snapshot = {
            let mut cache = self.cache.borrow_mut();
            let snapshot = cache.read(key);
            let applied = cache.patch(key, entity_id, &delta);
            cache.begin_write(key);
            debug!(mutation = id, %key, entity = %entity_id.short(), applied, "optimistic patch");
            snapshot
        };

        self.pending.borrow_mut().push(PendingWrite {
            id,
            key: key.clone(),
            entity_id: entity_id.clone(),
        });

        MutationRecord {
            id,
            key: key.clone(),
            entity_id: entity_id.clone(),
            delta,
            snapshot,
            state: MutationState::Pending,
        }
    }

    fn settle<T>(
        &self,
        mut record: MutationRecord,
        result: Result<T, StoreError>,
        attempts: u32,
    ) -> Result<MutationOutcome<T>, MutationError> {
        let overlapping = {
            let mut pending = self.pending.borrow_mut();
            pending.retain(|p| p.id != record.id);
            pending
                .iter()
                .filter(|p| {
                    p.id > record.id && p.key == record.key && p.entity_id == record.entity_id
                })
                .count()
        };

        let mut cache = self.cache.borrow_mut();
        cache.end_write(&record.key);

        match result {
            Ok(response) => {
                cache.invalidate(&record.key);
                record.state = MutationState::Committed;
                info!(mutation = record.id, key = %record.key, attempts, "mutation committed");
                Ok(MutationOutcome {
                    record,
                    attempts,
                    response,
                })
            }
            Err(source) => {
                if let Some(snapshot) = record.snapshot.clone() {
                    cache.replace(&record.key, snapshot);
                }
                cache.invalidate(&record.key);
                record.state = MutationState::RolledBack;
                warn!(
                    mutation = record.id,
                    key = %record.key,
                    attempts,
                    overlapping,
                    error = %source,
                    "mutation rolled back"
                );
                if overlapping > 0 {
                    Err(MutationError::RollbackConflict {
                        overlapping,
                        source,
                    })
                } else {
                    Err(MutationError::Failed { attempts, source })
                }
            }
        }
    }

    /// Roll back a write whose task was dropped before it settled.
    ///
    /// The server may or may not have applied the write; restoring the
    /// snapshot and invalidating leaves the answer to the next refetch.
    fn abandon(&self, record: &MutationRecord) {
        self.pending.borrow_mut().retain(|p| p.id != record.id);

        let Ok(mut cache) = self.cache.try_borrow_mut() else {
            warn!(
                mutation = record.id,
                key = %record.key,
                "cache borrowed during drop; write left pending"
            );
            return;
        };
        cache.end_write(&record.key);
        if let Some(snapshot) = record.snapshot.clone() {
            cache.replace(&record.key, snapshot);
        }
        cache.invalidate(&record.key);
        warn!(
            mutation = record.id,
            key = %record.key,
            "write dropped before settling; rolled back"
        );
    }
}

/// Wait for a spawned write. A panic in the write is re-raised here.
async fn join_write<R>(task: JoinHandle<Result<R, MutationError>>) -> Result<R, MutationError> {
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(MutationError::Failed {
            attempts: 0,
            source: StoreError::Network(format!("write task cancelled: {e}")),
        }),
    }
}

/// Rolls a mutation back if dropped while still armed.
struct Unsettled<'a> {
    coordinator: &'a MutationCoordinator,
    record: &'a MutationRecord,
    armed: bool,
}

impl Unsettled<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Unsettled<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.abandon(self.record);
        }
    }
}
