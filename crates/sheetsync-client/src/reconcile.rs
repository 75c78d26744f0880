//! Reconciliation: server truth always wins.
//!
//! There is no per-field merging. A collection that is missing, invalidated,
//! or older than the stale window is refetched, and the refetch result
//! replaces it wholesale. Conflicts between optimistic patches, push events
//! and rollbacks all resolve the same way: whoever wrote last locally wins
//! until the next refetch, which then overwrites everything.
//!
//! ```text
//! read(key)
//!    │ fresh ──────────────▶ cached records
//!    │ missing/stale/expired
//!    ▼
//! refetch(key) ── coalesced per key ──▶ store.list(key)
//!    │ no write pending or started ─▶ cache.replace(key, records)
//!    │ otherwise                   ─▶ discard (key stays stale)
//! ```
//!
//! A refetch never clobbers an optimistic patch that has not settled; the
//! write's own settle invalidates the key again, so the next read repairs it.
//!
//! The in-flight table only holds weak handles. When every caller awaiting a
//! refetch has gone away, the request is dropped and its syncing mark and
//! table entry go with it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{LocalBoxFuture, Shared, WeakShared};
use sheetsync_types::{EntityId, QueryKey, Record};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{RowStore, StoreError};
use crate::cache::{CacheEntry, SharedCache, SyncMark};
use crate::retry::{RetryPolicy, with_retries};

/// Why a read has to go to the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefetchReason {
    /// Never loaded.
    Missing,
    /// Explicitly invalidated (mutation settled, reconnect).
    Invalidated,
    /// Loaded longer ago than the stale window.
    Expired,
}

/// When cached data is trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconcilePolicy {
    pub stale_after: Duration,
}

impl ReconcilePolicy {
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }

    pub fn refetch_reason(
        &self,
        entry: Option<&CacheEntry>,
        now: Instant,
    ) -> Option<RefetchReason> {
        let entry = match entry {
            None => return Some(RefetchReason::Missing),
            Some(entry) => entry,
        };
        if entry.is_stale() {
            Some(RefetchReason::Invalidated)
        } else if now.saturating_duration_since(entry.fetched_at()) >= self.stale_after {
            Some(RefetchReason::Expired)
        } else {
            None
        }
    }
}

type Refetch = LocalBoxFuture<'static, Result<Vec<Record>, StoreError>>;
type InFlightTable = Rc<RefCell<HashMap<QueryKey, WeakShared<Refetch>>>>;

/// Issues refetches and applies them to the cache.
///
/// Cheap to clone; clones share the in-flight table.
#[derive(Clone)]
pub struct Reconciler {
    cache: SharedCache,
    store: Rc<dyn RowStore>,
    policy: ReconcilePolicy,
    retry: RetryPolicy,
    in_flight: InFlightTable,
}

impl Reconciler {
    pub fn new(
        cache: SharedCache,
        store: Rc<dyn RowStore>,
        policy: ReconcilePolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cache,
            store,
            policy,
            retry,
            in_flight: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// Read a collection, refetching first if the policy says so.
    ///
    /// On refetch failure the error is returned; whatever stale data was
    /// cached stays readable through the cache.
    pub async fn read(&self, key: &QueryKey) -> Result<Vec<Record>, StoreError> {
        let reason = {
            let cache = self.cache.borrow();
            match self.policy.refetch_reason(cache.entry(key), Instant::now()) {
                None => return Ok(cache.read(key).unwrap_or_default()),
                Some(reason) => reason,
            }
        };
        debug!(%key, ?reason, "refetching");
        self.refetch(key).await
    }

    /// Whether a refetch for this key is currently in flight.
    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.in_flight
            .borrow()
            .get(key)
            .is_some_and(|weak| weak.upgrade().is_some())
    }

    /// Fetch the collection and replace the cache entry with it.
    ///
    /// Concurrent calls for one key share a single request.
    pub async fn refetch(&self, key: &QueryKey) -> Result<Vec<Record>, StoreError> {
        let existing = self.in_flight.borrow().get(key).and_then(WeakShared::upgrade);
        let fut = match existing {
            Some(fut) => fut,
            None => {
                let ticket = InFlight::begin(self, key);
                let fut = self.clone().fetch_and_apply(ticket).boxed_local().shared();
                if let Some(weak) = fut.downgrade() {
                    self.in_flight.borrow_mut().insert(key.clone(), weak);
                }
                fut
            }
        };
        fut.await
    }

    /// Invalidate every loaded collection of a scope and refetch them.
    ///
    /// Used after a push channel reconnects, to repair events missed while
    /// offline. Failures are logged, not returned: the keys stay stale and the
    /// next read tries again.
    pub async fn resync_scope(&self, scope: &EntityId) -> usize {
        let keys = self.cache.borrow_mut().invalidate_scope(scope);
        let mut repaired = 0;
        for key in &keys {
            match self.refetch(key).await {
                Ok(_) => repaired += 1,
                Err(e) => warn!(%key, error = %e, "resync refetch failed; key left stale"),
            }
        }
        info!(scope = %scope.short(), keys = keys.len(), repaired, "scope resync complete");
        repaired
    }

    async fn fetch_and_apply(self, ticket: InFlight) -> Result<Vec<Record>, StoreError> {
        let key = ticket.key.clone();
        let epoch = ticket.epoch;
        let store = &self.store;

        let (result, attempts) = with_retries(self.retry, "refetch", || store.list(&key)).await;

        drop(ticket);
        let mut cache = self.cache.borrow_mut();

        match result {
            Ok(records) => {
                if cache.write_epoch(&key) != epoch || cache.has_pending_writes(&key) {
                    debug!(%key, "discarding refetch: optimistic write pending or started");
                    return Ok(cache.read(&key).unwrap_or(records));
                }
                cache.replace(&key, records.clone());
                Ok(records)
            }
            Err(e) => {
                warn!(%key, attempts, error = %e, "refetch failed");
                Err(e)
            }
        }
    }
}

/// One refetch's claim on its key: the syncing mark, the write epoch it
/// started at and its in-flight table entry. Dropping it releases both.
struct InFlight {
    key: QueryKey,
    epoch: u64,
    table: InFlightTable,
    _mark: SyncMark,
}

impl InFlight {
    fn begin(reconciler: &Reconciler, key: &QueryKey) -> Self {
        let mark = SyncMark::begin(&reconciler.cache, key);
        let epoch = reconciler.cache.borrow().write_epoch(key);
        Self {
            key: key.clone(),
            epoch,
            table: reconciler.in_flight.clone(),
            _mark: mark,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.try_borrow_mut() {
            table.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::memory::MemoryRowStore;

    fn slow_store(key: &QueryKey) -> Rc<MemoryRowStore> {
        let store = Rc::new(MemoryRowStore::new());
        store.seed(key.clone(), vec![Record::new("r1"), Record::new("r2")]);
        store.set_latency(Duration::from_secs(5));
        store
    }

    fn reconciler_for(cache: &SharedCache, store: &Rc<MemoryRowStore>) -> Reconciler {
        Reconciler::new(
            cache.clone(),
            store.clone(),
            ReconcilePolicy::new(Duration::from_secs(30)),
            RetryPolicy::never(),
        )
    }

    #[test]
    fn test_policy_reasons() {
        let policy = ReconcilePolicy::new(Duration::from_secs(30));
        let mut store = CacheStore::new();
        let key = QueryKey::rows("s1");
        let now = Instant::now();

        assert_eq!(policy.refetch_reason(store.entry(&key), now), Some(RefetchReason::Missing));

        store.replace(&key, vec![Record::new("r1")]);
        assert_eq!(policy.refetch_reason(store.entry(&key), Instant::now()), None);
        assert_eq!(
            policy.refetch_reason(store.entry(&key), Instant::now() + Duration::from_secs(31)),
            Some(RefetchReason::Expired)
        );

        store.invalidate(&key);
        assert_eq!(
            policy.refetch_reason(store.entry(&key), Instant::now()),
            Some(RefetchReason::Invalidated)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_refetch_releases_key() {
        let key = QueryKey::rows("s1");
        let cache = CacheStore::new().shared();
        let store = slow_store(&key);
        let reconciler = reconciler_for(&cache, &store);

        let mut fetch = Box::pin(reconciler.refetch(&key));
        assert!(futures::poll!(fetch.as_mut()).is_pending());
        assert!(reconciler.is_fetching(&key));
        assert!(cache.borrow().is_syncing(&key));

        drop(fetch);
        assert!(!reconciler.is_fetching(&key));
        assert!(!cache.borrow().is_syncing(&key));
        assert!(cache.borrow().read(&key).is_none());

        // The next read starts a fresh request.
        assert_eq!(reconciler.refetch(&key).await.unwrap().len(), 2);
        assert_eq!(store.list_count(&key), 2);
        assert!(!cache.borrow().is_syncing(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_survives_one_waiter_leaving() {
        let key = QueryKey::rows("s1");
        let cache = CacheStore::new().shared();
        let store = slow_store(&key);
        let reconciler = reconciler_for(&cache, &store);

        let mut first = Box::pin(reconciler.refetch(&key));
        let mut second = Box::pin(reconciler.refetch(&key));
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert!(futures::poll!(second.as_mut()).is_pending());

        drop(first);
        assert!(reconciler.is_fetching(&key));

        assert_eq!(second.await.unwrap().len(), 2);
        assert_eq!(store.list_count(&key), 1);
        assert!(!reconciler.is_fetching(&key));
        assert_eq!(cache.borrow().read(&key).map(|r| r.len()), Some(2));
    }
}
