//! In-memory cache of server-owned collections.
//!
//! One [`CacheEntry`] per [`QueryKey`], each an id-keyed, insertion-ordered
//! map of [`Record`]s plus a staleness flag and a version counter.
//!
//! Every method is a single synchronous call. The store is shared between the
//! optimistic coordinator, the event stream and the rendering layer as a
//! [`SharedCache`] on one `LocalSet`, and callers never hold the `RefCell`
//! borrow across an `.await`, so no two mutations can interleave.
//!
//! Missing targets are never errors: a patch or push event can race with a
//! collection that has not been fetched yet, and the fetch will bring the
//! truth anyway.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use sheetsync_types::{EntityId, FieldDelta, QueryKey, Record};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::constants::CHANGE_BUFFER;
use crate::subscriptions::{CacheChange, ChangeKind};

/// The cache as shared by every component of one sync context.
pub type SharedCache = Rc<RefCell<CacheStore>>;

/// One cached collection.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    records: IndexMap<EntityId, Record>,
    stale: bool,
    version: u64,
    fetched_at: Instant,
}

impl CacheEntry {
    fn from_records(records: Vec<Record>, version: u64) -> Self {
        let mut map = IndexMap::with_capacity(records.len());
        for record in records {
            // Duplicate ids in one payload: last value wins, first position kept.
            map.insert(record.id.clone(), record);
        }
        Self {
            records: map,
            stale: false,
            version,
            fetched_at: Instant::now(),
        }
    }

    /// Records in collection order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn get(&self, id: &EntityId) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn to_vec(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Bumped on every effective change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When the collection was last replaced wholesale.
    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }
}

/// Addressable, versioned table of cached collections.
pub struct CacheStore {
    entries: HashMap<QueryKey, CacheEntry>,
    /// In-flight writes and refetches per key (drives loading indicators).
    syncing: HashMap<QueryKey, usize>,
    /// Bumped when an optimistic write starts; refetches compare against it.
    write_epochs: HashMap<QueryKey, u64>,
    /// Optimistic writes not yet settled per key.
    writes: HashMap<QueryKey, usize>,
    change_tx: broadcast::Sender<CacheChange>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self::with_change_buffer(CHANGE_BUFFER)
    }

    pub fn with_change_buffer(capacity: usize) -> Self {
        let (change_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: HashMap::new(),
            syncing: HashMap::new(),
            write_epochs: HashMap::new(),
            writes: HashMap::new(),
            change_tx,
        }
    }

    /// Wrap in the shared handle the other components expect.
    pub fn shared(self) -> SharedCache {
        Rc::new(RefCell::new(self))
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.change_tx.subscribe()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Snapshot of a collection, or `None` if it was never loaded.
    pub fn read(&self, key: &QueryKey) -> Option<Vec<Record>> {
        self.entries.get(key).map(CacheEntry::to_vec)
    }

    pub fn entry(&self, key: &QueryKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn get(&self, key: &QueryKey, id: &EntityId) -> Option<&Record> {
        self.entries.get(key)?.get(id)
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Stale or never loaded.
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.entries.get(key).is_none_or(CacheEntry::is_stale)
    }

    /// Entry version, 0 if absent.
    pub fn version(&self, key: &QueryKey) -> u64 {
        self.entries.get(key).map_or(0, CacheEntry::version)
    }

    /// Loaded keys belonging to one parent scope.
    pub fn keys_in_scope(&self, scope: &EntityId) -> Vec<QueryKey> {
        self.entries.keys().filter(|k| k.in_scope(scope)).cloned().collect()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Atomically replace a whole collection and clear staleness.
    pub fn replace(&mut self, key: &QueryKey, records: Vec<Record>) {
        let version = self.version(key) + 1;
        let count = records.len();
        self.entries.insert(key.clone(), CacheEntry::from_records(records, version));
        trace!(%key, count, version, "cache replace");
        self.emit(key, version, ChangeKind::Replaced);
    }

    /// Apply a partial update to one record. No-op if key or record is absent.
    pub fn patch(&mut self, key: &QueryKey, id: &EntityId, delta: &FieldDelta) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            trace!(%key, id = %id.short(), "patch skipped: collection not loaded");
            return false;
        };
        let Some(record) = entry.records.get_mut(id) else {
            trace!(%key, id = %id.short(), "patch skipped: record absent");
            return false;
        };
        record.apply(delta);
        entry.version += 1;
        let version = entry.version;
        self.emit(key, version, ChangeKind::Patched(id.clone()));
        true
    }

    /// Append a record at the end of a loaded collection.
    ///
    /// An existing id is replaced in place instead of duplicated. No-op if
    /// the collection is not loaded.
    pub fn append(&mut self, key: &QueryKey, record: Record) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            trace!(%key, id = %record.id.short(), "append skipped: collection not loaded");
            return false;
        };
        let id = record.id.clone();
        entry.records.insert(id.clone(), record);
        entry.version += 1;
        let version = entry.version;
        self.emit(key, version, ChangeKind::Upserted(id));
        true
    }

    /// Replace one record by id with a full new value. No-op if absent.
    pub fn upsert(&mut self, key: &QueryKey, record: Record) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        let Some(slot) = entry.records.get_mut(&record.id) else {
            trace!(%key, id = %record.id.short(), "upsert skipped: record absent");
            return false;
        };
        let id = record.id.clone();
        *slot = record;
        entry.version += 1;
        let version = entry.version;
        self.emit(key, version, ChangeKind::Upserted(id));
        true
    }

    /// Drop one record, keeping the order of the rest. Idempotent.
    pub fn remove(&mut self, key: &QueryKey, id: &EntityId) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.records.shift_remove(id).is_none() {
            return false;
        }
        entry.version += 1;
        let version = entry.version;
        self.emit(key, version, ChangeKind::Removed(id.clone()));
        true
    }

    /// Mark a collection stale so the next read refetches. Data is kept.
    pub fn invalidate(&mut self, key: &QueryKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.stale = true;
        let version = entry.version;
        trace!(%key, "cache invalidate");
        self.emit(key, version, ChangeKind::Invalidated);
        true
    }

    /// Invalidate every loaded collection under one parent scope.
    pub fn invalidate_scope(&mut self, scope: &EntityId) -> Vec<QueryKey> {
        let keys = self.keys_in_scope(scope);
        for key in &keys {
            self.invalidate(key);
        }
        keys
    }

    // =========================================================================
    // Sync bookkeeping
    // =========================================================================

    pub fn begin_sync(&mut self, key: &QueryKey) {
        *self.syncing.entry(key.clone()).or_default() += 1;
    }

    pub fn end_sync(&mut self, key: &QueryKey) {
        if let Some(count) = self.syncing.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.syncing.remove(key);
            }
        }
    }

    /// Whether a write or refetch for this key is in flight.
    pub fn is_syncing(&self, key: &QueryKey) -> bool {
        self.syncing.contains_key(key)
    }

    /// Record that an optimistic write on this key has started.
    ///
    /// Bumps the key's write epoch and marks it syncing. Returns the new epoch.
    pub fn begin_write(&mut self, key: &QueryKey) -> u64 {
        *self.writes.entry(key.clone()).or_default() += 1;
        self.begin_sync(key);
        let epoch = self.write_epochs.entry(key.clone()).or_default();
        *epoch += 1;
        *epoch
    }

    /// Record that an optimistic write on this key has settled.
    pub fn end_write(&mut self, key: &QueryKey) {
        if let Some(count) = self.writes.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.writes.remove(key);
            }
        }
        self.end_sync(key);
    }

    /// Whether an optimistic write on this key has not settled yet.
    pub fn has_pending_writes(&self, key: &QueryKey) -> bool {
        self.writes.contains_key(key)
    }

    /// Count of optimistic writes ever started on this key.
    pub fn write_epoch(&self, key: &QueryKey) -> u64 {
        self.write_epochs.get(key).copied().unwrap_or(0)
    }

    fn emit(&self, key: &QueryKey, version: u64, kind: ChangeKind) {
        // No subscribers is fine.
        let _ = self.change_tx.send(CacheChange {
            key: key.clone(),
            version,
            kind,
        });
    }
}

/// Keeps a key marked syncing until dropped.
///
/// Held by write and refetch futures so the mark clears even when the future
/// is dropped before it finishes.
pub(crate) struct SyncMark {
    cache: SharedCache,
    key: QueryKey,
}

impl SyncMark {
    pub(crate) fn begin(cache: &SharedCache, key: &QueryKey) -> Self {
        cache.borrow_mut().begin_sync(key);
        Self {
            cache: cache.clone(),
            key: key.clone(),
        }
    }
}

impl Drop for SyncMark {
    fn drop(&mut self) {
        match self.cache.try_borrow_mut() {
            Ok(mut cache) => cache.end_sync(&self.key),
            Err(_) => warn!(key = %self.key, "cache borrowed during drop; syncing mark leaked"),
        }
    }
}
