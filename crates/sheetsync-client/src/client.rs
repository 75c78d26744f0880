//! The sync facade handed to the rendering layer.
//!
//! [`SheetSync`] owns one [`CacheStore`](crate::CacheStore) and wires the
//! reconciler, the mutation coordinator and per-sheet event streams to it.
//! It must live on a `LocalSet`; nothing in here is `Send`.

use std::rc::Rc;

use serde_json::{Map, Value};
use sheetsync_types::{AgentRule, Collection, EntityId, FieldDelta, QueryKey, Record, Row};
use tokio::sync::broadcast;
use tracing::info;

use crate::api::{HttpRowStore, RowStore, StoreError};
use crate::cache::{CacheStore, SharedCache};
use crate::config::SyncConfig;
use crate::mutation::{MutationCoordinator, MutationError, MutationOutcome};
use crate::reconcile::{ReconcilePolicy, Reconciler};
use crate::stream::{EventStreamClient, SheetWatch};
use crate::subscriptions::CacheChange;
use crate::transport::EventTransport;

/// Client-side sync context for one server.
pub struct SheetSync {
    config: SyncConfig,
    cache: SharedCache,
    store: Rc<dyn RowStore>,
    transport: Rc<dyn EventTransport>,
    reconciler: Reconciler,
    mutations: MutationCoordinator,
}

impl SheetSync {
    pub fn new(
        config: SyncConfig,
        store: Rc<dyn RowStore>,
        transport: Rc<dyn EventTransport>,
    ) -> Self {
        let cache = CacheStore::with_change_buffer(config.change_buffer).shared();
        let reconciler = Reconciler::new(
            cache.clone(),
            store.clone(),
            ReconcilePolicy::new(config.stale_after()),
            config.refetch_retry(),
        );
        let mutations = MutationCoordinator::new(cache.clone(), config.write_retry());
        Self {
            config,
            cache,
            store,
            transport,
            reconciler,
            mutations,
        }
    }

    /// Sync context against the HTTP row-store at `config.api_url`.
    pub fn with_http(
        config: SyncConfig,
        transport: Rc<dyn EventTransport>,
    ) -> Result<Self, StoreError> {
        let store = HttpRowStore::new(&config)?;
        info!(api_url = %config.api_url, "sheet sync using HTTP row-store");
        Ok(Self::new(config, Rc::new(store), transport))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Cached records for a key, without touching the network.
    pub fn read(&self, key: &QueryKey) -> Option<Vec<Record>> {
        self.cache.borrow().read(key)
    }

    /// Whether a write or refetch for this key is in flight.
    pub fn is_syncing(&self, key: &QueryKey) -> bool {
        self.cache.borrow().is_syncing(key) || self.reconciler.is_fetching(key)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.cache.borrow().subscribe()
    }

    /// Read a key, refetching first if it is missing, stale or expired.
    pub async fn fetch(&self, key: &QueryKey) -> Result<Vec<Record>, StoreError> {
        self.reconciler.read(key).await
    }

    pub async fn workspaces(&self) -> Result<Vec<Record>, StoreError> {
        self.fetch(&QueryKey::workspaces()).await
    }

    pub async fn sheets(&self, workspace_id: &EntityId) -> Result<Vec<Record>, StoreError> {
        self.fetch(&QueryKey::sheets(workspace_id.clone())).await
    }

    pub async fn rows(&self, sheet_id: &EntityId) -> Result<Vec<Row>, StoreError> {
        let records = self.fetch(&QueryKey::rows(sheet_id.clone())).await?;
        decode_all(&records)
    }

    pub async fn agent_rules(&self, sheet_id: &EntityId) -> Result<Vec<AgentRule>, StoreError> {
        let records = self.fetch(&QueryKey::agent_rules(sheet_id.clone())).await?;
        decode_all(&records)
    }

    // =========================================================================
    // Optimistic writes
    // =========================================================================

    /// Patch a row; `delta` shows in the cache before the server answers.
    pub async fn update_row(
        &self,
        sheet_id: &EntityId,
        row_id: &EntityId,
        delta: FieldDelta,
    ) -> Result<MutationOutcome<Record>, MutationError> {
        self.optimistic(QueryKey::rows(sheet_id.clone()), Collection::Rows, row_id, delta).await
    }

    pub async fn update_rule(
        &self,
        sheet_id: &EntityId,
        rule_id: &EntityId,
        delta: FieldDelta,
    ) -> Result<MutationOutcome<Record>, MutationError> {
        let key = QueryKey::agent_rules(sheet_id.clone());
        self.optimistic(key, Collection::AgentRules, rule_id, delta).await
    }

    pub async fn toggle_rule(
        &self,
        sheet_id: &EntityId,
        rule_id: &EntityId,
        enabled: bool,
    ) -> Result<MutationOutcome<Record>, MutationError> {
        self.update_rule(sheet_id, rule_id, FieldDelta::new().set("enabled", enabled)).await
    }

    async fn optimistic(
        &self,
        key: QueryKey,
        collection: Collection,
        id: &EntityId,
        delta: FieldDelta,
    ) -> Result<MutationOutcome<Record>, MutationError> {
        let store = self.store.clone();
        let (target, body) = (id.clone(), delta.clone());
        let commit = move || {
            let (store, target, body) = (store.clone(), target.clone(), body.clone());
            async move { store.update(collection, &target, &body).await }
        };
        self.mutations.mutate(&key, id, delta, commit).await
    }

    // =========================================================================
    // Write-through
    // =========================================================================

    /// Create a row with the given cells. The cache learns of it on refetch
    /// (or from the `row_created` push).
    pub async fn create_row(
        &self,
        sheet_id: &EntityId,
        cells: Map<String, Value>,
    ) -> Result<Record, MutationError> {
        let key = QueryKey::rows(sheet_id.clone());
        let fields = FieldDelta::new().set("data", Value::Object(cells));
        self.create(&key, fields).await
    }

    pub async fn delete_row(
        &self,
        sheet_id: &EntityId,
        row_id: &EntityId,
    ) -> Result<(), MutationError> {
        self.delete(&QueryKey::rows(sheet_id.clone()), Collection::Rows, row_id).await
    }

    pub async fn create_rule(
        &self,
        sheet_id: &EntityId,
        fields: FieldDelta,
    ) -> Result<Record, MutationError> {
        self.create(&QueryKey::agent_rules(sheet_id.clone()), fields).await
    }

    pub async fn delete_rule(
        &self,
        sheet_id: &EntityId,
        rule_id: &EntityId,
    ) -> Result<(), MutationError> {
        self.delete(&QueryKey::agent_rules(sheet_id.clone()), Collection::AgentRules, rule_id).await
    }

    pub async fn create_workspace(&self, name: &str) -> Result<Record, MutationError> {
        self.create(&QueryKey::workspaces(), FieldDelta::new().set("name", name)).await
    }

    pub async fn create_sheet(
        &self,
        workspace_id: &EntityId,
        name: &str,
    ) -> Result<Record, MutationError> {
        let key = QueryKey::sheets(workspace_id.clone());
        self.create(&key, FieldDelta::new().set("name", name)).await
    }

    async fn create(&self, key: &QueryKey, fields: FieldDelta) -> Result<Record, MutationError> {
        let store = self.store.clone();
        let target = key.clone();
        let commit = move || {
            let (store, target, fields) = (store.clone(), target.clone(), fields.clone());
            async move { store.create(&target, &fields).await }
        };
        self.mutations.write_through(key, commit).await
    }

    async fn delete(
        &self,
        key: &QueryKey,
        collection: Collection,
        id: &EntityId,
    ) -> Result<(), MutationError> {
        let store = self.store.clone();
        let target = id.clone();
        let commit = move || {
            let (store, target) = (store.clone(), target.clone());
            async move { store.delete(collection, &target).await }
        };
        self.mutations.write_through(key, commit).await
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Open the push channel for one sheet on the current `LocalSet`.
    ///
    /// The channel reconnects with backoff until the returned handle is shut
    /// down or dropped.
    pub fn watch_sheet(&self, sheet_id: &EntityId) -> SheetWatch {
        self.stream_for(sheet_id).spawn()
    }

    /// Unstarted event stream for one sheet, for callers that want to
    /// override its backoff before spawning.
    pub fn stream_for(&self, sheet_id: &EntityId) -> EventStreamClient {
        EventStreamClient::new(
            sheet_id.clone(),
            &self.config,
            self.transport.clone(),
            self.reconciler.clone(),
            self.cache.clone(),
        )
    }
}

fn decode_all<T>(records: &[Record]) -> Result<Vec<T>, StoreError>
where
    T: for<'a> TryFrom<&'a Record, Error = serde_json::Error>,
{
    records
        .iter()
        .map(|r| T::try_from(r).map_err(|e| StoreError::Decode(format!("{}: {e}", r.id))))
        .collect()
}
