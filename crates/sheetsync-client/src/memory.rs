//! In-memory [`RowStore`] and [`EventTransport`].
//!
//! Used by the test suite and by embedders that want to run the sync core
//! without a server. Both are scriptable: the store can be taken offline,
//! fed one-shot failures or held at a gate; the transport hands out push
//! channels (or refusals) in the order they were queued.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use sheetsync_types::{Collection, EntityId, FieldDelta, QueryKey, Record};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::trace;

use crate::api::{RowStore, StoreError};
use crate::transport::{ChannelError, EventChannel, EventTransport};

/// One call observed by [`MemoryRowStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreCall {
    List(QueryKey),
    Create(QueryKey),
    Update(Collection, EntityId),
    Delete(Collection, EntityId),
}

/// Row-store that keeps collections in a map.
pub struct MemoryRowStore {
    collections: RefCell<HashMap<QueryKey, Vec<Record>>>,
    calls: RefCell<Vec<StoreCall>>,
    failures: RefCell<VecDeque<StoreError>>,
    offline: Cell<bool>,
    latency: Cell<Duration>,
    /// Writes wait while this is `false`.
    gate: watch::Sender<bool>,
    next_id: Cell<u64>,
}

impl Default for MemoryRowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self {
            collections: RefCell::new(HashMap::new()),
            calls: RefCell::new(Vec::new()),
            failures: RefCell::new(VecDeque::new()),
            offline: Cell::new(false),
            latency: Cell::new(Duration::ZERO),
            gate: watch::Sender::new(true),
            next_id: Cell::new(1),
        }
    }

    /// Replace the server-side contents of one collection.
    pub fn seed(&self, key: QueryKey, records: Vec<Record>) {
        self.collections.borrow_mut().insert(key, records);
    }

    /// Server-side contents of one collection.
    pub fn records(&self, key: &QueryKey) -> Vec<Record> {
        self.collections.borrow().get(key).cloned().unwrap_or_default()
    }

    /// Every call fails with a network error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.set(offline);
    }

    /// The next call fails with `error`, once.
    pub fn fail_next(&self, error: StoreError) {
        self.failures.borrow_mut().push_back(error);
    }

    /// Delay every call by `latency` (tokio time, so paused clocks apply).
    pub fn set_latency(&self, latency: Duration) {
        self.latency.set(latency);
    }

    /// Park writes until [`open_gate`](Self::open_gate). Reads are not held.
    pub fn hold_writes(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.borrow().clone()
    }

    /// Number of `list` calls made for `key`.
    pub fn list_count(&self, key: &QueryKey) -> usize {
        self.calls.borrow().iter().filter(|c| matches!(c, StoreCall::List(k) if k == key)).count()
    }

    async fn enter(&self, call: StoreCall) -> Result<(), StoreError> {
        trace!(?call, "memory store call");
        let is_write = !matches!(call, StoreCall::List(_));
        self.calls.borrow_mut().push(call);

        if is_write {
            let mut open = self.gate.subscribe();
            // The sender lives in `self`, so this only ends when the gate opens.
            let _ = open.wait_for(|open| *open).await;
        }
        let latency = self.latency.get();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.failures.borrow_mut().pop_front() {
            return Err(error);
        }
        if self.offline.get() {
            return Err(StoreError::Network("connection refused".into()));
        }
        Ok(())
    }

    fn not_found(collection: Collection, id: &EntityId) -> StoreError {
        StoreError::rejected(404, format!("{collection} {id} not found"))
    }
}

#[async_trait(?Send)]
impl RowStore for MemoryRowStore {
    async fn list(&self, key: &QueryKey) -> Result<Vec<Record>, StoreError> {
        self.enter(StoreCall::List(key.clone())).await?;
        Ok(self.records(key))
    }

    async fn create(&self, key: &QueryKey, fields: &FieldDelta) -> Result<Record, StoreError> {
        self.enter(StoreCall::Create(key.clone())).await?;

        let n = self.next_id.get();
        self.next_id.set(n + 1);
        let mut record = Record::new(format!("{}-{n}", key.collection));
        record.apply(fields);
        if let Some(scope) = &key.scope {
            let parent = match key.collection {
                Collection::Sheets => "workspace_id",
                _ => "sheet_id",
            };
            record.fields.insert(parent.into(), scope.as_str().into());
        }

        self.collections.borrow_mut().entry(key.clone()).or_default().push(record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        collection: Collection,
        id: &EntityId,
        delta: &FieldDelta,
    ) -> Result<Record, StoreError> {
        self.enter(StoreCall::Update(collection, id.clone())).await?;

        let mut collections = self.collections.borrow_mut();
        collections
            .iter_mut()
            .filter(|(key, _)| key.collection == collection)
            .find_map(|(_, records)| records.iter_mut().find(|r| &r.id == id))
            .map(|record| {
                record.apply(delta);
                record.clone()
            })
            .ok_or_else(|| Self::not_found(collection, id))
    }

    async fn delete(&self, collection: Collection, id: &EntityId) -> Result<(), StoreError> {
        self.enter(StoreCall::Delete(collection, id.clone())).await?;

        let mut collections = self.collections.borrow_mut();
        for (key, records) in collections.iter_mut() {
            if key.collection != collection {
                continue;
            }
            if let Some(pos) = records.iter().position(|r| &r.id == id) {
                records.remove(pos);
                return Ok(());
            }
        }
        Err(Self::not_found(collection, id))
    }
}

// ============================================================================
// Transport
// ============================================================================

type Frame = Result<String, ChannelError>;

enum Outcome {
    Accept(mpsc::UnboundedReceiver<Frame>),
    Refuse(String),
}

/// Server end of one accepted push channel.
///
/// Dropping it (or calling [`close`](Self::close)) ends the channel cleanly.
pub struct PushSender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl PushSender {
    /// Send a raw text frame. Returns false once the client is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(Ok(text.into())).is_ok()
    }

    /// Send any serializable value as a JSON frame.
    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Break the channel with an error.
    pub fn fail(self, message: impl Into<String>) {
        let _ = self.tx.send(Err(ChannelError::Io(message.into())));
    }

    pub fn close(self) {}

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Push transport that serves queued outcomes in order.
///
/// With nothing queued, every connect is refused.
#[derive(Default)]
pub struct MemoryTransport {
    queue: RefCell<VecDeque<Outcome>>,
    attempts: RefCell<Vec<(Instant, String)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the next connect; returns the server end of that channel.
    pub fn accept_next(&self) -> PushSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queue.borrow_mut().push_back(Outcome::Accept(rx));
        PushSender { tx }
    }

    /// Refuse the next connect.
    pub fn refuse_next(&self, reason: impl Into<String>) {
        self.queue.borrow_mut().push_back(Outcome::Refuse(reason.into()));
    }

    /// When each connect was attempted, and to where.
    pub fn attempts(&self) -> Vec<(Instant, String)> {
        self.attempts.borrow().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.borrow().len()
    }
}

#[async_trait(?Send)]
impl EventTransport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<EventChannel, ChannelError> {
        self.attempts.borrow_mut().push((Instant::now(), url.to_string()));
        let outcome = self.queue.borrow_mut().pop_front();
        match outcome {
            Some(Outcome::Accept(mut rx)) => {
                Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed_local())
            }
            Some(Outcome::Refuse(reason)) => Err(ChannelError::Connect(reason)),
            None => Err(ChannelError::Connect("no server listening".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_store_crud() {
        let store = MemoryRowStore::new();
        let key = QueryKey::rows("s1");
        let pending = Record::new("r1").with("data", json!({ "status": "Pending" }));
        store.seed(key.clone(), vec![pending]);

        let created = store
            .create(&key, &FieldDelta::new().set("data", json!({ "status": "New" })))
            .await
            .unwrap();
        assert_eq!(created.get("sheet_id"), Some(&json!("s1")));
        assert_eq!(store.records(&key).len(), 2);

        let updated = store
            .update(Collection::Rows, &"r1".into(), &FieldDelta::row_data([("status", "Hired")]))
            .await
            .unwrap();
        assert_eq!(updated.get_path(&["data", "status"]), Some(&json!("Hired")));

        store.delete(Collection::Rows, &"r1".into()).await.unwrap();
        let err = store.delete(Collection::Rows, &"r1".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected { status: 404, .. }));
        assert_eq!(store.list(&key).await.unwrap(), vec![created]);
    }

    #[tokio::test]
    async fn test_store_failure_injection() {
        let store = MemoryRowStore::new();
        let key = QueryKey::rows("s1");

        store.fail_next(StoreError::rejected(500, "boom"));
        assert!(store.list(&key).await.is_err());
        assert!(store.list(&key).await.is_ok());

        store.set_offline(true);
        let refused = StoreError::Network("connection refused".into());
        assert_eq!(store.list(&key).await, Err(refused));
        assert_eq!(store.list_count(&key), 3);
    }

    #[tokio::test]
    async fn test_transport_serves_queue_in_order() {
        let transport = MemoryTransport::new();
        transport.refuse_next("down");
        let server = transport.accept_next();

        assert_eq!(
            transport.connect("ws://x").await.err(),
            Some(ChannelError::Connect("down".into()))
        );
        let mut channel = transport.connect("ws://x").await.unwrap();
        assert!(server.send_text("hello"));
        server.close();

        assert_eq!(channel.next().await, Some(Ok("hello".to_string())));
        assert_eq!(channel.next().await, None);
        assert!(transport.connect("ws://x").await.is_err());
        assert_eq!(transport.attempt_count(), 3);
    }
}
