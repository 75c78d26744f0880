//! Event stream client: one reconnecting push channel per sheet.
//!
//! ```text
//!            ┌──────────── backoff elapsed ─────────────┐
//!            ▼                                          │
//! Disconnected ──▶ Connecting ──▶ Connected ──▶ Disconnected
//!                      │          (resync,        ▲  (close / error,
//!                      │           drain events)  │   retry += 1)
//!                      └──── connect failed ──────┘
//! ```
//!
//! The task owns the only reconnect timer. Teardown (explicit
//! [`SheetWatch::shutdown`] or dropping the handle) resolves the shutdown
//! channel, which every await point in the loop races against, so no attempt
//! is made after it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use futures::StreamExt;
use sheetsync_types::{AgentLog, EntityId, QueryKey, SheetEvent};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheStore, SharedCache};
use crate::config::SyncConfig;
use crate::reconcile::Reconciler;
use crate::subscriptions::{ConnectionState, ConnectionStatus, SyncGeneration};
use crate::transport::{ChannelError, EventChannel, EventTransport};

/// Exponential reconnect delay: `min(base * 2^retry, cap)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.backoff_base(), config.backoff_cap())
    }

    /// Delay before the attempt following `retry` failures.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(crate::constants::BACKOFF_BASE, crate::constants::BACKOFF_CAP)
    }
}

/// Reconnection state machine, free of I/O.
#[derive(Clone, Debug)]
pub struct StreamState {
    backoff: Backoff,
    status: ConnectionStatus,
}

impl StreamState {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            status: ConnectionStatus::default(),
        }
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn on_connecting(&mut self) {
        self.status.state = ConnectionState::Connecting;
        self.status.retry_in = None;
    }

    /// Successful connect: reset the retry counter, start a new generation.
    pub fn on_connected(&mut self) -> SyncGeneration {
        self.status.state = ConnectionState::Connected;
        self.status.retry_count = 0;
        self.status.retry_in = None;
        self.status.generation = SyncGeneration(self.status.generation.0 + 1);
        self.status.generation
    }

    /// Close, error or failed connect. Returns the delay before the next try.
    pub fn on_closed(&mut self) -> Duration {
        let delay = self.backoff.delay(self.status.retry_count);
        self.status.state = ConnectionState::Disconnected;
        self.status.retry_count = self.status.retry_count.saturating_add(1);
        self.status.retry_in = Some(delay);
        delay
    }

    pub fn on_shutdown(&mut self) {
        self.status.state = ConnectionState::Disconnected;
        self.status.retry_in = None;
        self.status.closed = true;
    }
}

/// Last-N agent log entries, oldest first.
#[derive(Clone, Debug)]
pub struct LogBuffer {
    entries: VecDeque<AgentLog>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, log: AgentLog) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(log);
    }

    pub fn to_vec(&self) -> Vec<AgentLog> {
        self.entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&AgentLog> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Apply one push notification for a sheet.
///
/// Returns whether the cache changed. Entity events against a collection
/// that is not loaded are no-ops; the first fetch brings the truth.
pub fn apply_event(
    cache: &mut CacheStore,
    rows_key: &QueryKey,
    logs: &mut LogBuffer,
    event: SheetEvent,
) -> bool {
    match event {
        SheetEvent::RowCreated { row } => cache.append(rows_key, row),
        SheetEvent::RowUpdated { row } => cache.upsert(rows_key, row),
        SheetEvent::RowDeleted { row_id } => cache.remove(rows_key, &row_id),
        SheetEvent::AgentLog { log } => {
            logs.push(log);
            false
        }
    }
}

/// Configured push channel for one sheet, not yet running.
pub struct EventStreamClient {
    sheet_id: EntityId,
    url: String,
    transport: Rc<dyn EventTransport>,
    cache: SharedCache,
    reconciler: Reconciler,
    backoff: Backoff,
    log_capacity: usize,
}

impl EventStreamClient {
    pub fn new(
        sheet_id: EntityId,
        config: &SyncConfig,
        transport: Rc<dyn EventTransport>,
        reconciler: Reconciler,
        cache: SharedCache,
    ) -> Self {
        Self {
            url: config.sheet_channel_url(sheet_id.as_str()),
            sheet_id,
            transport,
            cache,
            reconciler,
            backoff: Backoff::from_config(config),
            log_capacity: config.log_capacity,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Start the connection task on the current `LocalSet`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a `LocalSet` (like `tokio::task::spawn_local`).
    pub fn spawn(self) -> SheetWatch {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let logs = Rc::new(RefCell::new(LogBuffer::new(self.log_capacity)));
        let sheet_id = self.sheet_id.clone();

        let task = tokio::task::spawn_local(self.run(shutdown_rx, status_tx, logs.clone()));

        SheetWatch {
            sheet_id,
            status_rx,
            logs,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn run(
        self,
        mut shutdown_rx: oneshot::Receiver<()>,
        status_tx: watch::Sender<ConnectionStatus>,
        logs: Rc<RefCell<LogBuffer>>,
    ) {
        let rows_key = QueryKey::rows(self.sheet_id.clone());
        let mut machine = StreamState::new(self.backoff);
        let sheet = self.sheet_id.short().to_string();

        loop {
            machine.on_connecting();
            status_tx.send_replace(machine.status().clone());
            debug!(%sheet, url = %self.url, "connecting");

            let connected = tokio::select! {
                _ = &mut shutdown_rx => break,
                result = self.transport.connect(&self.url) => result,
            };

            match connected {
                Ok(channel) => {
                    let generation = machine.on_connected();
                    status_tx.send_replace(machine.status().clone());
                    info!(%sheet, generation = generation.0, "event stream connected");

                    // Repair whatever was missed while disconnected before
                    // applying anything new.
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = self.reconciler.resync_scope(&self.sheet_id) => {}
                    }

                    let closed = tokio::select! {
                        _ = &mut shutdown_rx => break,
                        closed = self.drain(channel, &rows_key, &logs) => closed,
                    };
                    match closed {
                        Some(e) => warn!(%sheet, error = %e, "event stream error"),
                        None => info!(%sheet, "event stream closed by server"),
                    }
                }
                Err(e) => warn!(%sheet, error = %e, "event stream connect failed"),
            }

            let delay = machine.on_closed();
            status_tx.send_replace(machine.status().clone());
            info!(
                %sheet,
                retry = machine.status().retry_count,
                delay_ms = delay.as_millis() as u64,
                "reconnecting after backoff"
            );

            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        machine.on_shutdown();
        status_tx.send_replace(machine.status().clone());
        info!(%sheet, "event stream torn down");
    }

    /// Apply frames until the channel ends. `None` means a clean close.
    async fn drain(
        &self,
        mut channel: EventChannel,
        rows_key: &QueryKey,
        logs: &RefCell<LogBuffer>,
    ) -> Option<ChannelError> {
        while let Some(frame) = channel.next().await {
            match frame {
                Ok(text) => self.handle_frame(&text, rows_key, logs),
                Err(e) => return Some(e),
            }
        }
        None
    }

    fn handle_frame(&self, text: &str, rows_key: &QueryKey, logs: &RefCell<LogBuffer>) {
        let event = match SheetEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(sheet = %self.sheet_id.short(), error = %e, "dropping malformed event");
                return;
            }
        };
        let kind = event.kind();
        let id = event.entity_id().map(|id| id.short().to_string());
        let changed = apply_event(
            &mut self.cache.borrow_mut(),
            rows_key,
            &mut logs.borrow_mut(),
            event,
        );
        trace!(sheet = %self.sheet_id.short(), %kind, ?id, changed, "event applied");
    }
}

/// Running push channel. Dropping it tears the channel down.
pub struct SheetWatch {
    sheet_id: EntityId,
    status_rx: watch::Receiver<ConnectionStatus>,
    logs: Rc<RefCell<LogBuffer>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SheetWatch {
    pub fn sheet_id(&self) -> &EntityId {
        &self.sheet_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Recent agent logs, oldest first.
    pub fn agent_logs(&self) -> Vec<AgentLog> {
        self.logs.borrow().to_vec()
    }

    /// Tear down and wait for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(sheet = %self.sheet_id.short(), error = %e, "event stream task failed");
            }
        }
    }
}

impl Drop for SheetWatch {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
