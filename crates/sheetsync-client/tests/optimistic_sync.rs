//! Integration tests for optimistic writes and reconciliation through the
//! `SheetSync` facade, against the in-memory row-store.

use std::rc::Rc;
use std::time::Duration;

use serde_json::{Map, json};
use tokio::task::LocalSet;

use sheetsync_client::types::{EntityId, FieldDelta, QueryKey, Record};
use sheetsync_client::{
    ChangeKind, MemoryRowStore, MemoryTransport, MutationError, SheetSync, StoreCall, StoreError,
    SyncConfig,
};

/// Helper to run async test code that requires LocalSet, on a paused clock
fn run_local<F: std::future::Future<Output = ()>>(f: F) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap();
    let local = LocalSet::new();
    rt.block_on(local.run_until(f));
}

fn row(id: &str, status: &str) -> Record {
    Record::new(id)
        .with("sheet_id", "s1")
        .with("data", json!({ "status": status, "name": format!("Person {id}") }))
        .with("row_order", 1.0)
}

fn rule(id: &str, enabled: bool) -> Record {
    Record::new(id)
        .with("sheet_id", "s1")
        .with("trigger_column", "status")
        .with("trigger_value", "Shortlisted")
        .with("action_type", "send_email")
        .with("enabled", enabled)
}

struct Fixture {
    store: Rc<MemoryRowStore>,
    transport: Rc<MemoryTransport>,
    sync: Rc<SheetSync>,
    sheet: EntityId,
    rows: QueryKey,
}

fn fixture() -> Fixture {
    let store = Rc::new(MemoryRowStore::new());
    let transport = Rc::new(MemoryTransport::new());
    let sheet = EntityId::from("s1");
    let rows = QueryKey::rows(sheet.clone());
    store.seed(rows.clone(), vec![row("r1", "Pending"), row("r2", "Pending")]);
    store.seed(QueryKey::agent_rules(sheet.clone()), vec![rule("rule-1", true)]);
    let sync = Rc::new(SheetSync::new(SyncConfig::default(), store.clone(), transport.clone()));
    Fixture {
        store,
        transport,
        sync,
        sheet,
        rows,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn status_of(f: &Fixture, id: &str) -> Option<String> {
    f.sync
        .cache()
        .borrow()
        .get(&f.rows, &EntityId::from(id))
        .and_then(|r| r.get_path(&["data", "status"]))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn ids(f: &Fixture) -> Vec<String> {
    f.sync.read(&f.rows).unwrap_or_default().into_iter().map(|r| r.id.to_string()).collect()
}

fn shortlist() -> FieldDelta {
    FieldDelta::row_data([("status", "Shortlisted")])
}

#[test]
fn test_offline_edit_reverts_and_keeps_pushed_row_until_rollback() {
    run_local(async {
        let f = fixture();
        f.sync.rows(&f.sheet).await.unwrap();
        let server = f.transport.accept_next();
        let watch = f.sync.watch_sheet(&f.sheet);
        settle().await;
        assert!(watch.status().is_connected());

        f.store.set_offline(true);
        f.store.hold_writes();
        let write = tokio::task::spawn_local({
            let sync = f.sync.clone();
            let (sheet, id) = (f.sheet.clone(), EntityId::from("r1"));
            async move { sync.update_row(&sheet, &id, shortlist()).await }
        });
        settle().await;

        // Optimistic value is visible while the write is in flight.
        assert_eq!(status_of(&f, "r1").as_deref(), Some("Shortlisted"));
        assert!(f.sync.is_syncing(&f.rows));

        // A push for a new row lands mid-flight without touching r1.
        server.send_json(&json!({ "event": "row_created", "row": row("r9", "New") }));
        settle().await;
        assert_eq!(ids(&f), ["r1", "r2", "r9"]);
        assert_eq!(status_of(&f, "r1").as_deref(), Some("Shortlisted"));

        f.store.open_gate();
        let err = write.await.unwrap().unwrap_err();
        assert!(matches!(err, MutationError::Failed { attempts: 2, .. }));
        assert!(err.store_error().is_transient());

        // Own snapshot restored: r1 back to Pending; the key is stale.
        assert_eq!(status_of(&f, "r1").as_deref(), Some("Pending"));
        assert!(f.sync.cache().borrow().is_stale(&f.rows));
        assert!(!f.sync.is_syncing(&f.rows));

        // Back online, the next read brings server truth (including r9).
        f.store.set_offline(false);
        let server_rows = vec![row("r1", "Pending"), row("r2", "Pending"), row("r9", "New")];
        f.store.seed(f.rows.clone(), server_rows);
        let rows = f.sync.rows(&f.sheet).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].cell("status"), Some("Pending"));
    });
}

#[test]
fn test_successful_edit_invalidates_and_refetch_confirms() {
    run_local(async {
        let f = fixture();
        f.sync.rows(&f.sheet).await.unwrap();

        let outcome = f
            .sync
            .update_row(&f.sheet, &EntityId::from("r1"), shortlist())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.response.get_path(&["data", "status"]), Some(&json!("Shortlisted")));
        // Merged one level deep: other cells survive.
        assert_eq!(outcome.response.get_path(&["data", "name"]), Some(&json!("Person r1")));
        assert!(f.sync.cache().borrow().is_stale(&f.rows));

        let rows = f.sync.rows(&f.sheet).await.unwrap();
        assert_eq!(rows[0].cell("status"), Some("Shortlisted"));
        assert_eq!(rows[0].cell("name"), Some("Person r1"));
        assert_eq!(f.store.list_count(&f.rows), 2);
    });
}

#[test]
fn test_transient_write_failure_retried_once() {
    run_local(async {
        let f = fixture();
        f.sync.rows(&f.sheet).await.unwrap();
        f.store.fail_next(StoreError::rejected(503, "overloaded"));

        let outcome = f
            .sync
            .update_row(&f.sheet, &EntityId::from("r1"), shortlist())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        let updates = f
            .store
            .calls()
            .into_iter()
            .filter(|c| matches!(c, StoreCall::Update(..)))
            .count();
        assert_eq!(updates, 2);
    });
}

#[test]
fn test_rejected_write_not_retried_and_reason_surfaced() {
    run_local(async {
        let f = fixture();
        f.sync.rows(&f.sheet).await.unwrap();
        let before = f.sync.read(&f.rows);

        let err = f
            .sync
            .update_row(&f.sheet, &EntityId::from("r404"), shortlist())
            .await
            .unwrap_err();

        assert!(matches!(err, MutationError::Failed { attempts: 1, .. }));
        assert_eq!(err.reason(), "rows r404 not found");
        assert_eq!(f.sync.read(&f.rows), before);
    });
}

#[test]
fn test_toggle_rule_is_optimistic() {
    run_local(async {
        let f = fixture();
        let rules_key = QueryKey::agent_rules(f.sheet.clone());
        assert!(f.sync.agent_rules(&f.sheet).await.unwrap()[0].enabled);

        f.store.hold_writes();
        let toggle = tokio::task::spawn_local({
            let sync = f.sync.clone();
            let sheet = f.sheet.clone();
            async move { sync.toggle_rule(&sheet, &EntityId::from("rule-1"), false).await }
        });
        settle().await;
        let cached = f
            .sync
            .cache()
            .borrow()
            .get(&rules_key, &EntityId::from("rule-1"))
            .cloned();
        assert_eq!(cached.and_then(|r| r.get("enabled").cloned()), Some(json!(false)));

        f.store.open_gate();
        toggle.await.unwrap().unwrap();
        assert!(!f.sync.agent_rules(&f.sheet).await.unwrap()[0].enabled);
    });
}

#[test]
fn test_refetches_coalesce_per_key() {
    run_local(async {
        let f = fixture();
        f.store.set_latency(Duration::from_millis(100));

        let (a, b) = futures::join!(f.sync.fetch(&f.rows), f.sync.fetch(&f.rows));

        assert_eq!(a.unwrap().len(), 2);
        assert_eq!(b.unwrap().len(), 2);
        assert_eq!(f.store.list_count(&f.rows), 1);
        assert!(!f.sync.reconciler().is_fetching(&f.rows));
    });
}

#[test]
fn test_fresh_reads_stay_local_until_stale_window() {
    run_local(async {
        let f = fixture();
        f.sync.rows(&f.sheet).await.unwrap();
        f.sync.rows(&f.sheet).await.unwrap();
        assert_eq!(f.store.list_count(&f.rows), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        f.sync.rows(&f.sheet).await.unwrap();
        assert_eq!(f.store.list_count(&f.rows), 2);
    });
}

#[test]
fn test_refetch_landing_during_pending_write_is_discarded() {
    run_local(async {
        let f = fixture();
        f.sync.rows(&f.sheet).await.unwrap();
        f.store.set_latency(Duration::from_millis(100));
        f.store.hold_writes();

        // Refetch goes out first, then an optimistic write starts.
        f.sync.cache().borrow_mut().invalidate(&f.rows);
        let refetch = tokio::task::spawn_local({
            let sync = f.sync.clone();
            let key = f.rows.clone();
            async move { sync.fetch(&key).await }
        });
        let write = tokio::task::spawn_local({
            let sync = f.sync.clone();
            let sheet = f.sheet.clone();
            async move { sync.update_row(&sheet, &EntityId::from("r1"), shortlist()).await }
        });

        // The refetch returns pre-write server data; it must not clobber
        // the optimistic patch.
        refetch.await.unwrap().unwrap();
        assert_eq!(status_of(&f, "r1").as_deref(), Some("Shortlisted"));
        assert!(f.sync.cache().borrow().is_stale(&f.rows));

        f.store.open_gate();
        write.await.unwrap().unwrap();
        let rows = f.sync.rows(&f.sheet).await.unwrap();
        assert_eq!(rows[0].cell("status"), Some("Shortlisted"));
    });
}

#[test]
fn test_timed_out_edit_still_settles_and_server_truth_wins() {
    run_local(async {
        let f = fixture();
        f.sync.rows(&f.sheet).await.unwrap();
        f.store.set_offline(true);
        f.store.hold_writes();

        let timed_out = tokio::time::timeout(
            Duration::from_secs(1),
            f.sync.update_row(&f.sheet, &EntityId::from("r1"), shortlist()),
        )
        .await;
        assert!(timed_out.is_err());

        // The caller gave up, but the write is still in flight.
        assert_eq!(status_of(&f, "r1").as_deref(), Some("Shortlisted"));
        assert!(f.sync.is_syncing(&f.rows));
        assert_eq!(f.sync.mutations().pending_count(), 1);

        // It fails in the background and rolls back on its own.
        f.store.open_gate();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(status_of(&f, "r1").as_deref(), Some("Pending"));
        assert!(!f.sync.is_syncing(&f.rows));
        assert_eq!(f.sync.mutations().pending_count(), 0);

        f.store.set_offline(false);
        f.store.seed(f.rows.clone(), vec![row("r1", "Hired"), row("r2", "Pending")]);
        let rows = f.sync.rows(&f.sheet).await.unwrap();
        assert_eq!(rows[0].cell("status"), Some("Hired"));
        assert!(!f.sync.cache().borrow().is_stale(&f.rows));
    });
}

#[test]
fn test_timed_out_edit_that_commits_is_refetched() {
    run_local(async {
        let f = fixture();
        f.sync.rows(&f.sheet).await.unwrap();
        f.store.hold_writes();

        let timed_out = tokio::time::timeout(
            Duration::from_secs(1),
            f.sync.update_row(&f.sheet, &EntityId::from("r1"), shortlist()),
        )
        .await;
        assert!(timed_out.is_err());

        f.store.open_gate();
        settle().await;
        assert!(f.sync.cache().borrow().is_stale(&f.rows));
        assert!(!f.sync.is_syncing(&f.rows));

        let rows = f.sync.rows(&f.sheet).await.unwrap();
        assert_eq!(rows[0].cell("status"), Some("Shortlisted"));
        let server_r1 = f.store.records(&f.rows)[0].clone();
        assert_eq!(server_r1.get_path(&["data", "status"]), Some(&json!("Shortlisted")));
    });
}

#[test]
fn test_create_and_delete_are_write_through() {
    run_local(async {
        let f = fixture();
        f.sync.rows(&f.sheet).await.unwrap();

        let mut cells = Map::new();
        cells.insert("status".into(), json!("New"));
        let created = f.sync.create_row(&f.sheet, cells).await.unwrap();
        // Not optimistic: the cache only learns of it from the server.
        assert_eq!(ids(&f), ["r1", "r2"]);
        assert!(f.sync.cache().borrow().is_stale(&f.rows));

        let rows = f.sync.rows(&f.sheet).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].id, created.id);

        f.sync.delete_row(&f.sheet, &EntityId::from("r2")).await.unwrap();
        f.sync.rows(&f.sheet).await.unwrap();
        assert_eq!(ids(&f), ["r1", created.id.to_string().as_str()]);

        let err = f.sync.delete_row(&f.sheet, &EntityId::from("r2")).await.unwrap_err();
        assert!(matches!(err.store_error(), StoreError::Rejected { status: 404, .. }));
    });
}

#[test]
fn test_rule_and_workspace_writes() {
    run_local(async {
        let f = fixture();

        let created = f
            .sync
            .create_rule(
                &f.sheet,
                FieldDelta::new()
                    .set("trigger_column", "status")
                    .set("trigger_value", "Hired")
                    .set("action_type", "webhook"),
            )
            .await
            .unwrap();
        let rules = f.sync.agent_rules(&f.sheet).await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules[1].enabled);

        f.sync.delete_rule(&f.sheet, &created.id).await.unwrap();
        assert!(f.sync.cache().borrow().is_stale(&QueryKey::agent_rules(f.sheet.clone())));
        assert_eq!(f.sync.agent_rules(&f.sheet).await.unwrap().len(), 1);

        let ws = f.sync.create_workspace("Recruiting").await.unwrap();
        let sheet = f.sync.create_sheet(&ws.id, "Candidates").await.unwrap();
        assert_eq!(f.sync.workspaces().await.unwrap().len(), 1);
        let sheets = f.sync.sheets(&ws.id).await.unwrap();
        assert_eq!(sheets[0].id, sheet.id);
        assert_eq!(sheets[0].get("workspace_id"), Some(&json!(ws.id.as_str())));
    });
}

#[test]
fn test_change_notifications_follow_protocol() {
    run_local(async {
        let f = fixture();
        let mut changes = f.sync.subscribe();
        f.sync.rows(&f.sheet).await.unwrap();
        f.store.set_offline(true);

        let _ = f.sync.update_row(&f.sheet, &EntityId::from("r1"), shortlist()).await;

        let mut kinds = Vec::new();
        while let Ok(change) = changes.try_recv() {
            assert_eq!(change.key, f.rows);
            kinds.push(change.kind);
        }
        assert_eq!(
            kinds,
            [
                ChangeKind::Replaced,
                ChangeKind::Patched(EntityId::from("r1")),
                ChangeKind::Replaced,
                ChangeKind::Invalidated,
            ]
        );
    });
}

#[test]
fn test_refetch_failure_keeps_stale_data_readable() {
    run_local(async {
        let f = fixture();
        f.sync.rows(&f.sheet).await.unwrap();
        f.sync.cache().borrow_mut().invalidate(&f.rows);
        f.store.set_offline(true);

        let err = f.sync.rows(&f.sheet).await.unwrap_err();

        assert!(err.is_transient());
        // One retry, then surfaced.
        assert_eq!(f.store.list_count(&f.rows), 3);
        assert_eq!(ids(&f), ["r1", "r2"]);
        assert!(f.sync.cache().borrow().is_stale(&f.rows));
    });
}
