use agenda_conductor::bundle::{Bundle, BundleStore, Item, MemoryBundleStore};
use agenda_conductor::config::{AuditSettings, AutosaveSettings};
use agenda_conductor::db;
use agenda_conductor::error::OrchestratorError;
use agenda_conductor::machine::{Meeting, Services};
use agenda_conductor::model::{ActivityStatus, BundleKind, ParticipantScope};
use agenda_conductor::plugin::{ActivityContext, ActivityPlugin, PluginRegistry};
use agenda_conductor::registry::MeetingRegistry;
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tokio::time::Duration;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Plugin whose lifecycle failures are chosen through its config.
struct Recorder {
    fail_open: bool,
    fail_close: bool,
    skip_finalize: bool,
}

impl Recorder {
    fn from_config(config: &Value) -> Self {
        let flag = |key: &str| config.get(key).and_then(Value::as_bool).unwrap_or(false);
        Self {
            fail_open: flag("fail_open"),
            fail_close: flag("fail_close"),
            skip_finalize: flag("skip_finalize"),
        }
    }
}

#[async_trait]
impl ActivityPlugin for Recorder {
    fn tool_type(&self) -> &str {
        "recorder"
    }

    async fn open(&self, _ctx: &ActivityContext, _input: &Bundle) -> Result<()> {
        if self.fail_open {
            bail!("open refused");
        }
        Ok(())
    }

    async fn close(&self, ctx: &ActivityContext) -> Result<()> {
        if self.fail_close {
            bail!("close refused");
        }
        if self.skip_finalize {
            return Ok(());
        }
        ctx.finalize_output_bundle(vec![Item::new("r1", "done")], Map::new())
    }
}

fn plugins() -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtin();
    registry
        .register("recorder", |config| {
            Ok(Arc::new(Recorder::from_config(config)) as Arc<dyn ActivityPlugin>)
        })
        .unwrap();
    registry
}

fn services(pool: sqlx::SqlitePool) -> Arc<Services> {
    Arc::new(Services::new(
        pool,
        plugins(),
        AutosaveSettings::default(),
        AuditSettings::default(),
    ))
}

fn users(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

async fn harness() -> (Arc<Services>, MeetingRegistry, Arc<Meeting>) {
    let services = services(setup_pool().await);
    let registry = MeetingRegistry::new(services.clone());
    let meeting = registry
        .create_meeting("m1", users(&["u1", "u2", "u3"]), users(&["f1"]))
        .await
        .unwrap();
    (services, registry, meeting)
}

async fn add(meeting: &Meeting, tool_type: &str, config: Value) -> String {
    meeting
        .add_activity(tool_type, config, ParticipantScope::All)
        .await
        .unwrap()
        .activity_id
}

async fn status(meeting: &Meeting, activity_id: &str) -> ActivityStatus {
    meeting.activity(activity_id).await.unwrap().status
}

fn is_invalid_transition<T>(result: agenda_conductor::Result<T>) -> bool {
    matches!(result, Err(OrchestratorError::InvalidTransition { .. }))
}

#[tokio::test]
async fn transitions_follow_the_state_machine() {
    let (_services, _registry, meeting) = harness().await;
    let a = add(&meeting, "brainstorm", json!({})).await;

    assert!(is_invalid_transition(meeting.pause(&a).await));
    assert!(is_invalid_transition(meeting.resume(&a).await));
    assert!(is_invalid_transition(meeting.stop(&a).await));
    assert_eq!(status(&meeting, &a).await, ActivityStatus::NeverStarted);

    meeting.start(&a, None).await.unwrap();
    assert!(is_invalid_transition(meeting.start(&a, None).await));
    assert!(is_invalid_transition(meeting.resume(&a).await));
    assert!(is_invalid_transition(meeting.delete(&a).await));
    assert_eq!(status(&meeting, &a).await, ActivityStatus::InProgress);

    meeting.pause(&a).await.unwrap();
    assert!(is_invalid_transition(meeting.pause(&a).await));
    assert!(is_invalid_transition(meeting.start(&a, None).await));
    assert_eq!(status(&meeting, &a).await, ActivityStatus::Paused);

    meeting.resume(&a).await.unwrap();
    meeting.stop(&a).await.unwrap();
    assert!(is_invalid_transition(meeting.pause(&a).await));
    assert!(is_invalid_transition(meeting.resume(&a).await));
    assert!(is_invalid_transition(meeting.stop(&a).await));
    assert_eq!(status(&meeting, &a).await, ActivityStatus::Completed);

    // restart
    let snapshot = meeting.start(&a, None).await.unwrap();
    assert_eq!(snapshot.active_activities[&a].status, ActivityStatus::InProgress);
    assert!(matches!(
        meeting.start("m1:brainstorm:99", None).await,
        Err(OrchestratorError::StaleReference(_))
    ));
}

#[tokio::test]
async fn conflicting_start_is_rejected_without_side_effects() {
    let (services, _registry, meeting) = harness().await;
    let a = add(&meeting, "brainstorm", json!({})).await;
    let b = add(&meeting, "brainstorm", json!({})).await;

    meeting.start(&a, None).await.unwrap();
    let err = meeting
        .start(&b, Some(ParticipantScope::custom(["u2"])))
        .await
        .unwrap_err();
    match err {
        OrchestratorError::ScopeConflict {
            conflicting_users,
            active_activity_id,
        } => {
            assert_eq!(active_activity_id, a);
            assert_eq!(conflicting_users.len(), 1);
            assert_eq!(conflicting_users[0].user_id, "u2");
        }
        other => panic!("unexpected error {:?}", other),
    }

    assert_eq!(status(&meeting, &a).await, ActivityStatus::InProgress);
    let untouched = meeting.activity(&b).await.unwrap();
    assert_eq!(untouched.status, ActivityStatus::NeverStarted);
    assert_eq!(untouched.participant_scope, ParticipantScope::All);
    assert!(!services.autosave.is_running(&b));
    assert!(services
        .store
        .load("m1", &b, BundleKind::Input)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn concurrent_overlapping_starts_admit_one() {
    let (_services, _registry, meeting) = harness().await;
    let a = add(&meeting, "brainstorm", json!({})).await;
    let b = add(&meeting, "brainstorm", json!({})).await;

    let (first, second) = tokio::join!(
        meeting.start(&a, Some(ParticipantScope::custom(["u1", "u2"]))),
        meeting.start(&b, Some(ParticipantScope::custom(["u2", "u3"]))),
    );
    let results = [first.is_ok(), second.is_ok()];
    assert_eq!(results.iter().filter(|ok| **ok).count(), 1);

    let err = first.err().or(second.err()).unwrap();
    match err {
        OrchestratorError::ScopeConflict {
            conflicting_users, ..
        } => {
            let ids: Vec<_> = conflicting_users.iter().map(|c| c.user_id.as_str()).collect();
            assert_eq!(ids, vec!["u2"]);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn scope_changes_are_checked_then_applied() {
    let (_services, _registry, meeting) = harness().await;
    let a = add(&meeting, "brainstorm", json!({})).await;
    let b = add(&meeting, "brainstorm", json!({})).await;
    meeting
        .start(&a, Some(ParticipantScope::custom(["u1"])))
        .await
        .unwrap();
    meeting
        .start(&b, Some(ParticipantScope::custom(["u2"])))
        .await
        .unwrap();

    let err = meeting
        .set_scope(&b, ParticipantScope::custom(["u1", "u2"]))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ScopeConflict { .. }));
    assert_eq!(
        meeting.activity(&b).await.unwrap().participant_scope,
        ParticipantScope::custom(["u2"])
    );

    let snapshot = meeting
        .set_scope(&b, ParticipantScope::custom(["u2", "u3"]))
        .await
        .unwrap();
    assert_eq!(snapshot.active_activities[&b].participant_ids.len(), 2);

    // `all` on an active activity would absorb u1 and u2 from the others.
    meeting.pause(&b).await.unwrap();
    assert!(matches!(
        meeting.set_scope(&b, ParticipantScope::All).await,
        Err(OrchestratorError::ScopeConflict { .. })
    ));
}

#[tokio::test]
async fn roster_changes_cannot_double_book() {
    let (_services, _registry, meeting) = harness().await;
    let a = add(&meeting, "brainstorm", json!({})).await;
    let b = add(&meeting, "brainstorm", json!({})).await;
    meeting
        .start(&a, Some(ParticipantScope::custom(["u1"])))
        .await
        .unwrap();
    meeting
        .start(&b, Some(ParticipantScope::custom(["u9"])))
        .await
        .unwrap();

    // With `a` on a fixed list, a roster change alone cannot collide.
    meeting
        .set_participants(users(&["u1", "u2", "u9"]))
        .await
        .unwrap();

    meeting.set_scope(&a, ParticipantScope::All).await.unwrap_err();
    meeting.stop(&b).await.unwrap();
    meeting.set_scope(&a, ParticipantScope::All).await.unwrap();
    meeting
        .start(&b, Some(ParticipantScope::custom(["u7"])))
        .await
        .unwrap();
    let err = meeting
        .set_participants(users(&["u1", "u7"]))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ScopeConflict { .. }));
    let snapshot = meeting.resync().await.unwrap();
    assert!(!snapshot.participant_ids.contains("u7"));
}

#[tokio::test]
async fn outputs_are_immutable_revisions() {
    let (services, _registry, meeting) = harness().await;
    let a = add(&meeting, "brainstorm", json!({})).await;
    meeting.start(&a, None).await.unwrap();
    for idea in ["one", "two"] {
        meeting
            .tool_action(&a, json!({ "type": "add_idea", "content": idea }))
            .await
            .unwrap();
    }
    meeting.stop(&a).await.unwrap();

    let pool = &services.pool;
    let first = db::fetch_bundle_payload(pool, "m1", &a, BundleKind::Output)
        .await
        .unwrap()
        .unwrap();
    let second = db::fetch_bundle_payload(pool, "m1", &a, BundleKind::Output)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(Bundle::from_payload(&first).unwrap().items.len(), 2);

    meeting.start(&a, None).await.unwrap();
    meeting
        .tool_action(&a, json!({ "type": "add_idea", "content": "three" }))
        .await
        .unwrap();
    meeting.stop(&a).await.unwrap();

    let outputs: Vec<_> = db::list_bundles(pool, "m1")
        .await
        .unwrap()
        .into_iter()
        .filter(|row| row.activity_id == a && row.kind == BundleKind::Output)
        .collect();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].revision, 1);
    assert_eq!(outputs[0].payload, first);
    let latest = services
        .store
        .load("m1", &a, BundleKind::Output)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.items.len(), 3);
}

#[tokio::test]
async fn failed_close_leaves_activity_running() {
    let (services, _registry, meeting) = harness().await;
    let failing = add(&meeting, "recorder", json!({ "fail_close": true })).await;
    let silent = add(&meeting, "recorder", json!({ "skip_finalize": true })).await;
    meeting
        .start(&failing, Some(ParticipantScope::custom(["u1"])))
        .await
        .unwrap();
    meeting
        .start(&silent, Some(ParticipantScope::custom(["u2"])))
        .await
        .unwrap();
    meeting.pause(&silent).await.unwrap();

    for (id, prior) in [
        (&failing, ActivityStatus::InProgress),
        (&silent, ActivityStatus::Paused),
    ] {
        let err = meeting.stop(id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PluginLifecycleFailure { stage: "close", .. }));
        assert_eq!(err.user_message(), "unable to update activity");
        assert_eq!(status(&meeting, id).await, prior);
        assert!(services
            .store
            .load("m1", id, BundleKind::Output)
            .await
            .unwrap()
            .is_none());
    }
    assert!(services.autosave.is_running(&failing));
    assert!(!services.autosave.is_running(&silent));
}

#[tokio::test]
async fn failed_open_does_not_start() {
    let (services, _registry, meeting) = harness().await;
    let a = add(&meeting, "recorder", json!({ "fail_open": true })).await;
    let err = meeting.start(&a, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::PluginLifecycleFailure { stage: "open", .. }));
    assert_eq!(status(&meeting, &a).await, ActivityStatus::NeverStarted);
    assert!(!services.autosave.is_running(&a));
    assert!(matches!(
        meeting.add_activity("voting", json!({}), ParticipantScope::All).await,
        Err(OrchestratorError::UnknownTool(_))
    ));
    assert!(matches!(
        meeting.add_activity("Bad Tool", json!({}), ParticipantScope::All).await,
        Err(OrchestratorError::InvalidToolType(_))
    ));
}

#[tokio::test]
async fn delete_soft_deletes_and_never_reuses_ids() {
    let (services, _registry, meeting) = harness().await;
    let a = add(&meeting, "brainstorm", json!({})).await;
    let b = add(&meeting, "recorder", json!({})).await;
    let c = add(&meeting, "brainstorm", json!({})).await;

    meeting.start(&b, None).await.unwrap();
    assert!(is_invalid_transition(meeting.delete(&b).await));
    meeting.stop(&b).await.unwrap();
    let snapshot = meeting.delete(&b).await.unwrap();

    let ids: Vec<_> = snapshot.agenda.iter().map(|v| v.activity_id.clone()).collect();
    assert_eq!(ids, vec![a.clone(), c.clone()]);
    assert_eq!(snapshot.agenda[1].order_index, 1);
    assert!(snapshot.current_activity.is_none());
    assert!(matches!(
        meeting.start(&b, None).await,
        Err(OrchestratorError::StaleReference(_))
    ));

    let d = add(&meeting, "recorder", json!({})).await;
    assert_eq!(d, "m1:recorder:4");
    let rows = db::fetch_activities(&services.pool, "m1").await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.activity_id != b));
}

#[tokio::test]
async fn reorder_requires_exact_permutation() {
    let (_services, _registry, meeting) = harness().await;
    let a = add(&meeting, "brainstorm", json!({})).await;
    let b = add(&meeting, "brainstorm", json!({})).await;
    let c = add(&meeting, "brainstorm", json!({})).await;
    let before: Vec<String> = meeting
        .agenda()
        .await
        .into_iter()
        .map(|a| a.activity_id)
        .collect();

    for bad in [
        vec![a.clone(), b.clone()],
        vec![a.clone(), b.clone(), c.clone(), "m1:brainstorm:9".to_string()],
        vec![a.clone(), a.clone(), c.clone()],
        vec![a.clone(), b.clone(), "m1:brainstorm:9".to_string()],
    ] {
        assert!(matches!(
            meeting.reorder(&bad).await,
            Err(OrchestratorError::InvalidReorder(_))
        ));
        let after: Vec<String> = meeting
            .agenda()
            .await
            .into_iter()
            .map(|a| a.activity_id)
            .collect();
        assert_eq!(after, before);
    }

    let snapshot = meeting
        .reorder(&[c.clone(), a.clone(), b.clone()])
        .await
        .unwrap();
    let order: Vec<_> = snapshot
        .agenda
        .iter()
        .map(|v| (v.activity_id.clone(), v.order_index))
        .collect();
    assert_eq!(order, vec![(c, 0), (a, 1), (b, 2)]);
}

#[tokio::test]
async fn duplicate_open_does_not_duplicate_seeded_items() {
    let (services, _registry, meeting) = harness().await;
    let a = add(&meeting, "brainstorm", json!({})).await;
    let b = add(&meeting, "brainstorm", json!({})).await;
    meeting.start(&a, None).await.unwrap();
    for idea in ["one", "two"] {
        meeting
            .tool_action(&a, json!({ "type": "add_idea", "content": idea }))
            .await
            .unwrap();
    }
    meeting.stop(&a).await.unwrap();

    meeting.start(&b, None).await.unwrap();
    meeting.stop(&b).await.unwrap();
    meeting.start(&b, None).await.unwrap();

    let input = services
        .store
        .load("m1", &b, BundleKind::Input)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(input.items.len(), 2);
    assert!(input
        .items
        .iter()
        .all(|i| i.source.as_ref().unwrap().activity_id == a));
    let listed = meeting
        .tool_action(&b, json!({ "type": "list" }))
        .await
        .unwrap();
    assert_eq!(listed["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn elapsed_time_freezes_while_paused() {
    let (_services, _registry, meeting) = harness().await;
    let a = add(&meeting, "recorder", json!({})).await;
    meeting.start(&a, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    meeting.pause(&a).await.unwrap();
    let paused = meeting.activity(&a).await.unwrap().elapsed_ms;
    assert!(paused >= 30);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = meeting.resync().await.unwrap();
    assert_eq!(snapshot.active_activities[&a].elapsed_ms, paused);

    meeting.resume(&a).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    meeting.stop(&a).await.unwrap();
    let stopped = meeting.activity(&a).await.unwrap().elapsed_ms;
    assert!(stopped >= paused + 30);

    meeting.start(&a, None).await.unwrap();
    assert!(meeting.activity(&a).await.unwrap().elapsed_ms < stopped);
}

#[tokio::test]
async fn audit_trail_records_transitions() {
    let (services, _registry, meeting) = harness().await;
    let a = add(&meeting, "recorder", json!({})).await;
    meeting.start(&a, None).await.unwrap();
    meeting.pause(&a).await.unwrap();
    meeting.resume(&a).await.unwrap();
    meeting.stop(&a).await.unwrap();

    let actions: Vec<String> = db::list_audit(&services.pool, "m1", 10)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.action)
        .collect();
    assert_eq!(actions, vec!["stop", "resume", "pause", "start", "add"]);
}

#[tokio::test]
async fn running_activity_is_recovered_as_paused() {
    let pool = setup_pool().await;
    let first = services(pool.clone());
    let registry = MeetingRegistry::new(first.clone());
    let meeting = registry
        .create_meeting("m1", users(&["u1"]), users(&["f1"]))
        .await
        .unwrap();
    let a = add(&meeting, "brainstorm", json!({})).await;
    meeting.start(&a, None).await.unwrap();
    // What an autosave tick would have written before the process died.
    first
        .store
        .save_draft(
            "m1",
            &a,
            &Bundle::new(vec![Item::new("idea-1", "before crash")], Map::new()),
        )
        .await
        .unwrap();
    first.autosave.cancel_meeting("m1").await;
    drop(meeting);
    drop(registry);

    let restarted = services(pool);
    let registry = MeetingRegistry::new(restarted.clone());
    let meeting = registry.open_meeting("m1").await.unwrap();
    assert_eq!(status(&meeting, &a).await, ActivityStatus::Paused);
    assert!(is_invalid_transition(
        meeting.tool_action(&a, json!({ "type": "list" })).await
    ));

    meeting.resume(&a).await.unwrap();
    assert!(restarted.autosave.is_running(&a));
    let listed = meeting
        .tool_action(&a, json!({ "type": "list" }))
        .await
        .unwrap();
    assert_eq!(listed["items"][0]["content"], "before crash");

    let next = add(&meeting, "brainstorm", json!({})).await;
    assert_eq!(next, "m1:brainstorm:2");
    meeting.stop(&a).await.unwrap();
}

#[tokio::test]
async fn registry_lifecycle() {
    let (services, registry, meeting) = harness().await;
    assert!(matches!(
        registry.create_meeting("m1", vec![], vec![]).await,
        Err(OrchestratorError::MeetingExists(_))
    ));
    assert!(matches!(
        registry.open_meeting("nope").await,
        Err(OrchestratorError::MeetingNotFound(_))
    ));

    let a = add(&meeting, "recorder", json!({})).await;
    meeting.start(&a, None).await.unwrap();
    let mut sub = services.broadcaster.subscribe("m1", "c1");
    assert!(sub.recv().await.is_some());

    registry.close_meeting("m1").await.unwrap();
    assert!(!services.autosave.is_running(&a));
    assert!(sub.recv().await.is_none());
    assert!(matches!(
        registry.open_meeting("m1").await,
        Err(OrchestratorError::MeetingNotFound(_))
    ));
}

#[tokio::test]
async fn autosave_persists_latest_snapshot_while_running() {
    let store = Arc::new(MemoryBundleStore::new());
    let services = Arc::new(
        Services::new(
            setup_pool().await,
            plugins(),
            AutosaveSettings::default(),
            AuditSettings::default(),
        )
        .with_store(store.clone()),
    );
    let registry = MeetingRegistry::new(services.clone());
    let meeting = registry
        .create_meeting("m1", users(&["u1", "u2"]), users(&["f1"]))
        .await
        .unwrap();
    let a = add(&meeting, "brainstorm", json!({ "autosave_seconds": 5 })).await;
    meeting.start(&a, None).await.unwrap();
    for idea in ["one", "two"] {
        meeting
            .tool_action(&a, json!({ "type": "add_idea", "content": idea }))
            .await
            .unwrap();
    }

    // Only the in-memory store is touched while the clock is frozen.
    tokio::time::pause();
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(store.draft_writes("m1", &a) >= 2);
    let draft = store
        .load("m1", &a, BundleKind::Draft)
        .await
        .unwrap()
        .unwrap();
    let listed = meeting
        .tool_action(&a, json!({ "type": "list" }))
        .await
        .unwrap();
    assert_eq!(serde_json::to_value(&draft.items).unwrap(), listed["items"]);
    tokio::time::resume();

    meeting.stop(&a).await.unwrap();
    assert!(!services.autosave.is_running(&a));
}

async fn exec(pool: &sqlx::SqlitePool, sql: &str) {
    sqlx::query(sql).execute(pool).await.unwrap();
}

fn output_revisions(rows: Vec<agenda_conductor::db::BundleRow>) -> Vec<i64> {
    rows.into_iter()
        .filter(|row| row.kind == BundleKind::Output)
        .map(|row| row.revision)
        .collect()
}

const REFUSE_COMPLETION: &str = "CREATE TRIGGER refuse_completion BEFORE UPDATE ON activities \
     WHEN NEW.status = 'completed' BEGIN SELECT RAISE(FAIL, 'completion refused'); END";

#[tokio::test]
async fn stop_is_all_or_nothing_when_the_status_write_fails() {
    let (services, _registry, meeting) = harness().await;
    let a = add(&meeting, "brainstorm", json!({})).await;
    meeting.start(&a, None).await.unwrap();
    meeting
        .tool_action(&a, json!({ "type": "add_idea", "content": "one" }))
        .await
        .unwrap();

    exec(&services.pool, REFUSE_COMPLETION).await;
    assert!(matches!(
        meeting.stop(&a).await,
        Err(OrchestratorError::Storage(_))
    ));
    assert_eq!(status(&meeting, &a).await, ActivityStatus::InProgress);
    assert!(services.autosave.is_running(&a));
    assert!(services
        .store
        .load("m1", &a, BundleKind::Output)
        .await
        .unwrap()
        .is_none());
    let rows = db::fetch_activities(&services.pool, "m1").await.unwrap();
    assert_eq!(rows[0].status, ActivityStatus::InProgress);

    exec(&services.pool, "DROP TRIGGER refuse_completion").await;
    meeting.stop(&a).await.unwrap();
    assert_eq!(status(&meeting, &a).await, ActivityStatus::Completed);
    assert!(!services.autosave.is_running(&a));
    let bundles = db::list_bundles(&services.pool, "m1").await.unwrap();
    assert_eq!(output_revisions(bundles), vec![1]);
}

#[tokio::test]
async fn memory_store_rolls_back_output_when_completion_fails() {
    let store = Arc::new(MemoryBundleStore::new());
    let services = Arc::new(
        Services::new(
            setup_pool().await,
            plugins(),
            AutosaveSettings::default(),
            AuditSettings::default(),
        )
        .with_store(store.clone()),
    );
    let registry = MeetingRegistry::new(services.clone());
    let meeting = registry
        .create_meeting("m1", users(&["u1"]), users(&["f1"]))
        .await
        .unwrap();
    let a = add(&meeting, "recorder", json!({})).await;
    meeting.start(&a, None).await.unwrap();

    exec(&services.pool, REFUSE_COMPLETION).await;
    assert!(meeting.stop(&a).await.is_err());
    assert!(store
        .load("m1", &a, BundleKind::Output)
        .await
        .unwrap()
        .is_none());
    assert_eq!(status(&meeting, &a).await, ActivityStatus::InProgress);

    exec(&services.pool, "DROP TRIGGER refuse_completion").await;
    meeting.stop(&a).await.unwrap();
    let output = store
        .load("m1", &a, BundleKind::Output)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output.items[0].id, "r1");
}

#[tokio::test]
async fn failed_reindex_keeps_the_deleted_activity() {
    let (services, _registry, meeting) = harness().await;
    let a = add(&meeting, "recorder", json!({})).await;
    let b = add(&meeting, "recorder", json!({})).await;

    exec(
        &services.pool,
        "CREATE TRIGGER refuse_reindex BEFORE UPDATE OF order_index ON activities \
         BEGIN SELECT RAISE(FAIL, 'reindex refused'); END",
    )
    .await;
    assert!(matches!(
        meeting.delete(&a).await,
        Err(OrchestratorError::Storage(_))
    ));
    let ids: Vec<String> = meeting.agenda().await.into_iter().map(|x| x.activity_id).collect();
    assert_eq!(ids, vec![a.clone(), b.clone()]);
    let rows = db::fetch_activities(&services.pool, "m1").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].order_index, 1);

    exec(&services.pool, "DROP TRIGGER refuse_reindex").await;
    meeting.delete(&a).await.unwrap();
    let rows = db::fetch_activities(&services.pool, "m1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].activity_id, b);
    assert_eq!(rows[0].order_index, 0);
}

#[tokio::test]
async fn closed_meeting_handle_refuses_operations() {
    let (services, registry, meeting) = harness().await;
    let a = add(&meeting, "recorder", json!({})).await;
    registry.close_meeting("m1").await.unwrap();

    assert!(matches!(
        meeting.start(&a, None).await,
        Err(OrchestratorError::MeetingNotFound(_))
    ));
    assert!(!services.autosave.is_running(&a));
    assert!(matches!(
        meeting
            .add_activity("recorder", json!({}), ParticipantScope::All)
            .await,
        Err(OrchestratorError::MeetingNotFound(_))
    ));
    assert!(matches!(
        meeting.resync().await,
        Err(OrchestratorError::MeetingNotFound(_))
    ));
    assert!(!meeting.is_facilitator("f1").await);
    // Nothing published after close, so no channel came back.
    assert!(services.broadcaster.state_request("m1").is_none());
    assert_eq!(
        db::fetch_activities(&services.pool, "m1").await.unwrap().len(),
        1
    );
}
