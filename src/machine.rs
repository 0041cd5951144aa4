//! Per-meeting activity state machine.
//!
//! Every control operation on a meeting runs under that meeting's async
//! mutex, validates before it mutates, persists, then publishes a fresh
//! snapshot. Autosave timers and the broadcaster never take this lock.

use crate::autosave::AutosaveScheduler;
use crate::broadcast::{ActiveActivityView, ActivityView, Broadcaster, MeetingSnapshot, MeetingStatus};
use crate::bundle::{Bundle, BundleStore, SqliteBundleStore};
use crate::config::{AuditSettings, AutosaveSettings, Config};
use crate::db::{self, Pool};
use crate::error::{OrchestratorError, Result};
use crate::model::{Activity, ActivityStatus, BundleKind, MemberRole, ParticipantScope, UserRef};
use crate::plugin::{is_valid_tool_type, ActivityContext, ActivityPlugin, PluginRegistry};
use crate::scope::{self, ActiveAssignment};
use anyhow::anyhow;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Process-wide collaborators shared by every meeting.
pub struct Services {
    pub pool: Pool,
    pub store: Arc<dyn BundleStore>,
    pub plugins: PluginRegistry,
    pub autosave: AutosaveScheduler,
    pub broadcaster: Broadcaster,
    pub audit_max_entries: i64,
}

impl Services {
    pub fn new(
        pool: Pool,
        plugins: PluginRegistry,
        autosave: AutosaveSettings,
        audit: AuditSettings,
    ) -> Self {
        Self {
            store: Arc::new(SqliteBundleStore::new(pool.clone())),
            pool,
            plugins,
            autosave: AutosaveScheduler::new(autosave),
            broadcaster: Broadcaster::new(),
            audit_max_entries: audit.max_entries_per_meeting,
        }
    }

    pub fn from_config(pool: Pool, plugins: PluginRegistry, cfg: &Config) -> Self {
        Self::new(pool, plugins, cfg.autosave, cfg.audit)
    }

    /// Swap the bundle store, e.g. for an in-memory one in tests.
    pub fn with_store(mut self, store: Arc<dyn BundleStore>) -> Self {
        self.store = store;
        self
    }
}

/// One agenda slot together with its resolved plugin instance.
pub(crate) struct AgendaEntry {
    pub(crate) activity: Activity,
    pub(crate) plugin: Arc<dyn ActivityPlugin>,
    pub(crate) ctx: Arc<ActivityContext>,
    running_since: Option<Instant>,
    opened: bool,
}

impl AgendaEntry {
    pub(crate) fn new(
        activity: Activity,
        plugin: Arc<dyn ActivityPlugin>,
        store: Arc<dyn BundleStore>,
    ) -> Self {
        let ctx = Arc::new(ActivityContext::new(
            activity.meeting_id.clone(),
            activity.activity_id.clone(),
            activity.tool_type.clone(),
            store,
        ));
        Self {
            activity,
            plugin,
            ctx,
            running_since: None,
            opened: false,
        }
    }

    /// Accumulated time plus the current running stretch, if any.
    fn live_elapsed_ms(&self) -> i64 {
        let running = self
            .running_since
            .map(|since| since.elapsed().as_millis() as i64)
            .unwrap_or(0);
        self.activity.elapsed_ms + running
    }
}

pub(crate) struct MeetingState {
    pub(crate) participants: BTreeSet<UserRef>,
    pub(crate) facilitators: BTreeSet<UserRef>,
    pub(crate) metadata: Map<String, Value>,
    pub(crate) next_seq: i64,
    pub(crate) agenda: Vec<AgendaEntry>,
    /// Set once the meeting is closed; every later operation is refused.
    pub(crate) closed: bool,
}

impl MeetingState {
    fn position(&self, activity_id: &str) -> Result<usize> {
        self.agenda
            .iter()
            .position(|e| e.activity.activity_id == activity_id)
            .ok_or_else(|| OrchestratorError::StaleReference(activity_id.to_string()))
    }

    fn assignments_for(&self, roster: &BTreeSet<UserRef>) -> Vec<ActiveAssignment> {
        self.agenda
            .iter()
            .filter(|e| e.activity.status.is_active())
            .map(|e| ActiveAssignment {
                activity_id: e.activity.activity_id.clone(),
                participant_ids: scope::resolve(&e.activity.participant_scope, roster),
            })
            .collect()
    }

    fn assignments(&self) -> Vec<ActiveAssignment> {
        self.assignments_for(&self.participants)
    }

    /// Allocate the next never-reused id and build an unstarted activity at
    /// the end of the agenda.
    fn allocate(&mut self, meeting_id: &str, tool_type: &str, config: Value, scope: ParticipantScope) -> Activity {
        let seq = self.next_seq;
        self.next_seq += 1;
        Activity {
            activity_id: Activity::make_id(meeting_id, tool_type, seq),
            meeting_id: meeting_id.to_string(),
            tool_type: tool_type.to_string(),
            seq,
            order_index: self.agenda.len() as i64,
            config,
            status: ActivityStatus::NeverStarted,
            elapsed_ms: 0,
            participant_scope: scope,
            started_at: None,
        }
    }

    /// Most recently started active activity. Kept for clients that only
    /// understand a single current activity; `active_activities` is the
    /// authoritative view.
    fn current(&self) -> Option<&AgendaEntry> {
        self.agenda
            .iter()
            .filter(|e| e.activity.status.is_active())
            .max_by_key(|e| e.activity.started_at)
    }

    fn status(&self) -> MeetingStatus {
        let statuses = self.agenda.iter().map(|e| e.activity.status);
        let mut status = MeetingStatus::Idle;
        for s in statuses {
            match s {
                ActivityStatus::InProgress => return MeetingStatus::InProgress,
                ActivityStatus::Paused => status = MeetingStatus::Paused,
                _ => {}
            }
        }
        status
    }

    fn build_snapshot(&self, meeting_id: &str) -> MeetingSnapshot {
        let active_activities: BTreeMap<String, ActiveActivityView> = self
            .agenda
            .iter()
            .filter(|e| e.activity.status.is_active())
            .map(|e| {
                (
                    e.activity.activity_id.clone(),
                    ActiveActivityView {
                        status: e.activity.status,
                        tool: e.activity.tool_type.clone(),
                        participant_ids: scope::resolve(&e.activity.participant_scope, &self.participants),
                        started_at: e.activity.started_at,
                        elapsed_ms: e.live_elapsed_ms(),
                    },
                )
            })
            .collect();
        let agenda = self
            .agenda
            .iter()
            .map(|e| ActivityView {
                activity_id: e.activity.activity_id.clone(),
                tool_type: e.activity.tool_type.clone(),
                order_index: e.activity.order_index,
                status: e.activity.status,
                elapsed_ms: e.live_elapsed_ms(),
                participant_scope: e.activity.participant_scope.clone(),
                config: e.activity.config.clone(),
            })
            .collect();
        let current = self.current();
        MeetingSnapshot {
            meeting_id: meeting_id.to_string(),
            version: 0,
            status: self.status(),
            current_activity: current.map(|e| e.activity.activity_id.clone()),
            current_tool: current.map(|e| e.activity.tool_type.clone()),
            metadata: self.metadata.clone(),
            active_activities,
            agenda,
            participant_ids: self.participants.clone(),
            facilitator_ids: self.facilitators.clone(),
            updated_at: Utc::now(),
        }
    }
}

/// Handle to one live meeting. All state is reached through its operations.
pub struct Meeting {
    id: String,
    services: Arc<Services>,
    state: Mutex<MeetingState>,
}

impl Meeting {
    pub(crate) fn from_parts(id: String, services: Arc<Services>, state: MeetingState) -> Self {
        Self {
            id,
            services,
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn lock(&self) -> Result<MutexGuard<'_, MeetingState>> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(OrchestratorError::MeetingNotFound(self.id.clone()));
        }
        Ok(state)
    }

    /// Refuse every later operation on this handle. Waits for the operation
    /// in flight, so nothing restarts a timer or republishes after this.
    pub(crate) async fn mark_closed(&self) {
        self.state.lock().await.closed = true;
    }

    pub async fn activity(&self, activity_id: &str) -> Result<Activity> {
        let state = self.lock().await?;
        let idx = state.position(activity_id)?;
        Ok(state.agenda[idx].activity.clone())
    }

    /// Agenda in order, with elapsed time frozen at the last transition.
    pub async fn agenda(&self) -> Vec<Activity> {
        let state = self.state.lock().await;
        state.agenda.iter().map(|e| e.activity.clone()).collect()
    }

    pub async fn is_facilitator(&self, user_id: &str) -> bool {
        let state = self.state.lock().await;
        !state.closed && state.facilitators.contains(user_id)
    }

    pub async fn is_member(&self, user_id: &str) -> bool {
        let state = self.state.lock().await;
        !state.closed && (state.participants.contains(user_id) || state.facilitators.contains(user_id))
    }

    /// Facilitators, or participants inside the activity's resolved scope.
    pub async fn can_act_in(&self, user_id: &str, activity_id: &str) -> bool {
        let state = self.state.lock().await;
        if state.closed {
            return false;
        }
        if state.facilitators.contains(user_id) {
            return true;
        }
        state
            .position(activity_id)
            .map(|idx| {
                scope::resolve(&state.agenda[idx].activity.participant_scope, &state.participants)
                    .contains(user_id)
            })
            .unwrap_or(false)
    }

    /// Build and publish a fresh snapshot for resyncing clients.
    pub async fn resync(&self) -> Result<Arc<MeetingSnapshot>> {
        let state = self.lock().await?;
        Ok(self.publish(&state))
    }

    fn publish(&self, state: &MeetingState) -> Arc<MeetingSnapshot> {
        self.services
            .broadcaster
            .publish(state.build_snapshot(&self.id))
    }

    async fn audit(&self, activity_id: Option<&str>, action: &str, detail: Value) {
        if let Err(err) = db::append_audit(
            &self.services.pool,
            &self.id,
            activity_id,
            action,
            &detail,
            self.services.audit_max_entries,
        )
        .await
        {
            warn!(?err, meeting_id = %self.id, action, "failed to append audit entry");
        }
    }

    #[instrument(skip_all, fields(meeting_id = %self.id, tool_type = %tool_type))]
    pub async fn add_activity(
        &self,
        tool_type: &str,
        config: Value,
        scope: ParticipantScope,
    ) -> Result<Activity> {
        if !is_valid_tool_type(tool_type) {
            return Err(OrchestratorError::InvalidToolType(tool_type.to_string()));
        }
        let plugin = self.services.plugins.create(tool_type, &config)?;
        let mut state = self.lock().await?;
        let activity = state.allocate(&self.id, tool_type, config, scope);
        db::insert_activity(&self.services.pool, &activity).await?;
        info!(activity_id = %activity.activity_id, "activity added");
        state.agenda.push(AgendaEntry::new(
            activity.clone(),
            plugin,
            self.services.store.clone(),
        ));
        self.audit(
            Some(&activity.activity_id),
            "add",
            json!({ "tool_type": tool_type }),
        )
        .await;
        self.publish(&state);
        Ok(activity)
    }

    /// Start a never-started activity, or restart a completed one.
    #[instrument(skip_all, fields(meeting_id = %self.id, activity_id = %activity_id))]
    pub async fn start(
        &self,
        activity_id: &str,
        requested_scope: Option<ParticipantScope>,
    ) -> Result<Arc<MeetingSnapshot>> {
        let mut state = self.lock().await?;
        let idx = state.position(activity_id)?;
        let prior = state.agenda[idx].activity.status;
        if !matches!(prior, ActivityStatus::NeverStarted | ActivityStatus::Completed) {
            return Err(OrchestratorError::invalid_transition(activity_id, prior, "start"));
        }
        let scope = requested_scope.unwrap_or_else(|| state.agenda[idx].activity.participant_scope.clone());
        let candidate = scope::resolve(&scope, &state.participants);
        scope::check_conflicts(&candidate, activity_id, &state.assignments())?;

        let predecessor = idx
            .checked_sub(1)
            .map(|i| state.agenda[i].activity.activity_id.clone());
        self.seed_input(activity_id, predecessor.as_deref()).await?;

        let entry = &state.agenda[idx];
        let (plugin, ctx) = (entry.plugin.clone(), entry.ctx.clone());
        let input = ctx.load_input_bundle().await?;
        ctx.take_staged_output();
        plugin
            .open(&ctx, &input)
            .await
            .map_err(|err| OrchestratorError::plugin(activity_id, "open", err))?;

        let mut updated = entry.activity.clone();
        updated.status = ActivityStatus::InProgress;
        updated.participant_scope = scope;
        updated.started_at = Some(Utc::now());
        updated.elapsed_ms = 0;
        db::update_activity(&self.services.pool, &updated).await?;

        let entry = &mut state.agenda[idx];
        entry.activity = updated;
        entry.running_since = Some(Instant::now());
        entry.opened = true;
        self.services.autosave.start(plugin, ctx);
        info!(
            restart = prior == ActivityStatus::Completed,
            participants = candidate.len(),
            "activity started"
        );
        self.audit(
            Some(activity_id),
            "start",
            json!({ "participant_ids": candidate, "from": prior.as_str() }),
        )
        .await;
        Ok(self.publish(&state))
    }

    /// Write the input bundle once, from the predecessor's latest output.
    async fn seed_input(&self, activity_id: &str, predecessor: Option<&str>) -> Result<()> {
        let store = &self.services.store;
        if store
            .load(&self.id, activity_id, BundleKind::Input)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let mut seeded = Bundle::empty();
        if let Some(pred) = predecessor {
            if let Some(output) = store.load(&self.id, pred, BundleKind::Output).await? {
                seeded = output;
                for item in &mut seeded.items {
                    item.stamp_source(pred);
                }
            }
        }
        let inserted = store.insert_input(&self.id, activity_id, &seeded).await?;
        debug!(
            inserted,
            items = seeded.items.len(),
            predecessor,
            "seeded input bundle"
        );
        Ok(())
    }

    #[instrument(skip_all, fields(meeting_id = %self.id, activity_id = %activity_id))]
    pub async fn pause(&self, activity_id: &str) -> Result<Arc<MeetingSnapshot>> {
        let mut state = self.lock().await?;
        let idx = state.position(activity_id)?;
        let entry = &state.agenda[idx];
        if entry.activity.status != ActivityStatus::InProgress {
            return Err(OrchestratorError::invalid_transition(
                activity_id,
                entry.activity.status,
                "pause",
            ));
        }
        let mut updated = entry.activity.clone();
        updated.elapsed_ms = entry.live_elapsed_ms();
        updated.status = ActivityStatus::Paused;
        db::update_activity(&self.services.pool, &updated).await?;
        self.services.autosave.cancel(activity_id).await;

        let entry = &mut state.agenda[idx];
        entry.activity = updated;
        entry.running_since = None;
        info!(elapsed_ms = entry.activity.elapsed_ms, "activity paused");
        let detail = json!({ "elapsed_ms": entry.activity.elapsed_ms });
        self.audit(Some(activity_id), "pause", detail).await;
        Ok(self.publish(&state))
    }

    #[instrument(skip_all, fields(meeting_id = %self.id, activity_id = %activity_id))]
    pub async fn resume(&self, activity_id: &str) -> Result<Arc<MeetingSnapshot>> {
        let mut state = self.lock().await?;
        let idx = state.position(activity_id)?;
        let status = state.agenda[idx].activity.status;
        if status != ActivityStatus::Paused {
            return Err(OrchestratorError::invalid_transition(activity_id, status, "resume"));
        }
        let candidate = scope::resolve(&state.agenda[idx].activity.participant_scope, &state.participants);
        scope::check_conflicts(&candidate, activity_id, &state.assignments())?;

        self.ensure_opened(&mut state, idx).await?;
        let entry = &state.agenda[idx];
        let (plugin, ctx) = (entry.plugin.clone(), entry.ctx.clone());
        let mut updated = entry.activity.clone();
        updated.status = ActivityStatus::InProgress;
        db::update_activity(&self.services.pool, &updated).await?;

        let entry = &mut state.agenda[idx];
        entry.activity = updated;
        entry.running_since = Some(Instant::now());
        self.services.autosave.start(plugin, ctx);
        info!("activity resumed");
        self.audit(Some(activity_id), "resume", json!({})).await;
        Ok(self.publish(&state))
    }

    /// Activities recovered after a restart have a plugin instance that was
    /// never opened in this process; open it with the stored input.
    async fn ensure_opened(&self, state: &mut MeetingState, idx: usize) -> Result<()> {
        let entry = &state.agenda[idx];
        if entry.opened {
            return Ok(());
        }
        let activity_id = entry.activity.activity_id.clone();
        let input = entry.ctx.load_input_bundle().await?;
        entry
            .plugin
            .open(&entry.ctx, &input)
            .await
            .map_err(|err| OrchestratorError::plugin(&activity_id, "open", err))?;
        state.agenda[idx].opened = true;
        debug!(activity_id, "reopened recovered activity");
        Ok(())
    }

    /// Close the plugin and persist its output. The output revision and the
    /// completed row are stored together; nothing changes unless both land.
    #[instrument(skip_all, fields(meeting_id = %self.id, activity_id = %activity_id))]
    pub async fn stop(&self, activity_id: &str) -> Result<Arc<MeetingSnapshot>> {
        let mut state = self.lock().await?;
        let idx = state.position(activity_id)?;
        let status = state.agenda[idx].activity.status;
        if !status.is_active() {
            return Err(OrchestratorError::invalid_transition(activity_id, status, "stop"));
        }
        self.ensure_opened(&mut state, idx).await?;

        let entry = &state.agenda[idx];
        let ctx = entry.ctx.clone();
        ctx.take_staged_output();
        if let Err(err) = entry.plugin.close(&ctx).await {
            ctx.take_staged_output();
            return Err(OrchestratorError::plugin(activity_id, "close", err));
        }
        let output = ctx.take_staged_output().ok_or_else(|| {
            OrchestratorError::plugin(
                activity_id,
                "close",
                anyhow!("close did not finalize an output bundle"),
            )
        })?;
        let mut updated = entry.activity.clone();
        updated.elapsed_ms = entry.live_elapsed_ms();
        updated.status = ActivityStatus::Completed;
        let revision = self
            .services
            .store
            .complete_activity(&self.services.pool, &updated, &output)
            .await?;
        self.services.autosave.cancel(activity_id).await;

        let entry = &mut state.agenda[idx];
        entry.activity = updated;
        entry.running_since = None;
        info!(
            revision,
            items = output.items.len(),
            elapsed_ms = entry.activity.elapsed_ms,
            "activity completed"
        );
        self.audit(
            Some(activity_id),
            "stop",
            json!({ "revision": revision, "item_count": output.items.len() }),
        )
        .await;
        Ok(self.publish(&state))
    }

    #[instrument(skip_all, fields(meeting_id = %self.id, activity_id = %activity_id))]
    pub async fn delete(&self, activity_id: &str) -> Result<Arc<MeetingSnapshot>> {
        let mut state = self.lock().await?;
        let idx = state.position(activity_id)?;
        let status = state.agenda[idx].activity.status;
        if status.is_active() {
            return Err(OrchestratorError::invalid_transition(activity_id, status, "delete"));
        }
        let reindexed: Vec<(String, i64)> = state
            .agenda
            .iter()
            .filter(|e| e.activity.activity_id != activity_id)
            .enumerate()
            .map(|(i, e)| (e.activity.activity_id.clone(), i as i64))
            .collect();
        db::delete_activity(&self.services.pool, activity_id, &reindexed).await?;
        self.services.autosave.cancel(activity_id).await;

        state.agenda.remove(idx);
        for (i, entry) in state.agenda.iter_mut().enumerate() {
            entry.activity.order_index = i as i64;
        }
        info!(remaining = state.agenda.len(), "activity deleted");
        self.audit(Some(activity_id), "delete", json!({ "status": status.as_str() }))
            .await;
        Ok(self.publish(&state))
    }

    /// Apply a new agenda order. `ordered_ids` must be an exact permutation
    /// of the current agenda.
    #[instrument(skip_all, fields(meeting_id = %self.id))]
    pub async fn reorder(&self, ordered_ids: &[String]) -> Result<Arc<MeetingSnapshot>> {
        let mut state = self.lock().await?;
        if ordered_ids.len() != state.agenda.len() {
            return Err(OrchestratorError::InvalidReorder(format!(
                "expected {} activity ids, got {}",
                state.agenda.len(),
                ordered_ids.len()
            )));
        }
        let mut seen = HashSet::new();
        for id in ordered_ids {
            if !seen.insert(id.as_str()) {
                return Err(OrchestratorError::InvalidReorder(format!("duplicate activity id {}", id)));
            }
            if state.position(id).is_err() {
                return Err(OrchestratorError::InvalidReorder(format!("unknown activity id {}", id)));
            }
        }
        let order: Vec<(String, i64)> = ordered_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i as i64))
            .collect();
        db::update_order_indexes(&self.services.pool, &order).await?;

        let mut remaining = std::mem::take(&mut state.agenda);
        for (i, id) in ordered_ids.iter().enumerate() {
            if let Some(pos) = remaining.iter().position(|e| &e.activity.activity_id == id) {
                let mut entry = remaining.swap_remove(pos);
                entry.activity.order_index = i as i64;
                state.agenda.push(entry);
            }
        }
        info!(activities = state.agenda.len(), "agenda reordered");
        self.audit(None, "reorder", json!({ "ordered_ids": ordered_ids }))
            .await;
        Ok(self.publish(&state))
    }

    /// Replace an activity's scope. Active activities are conflict-checked
    /// first and keep their prior scope on failure.
    #[instrument(skip_all, fields(meeting_id = %self.id, activity_id = %activity_id))]
    pub async fn set_scope(
        &self,
        activity_id: &str,
        scope: ParticipantScope,
    ) -> Result<Arc<MeetingSnapshot>> {
        let mut state = self.lock().await?;
        let idx = state.position(activity_id)?;
        if state.agenda[idx].activity.status.is_active() {
            let candidate = scope::resolve(&scope, &state.participants);
            scope::check_conflicts(&candidate, activity_id, &state.assignments())?;
        }
        let mut updated = state.agenda[idx].activity.clone();
        updated.participant_scope = scope;
        db::update_activity(&self.services.pool, &updated).await?;
        let detail = json!({ "participant_scope": updated.participant_scope });
        state.agenda[idx].activity = updated;
        self.audit(Some(activity_id), "set_scope", detail).await;
        Ok(self.publish(&state))
    }

    /// Replace the participant roster. Rejected if any active `all`-scoped
    /// activity would then overlap another active activity.
    #[instrument(skip_all, fields(meeting_id = %self.id))]
    pub async fn set_participants(&self, participant_ids: Vec<UserRef>) -> Result<Arc<MeetingSnapshot>> {
        let mut state = self.lock().await?;
        let roster: BTreeSet<UserRef> = participant_ids.into_iter().collect();
        scope::check_assignments(&state.assignments_for(&roster))?;
        let ids: Vec<UserRef> = roster.iter().cloned().collect();
        db::replace_members(&self.services.pool, &self.id, MemberRole::Participant, &ids).await?;
        state.participants = roster;
        info!(participants = ids.len(), "roster updated");
        self.audit(None, "set_participants", json!({ "participant_ids": ids }))
            .await;
        Ok(self.publish(&state))
    }

    #[instrument(skip_all, fields(meeting_id = %self.id))]
    pub async fn set_facilitators(&self, facilitator_ids: Vec<UserRef>) -> Result<Arc<MeetingSnapshot>> {
        let mut state = self.lock().await?;
        let facilitators: BTreeSet<UserRef> = facilitator_ids.into_iter().collect();
        let ids: Vec<UserRef> = facilitators.iter().cloned().collect();
        db::replace_members(&self.services.pool, &self.id, MemberRole::Facilitator, &ids).await?;
        state.facilitators = facilitators;
        self.audit(None, "set_facilitators", json!({ "facilitator_ids": ids }))
            .await;
        Ok(self.publish(&state))
    }

    /// Shallow-merge `patch` into the meeting metadata; `null` removes a key.
    #[instrument(skip_all, fields(meeting_id = %self.id))]
    pub async fn set_metadata(&self, patch: Map<String, Value>) -> Result<Arc<MeetingSnapshot>> {
        let mut state = self.lock().await?;
        let mut merged = state.metadata.clone();
        for (key, value) in &patch {
            if value.is_null() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
        db::update_meeting_metadata(&self.services.pool, &self.id, &Value::Object(merged.clone()))
            .await?;
        state.metadata = merged;
        let keys: Vec<&String> = patch.keys().collect();
        self.audit(None, "set_metadata", json!({ "keys": keys })).await;
        Ok(self.publish(&state))
    }

    /// Forward a participant interaction to a running activity's plugin.
    #[instrument(skip_all, fields(meeting_id = %self.id, activity_id = %activity_id))]
    pub async fn tool_action(&self, activity_id: &str, action: Value) -> Result<Value> {
        let state = self.lock().await?;
        let idx = state.position(activity_id)?;
        let entry = &state.agenda[idx];
        if entry.activity.status != ActivityStatus::InProgress {
            return Err(OrchestratorError::invalid_transition(
                activity_id,
                entry.activity.status,
                "act on",
            ));
        }
        entry
            .plugin
            .handle_action(&entry.ctx, action)
            .await
            .map_err(|err| OrchestratorError::plugin(activity_id, "action", err))
    }

    /// Hold this meeting for a transfer commit.
    pub(crate) async fn begin_commit(&self) -> Result<CommitGuard<'_>> {
        Ok(CommitGuard {
            meeting: self,
            state: self.lock().await?,
        })
    }
}

/// Exclusive hold on a meeting across a transfer commit. The donor is read
/// and the target appended with no other operation in between.
pub(crate) struct CommitGuard<'a> {
    meeting: &'a Meeting,
    state: MutexGuard<'a, MeetingState>,
}

impl CommitGuard<'_> {
    pub(crate) fn activity(&self, activity_id: &str) -> Result<Activity> {
        let idx = self.state.position(activity_id)?;
        Ok(self.state.agenda[idx].activity.clone())
    }

    /// The activity an earlier commit with this key created, if any.
    pub(crate) async fn replayed(&self, idempotency_key: &str) -> Result<Option<Activity>> {
        let meeting = self.meeting;
        let Some(existing) =
            db::find_transfer_commit(&meeting.services.pool, &meeting.id, idempotency_key).await?
        else {
            return Ok(None);
        };
        info!(meeting_id = %meeting.id, activity_id = %existing, "transfer commit replayed");
        self.activity(&existing).map(Some)
    }

    /// Append a new activity whose input is `input`. The input bundle, the
    /// agenda row and the idempotency key are stored together or not at all.
    #[instrument(skip_all, fields(meeting_id = %self.meeting.id, tool_type = %tool_type))]
    pub(crate) async fn append_seeded(
        mut self,
        tool_type: &str,
        config: Value,
        input: &Bundle,
        idempotency_key: Option<&str>,
    ) -> Result<Activity> {
        let meeting = self.meeting;
        if !is_valid_tool_type(tool_type) {
            return Err(OrchestratorError::InvalidToolType(tool_type.to_string()));
        }
        let services = &meeting.services;
        let plugin = services.plugins.create(tool_type, &config)?;
        let activity = self
            .state
            .allocate(&meeting.id, tool_type, config, ParticipantScope::All);
        services
            .store
            .insert_seeded_activity(&services.pool, &activity, input, idempotency_key)
            .await?;
        info!(
            activity_id = %activity.activity_id,
            items = input.items.len(),
            "seeded activity appended"
        );
        self.state.agenda.push(AgendaEntry::new(
            activity.clone(),
            plugin,
            services.store.clone(),
        ));
        meeting
            .audit(
                Some(&activity.activity_id),
                "transfer_commit",
                json!({ "tool_type": tool_type, "item_count": input.items.len() }),
            )
            .await;
        meeting.publish(&self.state);
        Ok(activity)
    }
}
