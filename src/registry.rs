//! Live meeting handles, hydrated from SQLite on first use.

use crate::db;
use crate::error::{OrchestratorError, Result};
use crate::machine::{AgendaEntry, Meeting, MeetingState, Services};
use crate::model::{ActivityStatus, MemberRole, UserRef};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};

pub struct MeetingRegistry {
    services: Arc<Services>,
    meetings: Mutex<HashMap<String, Arc<Meeting>>>,
}

impl MeetingRegistry {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            meetings: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    fn cached(&self, meeting_id: &str) -> Option<Arc<Meeting>> {
        self.meetings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(meeting_id)
            .cloned()
    }

    /// Keep the first handle if two callers hydrated the same meeting.
    fn remember(&self, meeting: Meeting) -> Arc<Meeting> {
        let mut meetings = self
            .meetings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        meetings
            .entry(meeting.id().to_string())
            .or_insert_with(|| Arc::new(meeting))
            .clone()
    }

    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    pub async fn create_meeting(
        &self,
        meeting_id: &str,
        participants: Vec<UserRef>,
        facilitators: Vec<UserRef>,
    ) -> Result<Arc<Meeting>> {
        if db::fetch_meeting(&self.services.pool, meeting_id)
            .await?
            .is_some()
        {
            return Err(OrchestratorError::MeetingExists(meeting_id.to_string()));
        }
        db::insert_meeting(&self.services.pool, meeting_id, &participants, &facilitators).await?;
        let state = MeetingState {
            participants: participants.into_iter().collect(),
            facilitators: facilitators.into_iter().collect(),
            metadata: Map::new(),
            next_seq: 1,
            agenda: Vec::new(),
            closed: false,
        };
        info!(
            participants = state.participants.len(),
            facilitators = state.facilitators.len(),
            "meeting created"
        );
        let meeting = self.remember(Meeting::from_parts(
            meeting_id.to_string(),
            self.services.clone(),
            state,
        ));
        meeting.resync().await?;
        Ok(meeting)
    }

    /// Cached handle, or the meeting rebuilt from storage.
    ///
    /// Activities stored as `in_progress` belonged to a process that is gone;
    /// they come back `paused` with the elapsed time last persisted, and their
    /// plugin is opened again on resume.
    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    pub async fn open_meeting(&self, meeting_id: &str) -> Result<Arc<Meeting>> {
        if let Some(meeting) = self.cached(meeting_id) {
            return Ok(meeting);
        }
        let pool = &self.services.pool;
        let row = db::fetch_meeting(pool, meeting_id)
            .await?
            .filter(|row| row.closed_at.is_none())
            .ok_or_else(|| OrchestratorError::MeetingNotFound(meeting_id.to_string()))?;
        let participants: BTreeSet<UserRef> = db::fetch_members(pool, meeting_id, MemberRole::Participant)
            .await?
            .into_iter()
            .collect();
        let facilitators: BTreeSet<UserRef> = db::fetch_members(pool, meeting_id, MemberRole::Facilitator)
            .await?
            .into_iter()
            .collect();

        let mut agenda = Vec::new();
        let mut recovered = 0;
        for (i, mut activity) in db::fetch_activities(pool, meeting_id)
            .await?
            .into_iter()
            .enumerate()
        {
            let plugin = self
                .services
                .plugins
                .create(&activity.tool_type, &activity.config)?;
            activity.order_index = i as i64;
            if activity.status == ActivityStatus::InProgress {
                activity.status = ActivityStatus::Paused;
                db::update_activity(pool, &activity).await?;
                recovered += 1;
                warn!(activity_id = %activity.activity_id, "recovered running activity as paused");
            }
            agenda.push(AgendaEntry::new(activity, plugin, self.services.store.clone()));
        }

        let metadata = match row.metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        info!(activities = agenda.len(), recovered, "meeting hydrated");
        let meeting = self.remember(Meeting::from_parts(
            row.id,
            self.services.clone(),
            MeetingState {
                participants,
                facilitators,
                metadata,
                next_seq: row.next_seq,
                agenda,
                closed: false,
            },
        ));
        meeting.resync().await?;
        Ok(meeting)
    }

    /// Mark the meeting closed, then stop its timers and end its
    /// subscriptions. Handles still held elsewhere refuse every operation
    /// from here on.
    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    pub async fn close_meeting(&self, meeting_id: &str) -> Result<()> {
        let pool = &self.services.pool;
        if db::fetch_meeting(pool, meeting_id).await?.is_none() {
            return Err(OrchestratorError::MeetingNotFound(meeting_id.to_string()));
        }
        let live = self
            .meetings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(meeting_id);
        if let Some(meeting) = live {
            meeting.mark_closed().await;
        }
        self.services.autosave.cancel_meeting(meeting_id).await;
        self.services.broadcaster.close_meeting(meeting_id);
        db::mark_meeting_closed(pool, meeting_id).await?;
        info!("meeting closed");
        Ok(())
    }
}
