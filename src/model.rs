use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Participant identifier as issued by the host application.
pub type UserRef = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    NeverStarted,
    InProgress,
    Paused,
    Completed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::NeverStarted => "never_started",
            ActivityStatus::InProgress => "in_progress",
            ActivityStatus::Paused => "paused",
            ActivityStatus::Completed => "completed",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "never_started" => Some(ActivityStatus::NeverStarted),
            "in_progress" => Some(ActivityStatus::InProgress),
            "paused" => Some(ActivityStatus::Paused),
            "completed" => Some(ActivityStatus::Completed),
            _ => None,
        }
    }

    /// Non-terminal statuses that hold participants.
    pub fn is_active(&self) -> bool {
        matches!(self, ActivityStatus::InProgress | ActivityStatus::Paused)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BundleKind {
    Input,
    Draft,
    Output,
}

impl BundleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleKind::Input => "input",
            BundleKind::Draft => "draft",
            BundleKind::Output => "output",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "input" => Some(BundleKind::Input),
            "draft" => Some(BundleKind::Draft),
            "output" => Some(BundleKind::Output),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ParticipantScope {
    #[default]
    All,
    Custom {
        #[serde(default)]
        participant_ids: BTreeSet<UserRef>,
    },
}

impl ParticipantScope {
    pub fn custom<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UserRef>,
    {
        ParticipantScope::Custom {
            participant_ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub activity_id: String,
    pub meeting_id: String,
    pub tool_type: String,
    pub seq: i64,
    pub order_index: i64,
    pub config: Value,
    pub status: ActivityStatus,
    pub elapsed_ms: i64,
    pub participant_scope: ParticipantScope,
    pub started_at: Option<DateTime<Utc>>,
}

impl Activity {
    /// Activity ids are derived from meeting, tool type and the meeting's sequence counter.
    pub fn make_id(meeting_id: &str, tool_type: &str, seq: i64) -> String {
        format!("{}:{}:{}", meeting_id, tool_type, seq)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Participant,
    Facilitator,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Participant => "participant",
            MemberRole::Facilitator => "facilitator",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ActivityStatus::NeverStarted,
            ActivityStatus::InProgress,
            ActivityStatus::Paused,
            ActivityStatus::Completed,
        ] {
            assert_eq!(ActivityStatus::parse_state(status.as_str()), Some(status));
        }
        assert_eq!(ActivityStatus::parse_state("running"), None);
    }

    #[test]
    fn scope_wire_shape() {
        let all: ParticipantScope = serde_json::from_str(r#"{"mode":"all"}"#).unwrap();
        assert_eq!(all, ParticipantScope::All);

        let custom: ParticipantScope =
            serde_json::from_str(r#"{"mode":"custom","participant_ids":["u2","u1"]}"#).unwrap();
        assert_eq!(custom, ParticipantScope::custom(["u1", "u2"]));
    }

    #[test]
    fn activity_id_format() {
        assert_eq!(Activity::make_id("m1", "brainstorm", 3), "m1:brainstorm:3");
    }
}
