//! Error taxonomy for control-plane operations.

use crate::model::{ActivityStatus, UserRef};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// A participant that is already live in another active activity.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConflictingUser {
    pub user_id: UserRef,
    pub activity_id: String,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("participants already assigned to active activity {active_activity_id}")]
    ScopeConflict {
        conflicting_users: Vec<ConflictingUser>,
        active_activity_id: String,
    },

    #[error("cannot {action} activity {activity_id} while {from}")]
    InvalidTransition {
        activity_id: String,
        from: &'static str,
        action: &'static str,
    },

    #[error("plugin {stage} failed for activity {activity_id}: {source}")]
    PluginLifecycleFailure {
        activity_id: String,
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("activity {0} does not exist")]
    StaleReference(String),

    #[error("transform profile {profile} failed: {reason}")]
    TransformFailure { profile: String, reason: String },

    #[error("invalid agenda order: {0}")]
    InvalidReorder(String),

    #[error("no plugin registered for tool type {0}")]
    UnknownTool(String),

    #[error("invalid tool type name: {0}")]
    InvalidToolType(String),

    #[error("meeting {0} not found")]
    MeetingNotFound(String),

    #[error("meeting {0} already exists")]
    MeetingExists(String),

    #[error("{0} is not a facilitator of this meeting")]
    Forbidden(UserRef),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

impl OrchestratorError {
    pub(crate) fn invalid_transition(
        activity_id: &str,
        from: ActivityStatus,
        action: &'static str,
    ) -> Self {
        OrchestratorError::InvalidTransition {
            activity_id: activity_id.to_string(),
            from: from.as_str(),
            action,
        }
    }

    pub(crate) fn plugin(activity_id: &str, stage: &'static str, source: anyhow::Error) -> Self {
        OrchestratorError::PluginLifecycleFailure {
            activity_id: activity_id.to_string(),
            stage,
            source,
        }
    }

    /// Stable machine-readable code for the command surface.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::ScopeConflict { .. } => "scope_conflict",
            OrchestratorError::InvalidTransition { .. } => "invalid_transition",
            OrchestratorError::PluginLifecycleFailure { .. } => "plugin_lifecycle_failure",
            OrchestratorError::StaleReference(_) => "stale_reference",
            OrchestratorError::TransformFailure { .. } => "transform_failure",
            OrchestratorError::InvalidReorder(_) => "invalid_reorder",
            OrchestratorError::UnknownTool(_) => "unknown_tool",
            OrchestratorError::InvalidToolType(_) => "invalid_tool_type",
            OrchestratorError::MeetingNotFound(_) => "meeting_not_found",
            OrchestratorError::MeetingExists(_) => "meeting_exists",
            OrchestratorError::Forbidden(_) => "forbidden",
            OrchestratorError::Storage(_) => "storage",
        }
    }

    /// Only errors the facilitator can act on carry detail; the rest degrade
    /// to a generic message.
    pub fn user_message(&self) -> String {
        match self {
            OrchestratorError::ScopeConflict { .. }
            | OrchestratorError::InvalidTransition { .. }
            | OrchestratorError::InvalidReorder(_)
            | OrchestratorError::Forbidden(_) => self.to_string(),
            _ => "unable to update activity".to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "code": self.code(),
            "message": self.user_message(),
        });
        if let OrchestratorError::ScopeConflict {
            conflicting_users,
            active_activity_id,
        } = self
        {
            body["conflicting_users"] = json!(conflicting_users);
            body["active_activity_id"] = json!(active_activity_id);
        }
        body
    }
}
