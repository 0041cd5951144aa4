//! JSON command surface for the control plane.
//!
//! Commands arrive as `{meeting_id, actor, command}` envelopes, are checked
//! against the actor's role, and are answered with either the resulting
//! snapshot, a command-specific result, or a structured error.

use crate::broadcast::MeetingSnapshot;
use crate::bundle::Item;
use crate::error::{OrchestratorError, Result};
use crate::model::{ParticipantScope, UserRef};
use crate::registry::MeetingRegistry;
use crate::transfer::{CommitRequest, TransferEngine, TransferOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument};

fn default_profile() -> String {
    "standard".to_string()
}

fn default_config() -> Value {
    json!({})
}

/// Optional command metadata. Scope travels as `participantScope`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandMetadata {
    #[serde(rename = "participantScope", default)]
    pub participant_scope: Option<ParticipantScope>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    StartTool {
        activity_id: String,
        #[serde(default)]
        metadata: CommandMetadata,
    },
    PauseTool {
        activity_id: String,
    },
    ResumeTool {
        activity_id: String,
    },
    StopTool {
        activity_id: String,
    },
    DeleteTool {
        activity_id: String,
    },
    AddTool {
        tool_type: String,
        #[serde(default = "default_config")]
        config: Value,
        #[serde(default)]
        metadata: CommandMetadata,
    },
    ReorderAgenda {
        ordered_ids: Vec<String>,
    },
    /// A missing `participantScope` resets the activity to `all`.
    SetScope {
        activity_id: String,
        #[serde(default)]
        metadata: CommandMetadata,
    },
    SetParticipants {
        participant_ids: Vec<UserRef>,
    },
    SetFacilitators {
        facilitator_ids: Vec<UserRef>,
    },
    SetMetadata {
        metadata: Map<String, Value>,
    },
    ToolAction {
        activity_id: String,
        action: Value,
    },
    StateRequest,
    TransferLoad {
        donor_activity_id: String,
        #[serde(default = "default_profile")]
        transform_profile: String,
        #[serde(default)]
        options: TransferOptions,
    },
    TransferSaveDraft {
        donor_activity_id: String,
        items: Vec<Item>,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(default)]
        round_index: Option<i64>,
    },
    TransferCommit(CommitRequest),
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::StartTool { .. } => "start_tool",
            ControlCommand::PauseTool { .. } => "pause_tool",
            ControlCommand::ResumeTool { .. } => "resume_tool",
            ControlCommand::StopTool { .. } => "stop_tool",
            ControlCommand::DeleteTool { .. } => "delete_tool",
            ControlCommand::AddTool { .. } => "add_tool",
            ControlCommand::ReorderAgenda { .. } => "reorder_agenda",
            ControlCommand::SetScope { .. } => "set_scope",
            ControlCommand::SetParticipants { .. } => "set_participants",
            ControlCommand::SetFacilitators { .. } => "set_facilitators",
            ControlCommand::SetMetadata { .. } => "set_metadata",
            ControlCommand::ToolAction { .. } => "tool_action",
            ControlCommand::StateRequest => "state_request",
            ControlCommand::TransferLoad { .. } => "transfer_load",
            ControlCommand::TransferSaveDraft { .. } => "transfer_save_draft",
            ControlCommand::TransferCommit(_) => "transfer_commit",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    pub meeting_id: String,
    pub actor: UserRef,
    pub command: ControlCommand,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Arc<MeetingSnapshot>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl CommandResponse {
    fn with_snapshot(snapshot: Arc<MeetingSnapshot>) -> Self {
        Self {
            ok: true,
            snapshot: Some(snapshot),
            result: None,
            error: None,
        }
    }

    fn with_result(result: Value) -> Self {
        Self {
            ok: true,
            snapshot: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(err: &OrchestratorError) -> Self {
        Self {
            ok: false,
            snapshot: None,
            result: None,
            error: Some(err.to_json()),
        }
    }
}

/// One line of the binary's stdin protocol.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Inbound {
    CreateMeeting {
        meeting_id: String,
        #[serde(default)]
        participant_ids: Vec<UserRef>,
        #[serde(default)]
        facilitator_ids: Vec<UserRef>,
    },
    CloseMeeting {
        meeting_id: String,
        actor: UserRef,
    },
    Subscribe {
        meeting_id: String,
        client_ref: String,
    },
    Unsubscribe {
        meeting_id: String,
        client_ref: String,
    },
    Command(CommandEnvelope),
}

fn to_result<T: Serialize>(value: &T) -> Result<CommandResponse> {
    let value = serde_json::to_value(value).map_err(anyhow::Error::from)?;
    Ok(CommandResponse::with_result(value))
}

/// Run one control command and describe the outcome. Errors are returned in
/// the response body, never as a failed call.
#[instrument(skip_all, fields(meeting_id = %envelope.meeting_id, actor = %envelope.actor, command = envelope.command.name()))]
pub async fn handle_command(
    registry: &MeetingRegistry,
    transfers: &TransferEngine,
    envelope: CommandEnvelope,
) -> CommandResponse {
    match dispatch(registry, transfers, envelope).await {
        Ok(response) => {
            debug!("command applied");
            response
        }
        Err(err) => {
            info!(code = err.code(), error = %err, "command rejected");
            CommandResponse::failure(&err)
        }
    }
}

async fn dispatch(
    registry: &MeetingRegistry,
    transfers: &TransferEngine,
    envelope: CommandEnvelope,
) -> Result<CommandResponse> {
    let CommandEnvelope {
        meeting_id,
        actor,
        command,
    } = envelope;
    let meeting = registry.open_meeting(&meeting_id).await?;

    let allowed = match &command {
        ControlCommand::StateRequest => meeting.is_member(&actor).await,
        ControlCommand::ToolAction { activity_id, .. } => meeting.can_act_in(&actor, activity_id).await,
        _ => meeting.is_facilitator(&actor).await,
    };
    if !allowed {
        return Err(OrchestratorError::Forbidden(actor));
    }

    let response = match command {
        ControlCommand::StartTool {
            activity_id,
            metadata,
        } => CommandResponse::with_snapshot(meeting.start(&activity_id, metadata.participant_scope).await?),
        ControlCommand::PauseTool { activity_id } => {
            CommandResponse::with_snapshot(meeting.pause(&activity_id).await?)
        }
        ControlCommand::ResumeTool { activity_id } => {
            CommandResponse::with_snapshot(meeting.resume(&activity_id).await?)
        }
        ControlCommand::StopTool { activity_id } => {
            CommandResponse::with_snapshot(meeting.stop(&activity_id).await?)
        }
        ControlCommand::DeleteTool { activity_id } => {
            CommandResponse::with_snapshot(meeting.delete(&activity_id).await?)
        }
        ControlCommand::AddTool {
            tool_type,
            config,
            metadata,
        } => {
            let activity = meeting
                .add_activity(&tool_type, config, metadata.participant_scope.unwrap_or_default())
                .await?;
            to_result(&activity)?
        }
        ControlCommand::ReorderAgenda { ordered_ids } => {
            CommandResponse::with_snapshot(meeting.reorder(&ordered_ids).await?)
        }
        ControlCommand::SetScope {
            activity_id,
            metadata,
        } => CommandResponse::with_snapshot(
            meeting
                .set_scope(&activity_id, metadata.participant_scope.unwrap_or_default())
                .await?,
        ),
        ControlCommand::SetParticipants { participant_ids } => {
            CommandResponse::with_snapshot(meeting.set_participants(participant_ids).await?)
        }
        ControlCommand::SetFacilitators { facilitator_ids } => {
            CommandResponse::with_snapshot(meeting.set_facilitators(facilitator_ids).await?)
        }
        ControlCommand::SetMetadata { metadata } => {
            CommandResponse::with_snapshot(meeting.set_metadata(metadata).await?)
        }
        ControlCommand::ToolAction {
            activity_id,
            action,
        } => CommandResponse::with_result(meeting.tool_action(&activity_id, action).await?),
        ControlCommand::StateRequest => CommandResponse::with_snapshot(meeting.resync().await?),
        ControlCommand::TransferLoad {
            donor_activity_id,
            transform_profile,
            options,
        } => {
            let draft = transfers
                .load_bundle(&meeting, &donor_activity_id, &transform_profile, options)
                .await?;
            to_result(&draft)?
        }
        ControlCommand::TransferSaveDraft {
            donor_activity_id,
            items,
            metadata,
            round_index,
        } => {
            let draft = transfers
                .save_draft(&meeting, &donor_activity_id, items, metadata, round_index)
                .await?;
            to_result(&draft)?
        }
        ControlCommand::TransferCommit(request) => {
            let activity = transfers.commit(&meeting, request).await?;
            to_result(&activity)?
        }
    };
    Ok(response)
}
