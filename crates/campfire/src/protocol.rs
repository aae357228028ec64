use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ChatMessage, MessageId, Millis, Participant, SessionSnapshot, TabId, UserId};

/// Partial roster entry keyed by `id`. Absent fields leave the target
/// untouched; an update for an unknown id is dropped by receivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantUpdate {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<Millis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
}

impl ParticipantUpdate {
    pub fn full(participant: &Participant) -> Self {
        Self {
            id: participant.id.clone(),
            display_name: Some(participant.display_name.clone()),
            last_activity: Some(participant.last_activity),
            tab_id: Some(participant.tab_id.clone()),
        }
    }

    pub fn apply_to(&self, target: &mut Participant) {
        if let Some(display_name) = &self.display_name {
            target.display_name = display_name.clone();
        }
        if let Some(last_activity) = self.last_activity {
            target.touch(last_activity);
        }
        if let Some(tab_id) = &self.tab_id {
            target.tab_id = tab_id.clone();
        }
    }
}

/// Everything replicas say to each other. The sending tab's id travels as
/// bus-frame metadata, not inside the event, so only `SendMessage` and
/// `UpdateCounter` payloads are ever inspected for origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Join(Participant),
    Leave {
        user_id: UserId,
    },
    ParticipantUpdate(ParticipantUpdate),
    SendMessage(ChatMessage),
    RemoveMessage {
        message_id: MessageId,
        user_id: UserId,
    },
    UpdateCounter {
        value: i64,
        user_id: UserId,
        display_name: String,
    },
    BeginTyping {
        user_id: UserId,
    },
    EndTyping {
        user_id: UserId,
    },
    RequestSync {
        requester_id: UserId,
    },
    SyncState(SessionSnapshot),
    #[serde(other)]
    Unknown,
}

impl SyncEvent {
    /// Wire tag of the event, for logging and traffic inspection.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::Join(_) => "join",
            SyncEvent::Leave { .. } => "leave",
            SyncEvent::ParticipantUpdate(_) => "participant_update",
            SyncEvent::SendMessage(_) => "send_message",
            SyncEvent::RemoveMessage { .. } => "remove_message",
            SyncEvent::UpdateCounter { .. } => "update_counter",
            SyncEvent::BeginTyping { .. } => "begin_typing",
            SyncEvent::EndTyping { .. } => "end_typing",
            SyncEvent::RequestSync { .. } => "request_sync",
            SyncEvent::SyncState(_) => "sync_state",
            SyncEvent::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn encode_event(event: &SyncEvent) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(event)
        .map(Bytes::from)
        .map_err(ProtocolError::Encode)
}

pub fn decode_event(bytes: &[u8]) -> Result<SyncEvent, ProtocolError> {
    serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
}
