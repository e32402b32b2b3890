use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AttachmentId, ChatRoomId, MediaKind, MessageId, RecordVersion, UserId};

/// A message row as held by the record service. Identifier and creation
/// timestamp are assigned on the server side; the row is immutable once
/// created except for the soft-delete flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_room_id: ChatRoomId,
    pub author_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub chat_room_id: ChatRoomId,
    pub author_id: UserId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub message_id: MessageId,
    pub chat_room_id: ChatRoomId,
    pub kind: MediaKind,
    pub storage_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAttachment {
    pub message_id: MessageId,
    pub chat_room_id: ChatRoomId,
    pub kind: MediaKind,
    pub storage_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: ChatRoomId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<MessageId>,
    pub member_ids: Vec<UserId>,
    pub version: RecordVersion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_key: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

/// Membership join row linking a user to a chat room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserChatRoom {
    pub user_id: UserId,
    pub chat_room_id: ChatRoomId,
}

/// Partial-update event for a chat room. Carries only the changed fields
/// plus the new version token; absent fields leave the projection untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRoomPatch {
    pub id: ChatRoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_ids: Option<Vec<UserId>>,
    pub version: RecordVersion,
}

/// Result of a conditional mutation. A stale version surfaces as `Conflict`
/// so callers are forced to branch on it; it is never an error value.
#[must_use]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOutcome<T> {
    Applied(T),
    Conflict,
}

impl<T> MutationOutcome<T> {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}
