use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

use shared::{
    domain::{ChatRoomId, MessageId, RecordVersion, UserId},
    protocol::{
        Attachment, ChatRoom, ChatRoomPatch, Message, MutationOutcome, NewAttachment, NewMessage,
        User, UserChatRoom,
    },
};

pub mod memory;
pub mod projector;
pub mod send;
pub mod timeline;
pub mod upload;

pub use projector::ChatRoomProjector;
pub use send::{SendError, SendPhase, SendPipeline, SendReport, SendStatus};
pub use timeline::{TimelineReconciler, TimelineUpdate};
pub use upload::{AttachmentUploadCoordinator, MediaItem, UploadError, UploadedMedia};

/// The authenticated identity this client acts as. The subject id equals the
/// stable user record identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: UserId,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no authenticated session")]
    Unauthenticated,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_identity(&self) -> Result<Identity, IdentityError>;
}

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("upload failed for key {key}: {reason}")]
    UploadFailed { key: String, reason: String },
}

/// Durable blob storage. `put` returns only once the write is confirmed;
/// a failed put leaves nothing registered under the key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str)
        -> Result<(), BlobStoreError>;
}

/// Abstract versioned record service: queries, mutations and room-filtered
/// subscriptions. Transport errors come back as plain errors; a stale
/// version on a conditional mutation comes back as
/// [`MutationOutcome::Conflict`], never as an error.
#[async_trait]
pub trait RecordService: Send + Sync {
    async fn fetch_chat_room(&self, id: ChatRoomId) -> Result<ChatRoom>;

    /// Snapshot query for a room's messages, sorted descending by creation
    /// order (service-side sort).
    async fn list_room_messages_desc(&self, chat_room_id: ChatRoomId) -> Result<Vec<Message>>;

    async fn list_users(&self) -> Result<Vec<User>>;

    /// Creates a message; the service assigns the identifier and timestamp.
    async fn create_message(&self, input: NewMessage) -> Result<Message>;

    /// Creates an attachment row. Fails if the referenced message does not
    /// exist.
    async fn create_attachment(&self, input: NewAttachment) -> Result<Attachment>;

    async fn create_chat_room(&self, name: &str) -> Result<ChatRoom>;

    async fn create_user_chat_room(
        &self,
        chat_room_id: ChatRoomId,
        user_id: UserId,
    ) -> Result<UserChatRoom>;

    /// Conditionally points the room at a new last message. The presented
    /// version must match the room's current version or the call reports a
    /// conflict without mutating anything.
    async fn update_last_message(
        &self,
        chat_room_id: ChatRoomId,
        last_message_id: MessageId,
        expected_version: RecordVersion,
    ) -> Result<MutationOutcome<ChatRoom>>;

    /// Subscribes to creation events for one room. Events arrive in
    /// creation order; dropping the receiver revokes the subscription.
    async fn subscribe_room_messages(
        &self,
        chat_room_id: ChatRoomId,
    ) -> Result<broadcast::Receiver<Message>>;

    /// Subscribes to partial-update events for one room.
    async fn subscribe_room_updates(
        &self,
        chat_room_id: ChatRoomId,
    ) -> Result<broadcast::Receiver<ChatRoomPatch>>;
}

/// Creates a group chat room and joins every selected member plus the
/// creator, mirroring the group-creation flow of the app: the room first,
/// then one membership row per user, concurrently.
pub async fn create_group_chat(
    service: &dyn RecordService,
    identity: &dyn IdentityProvider,
    name: &str,
    member_ids: &[UserId],
) -> Result<ChatRoom> {
    let name = name.trim();
    if name.is_empty() {
        bail!("group name is empty");
    }
    if member_ids.is_empty() {
        bail!("a group needs at least one member besides the creator");
    }

    let creator = identity.current_identity().await?;
    let room = service
        .create_chat_room(name)
        .await
        .context("failed to create chat room")?;

    let joins = member_ids
        .iter()
        .copied()
        .chain(std::iter::once(creator.subject_id))
        .map(|user_id| service.create_user_chat_room(room.id, user_id));
    for joined in future::join_all(joins).await {
        joined.context("failed to add member to chat room")?;
    }

    info!(
        "group: created chat_room={} name={} members={}",
        room.id,
        room.name,
        member_ids.len() + 1
    );
    Ok(room)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
