//! In-memory collaborators for tests and the console demo. The record
//! service honors the same contract a remote backend would: server-assigned
//! identifiers and timestamps, per-room event feeds, attachment creation
//! rejected for unknown messages, and conditional mutations that report a
//! conflict on a stale version instead of merging.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use shared::{
    domain::{AttachmentId, ChatRoomId, MessageId, RecordVersion, UserId},
    protocol::{
        Attachment, ChatRoom, ChatRoomPatch, Message, MutationOutcome, NewAttachment, NewMessage,
        User, UserChatRoom,
    },
};

use crate::{
    BlobStore, BlobStoreError, Identity, IdentityError, IdentityProvider, RecordService,
};

const FEED_CAPACITY: usize = 256;

#[derive(Default)]
struct ServiceState {
    rooms: HashMap<ChatRoomId, ChatRoom>,
    messages: HashMap<MessageId, Message>,
    attachments: HashMap<AttachmentId, Attachment>,
    users: HashMap<UserId, User>,
    memberships: Vec<UserChatRoom>,
    message_feeds: HashMap<ChatRoomId, broadcast::Sender<Message>>,
    room_feeds: HashMap<ChatRoomId, broadcast::Sender<ChatRoomPatch>>,
}

impl ServiceState {
    fn message_feed(&mut self, chat_room_id: ChatRoomId) -> broadcast::Sender<Message> {
        self.message_feeds
            .entry(chat_room_id)
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    fn room_feed(&mut self, chat_room_id: ChatRoomId) -> broadcast::Sender<ChatRoomPatch> {
        self.room_feeds
            .entry(chat_room_id)
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }
}

#[derive(Default)]
pub struct InMemoryRecordService {
    state: Mutex<ServiceState>,
}

impl InMemoryRecordService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_user(&self, user: User) {
        self.state.lock().await.users.insert(user.id, user);
    }

    /// Inserts a message row without emitting a creation event, so tests can
    /// populate the snapshot side independently of the event stream.
    pub async fn seed_message(&self, message: Message) {
        self.state.lock().await.messages.insert(message.id, message);
    }

    pub async fn room(&self, id: ChatRoomId) -> Option<ChatRoom> {
        self.state.lock().await.rooms.get(&id).cloned()
    }

    pub async fn attachments_for(&self, message_id: MessageId) -> Vec<Attachment> {
        self.state
            .lock()
            .await
            .attachments
            .values()
            .filter(|a| a.message_id == message_id)
            .cloned()
            .collect()
    }

    pub async fn membership_rows(&self, chat_room_id: ChatRoomId) -> Vec<UserChatRoom> {
        self.state
            .lock()
            .await
            .memberships
            .iter()
            .filter(|m| m.chat_room_id == chat_room_id)
            .cloned()
            .collect()
    }

    pub async fn message_count(&self) -> usize {
        self.state.lock().await.messages.len()
    }
}

#[async_trait]
impl RecordService for InMemoryRecordService {
    async fn fetch_chat_room(&self, id: ChatRoomId) -> Result<ChatRoom> {
        let state = self.state.lock().await;
        match state.rooms.get(&id) {
            Some(room) => Ok(room.clone()),
            None => bail!("chat room {id} not found"),
        }
    }

    async fn list_room_messages_desc(&self, chat_room_id: ChatRoomId) -> Result<Vec<Message>> {
        let state = self.state.lock().await;
        let mut items: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.chat_room_id == chat_room_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(items)
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.state.lock().await.users.values().cloned().collect())
    }

    async fn create_message(&self, input: NewMessage) -> Result<Message> {
        let mut state = self.state.lock().await;
        if !state.rooms.contains_key(&input.chat_room_id) {
            bail!("chat room {} not found", input.chat_room_id);
        }

        let message = Message {
            id: MessageId::random(),
            chat_room_id: input.chat_room_id,
            author_id: input.author_id,
            text: input.text,
            created_at: Utc::now(),
            deleted: false,
        };
        state.messages.insert(message.id, message.clone());
        let _ = state.message_feed(message.chat_room_id).send(message.clone());
        Ok(message)
    }

    async fn create_attachment(&self, input: NewAttachment) -> Result<Attachment> {
        let mut state = self.state.lock().await;
        if !state.messages.contains_key(&input.message_id) {
            bail!("message {} not found", input.message_id);
        }

        let attachment = Attachment {
            id: AttachmentId::random(),
            message_id: input.message_id,
            chat_room_id: input.chat_room_id,
            kind: input.kind,
            storage_key: input.storage_key,
            width: input.width,
            height: input.height,
            duration_seconds: input.duration_seconds,
        };
        state.attachments.insert(attachment.id, attachment.clone());
        Ok(attachment)
    }

    async fn create_chat_room(&self, name: &str) -> Result<ChatRoom> {
        let mut state = self.state.lock().await;
        let room = ChatRoom {
            id: ChatRoomId::random(),
            name: name.to_owned(),
            last_message_id: None,
            member_ids: Vec::new(),
            version: RecordVersion::INITIAL,
        };
        state.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn create_user_chat_room(
        &self,
        chat_room_id: ChatRoomId,
        user_id: UserId,
    ) -> Result<UserChatRoom> {
        let mut state = self.state.lock().await;
        let Some(room) = state.rooms.get_mut(&chat_room_id) else {
            bail!("chat room {chat_room_id} not found");
        };

        if !room.member_ids.contains(&user_id) {
            room.member_ids.push(user_id);
            room.version = room.version.next();
            let patch = ChatRoomPatch {
                id: chat_room_id,
                name: None,
                last_message_id: None,
                member_ids: Some(room.member_ids.clone()),
                version: room.version,
            };
            let _ = state.room_feed(chat_room_id).send(patch);
        }

        let membership = UserChatRoom {
            user_id,
            chat_room_id,
        };
        // Joining twice is idempotent: no second membership row.
        if !state.memberships.contains(&membership) {
            state.memberships.push(membership.clone());
        }
        Ok(membership)
    }

    async fn update_last_message(
        &self,
        chat_room_id: ChatRoomId,
        last_message_id: MessageId,
        expected_version: RecordVersion,
    ) -> Result<MutationOutcome<ChatRoom>> {
        let mut state = self.state.lock().await;
        if !state.messages.contains_key(&last_message_id) {
            bail!("message {last_message_id} not found");
        }
        let Some(room) = state.rooms.get_mut(&chat_room_id) else {
            bail!("chat room {chat_room_id} not found");
        };

        if room.version != expected_version {
            debug!(
                "record: pointer update conflict chat_room={chat_room_id} presented={:?} current={:?}",
                expected_version, room.version
            );
            return Ok(MutationOutcome::Conflict);
        }

        room.last_message_id = Some(last_message_id);
        room.version = room.version.next();
        let updated = room.clone();
        let patch = ChatRoomPatch {
            id: chat_room_id,
            name: None,
            last_message_id: Some(last_message_id),
            member_ids: None,
            version: updated.version,
        };
        let _ = state.room_feed(chat_room_id).send(patch);
        Ok(MutationOutcome::Applied(updated))
    }

    async fn subscribe_room_messages(
        &self,
        chat_room_id: ChatRoomId,
    ) -> Result<broadcast::Receiver<Message>> {
        Ok(self.state.lock().await.message_feed(chat_room_id).subscribe())
    }

    async fn subscribe_room_updates(
        &self,
        chat_room_id: ChatRoomId,
    ) -> Result<broadcast::Receiver<ChatRoomPatch>> {
        Ok(self.state.lock().await.room_feed(chat_room_id).subscribe())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<HashMap<String, StoredBlob>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn object(&self, key: &str) -> Option<StoredBlob> {
        self.objects.lock().await.get(key).cloned()
    }

    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), BlobStoreError> {
        self.objects.lock().await.insert(
            key.to_owned(),
            StoredBlob {
                bytes: bytes.to_vec(),
                content_type: content_type.to_owned(),
            },
        );
        Ok(())
    }
}

/// Identity provider with a fixed signed-in subject.
pub struct StaticIdentity {
    subject_id: UserId,
}

impl StaticIdentity {
    pub fn new(subject_id: UserId) -> Self {
        Self { subject_id }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_identity(&self) -> Result<Identity, IdentityError> {
        Ok(Identity {
            subject_id: self.subject_id,
        })
    }
}
