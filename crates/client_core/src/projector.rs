use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::{
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

use shared::{
    domain::ChatRoomId,
    protocol::{ChatRoom, ChatRoomPatch},
};

use crate::RecordService;

const PROJECTOR_EVENT_CAPACITY: usize = 256;

/// Maintains one chat room's projection from an initial fetch plus a
/// partial-update event stream. Patches shallow-merge into the held record:
/// absent fields stay untouched, and the patch's version token is adopted.
/// The send pipeline reads the version token from here before mutating.
pub struct ChatRoomProjector {
    chat_room_id: ChatRoomId,
    service: Arc<dyn RecordService>,
    inner: RwLock<ProjectorState>,
    updates: broadcast::Sender<ChatRoom>,
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

struct ProjectorState {
    room: Option<ChatRoom>,
    /// Patches that arrived before the initial fetch resolved; replayed in
    /// version order once it does. Single-entity analogue of the timeline's
    /// union rule.
    pending: Vec<ChatRoomPatch>,
    closed: bool,
}

impl ChatRoomProjector {
    pub fn new(service: Arc<dyn RecordService>, chat_room_id: ChatRoomId) -> Arc<Self> {
        let (updates, _) = broadcast::channel(PROJECTOR_EVENT_CAPACITY);
        Arc::new(Self {
            chat_room_id,
            service,
            inner: RwLock::new(ProjectorState {
                room: None,
                pending: Vec::new(),
                closed: false,
            }),
            updates,
            tasks: RwLock::new(Vec::new()),
        })
    }

    pub fn chat_room_id(&self) -> ChatRoomId {
        self.chat_room_id
    }

    /// Opens the update subscription, then fetches the current record. The
    /// subscription comes first so no update can slip between fetch and
    /// subscribe; a patch delivered before the fetch resolves is buffered.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let receiver = self
            .service
            .subscribe_room_updates(self.chat_room_id)
            .await
            .context("failed to open room update subscription")?;

        let client = Arc::clone(self);
        let patch_task = tokio::spawn(async move {
            let mut stream = BroadcastStream::new(receiver);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(patch) => client.apply_patch(patch).await,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(
                            "projector: update stream lagged chat_room={} skipped={skipped}",
                            client.chat_room_id
                        );
                    }
                }
            }
        });
        self.tasks.write().await.push(patch_task);

        let room = self
            .service
            .fetch_chat_room(self.chat_room_id)
            .await
            .context("failed to fetch chat room")?;
        self.apply_fetched(room).await;
        Ok(())
    }

    /// Installs the initially fetched record, then replays any buffered
    /// patches that are newer than it.
    pub async fn apply_fetched(&self, fetched: ChatRoom) {
        let mut guard = self.inner.write().await;
        if guard.closed {
            return;
        }

        let mut room = fetched;
        let mut pending = std::mem::take(&mut guard.pending);
        pending.sort_by_key(|patch| patch.version);
        for patch in pending {
            if patch.version > room.version {
                merge_patch(&mut room, patch);
            }
        }

        debug!(
            "projector: loaded chat_room={} version={:?}",
            room.id, room.version
        );
        guard.room = Some(room.clone());
        drop(guard);

        let _ = self.updates.send(room);
    }

    /// Shallow-merges one partial-update event. Patches at or below the held
    /// version are stale duplicates and are ignored; patches arriving before
    /// the fetch resolved are buffered.
    pub async fn apply_patch(&self, patch: ChatRoomPatch) {
        let mut guard = self.inner.write().await;
        if guard.closed {
            return;
        }

        let merged = match guard.room.as_mut() {
            Some(room) => {
                if patch.version <= room.version {
                    debug!(
                        "projector: stale patch ignored chat_room={} version={:?}",
                        self.chat_room_id, patch.version
                    );
                    return;
                }
                merge_patch(room, patch);
                room.clone()
            }
            None => {
                guard.pending.push(patch);
                return;
            }
        };
        drop(guard);

        let _ = self.updates.send(merged);
    }

    /// Current projection; `None` until the initial fetch resolved.
    pub async fn current(&self) -> Option<ChatRoom> {
        self.inner.read().await.room.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatRoom> {
        self.updates.subscribe()
    }

    pub async fn shutdown(&self) {
        {
            let mut guard = self.inner.write().await;
            guard.closed = true;
        }
        let mut tasks = self.tasks.write().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        debug!("projector: shut down chat_room={}", self.chat_room_id);
    }
}

fn merge_patch(room: &mut ChatRoom, patch: ChatRoomPatch) {
    if let Some(name) = patch.name {
        room.name = name;
    }
    if let Some(last_message_id) = patch.last_message_id {
        room.last_message_id = Some(last_message_id);
    }
    if let Some(member_ids) = patch.member_ids {
        room.member_ids = member_ids;
    }
    room.version = patch.version;
}

#[cfg(test)]
#[path = "tests/projector_tests.rs"]
mod tests;
