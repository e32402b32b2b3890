use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, error, warn};

use shared::{
    domain::{ChatRoomId, MessageId},
    protocol::Message,
};

use crate::RecordService;

const TIMELINE_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum TimelineUpdate {
    /// The snapshot query resolved and was merged into the sequence.
    SnapshotApplied,
    /// A new message was appended at the front of the sequence.
    MessageArrived(Message),
    /// The snapshot query failed; the sequence holds only event-delivered
    /// messages.
    SnapshotFailed { reason: String },
}

/// Merges one descending paginated snapshot with a live creation-event
/// stream into a single deduplicated, newest-first message sequence for one
/// chat room. The snapshot fetch and the subscription run concurrently; the
/// merge is an identifier-keyed union, so an event that races ahead of the
/// snapshot is never dropped.
pub struct TimelineReconciler {
    chat_room_id: ChatRoomId,
    service: Arc<dyn RecordService>,
    inner: Mutex<TimelineState>,
    updates: broadcast::Sender<TimelineUpdate>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct TimelineState {
    /// Newest first; ties on the creation timestamp break by identifier.
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
    snapshot_applied: bool,
    closed: bool,
}

impl TimelineReconciler {
    pub fn new(service: Arc<dyn RecordService>, chat_room_id: ChatRoomId) -> Arc<Self> {
        let (updates, _) = broadcast::channel(TIMELINE_EVENT_CAPACITY);
        Arc::new(Self {
            chat_room_id,
            service,
            inner: Mutex::new(TimelineState {
                messages: Vec::new(),
                seen: HashSet::new(),
                snapshot_applied: false,
                closed: false,
            }),
            updates,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn chat_room_id(&self) -> ChatRoomId {
        self.chat_room_id
    }

    /// Opens the room-filtered creation-event subscription, then issues the
    /// snapshot query; both feed the shared sequence from spawned tasks.
    /// The subscription is opened first so no creation event can fall into
    /// a gap between the two.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let receiver = self
            .service
            .subscribe_room_messages(self.chat_room_id)
            .await
            .context("failed to open message subscription")?;

        let client = Arc::clone(self);
        let event_task = tokio::spawn(async move {
            let mut stream = BroadcastStream::new(receiver);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(message) => client.apply_event(message).await,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(
                            "timeline: event stream lagged chat_room={} skipped={skipped}",
                            client.chat_room_id
                        );
                    }
                }
            }
        });

        let client = Arc::clone(self);
        let snapshot_task = tokio::spawn(async move {
            match client
                .service
                .list_room_messages_desc(client.chat_room_id)
                .await
            {
                Ok(items) => client.apply_snapshot(items).await,
                Err(err) => {
                    error!(
                        "timeline: snapshot query failed chat_room={} err={err:#}",
                        client.chat_room_id
                    );
                    let _ = client.updates.send(TimelineUpdate::SnapshotFailed {
                        reason: err.to_string(),
                    });
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(event_task);
        tasks.push(snapshot_task);
        Ok(())
    }

    /// Merges the snapshot with whatever events already arrived: union keyed
    /// on the message identifier, snapshot rows winning on overlap, sorted
    /// newest-first. Naive replacement would drop any event that raced
    /// ahead of the snapshot's resolution.
    pub async fn apply_snapshot(&self, items: Vec<Message>) {
        let mut guard = self.inner.lock().await;
        if guard.closed {
            return;
        }

        let mut merged: Vec<Message> = items.into_iter().filter(|m| !m.deleted).collect();
        let mut seen: HashSet<_> = merged.iter().map(|m| m.id).collect();
        for existing in guard.messages.drain(..) {
            if seen.insert(existing.id) {
                merged.push(existing);
            }
        }
        merged.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        debug!(
            "timeline: snapshot applied chat_room={} len={}",
            self.chat_room_id,
            merged.len()
        );
        guard.messages = merged;
        guard.seen = seen;
        guard.snapshot_applied = true;
        drop(guard);

        let _ = self.updates.send(TimelineUpdate::SnapshotApplied);
    }

    /// Handles one creation event. Idempotent: an identifier already in the
    /// sequence is absorbed silently, which covers the snapshot racing with
    /// a subscription event for the same message.
    pub async fn apply_event(&self, message: Message) {
        // Same tombstone rule as the snapshot path.
        if message.deleted {
            debug!(
                "timeline: deleted row dropped chat_room={} message={}",
                self.chat_room_id, message.id
            );
            return;
        }
        let mut guard = self.inner.lock().await;
        if guard.closed {
            return;
        }
        if !guard.seen.insert(message.id) {
            debug!(
                "timeline: duplicate event absorbed chat_room={} message={}",
                self.chat_room_id, message.id
            );
            return;
        }

        guard.messages.insert(0, message.clone());
        drop(guard);

        let _ = self.updates.send(TimelineUpdate::MessageArrived(message));
    }

    /// Current ordered sequence, newest first.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn snapshot_applied(&self) -> bool {
        self.inner.lock().await.snapshot_applied
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineUpdate> {
        self.updates.subscribe()
    }

    /// Revokes the subscription and the snapshot-in-flight; anything
    /// delivered afterwards is dropped.
    pub async fn shutdown(&self) {
        {
            let mut guard = self.inner.lock().await;
            guard.closed = true;
        }
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        debug!("timeline: shut down chat_room={}", self.chat_room_id);
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
