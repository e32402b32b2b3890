use std::sync::Arc;

use futures::future;
use thiserror::Error;
use tracing::{debug, info, warn};

use shared::{
    domain::{ChatRoomId, MessageId},
    protocol::{NewAttachment, NewMessage},
};

use crate::{
    projector::ChatRoomProjector,
    upload::{AttachmentUploadCoordinator, MediaItem},
    BlobStore, IdentityError, IdentityProvider, RecordService,
};

/// Phases of one send attempt. Every phase after `Composing` can fail; the
/// report records how far the attempt got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Composing,
    Submitting,
    UploadingAttachments,
    LinkingAttachments,
    UpdatingRoomPointer,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Done,
    /// The message itself was created; the listed media indices failed to
    /// upload or link and can be retried independently.
    PartialFailure(Vec<usize>),
    /// The room pointer update presented a stale version token and was
    /// rejected. Never auto-retried: a blind re-read-and-write could
    /// overwrite a pointer set by a genuinely newer concurrent send.
    StaleRoomState,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub status: SendStatus,
    /// `Some` once the message was durably created, which is the caller's
    /// signal that composition state may be cleared even if later steps
    /// failed.
    pub message_id: Option<MessageId>,
    pub phase_reached: SendPhase,
}

/// Failures that abort the attempt outright. Each variant names the step so
/// the caller can retry that step alone rather than the whole send.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("no authenticated session")]
    Unauthenticated(#[from] IdentityError),
    #[error("message submission failed")]
    Submit(#[source] anyhow::Error),
    #[error("room projection not loaded for {chat_room_id}")]
    RoomUnavailable { chat_room_id: ChatRoomId },
    #[error("room pointer update failed after message {message_id} was created")]
    PointerUpdate {
        message_id: MessageId,
        #[source]
        source: anyhow::Error,
    },
}

/// The sole write path: message creation, concurrent attachment upload and
/// linking, then the room's last-message pointer update under optimistic
/// concurrency. The steps are not one transaction; partial failure is a
/// first-class outcome, not a rollback.
pub struct SendPipeline {
    service: Arc<dyn RecordService>,
    identity: Arc<dyn IdentityProvider>,
    uploads: AttachmentUploadCoordinator,
    projector: Arc<ChatRoomProjector>,
    chat_room_id: ChatRoomId,
}

impl SendPipeline {
    pub fn new(
        service: Arc<dyn RecordService>,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn BlobStore>,
        projector: Arc<ChatRoomProjector>,
    ) -> Self {
        let chat_room_id = projector.chat_room_id();
        Self {
            service,
            identity,
            uploads: AttachmentUploadCoordinator::new(store),
            projector,
            chat_room_id,
        }
    }

    pub async fn send(&self, text: &str, media: &[MediaItem]) -> Result<SendReport, SendError> {
        let mut phase = SendPhase::Composing;

        let body = text.trim();
        if body.is_empty() {
            debug!("send: rejected empty body chat_room={}", self.chat_room_id);
            return Ok(SendReport {
                status: SendStatus::Rejected {
                    reason: "message body is empty".to_owned(),
                },
                message_id: None,
                phase_reached: phase,
            });
        }

        let identity = self.identity.current_identity().await?;

        phase = SendPhase::Submitting;
        debug!("send: phase={phase:?} chat_room={}", self.chat_room_id);
        let message = self
            .service
            .create_message(NewMessage {
                chat_room_id: self.chat_room_id,
                author_id: identity.subject_id,
                text: body.to_owned(),
            })
            .await
            .map_err(SendError::Submit)?;
        info!(
            "send: message created id={} chat_room={}",
            message.id, self.chat_room_id
        );

        phase = SendPhase::UploadingAttachments;
        debug!("send: phase={phase:?} items={}", media.len());
        let mut failed: Vec<usize> = Vec::new();
        let mut uploaded = Vec::new();
        for (index, result) in self.uploads.upload_all(media).await.into_iter().enumerate() {
            match result {
                Ok(item) => uploaded.push((index, item)),
                Err(err) => {
                    warn!("send: attachment upload failed index={index} err={err}");
                    failed.push(index);
                }
            }
        }

        phase = SendPhase::LinkingAttachments;
        debug!("send: phase={phase:?} uploaded={}", uploaded.len());
        let links = uploaded.into_iter().map(|(index, item)| {
            let input = NewAttachment {
                message_id: message.id,
                chat_room_id: self.chat_room_id,
                kind: item.kind,
                storage_key: item.storage_key,
                width: item.width,
                height: item.height,
                duration_seconds: item.duration_seconds,
            };
            async move { (index, self.service.create_attachment(input).await) }
        });
        for (index, result) in future::join_all(links).await {
            if let Err(err) = result {
                warn!("send: attachment link failed index={index} err={err:#}");
                failed.push(index);
            }
        }
        failed.sort_unstable();

        phase = SendPhase::UpdatingRoomPointer;
        debug!("send: phase={phase:?} chat_room={}", self.chat_room_id);
        let room = self
            .projector
            .current()
            .await
            .ok_or(SendError::RoomUnavailable {
                chat_room_id: self.chat_room_id,
            })?;
        let outcome = self
            .service
            .update_last_message(self.chat_room_id, message.id, room.version)
            .await
            .map_err(|source| SendError::PointerUpdate {
                message_id: message.id,
                source,
            })?;
        if outcome.is_conflict() {
            warn!(
                "send: room pointer update rejected as stale chat_room={} presented_version={:?}",
                self.chat_room_id, room.version
            );
            if !failed.is_empty() {
                warn!("send: stale pointer outcome also had failed attachments indices={failed:?}");
            }
            return Ok(SendReport {
                status: SendStatus::StaleRoomState,
                message_id: Some(message.id),
                phase_reached: phase,
            });
        }

        let status = if failed.is_empty() {
            SendStatus::Done
        } else {
            SendStatus::PartialFailure(failed)
        };
        Ok(SendReport {
            status,
            message_id: Some(message.id),
            phase_reached: SendPhase::Done,
        })
    }
}

#[cfg(test)]
#[path = "tests/send_tests.rs"]
mod tests;
