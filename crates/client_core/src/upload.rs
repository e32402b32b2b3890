use std::sync::Arc;

use futures::future;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use shared::domain::MediaKind;

use crate::{BlobStore, BlobStoreError};

/// A locally picked media item, as reported by the picker: a kind string,
/// the raw bytes, and whatever dimensions the picker knew about.
#[derive(Debug, Clone)]
pub struct MediaItem {
    pub kind: String,
    pub data: Vec<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_seconds: Option<f64>,
}

/// A durably stored media item: the storage key exists iff the write was
/// confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedMedia {
    pub kind: MediaKind,
    pub storage_key: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("unsupported media kind: {0}")]
    UnsupportedMediaKind(String),
    #[error("upload failed for key {key}")]
    UploadFailed {
        key: String,
        #[source]
        source: BlobStoreError,
    },
}

/// Turns locally picked media into remote blobs under fresh random keys.
/// Collisions are avoided by key randomness, not content dedup; nothing is
/// registered for a key whose write failed.
pub struct AttachmentUploadCoordinator {
    store: Arc<dyn BlobStore>,
}

impl AttachmentUploadCoordinator {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub async fn upload(&self, item: &MediaItem) -> Result<UploadedMedia, UploadError> {
        let kind = MediaKind::from_picker_type(&item.kind)
            .ok_or_else(|| UploadError::UnsupportedMediaKind(item.kind.clone()))?;

        let key = format!("{}.{}", Uuid::new_v4(), kind.file_extension());
        self.store
            .put(&key, &item.data, kind.content_type())
            .await
            .map_err(|source| UploadError::UploadFailed {
                key: key.clone(),
                source,
            })?;

        debug!(
            "upload: stored key={key} kind={kind:?} bytes={}",
            item.data.len()
        );
        Ok(UploadedMedia {
            kind,
            storage_key: key,
            width: item.width,
            height: item.height,
            duration_seconds: item.duration_seconds,
        })
    }

    /// Uploads independent items concurrently, no ordering guarantee between
    /// them; results come back per index so callers can tell exactly which
    /// items failed.
    pub async fn upload_all(&self, items: &[MediaItem]) -> Vec<Result<UploadedMedia, UploadError>> {
        future::join_all(items.iter().map(|item| self.upload(item))).await
    }
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
