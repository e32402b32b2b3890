use super::*;
use async_trait::async_trait;

use crate::memory::InMemoryBlobStore;

/// Blob store that refuses any payload whose first byte is the marker,
/// storing nothing for it.
struct MarkerFailStore {
    marker: u8,
    inner: InMemoryBlobStore,
}

impl MarkerFailStore {
    fn new(marker: u8) -> Self {
        Self {
            marker,
            inner: InMemoryBlobStore::new(),
        }
    }
}

#[async_trait]
impl BlobStore for MarkerFailStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), BlobStoreError> {
        if bytes.first() == Some(&self.marker) {
            return Err(BlobStoreError::UploadFailed {
                key: key.to_owned(),
                reason: "simulated transport failure".to_owned(),
            });
        }
        self.inner.put(key, bytes, content_type).await
    }
}

fn image_item(data: Vec<u8>) -> MediaItem {
    MediaItem {
        kind: "image".to_owned(),
        data,
        width: Some(640),
        height: Some(480),
        duration_seconds: None,
    }
}

#[tokio::test]
async fn image_upload_lands_under_a_png_key_with_the_right_content_type() {
    let store = Arc::new(InMemoryBlobStore::new());
    let coordinator = AttachmentUploadCoordinator::new(Arc::clone(&store) as Arc<dyn BlobStore>);

    let uploaded = coordinator.upload(&image_item(vec![1, 2, 3])).await.unwrap();

    assert_eq!(uploaded.kind, MediaKind::Image);
    assert!(uploaded.storage_key.ends_with(".png"));
    assert_eq!(uploaded.width, Some(640));
    let blob = store.object(&uploaded.storage_key).await.unwrap();
    assert_eq!(blob.bytes, vec![1, 2, 3]);
    assert_eq!(blob.content_type, "image/png");
}

#[tokio::test]
async fn video_uploads_map_to_mp4() {
    let store = Arc::new(InMemoryBlobStore::new());
    let coordinator = AttachmentUploadCoordinator::new(Arc::clone(&store) as Arc<dyn BlobStore>);

    let uploaded = coordinator
        .upload(&MediaItem {
            kind: "video".to_owned(),
            data: vec![9],
            width: None,
            height: None,
            duration_seconds: Some(12.5),
        })
        .await
        .unwrap();

    assert_eq!(uploaded.kind, MediaKind::Video);
    assert!(uploaded.storage_key.ends_with(".mp4"));
    assert_eq!(
        store.object(&uploaded.storage_key).await.unwrap().content_type,
        "video/mp4"
    );
}

#[tokio::test]
async fn unknown_kind_is_rejected_before_any_write() {
    let store = Arc::new(InMemoryBlobStore::new());
    let coordinator = AttachmentUploadCoordinator::new(Arc::clone(&store) as Arc<dyn BlobStore>);

    let err = coordinator
        .upload(&MediaItem {
            kind: "audio".to_owned(),
            data: vec![1],
            width: None,
            height: None,
            duration_seconds: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::UnsupportedMediaKind(kind) if kind == "audio"));
    assert_eq!(store.object_count().await, 0);
}

#[tokio::test]
async fn failed_put_surfaces_upload_failed() {
    let coordinator =
        AttachmentUploadCoordinator::new(Arc::new(MarkerFailStore::new(0xFF)) as Arc<dyn BlobStore>);

    let err = coordinator.upload(&image_item(vec![0xFF, 1])).await.unwrap_err();
    assert!(matches!(err, UploadError::UploadFailed { .. }));
}

#[tokio::test]
async fn concurrent_uploads_report_per_index_results_under_distinct_keys() {
    let coordinator =
        AttachmentUploadCoordinator::new(Arc::new(MarkerFailStore::new(0xFF)) as Arc<dyn BlobStore>);

    let items = [
        image_item(vec![1]),
        image_item(vec![0xFF]),
        image_item(vec![2]),
    ];
    let results = coordinator.upload_all(&items).await;

    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    assert!(results[2].is_ok());
    let first = results[0].as_ref().unwrap();
    let third = results[2].as_ref().unwrap();
    assert_ne!(first.storage_key, third.storage_key);
}
