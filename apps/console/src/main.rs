use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use client_core::{
    create_group_chat,
    memory::{InMemoryBlobStore, InMemoryRecordService, StaticIdentity},
    BlobStore, ChatRoomProjector, IdentityProvider, MediaItem, RecordService, SendPipeline,
    TimelineReconciler,
};
use shared::{domain::UserId, protocol::User};
use tracing::info;

/// Runs the sync core end to end against the in-memory collaborators:
/// creates a group, starts the reconciler and projector, sends a message
/// with an attachment, and prints the reconciled timeline.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "weekend plans")]
    room_name: String,
    #[arg(long, default_value = "hello from the console")]
    text: String,
}

fn contact(name: &str) -> User {
    User {
        id: UserId::random(),
        name: name.to_owned(),
        status: None,
        image_key: None,
        deleted: false,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let service = Arc::new(InMemoryRecordService::new());
    let store = Arc::new(InMemoryBlobStore::new());

    let me = contact("me");
    for user in [me.clone(), contact("alice"), contact("bob")] {
        service.seed_user(user).await;
    }
    let identity = Arc::new(StaticIdentity::new(me.id));

    let contacts: Vec<UserId> = service
        .list_users()
        .await?
        .into_iter()
        .filter(|user| !user.deleted && user.id != me.id)
        .map(|user| user.id)
        .collect();
    let room = create_group_chat(
        service.as_ref(),
        identity.as_ref(),
        &args.room_name,
        &contacts,
    )
    .await?;

    let record_service = Arc::clone(&service) as Arc<dyn RecordService>;
    let projector = ChatRoomProjector::new(Arc::clone(&record_service), room.id);
    projector.start().await?;
    let timeline = TimelineReconciler::new(Arc::clone(&record_service), room.id);
    timeline.start().await?;

    let pipeline = SendPipeline::new(
        record_service,
        identity as Arc<dyn IdentityProvider>,
        Arc::clone(&store) as Arc<dyn BlobStore>,
        Arc::clone(&projector),
    );
    let media = MediaItem {
        kind: "image".to_owned(),
        data: vec![0u8; 16],
        width: Some(64),
        height: Some(64),
        duration_seconds: None,
    };
    let report = pipeline.send(&args.text, &[media]).await?;
    info!("send report: {report:?}");

    // Give the feeds a moment to drain before reading the merged view.
    tokio::time::sleep(Duration::from_millis(50)).await;

    for message in timeline.messages().await {
        println!("{}", serde_json::to_string(&message)?);
    }
    if let Some(current) = projector.current().await {
        println!("room: {}", serde_json::to_string(&current)?);
    }
    println!("blobs stored: {}", store.object_count().await);

    timeline.shutdown().await;
    projector.shutdown().await;
    Ok(())
}
