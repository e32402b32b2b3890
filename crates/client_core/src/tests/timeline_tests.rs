use super::*;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::memory::InMemoryRecordService;
use shared::{
    domain::{MessageId, UserId},
    protocol::NewMessage,
};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn message(room: ChatRoomId, text: &str, minutes_after_base: i64) -> Message {
    Message {
        id: MessageId::random(),
        chat_room_id: room,
        author_id: UserId::random(),
        text: text.to_owned(),
        created_at: base_time() + chrono::Duration::minutes(minutes_after_base),
        deleted: false,
    }
}

fn reconciler(room: ChatRoomId) -> Arc<TimelineReconciler> {
    TimelineReconciler::new(Arc::new(InMemoryRecordService::new()), room)
}

fn texts(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.text.as_str()).collect()
}

#[tokio::test]
async fn snapshot_then_event_appends_at_front() {
    let room = ChatRoomId::random();
    let timeline = reconciler(room);

    let (m1, m2, m3) = (
        message(room, "m1", 1),
        message(room, "m2", 2),
        message(room, "m3", 3),
    );
    timeline
        .apply_snapshot(vec![m3.clone(), m2.clone(), m1.clone()])
        .await;
    timeline.apply_event(message(room, "m4", 4)).await;

    assert_eq!(texts(&timeline.messages().await), ["m4", "m3", "m2", "m1"]);
}

#[tokio::test]
async fn event_arriving_before_snapshot_survives_the_merge() {
    let room = ChatRoomId::random();
    let timeline = reconciler(room);

    let m5 = message(room, "m5", 5);
    timeline.apply_event(m5.clone()).await;

    let (m1, m2, m3) = (
        message(room, "m1", 1),
        message(room, "m2", 2),
        message(room, "m3", 3),
    );
    timeline.apply_snapshot(vec![m3, m2, m1]).await;

    let messages = timeline.messages().await;
    assert_eq!(texts(&messages), ["m5", "m3", "m2", "m1"]);
    assert_eq!(
        messages.iter().filter(|m| m.id == m5.id).count(),
        1,
        "raced event must appear exactly once"
    );
}

#[tokio::test]
async fn duplicate_event_is_absorbed() {
    let room = ChatRoomId::random();
    let timeline = reconciler(room);

    let m = message(room, "only", 1);
    timeline.apply_event(m.clone()).await;
    timeline.apply_event(m).await;

    assert_eq!(timeline.messages().await.len(), 1);
}

#[tokio::test]
async fn snapshot_overlapping_an_event_keeps_one_entry_per_identifier() {
    let room = ChatRoomId::random();
    let timeline = reconciler(room);

    let (m1, m2, m3) = (
        message(room, "m1", 1),
        message(room, "m2", 2),
        message(room, "m3", 3),
    );
    timeline.apply_event(m3.clone()).await;
    timeline.apply_snapshot(vec![m3, m2, m1]).await;
    timeline.apply_event(message(room, "m4", 4)).await;

    let messages = timeline.messages().await;
    assert_eq!(messages.len(), 4);
    let mut ids: Vec<_> = messages.iter().map(|m| m.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
}

#[tokio::test]
async fn equal_timestamps_break_ties_by_identifier() {
    let room = ChatRoomId::random();
    let timeline = reconciler(room);

    let a = message(room, "a", 1);
    let b = message(room, "b", 1);
    timeline.apply_snapshot(vec![a.clone(), b.clone()]).await;

    let expected_first = if a.id > b.id { a.id } else { b.id };
    assert_eq!(timeline.messages().await[0].id, expected_first);
}

#[tokio::test]
async fn soft_deleted_rows_are_dropped_from_the_snapshot() {
    let room = ChatRoomId::random();
    let timeline = reconciler(room);

    let mut tombstone = message(room, "gone", 2);
    tombstone.deleted = true;
    timeline
        .apply_snapshot(vec![tombstone, message(room, "kept", 1)])
        .await;

    assert_eq!(texts(&timeline.messages().await), ["kept"]);
}

#[tokio::test]
async fn soft_deleted_rows_are_dropped_from_the_event_stream() {
    let room = ChatRoomId::random();
    let timeline = reconciler(room);

    timeline.apply_event(message(room, "kept", 1)).await;
    let mut tombstone = message(room, "gone", 2);
    tombstone.deleted = true;
    timeline.apply_event(tombstone).await;

    assert_eq!(texts(&timeline.messages().await), ["kept"]);
}

#[tokio::test]
async fn shutdown_drops_late_deliveries() {
    let room = ChatRoomId::random();
    let timeline = reconciler(room);

    timeline.apply_event(message(room, "before", 1)).await;
    timeline.shutdown().await;
    timeline.apply_event(message(room, "after", 2)).await;
    timeline.apply_snapshot(vec![message(room, "late", 3)]).await;

    assert_eq!(texts(&timeline.messages().await), ["before"]);
}

#[tokio::test]
async fn live_service_feed_converges_with_the_snapshot() {
    let service = Arc::new(InMemoryRecordService::new());
    let room = service.create_chat_room("demo").await.unwrap();
    for n in 0..3 {
        service
            .seed_message(message(room.id, &format!("seeded-{n}"), n))
            .await;
    }

    let timeline = TimelineReconciler::new(
        Arc::clone(&service) as Arc<dyn RecordService>,
        room.id,
    );
    timeline.start().await.unwrap();

    service
        .create_message(NewMessage {
            chat_room_id: room.id,
            author_id: UserId::random(),
            text: "live".to_owned(),
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let messages = timeline.messages().await;
        if messages.len() == 4 && timeline.snapshot_applied().await {
            assert_eq!(messages[0].text, "live");
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timeline did not converge: {:?}",
            texts(&messages)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    timeline.shutdown().await;
}
