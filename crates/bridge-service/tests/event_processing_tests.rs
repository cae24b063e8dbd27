//! End-to-end event processing tests.
//!
//! Signed callbacks go through the HTTP surface, are acknowledged, and the
//! dispatched handlers drive the mock DingTalk notifier and the in-memory
//! idempotency store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bridge_service::models::SideEffectKind;
use bridge_service::services::dingtalk_client::mock::{MockNotifier, NotifierCall};
use bridge_service::services::wemeet_client::mock::MockMeetingDirectory;
use bridge_test_utils::{fixtures, TestBridgeServer};

fn directory() -> MockMeetingDirectory {
    MockMeetingDirectory::new().with_meeting(fixtures::meeting_detail("m-1", "alice", &["bob"]))
}

fn notifier() -> MockNotifier {
    MockNotifier::new()
        .with_union_id("alice", "u-alice")
        .with_union_id("bob", "u-bob")
}

#[tokio::test]
async fn test_created_meeting_gets_todo_and_calendar() -> Result<(), anyhow::Error> {
    let server = TestBridgeServer::builder()
        .directory(directory())
        .notifier(notifier())
        .spawn()
        .await?;
    let webhook = server.webhook_client();

    let response = webhook
        .post_event(&fixtures::meeting_created("m-1", "alice"))
        .await?;
    assert_eq!(response.status(), 200);
    server.wait_for_events().await?;

    let recipients = vec!["u-alice".to_string(), "u-bob".to_string()];
    assert_eq!(
        server.notifier().side_effect_calls(),
        vec![
            NotifierCall::CreateTodo {
                owner: "u-alice".to_string(),
                meeting_id: "m-1".to_string(),
                executors: recipients.clone(),
            },
            NotifierCall::CreateCalendar {
                owner: "u-alice".to_string(),
                meeting_id: "m-1".to_string(),
                attendees: recipients,
            },
        ]
    );

    let todo = server
        .side_effects()
        .find("m-1", SideEffectKind::Todo)
        .await?
        .expect("todo record should be stored");
    assert_eq!(todo.external_id, "todo-1");
    assert_eq!(todo.owner_id, "u-alice");

    let calendar = server
        .side_effects()
        .find("m-1", SideEffectKind::Calendar)
        .await?
        .expect("calendar record should be stored");
    assert_eq!(calendar.external_id, "event-2");

    Ok(())
}

#[tokio::test]
async fn test_redelivered_created_event_is_idempotent() -> Result<(), anyhow::Error> {
    let server = TestBridgeServer::builder()
        .directory(directory())
        .notifier(notifier())
        .spawn()
        .await?;
    let webhook = server.webhook_client();
    let event = fixtures::meeting_created("m-1", "alice");

    for _ in 0..3 {
        assert_eq!(webhook.post_event(&event).await?.status(), 200);
    }
    server.wait_for_events().await?;

    let creates = server
        .notifier()
        .side_effect_calls()
        .into_iter()
        .filter(|call| {
            matches!(
                call,
                NotifierCall::CreateTodo { .. } | NotifierCall::CreateCalendar { .. }
            )
        })
        .count();
    assert_eq!(creates, 2);

    Ok(())
}

#[tokio::test]
async fn test_canceled_meeting_removes_side_effects() -> Result<(), anyhow::Error> {
    let server = TestBridgeServer::builder()
        .directory(directory())
        .notifier(notifier())
        .spawn()
        .await?;
    let webhook = server.webhook_client();

    webhook
        .post_event(&fixtures::meeting_created("m-1", "alice"))
        .await?;
    server.wait_for_events().await?;

    webhook
        .post_event(&fixtures::meeting_canceled("m-1", "alice"))
        .await?;
    server.wait_for_events().await?;

    let calls = server.notifier().side_effect_calls();
    assert!(calls.contains(&NotifierCall::DeleteTodo {
        owner: "u-alice".to_string(),
        task_id: "todo-1".to_string(),
    }));
    assert!(calls.contains(&NotifierCall::DeleteCalendar {
        owner: "u-alice".to_string(),
        event_id: "event-2".to_string(),
    }));

    assert!(server
        .side_effects()
        .find("m-1", SideEffectKind::Todo)
        .await?
        .is_none());
    assert!(server
        .side_effects()
        .find("m-1", SideEffectKind::Calendar)
        .await?
        .is_none());

    Ok(())
}

#[tokio::test]
async fn test_disabled_calendar_only_creates_todo() -> Result<(), anyhow::Error> {
    let server = TestBridgeServer::builder()
        .var("DINGTALK_CALENDAR_ENABLED", "false")
        .directory(directory())
        .notifier(notifier())
        .spawn()
        .await?;
    let webhook = server.webhook_client();

    webhook
        .post_event(&fixtures::meeting_created("m-1", "alice"))
        .await?;
    server.wait_for_events().await?;

    let calls = server.notifier().side_effect_calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(
        calls.first(),
        Some(NotifierCall::CreateTodo { .. })
    ));

    Ok(())
}

#[tokio::test]
async fn test_unknown_event_is_acknowledged_and_ignored() -> Result<(), anyhow::Error> {
    let server = TestBridgeServer::builder()
        .directory(directory())
        .notifier(notifier())
        .spawn()
        .await?;
    let webhook = server.webhook_client();

    let event = fixtures::event(
        "meeting.participant-joined",
        fixtures::meeting_info("m-1", "alice", fixtures::ONE_OFF),
        fixtures::MEETING_START * 1000,
    );
    let response = webhook.post_event(&event).await?;
    assert_eq!(response.status(), 200);
    server.wait_for_events().await?;

    assert!(server.notifier().calls().is_empty());
    assert_eq!(server.directory().call_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_recording_completed_sends_cards() -> Result<(), anyhow::Error> {
    let directory = directory()
        .with_recording("m-1", "rec-1", "https://meeting.tencent.com/v2/rec/abc")
        .with_participants("m-1", &["alice", "bob", "alice"]);
    let server = TestBridgeServer::builder()
        .directory(directory)
        .notifier(notifier())
        .spawn()
        .await?;
    let webhook = server.webhook_client();

    let event = fixtures::event(
        "recording.completed",
        fixtures::meeting_info("m-1", "alice", fixtures::ONE_OFF),
        (fixtures::MEETING_START + 3700) * 1000,
    );
    assert_eq!(webhook.post_event(&event).await?.status(), 200);
    server.wait_for_events().await?;

    let calls = server.notifier().side_effect_calls();
    assert_eq!(calls.len(), 1);
    match calls.first() {
        Some(NotifierCall::SendCard { user_ids, card }) => {
            assert_eq!(user_ids, &vec!["alice".to_string(), "bob".to_string()]);
            assert_eq!(card.view_address, "https://meeting.tencent.com/v2/rec/abc");
            assert_eq!(card.subject, "Weekly sync");
        }
        other => panic!("expected a recording card, got {other:?}"),
    }

    Ok(())
}
