//! Webhook event and meeting fixtures.

use bridge_service::models::{MeetingDetail, MeetingType, MeetingUser};
use serde_json::{json, Value};

/// Webhook token every harness server is configured with.
pub const TEST_WEBHOOK_TOKEN: &str = "test-webhook-token";

/// Base64 (unpadded) of a 32 byte AES key, in the form WeMeet hands out.
pub const TEST_AES_KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY";

/// WeMeet `meeting_type` codes.
pub const ONE_OFF: i64 = 0;
pub const RECURRING: i64 = 1;

/// Meeting start used by the fixtures, 2025-03-04 02:00:00 UTC.
pub const MEETING_START: i64 = 1_741_053_600;

pub fn user(userid: &str) -> MeetingUser {
    MeetingUser {
        userid: userid.to_string(),
        user_name: userid.to_string(),
    }
}

/// Webhook `meeting_info` block for a meeting owned by `creator`.
pub fn meeting_info(meeting_id: &str, creator: &str, meeting_type: i64) -> Value {
    json!({
        "meeting_id": meeting_id,
        "meeting_code": "123456789",
        "subject": "Weekly sync",
        "creator": {"userid": creator, "user_name": creator},
        "meeting_type": meeting_type,
        "start_time": MEETING_START.to_string(),
        "end_time": (MEETING_START + 3600).to_string(),
        "meeting_create_mode": 0
    })
}

/// Full webhook event with one payload entry.
pub fn event(kind: &str, meeting_info: Value, operate_time_ms: i64) -> Value {
    json!({
        "event": kind,
        "trace_id": format!("trace-{kind}"),
        "payload": [{
            "operate_time": operate_time_ms,
            "meeting_info": meeting_info
        }]
    })
}

pub fn meeting_created(meeting_id: &str, creator: &str) -> Value {
    event(
        "meeting.created",
        meeting_info(meeting_id, creator, ONE_OFF),
        MEETING_START * 1000,
    )
}

pub fn meeting_canceled(meeting_id: &str, creator: &str) -> Value {
    event(
        "meeting.canceled",
        meeting_info(meeting_id, creator, ONE_OFF),
        MEETING_START * 1000,
    )
}

/// Directory entry matching [`meeting_info`], with `invitees` as participants.
pub fn meeting_detail(meeting_id: &str, creator: &str, invitees: &[&str]) -> MeetingDetail {
    MeetingDetail {
        meeting_id: meeting_id.to_string(),
        meeting_code: "123456789".to_string(),
        subject: "Weekly sync".to_string(),
        meeting_type: MeetingType::OneOff,
        start_time: MEETING_START,
        end_time: MEETING_START + 3600,
        current_hosts: vec![user(creator)],
        participants: invitees.iter().map(|id| user(id)).collect(),
        ..MeetingDetail::default()
    }
}
