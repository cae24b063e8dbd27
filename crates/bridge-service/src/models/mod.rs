//! Meeting bridge models.
//!
//! Webhook event shapes, WeMeet meeting descriptors, and the persisted
//! side-effect record. WeMeet sends numeric fields as JSON numbers in
//! webhooks but as strings in REST responses, so those fields accept both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::services::admission::AdmissionStatus;
use crate::services::dispatcher::DispatcherStatus;

/// Webhook event kinds the bridge reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    MeetingCreated,
    MeetingUpdated,
    MeetingCanceled,
    MeetingEnd,
    RecordingCompleted,
    /// Anything else; logged and dropped.
    Unknown(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "meeting.created" => EventKind::MeetingCreated,
            "meeting.updated" => EventKind::MeetingUpdated,
            "meeting.canceled" => EventKind::MeetingCanceled,
            "meeting.end" => EventKind::MeetingEnd,
            "recording.completed" => EventKind::RecordingCompleted,
            other => EventKind::Unknown(other.to_string()),
        }
    }

    /// Bounded label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MeetingCreated => "meeting.created",
            EventKind::MeetingUpdated => "meeting.updated",
            EventKind::MeetingCanceled => "meeting.canceled",
            EventKind::MeetingEnd => "meeting.end",
            EventKind::RecordingCompleted => "recording.completed",
            EventKind::Unknown(_) => "unknown",
        }
    }
}

/// WeMeet meeting type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeetingType {
    #[default]
    OneOff,
    Recurring,
    WechatExclusive,
    RoomsScreenCast,
    PersonalMeetingNumber,
    Webinar,
    Other(i64),
}

impl MeetingType {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => MeetingType::OneOff,
            1 => MeetingType::Recurring,
            2 => MeetingType::WechatExclusive,
            4 => MeetingType::RoomsScreenCast,
            5 => MeetingType::PersonalMeetingNumber,
            6 => MeetingType::Webinar,
            other => MeetingType::Other(other),
        }
    }

    pub fn is_recurring(self) -> bool {
        self == MeetingType::Recurring
    }

    /// Types that get per-meeting to-dos and calendar entries.
    pub fn is_single_occurrence(self) -> bool {
        matches!(
            self,
            MeetingType::OneOff
                | MeetingType::WechatExclusive
                | MeetingType::PersonalMeetingNumber
                | MeetingType::Webinar
        )
    }
}

impl<'de> Deserialize<'de> for MeetingType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        lenient_i64(deserializer).map(MeetingType::from_code)
    }
}

/// Meeting creation mode reported for ad-hoc "quick" meetings.
pub const QUICK_MEETING_CREATE_MODE: i64 = 1;

/// Decoded webhook body.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub event: String,

    #[serde(default)]
    pub trace_id: Option<String>,

    #[serde(default)]
    pub payload: Vec<EventPayload>,
}

impl WebhookEvent {
    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event)
    }

    /// WeMeet delivers one payload entry per event.
    pub fn first_payload(&self) -> Option<&EventPayload> {
        self.payload.first()
    }

    pub fn meeting_info(&self) -> Option<&WebhookMeetingInfo> {
        self.first_payload()
            .and_then(|payload| payload.meeting_info.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventPayload {
    /// Milliseconds since the epoch.
    #[serde(default, deserialize_with = "lenient_i64")]
    pub operate_time: i64,

    #[serde(default)]
    pub meeting_info: Option<WebhookMeetingInfo>,
}

/// Meeting descriptor carried inside a webhook payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookMeetingInfo {
    pub meeting_id: String,

    #[serde(default)]
    pub meeting_code: String,

    #[serde(default)]
    pub subject: String,

    #[serde(default)]
    pub creator: MeetingUser,

    #[serde(default)]
    pub meeting_type: MeetingType,

    /// Seconds since the epoch.
    #[serde(default, deserialize_with = "lenient_i64")]
    pub start_time: i64,

    #[serde(default, deserialize_with = "lenient_i64")]
    pub end_time: i64,

    #[serde(default, deserialize_with = "lenient_i64")]
    pub meeting_create_mode: i64,

    /// Present when the event targets one occurrence of a recurring meeting.
    #[serde(default)]
    pub sub_meeting_id: Option<String>,
}

impl WebhookMeetingInfo {
    pub fn is_quick_meeting(&self) -> bool {
        self.meeting_create_mode == QUICK_MEETING_CREATE_MODE
    }

    pub fn targets_single_occurrence(&self) -> bool {
        self.sub_meeting_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct MeetingUser {
    #[serde(default)]
    pub userid: String,

    #[serde(default)]
    pub user_name: String,
}

/// Authoritative meeting detail from the WeMeet REST API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeetingDetail {
    pub meeting_id: String,

    #[serde(default)]
    pub meeting_code: String,

    #[serde(default)]
    pub subject: String,

    #[serde(default)]
    pub meeting_type: MeetingType,

    #[serde(default, deserialize_with = "lenient_i64")]
    pub start_time: i64,

    #[serde(default, deserialize_with = "lenient_i64")]
    pub end_time: i64,

    #[serde(default)]
    pub join_url: String,

    #[serde(default)]
    pub current_hosts: Vec<MeetingUser>,

    #[serde(default)]
    pub hosts: Vec<MeetingUser>,

    #[serde(default)]
    pub participants: Vec<MeetingUser>,

    #[serde(default)]
    pub recurring_rule: Option<RecurringRule>,
}

impl MeetingDetail {
    /// Provider user ids of everyone to notify, hosts first.
    pub fn invitee_userids(&self) -> impl Iterator<Item = &str> {
        self.current_hosts
            .iter()
            .chain(&self.hosts)
            .chain(&self.participants)
            .map(|user| user.userid.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// WeMeet recurrence description.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RecurringRule {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub recurring_type: i64,

    /// 0 = until a date, 1 = a number of occurrences.
    #[serde(default = "no_until_type", deserialize_with = "lenient_i64")]
    pub until_type: i64,

    #[serde(default, deserialize_with = "lenient_i64")]
    pub until_date: i64,

    #[serde(default, deserialize_with = "lenient_i64")]
    pub until_count: i64,

    #[serde(default, deserialize_with = "lenient_i64")]
    pub customized_recurring_type: i64,

    #[serde(default = "one", deserialize_with = "lenient_i64")]
    pub customized_recurring_step: i64,

    /// Bit flags: 1..64 Monday..Sunday, 128..2048 week-of-month.
    #[serde(default, deserialize_with = "lenient_i64")]
    pub customized_recurring_days: i64,
}

fn no_until_type() -> i64 {
    -1
}

fn one() -> i64 {
    1
}

/// Side effect kinds tracked for idempotency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectKind {
    Todo,
    Calendar,
}

impl SideEffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffectKind::Todo => "todo",
            SideEffectKind::Calendar => "calendar",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "todo" => Some(SideEffectKind::Todo),
            "calendar" => Some(SideEffectKind::Calendar),
            _ => None,
        }
    }
}

/// A live downstream object created for a meeting.
///
/// At most one record exists per `(meeting_id, kind)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideEffectRecord {
    pub meeting_id: String,
    pub kind: SideEffectKind,
    /// DingTalk task id or calendar event id.
    pub external_id: String,
    /// DingTalk union id the object was created under.
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

/// Readiness probe response.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Webhook pipeline status.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookStatusResponse {
    pub admission: AdmissionStatus,
    pub dispatcher: DispatcherStatus,
}

/// Accept an integer given as a JSON number or a numeric string.
pub fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        Float(f64),
        Text(String),
        Null,
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        #[allow(clippy::cast_possible_truncation)]
        NumberOrString::Float(f) => Ok(f as i64),
        NumberOrString::Null => Ok(0),
        NumberOrString::Text(s) if s.trim().is_empty() => Ok(0),
        NumberOrString::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("expected integer, got '{s}'"))),
    }
}
