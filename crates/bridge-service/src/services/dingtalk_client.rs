//! DingTalk API client.
//!
//! Creates and removes to-dos and calendar events, sends robot cards, and
//! resolves user ids to union ids. Every call carries the app access token
//! published by `common::token_manager`. This layer is pure transport:
//! idempotency bookkeeping lives in the event handlers.

use crate::errors::BridgeError;
use crate::models::MeetingDetail;
use crate::observability::metrics;
use crate::services::formatting::{format_time_range, iso_utc, AppLinkBuilder, DISPLAY_TIME_ZONE};
use crate::services::recurrence::{self, Recurrence};
use base64::{engine::general_purpose::STANDARD, Engine};
use common::secret::ExposeSecret;
use common::token_manager::TokenReceiver;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Most recipients DingTalk accepts in one robot batch send.
pub const MAX_CARD_RECIPIENTS: usize = 20;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const ACCESS_TOKEN_HEADER: &str = "x-acs-dingtalk-access-token";

/// Content of a "recording ready" card.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingCard {
    pub subject: String,
    pub meeting_code: String,
    pub start_time: i64,
    pub end_time: i64,
    pub creator_name: String,
    pub view_address: String,
}

/// Side-effect operations against DingTalk.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Create a to-do owned by `owner_union_id`. Returns the task id.
    async fn create_todo(
        &self,
        owner_union_id: &str,
        meeting: &MeetingDetail,
        executor_ids: &[String],
    ) -> Result<String, BridgeError>;

    async fn delete_todo(&self, owner_union_id: &str, task_id: &str) -> Result<(), BridgeError>;

    /// Create a calendar event in the owner's primary calendar. Returns the event id.
    async fn create_calendar_event(
        &self,
        owner_union_id: &str,
        meeting: &MeetingDetail,
        attendee_ids: &[String],
    ) -> Result<String, BridgeError>;

    async fn update_calendar_event(
        &self,
        owner_union_id: &str,
        event_id: &str,
        meeting: &MeetingDetail,
        attendee_ids: &[String],
    ) -> Result<(), BridgeError>;

    async fn delete_calendar_event(
        &self,
        owner_union_id: &str,
        event_id: &str,
    ) -> Result<(), BridgeError>;

    /// Send one card batch. `user_ids` must not exceed [`MAX_CARD_RECIPIENTS`].
    async fn send_recording_card(
        &self,
        user_ids: &[String],
        card: &RecordingCard,
    ) -> Result<(), BridgeError>;

    /// Union id for a DingTalk user id, `None` when DingTalk does not know it.
    async fn lookup_union_id(&self, userid: &str) -> Result<Option<String>, BridgeError>;
}

/// Endpoint and app settings for [`DingtalkClient`].
#[derive(Debug, Clone)]
pub struct DingtalkSettings {
    pub api_url: String,
    pub oapi_url: String,
    pub robot_code: String,
    pub links: AppLinkBuilder,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DetailUrl<'a> {
    app_url: &'a str,
    pc_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotifyConfigs {
    ding_notify: &'static str,
}

const DING_NOTIFY: NotifyConfigs = NotifyConfigs { ding_notify: "1" };

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TodoBody<'a> {
    source_id: String,
    subject: String,
    creator_id: &'a str,
    due_time: i64,
    executor_ids: &'a [String],
    detail_url: DetailUrl<'a>,
    notify_configs: NotifyConfigs,
    reminder_time_stamp: i64,
    remind_notify_configs: NotifyConfigs,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventTime {
    date_time: String,
    time_zone: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Attendee<'a> {
    id: &'a str,
    is_optional: bool,
}

#[derive(Serialize)]
struct RichText {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CalendarEventBody<'a> {
    summary: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    start: EventTime,
    end: EventTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    recurrence: Option<Recurrence>,
    attendees: Vec<Attendee<'a>>,
    rich_text_description: RichText,
}

#[derive(Serialize)]
struct CardParams {
    title: String,
    text: String,
    #[serde(rename = "singleTitle")]
    single_title: &'static str,
    #[serde(rename = "singleURL")]
    single_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchSendBody<'a> {
    msg_param: String,
    msg_key: &'static str,
    user_ids: &'a [String],
    robot_code: &'a str,
}

#[derive(Serialize)]
struct UserGetBody<'a> {
    userid: &'a str,
}

#[derive(Deserialize)]
struct CreatedObject {
    id: String,
}

#[derive(Deserialize)]
struct UserGetResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    result: Option<UserGetResult>,
}

#[derive(Deserialize)]
struct UserGetResult {
    #[serde(default)]
    unionid: String,
}

/// HTTP client for the DingTalk v1.0 and legacy APIs.
pub struct DingtalkClient {
    http: reqwest::Client,
    settings: DingtalkSettings,
    tokens: TokenReceiver,
}

impl DingtalkClient {
    /// # Errors
    ///
    /// Returns `BridgeError::Internal` if the HTTP client cannot be built.
    pub fn new(settings: DingtalkSettings, tokens: TokenReceiver) -> Result<Self, BridgeError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::Internal(format!("Failed to build DingTalk client: {e}")))?;

        Ok(Self {
            http,
            settings,
            tokens,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header(ACCESS_TOKEN_HEADER, self.tokens.token().expose_secret())
    }

    /// Send a request, mapping transport failures and non-2xx statuses to
    /// `BridgeError::Downstream`.
    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, BridgeError> {
        let start = Instant::now();

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                metrics::record_downstream_request("dingtalk", operation, "error", start.elapsed());
                warn!(target: "bridge.dingtalk", operation, error = %e, "DingTalk request failed");
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            metrics::record_downstream_request("dingtalk", operation, "error", start.elapsed());
            warn!(
                target: "bridge.dingtalk",
                operation,
                status = %status,
                body = %body,
                "DingTalk returned an error"
            );
            return Err(BridgeError::Downstream(format!(
                "DingTalk {operation} returned {status}"
            )));
        }

        metrics::record_downstream_request("dingtalk", operation, "success", start.elapsed());
        Ok(response)
    }

    async fn created_id(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<String, BridgeError> {
        let created: CreatedObject = response.json().await.map_err(|e| {
            warn!(target: "bridge.dingtalk", operation, error = %e, "Unparseable DingTalk response");
            BridgeError::Downstream(format!("DingTalk {operation} response invalid: {e}"))
        })?;
        Ok(created.id)
    }

    fn calendar_body<'a>(
        &self,
        meeting: &'a MeetingDetail,
        event_id: Option<&'a str>,
        attendee_ids: &'a [String],
    ) -> CalendarEventBody<'a> {
        let recurrence = if meeting.meeting_type.is_recurring() {
            meeting
                .recurring_rule
                .as_ref()
                .map(|rule| recurrence::convert(rule, meeting.start_time))
        } else {
            None
        };

        let link = self.settings.links.meeting_link(&meeting.meeting_code);

        CalendarEventBody {
            summary: &meeting.subject,
            id: event_id,
            start: EventTime {
                date_time: iso_utc(meeting.start_time),
                time_zone: DISPLAY_TIME_ZONE,
            },
            end: EventTime {
                date_time: iso_utc(meeting.end_time),
                time_zone: DISPLAY_TIME_ZONE,
            },
            recurrence,
            attendees: attendee_ids
                .iter()
                .map(|id| Attendee {
                    id,
                    is_optional: false,
                })
                .collect(),
            rich_text_description: RichText {
                text: format!(r#"<a href="{link}" target="_blank">加入会议</a>"#),
            },
        }
    }

    fn events_url(&self, owner_union_id: &str) -> String {
        format!(
            "{}/v1.0/calendar/users/{}/calendars/primary/events",
            self.settings.api_url,
            urlencoding::encode(owner_union_id)
        )
    }
}

#[async_trait::async_trait]
impl Notifier for DingtalkClient {
    #[instrument(skip_all, name = "bridge.dingtalk.create_todo", fields(meeting_id = %meeting.meeting_id))]
    async fn create_todo(
        &self,
        owner_union_id: &str,
        meeting: &MeetingDetail,
        executor_ids: &[String],
    ) -> Result<String, BridgeError> {
        let owner = urlencoding::encode(owner_union_id);
        let url = format!(
            "{}/v1.0/todo/users/{owner}/tasks?operatorId={owner}",
            self.settings.api_url
        );

        let body = TodoBody {
            source_id: format!("{}_todo", meeting.meeting_id),
            subject: format!(
                "腾讯会议：{} - 会议号：{} - 时间：{}",
                meeting.subject,
                meeting.meeting_code,
                format_time_range(meeting.start_time, meeting.end_time)
            ),
            creator_id: owner_union_id,
            due_time: meeting.start_time.saturating_mul(1000),
            executor_ids,
            detail_url: DetailUrl {
                app_url: &meeting.join_url,
                pc_url: self.settings.links.meeting_link(&meeting.meeting_code),
            },
            notify_configs: DING_NOTIFY,
            reminder_time_stamp: meeting.start_time.saturating_mul(1000),
            remind_notify_configs: DING_NOTIFY,
        };

        let response = self
            .send("create_todo", self.authorized(self.http.post(url)).json(&body))
            .await?;
        let task_id = Self::created_id("create_todo", response).await?;

        debug!(target: "bridge.dingtalk", executors = executor_ids.len(), "To-do created");
        Ok(task_id)
    }

    #[instrument(skip_all, name = "bridge.dingtalk.delete_todo")]
    async fn delete_todo(&self, owner_union_id: &str, task_id: &str) -> Result<(), BridgeError> {
        let owner = urlencoding::encode(owner_union_id);
        let url = format!(
            "{}/v1.0/todo/users/{owner}/tasks/{}?operatorId={owner}",
            self.settings.api_url,
            urlencoding::encode(task_id)
        );

        self.send("delete_todo", self.authorized(self.http.delete(url)))
            .await?;
        Ok(())
    }

    #[instrument(skip_all, name = "bridge.dingtalk.create_calendar_event", fields(meeting_id = %meeting.meeting_id))]
    async fn create_calendar_event(
        &self,
        owner_union_id: &str,
        meeting: &MeetingDetail,
        attendee_ids: &[String],
    ) -> Result<String, BridgeError> {
        let body = self.calendar_body(meeting, None, attendee_ids);
        let request = self
            .authorized(self.http.post(self.events_url(owner_union_id)))
            .json(&body);

        let response = self.send("create_calendar_event", request).await?;
        Self::created_id("create_calendar_event", response).await
    }

    #[instrument(skip_all, name = "bridge.dingtalk.update_calendar_event", fields(meeting_id = %meeting.meeting_id))]
    async fn update_calendar_event(
        &self,
        owner_union_id: &str,
        event_id: &str,
        meeting: &MeetingDetail,
        attendee_ids: &[String],
    ) -> Result<(), BridgeError> {
        let url = format!(
            "{}/{}",
            self.events_url(owner_union_id),
            urlencoding::encode(event_id)
        );
        let body = self.calendar_body(meeting, Some(event_id), attendee_ids);

        self.send(
            "update_calendar_event",
            self.authorized(self.http.put(url)).json(&body),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip_all, name = "bridge.dingtalk.delete_calendar_event")]
    async fn delete_calendar_event(
        &self,
        owner_union_id: &str,
        event_id: &str,
    ) -> Result<(), BridgeError> {
        let url = format!(
            "{}/{}",
            self.events_url(owner_union_id),
            urlencoding::encode(event_id)
        );

        self.send("delete_calendar_event", self.authorized(self.http.delete(url)))
            .await?;
        Ok(())
    }

    #[instrument(skip_all, name = "bridge.dingtalk.send_recording_card", fields(recipients = user_ids.len()))]
    async fn send_recording_card(
        &self,
        user_ids: &[String],
        card: &RecordingCard,
    ) -> Result<(), BridgeError> {
        if user_ids.len() > MAX_CARD_RECIPIENTS {
            return Err(BridgeError::Internal(format!(
                "card batch of {} exceeds {MAX_CARD_RECIPIENTS} recipients",
                user_ids.len()
            )));
        }

        let target = STANDARD.encode(card.view_address.as_bytes());
        let params = CardParams {
            title: format!("【录制文件已生成】{}", card.subject),
            text: format!(
                "会议时间：{}\n\n云录制地址：\n{}\n\n#腾讯会议：{}\n\n发起人 {}",
                format_time_range(card.start_time, card.end_time),
                card.view_address,
                card.meeting_code,
                card.creator_name
            ),
            single_title: "点击查看云录制",
            single_url: self.settings.links.h5_link(&format!("?targetUrl={target}")),
        };

        let msg_param = serde_json::to_string(&params)
            .map_err(|e| BridgeError::Internal(format!("Failed to encode card: {e}")))?;

        let body = BatchSendBody {
            msg_param,
            msg_key: "sampleActionCard",
            user_ids,
            robot_code: &self.settings.robot_code,
        };

        let url = format!("{}/v1.0/robot/oToMessages/batchSend", self.settings.api_url);
        self.send("send_recording_card", self.authorized(self.http.post(url)).json(&body))
            .await?;
        Ok(())
    }

    #[instrument(skip_all, name = "bridge.dingtalk.lookup_union_id")]
    async fn lookup_union_id(&self, userid: &str) -> Result<Option<String>, BridgeError> {
        let url = format!("{}/topapi/v2/user/get", self.settings.oapi_url);
        let token = self.tokens.token();
        let request = self
            .http
            .post(url)
            .query(&[("access_token", token.expose_secret())])
            .json(&UserGetBody { userid });

        let response = self.send("lookup_union_id", request).await?;
        let parsed: UserGetResponse = response.json().await.map_err(|e| {
            BridgeError::Downstream(format!("DingTalk lookup_union_id response invalid: {e}"))
        })?;

        if parsed.errcode != 0 {
            warn!(
                target: "bridge.dingtalk",
                userid = %userid,
                errcode = parsed.errcode,
                errmsg = %parsed.errmsg,
                "User lookup rejected"
            );
            return Ok(None);
        }

        Ok(parsed
            .result
            .map(|result| result.unionid)
            .filter(|unionid| !unionid.is_empty()))
    }
}

/// Recording `Notifier` for tests.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    /// One call observed by [`MockNotifier`].
    #[derive(Debug, Clone, PartialEq)]
    pub enum NotifierCall {
        CreateTodo {
            owner: String,
            meeting_id: String,
            executors: Vec<String>,
        },
        DeleteTodo {
            owner: String,
            task_id: String,
        },
        CreateCalendar {
            owner: String,
            meeting_id: String,
            attendees: Vec<String>,
        },
        UpdateCalendar {
            owner: String,
            event_id: String,
            meeting_id: String,
            attendees: Vec<String>,
        },
        DeleteCalendar {
            owner: String,
            event_id: String,
        },
        SendCard {
            user_ids: Vec<String>,
            card: RecordingCard,
        },
        LookupUnionId {
            userid: String,
        },
    }

    /// Records calls and hands out sequential ids (`todo-1`, `event-1`, ...).
    #[derive(Default)]
    pub struct MockNotifier {
        union_ids: HashMap<String, String>,
        fail_writes: bool,
        calls: Mutex<Vec<NotifierCall>>,
        next_id: AtomicUsize,
    }

    impl MockNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        /// Map a user id to a union id for `lookup_union_id`.
        #[must_use]
        pub fn with_union_id(mut self, userid: &str, union_id: &str) -> Self {
            self.union_ids
                .insert(userid.to_string(), union_id.to_string());
            self
        }

        /// Every side-effect call fails with `BridgeError::Downstream`.
        /// Lookups still succeed.
        #[must_use]
        pub fn failing_writes(mut self) -> Self {
            self.fail_writes = true;
            self
        }

        pub fn calls(&self) -> Vec<NotifierCall> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Calls excluding identity lookups.
        pub fn side_effect_calls(&self) -> Vec<NotifierCall> {
            self.calls()
                .into_iter()
                .filter(|call| !matches!(call, NotifierCall::LookupUnionId { .. }))
                .collect()
        }

        fn record(&self, call: NotifierCall) {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(call);
        }

        fn write(&self, call: NotifierCall) -> Result<(), BridgeError> {
            self.record(call);
            if self.fail_writes {
                return Err(BridgeError::Downstream("Mock DingTalk error".to_string()));
            }
            Ok(())
        }

        fn next_id(&self, prefix: &str) -> String {
            format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[async_trait::async_trait]
    impl Notifier for MockNotifier {
        async fn create_todo(
            &self,
            owner_union_id: &str,
            meeting: &MeetingDetail,
            executor_ids: &[String],
        ) -> Result<String, BridgeError> {
            self.write(NotifierCall::CreateTodo {
                owner: owner_union_id.to_string(),
                meeting_id: meeting.meeting_id.clone(),
                executors: executor_ids.to_vec(),
            })?;
            Ok(self.next_id("todo"))
        }

        async fn delete_todo(
            &self,
            owner_union_id: &str,
            task_id: &str,
        ) -> Result<(), BridgeError> {
            self.write(NotifierCall::DeleteTodo {
                owner: owner_union_id.to_string(),
                task_id: task_id.to_string(),
            })
        }

        async fn create_calendar_event(
            &self,
            owner_union_id: &str,
            meeting: &MeetingDetail,
            attendee_ids: &[String],
        ) -> Result<String, BridgeError> {
            self.write(NotifierCall::CreateCalendar {
                owner: owner_union_id.to_string(),
                meeting_id: meeting.meeting_id.clone(),
                attendees: attendee_ids.to_vec(),
            })?;
            Ok(self.next_id("event"))
        }

        async fn update_calendar_event(
            &self,
            owner_union_id: &str,
            event_id: &str,
            meeting: &MeetingDetail,
            attendee_ids: &[String],
        ) -> Result<(), BridgeError> {
            self.write(NotifierCall::UpdateCalendar {
                owner: owner_union_id.to_string(),
                event_id: event_id.to_string(),
                meeting_id: meeting.meeting_id.clone(),
                attendees: attendee_ids.to_vec(),
            })
        }

        async fn delete_calendar_event(
            &self,
            owner_union_id: &str,
            event_id: &str,
        ) -> Result<(), BridgeError> {
            self.write(NotifierCall::DeleteCalendar {
                owner: owner_union_id.to_string(),
                event_id: event_id.to_string(),
            })
        }

        async fn send_recording_card(
            &self,
            user_ids: &[String],
            card: &RecordingCard,
        ) -> Result<(), BridgeError> {
            self.write(NotifierCall::SendCard {
                user_ids: user_ids.to_vec(),
                card: card.clone(),
            })
        }

        async fn lookup_union_id(&self, userid: &str) -> Result<Option<String>, BridgeError> {
            self.record(NotifierCall::LookupUnionId {
                userid: userid.to_string(),
            });
            Ok(self.union_ids.get(userid).cloned())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{MeetingType, RecurringRule};
    use common::secret::SecretString;
    use tokio::sync::watch;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // 2023-11-15 14:00 Shanghai
    const START: i64 = 1_700_028_000;

    fn client_for(server: &MockServer) -> (DingtalkClient, watch::Sender<SecretString>) {
        let (tx, rx) = watch::channel(SecretString::from("test-access-token"));
        let settings = DingtalkSettings {
            api_url: server.uri(),
            oapi_url: server.uri(),
            robot_code: "robot-1".to_string(),
            links: AppLinkBuilder::new("agent-1", "corp-1"),
        };
        let client = DingtalkClient::new(settings, TokenReceiver::from_test_channel(rx)).unwrap();
        (client, tx)
    }

    fn meeting() -> MeetingDetail {
        MeetingDetail {
            meeting_id: "m-1".to_string(),
            meeting_code: "123456789".to_string(),
            subject: "Weekly sync".to_string(),
            start_time: START,
            end_time: START + 3600,
            join_url: "https://meeting.tencent.com/dm/abc".to_string(),
            ..MeetingDetail::default()
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[tokio::test]
    async fn test_create_todo_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/todo/users/union-owner/tasks"))
            .and(query_param("operatorId", "union-owner"))
            .and(header(ACCESS_TOKEN_HEADER, "test-access-token"))
            .and(body_partial_json(serde_json::json!({
                "sourceId": "m-1_todo",
                "subject": "腾讯会议：Weekly sync - 会议号：123456789 - 时间：2023年11月15日14:00 - 15:00",
                "creatorId": "union-owner",
                "dueTime": START * 1000,
                "reminderTimeStamp": START * 1000,
                "executorIds": ["union-owner", "union-2"],
                "detailUrl": {
                    "appUrl": "https://meeting.tencent.com/dm/abc",
                    "pcUrl": "https://applink.dingtalk.com/page/h5_app_open?appId=agent-1&corpId=corp-1&appType=2&path=%3FmeetingCode%3D123456789"
                },
                "notifyConfigs": {"dingNotify": "1"},
                "remindNotifyConfigs": {"dingNotify": "1"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "task-9"})))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _tx) = client_for(&server);
        let task_id = client
            .create_todo("union-owner", &meeting(), &ids(&["union-owner", "union-2"]))
            .await
            .unwrap();

        assert_eq!(task_id, "task-9");
    }

    #[tokio::test]
    async fn test_create_todo_error_status_is_downstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": "invalidParameter",
                "message": "executorIds empty"
            })))
            .mount(&server)
            .await;

        let (client, _tx) = client_for(&server);
        let result = client.create_todo("u", &meeting(), &[]).await;
        assert!(matches!(result, Err(BridgeError::Downstream(_))));
    }

    #[tokio::test]
    async fn test_delete_todo_uses_refreshed_token() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1.0/todo/users/union-owner/tasks/task-9"))
            .and(query_param("operatorId", "union-owner"))
            .and(header(ACCESS_TOKEN_HEADER, "rotated-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": true})))
            .expect(1)
            .mount(&server)
            .await;

        let (client, tx) = client_for(&server);
        tx.send(SecretString::from("rotated-token")).unwrap();

        client.delete_todo("union-owner", "task-9").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_calendar_event_one_off() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/calendar/users/union-owner/calendars/primary/events"))
            .and(body_partial_json(serde_json::json!({
                "summary": "Weekly sync",
                "start": {"dateTime": "2023-11-15T06:00:00.000Z", "timeZone": "Asia/Shanghai"},
                "end": {"dateTime": "2023-11-15T07:00:00.000Z", "timeZone": "Asia/Shanghai"},
                "attendees": [{"id": "union-owner", "isOptional": false}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "event-3"})))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _tx) = client_for(&server);
        let event_id = client
            .create_calendar_event("union-owner", &meeting(), &ids(&["union-owner"]))
            .await
            .unwrap();
        assert_eq!(event_id, "event-3");

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = received.first().unwrap().body_json().unwrap();
        assert!(body.get("recurrence").is_none());
        let description = body["richTextDescription"]["text"].as_str().unwrap();
        assert!(description.starts_with("<a href=\"https://applink.dingtalk.com/page/h5_app_open?"));
        assert!(description.ends_with(">加入会议</a>"));
    }

    #[tokio::test]
    async fn test_recurring_calendar_event_carries_recurrence() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1.0/calendar/users/union-owner/calendars/primary/events/event-3"))
            .and(body_partial_json(serde_json::json!({
                "id": "event-3",
                "recurrence": {
                    "pattern": {"type": "weekly", "interval": 1},
                    "range": {"type": "numbered", "numberOfOccurrences": 6}
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "event-3"})))
            .expect(1)
            .mount(&server)
            .await;

        let recurring = MeetingDetail {
            meeting_type: MeetingType::Recurring,
            recurring_rule: Some(RecurringRule {
                recurring_type: 2,
                until_type: 1,
                until_count: 6,
                customized_recurring_step: 1,
                ..RecurringRule::default()
            }),
            ..meeting()
        };

        let (client, _tx) = client_for(&server);
        client
            .update_calendar_event("union-owner", "event-3", &recurring, &ids(&["union-owner"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_calendar_event() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1.0/calendar/users/union-owner/calendars/primary/events/event-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _tx) = client_for(&server);
        client
            .delete_calendar_event("union-owner", "event-3")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recording_card_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/robot/oToMessages/batchSend"))
            .and(body_partial_json(serde_json::json!({
                "msgKey": "sampleActionCard",
                "robotCode": "robot-1",
                "userIds": ["p-1", "p-2"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"processQueryKey": "k"})))
            .expect(1)
            .mount(&server)
            .await;

        let card = RecordingCard {
            subject: "Weekly sync".to_string(),
            meeting_code: "123456789".to_string(),
            start_time: START,
            end_time: START + 3600,
            creator_name: "Alice".to_string(),
            view_address: "https://meeting.tencent.com/v/rec".to_string(),
        };

        let (client, _tx) = client_for(&server);
        client
            .send_recording_card(&ids(&["p-1", "p-2"]), &card)
            .await
            .unwrap();

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = received.first().unwrap().body_json().unwrap();
        let params: serde_json::Value =
            serde_json::from_str(body["msgParam"].as_str().unwrap()).unwrap();

        assert_eq!(params["title"], "【录制文件已生成】Weekly sync");
        assert_eq!(params["singleTitle"], "点击查看云录制");
        assert_eq!(
            params["text"],
            "会议时间：2023年11月15日14:00 - 15:00\n\n云录制地址：\nhttps://meeting.tencent.com/v/rec\n\n#腾讯会议：123456789\n\n发起人 Alice"
        );
        let target = STANDARD.encode("https://meeting.tencent.com/v/rec");
        let expected_url = AppLinkBuilder::new("agent-1", "corp-1").h5_link(&format!("?targetUrl={target}"));
        assert_eq!(params["singleURL"], expected_url.as_str());
    }

    #[tokio::test]
    async fn test_recording_card_rejects_oversized_batch() {
        let server = MockServer::start().await;
        let (client, _tx) = client_for(&server);
        let recipients: Vec<String> = (0..=MAX_CARD_RECIPIENTS).map(|i| format!("u-{i}")).collect();
        let card = RecordingCard {
            subject: String::new(),
            meeting_code: String::new(),
            start_time: START,
            end_time: START,
            creator_name: String::new(),
            view_address: String::new(),
        };

        let result = client.send_recording_card(&recipients, &card).await;
        assert!(matches!(result, Err(BridgeError::Internal(_))));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_union_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/topapi/v2/user/get"))
            .and(query_param("access_token", "test-access-token"))
            .and(body_partial_json(serde_json::json!({"userid": "u-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 0,
                "errmsg": "ok",
                "result": {"unionid": "union-1", "name": "Alice"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/topapi/v2/user/get"))
            .and(body_partial_json(serde_json::json!({"userid": "ghost"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 60121,
                "errmsg": "user not found"
            })))
            .mount(&server)
            .await;

        let (client, _tx) = client_for(&server);
        assert_eq!(
            client.lookup_union_id("u-1").await.unwrap().as_deref(),
            Some("union-1")
        );
        assert!(client.lookup_union_id("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mock_notifier_records_calls() {
        let mock = mock::MockNotifier::new().with_union_id("u-1", "union-1");

        assert_eq!(
            mock.lookup_union_id("u-1").await.unwrap().as_deref(),
            Some("union-1")
        );
        let first = mock.create_todo("union-1", &meeting(), &[]).await.unwrap();
        let second = mock
            .create_calendar_event("union-1", &meeting(), &[])
            .await
            .unwrap();

        assert_eq!(first, "todo-1");
        assert_eq!(second, "event-2");
        assert_eq!(mock.calls().len(), 3);
        assert_eq!(mock.side_effect_calls().len(), 2);

        let failing = mock::MockNotifier::new().failing_writes();
        assert!(failing.delete_todo("u", "t").await.is_err());
        assert_eq!(failing.calls().len(), 1);
    }
}
