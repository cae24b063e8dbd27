//! WeMeet REST API client.
//!
//! Every request is signed with the application's secret key:
//!
//! ```text
//! METHOD \n X-TC-Key=..&X-TC-Nonce=..&X-TC-Timestamp=.. \n URI \n BODY
//! ```
//!
//! HMAC-SHA256 over that string, lowercase hex, then Base64 of the hex text.
//! Only the read endpoints the event handlers need are implemented.

use crate::errors::BridgeError;
use crate::models::MeetingDetail;
use crate::observability::metrics;
use base64::{engine::general_purpose::STANDARD, Engine};
use common::secret::{ExposeSecret, SecretString};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const API_VERSION: &str = "v1.2.0";

/// Page size for participant listing.
const PARTICIPANT_PAGE_SIZE: u32 = 100;

/// Read access to WeMeet meeting and recording data.
#[async_trait::async_trait]
pub trait MeetingDirectory: Send + Sync {
    /// Authoritative meeting detail, queried as `operator_userid`.
    async fn meeting_detail(
        &self,
        meeting_id: &str,
        operator_userid: &str,
    ) -> Result<Option<MeetingDetail>, BridgeError>;

    /// Most recent `meeting_record_id` for recordings since `since_epoch_secs`.
    async fn latest_recording(
        &self,
        meeting_id: &str,
        operator_userid: &str,
        since_epoch_secs: i64,
    ) -> Result<Option<String>, BridgeError>;

    /// Playback address of the first file in a recording.
    async fn recording_address(
        &self,
        meeting_record_id: &str,
        userid: &str,
    ) -> Result<Option<String>, BridgeError>;

    /// User ids of everyone who attended.
    async fn meeting_participants(
        &self,
        meeting_id: &str,
        userid: &str,
    ) -> Result<Vec<String>, BridgeError>;
}

/// Application credentials for the WeMeet REST API.
#[derive(Clone)]
pub struct WemeetCredentials {
    pub app_id: String,
    pub sdk_id: String,
    pub secret_id: String,
    pub secret_key: SecretString,
}

impl std::fmt::Debug for WemeetCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WemeetCredentials")
            .field("app_id", &self.app_id)
            .field("sdk_id", &self.sdk_id)
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Build the `X-TC-Signature` value for one request.
pub fn sign_request(
    secret_id: &str,
    secret_key: &str,
    method: &str,
    nonce: &str,
    timestamp: &str,
    uri: &str,
    body: &str,
) -> String {
    let header_string = format!("X-TC-Key={secret_id}&X-TC-Nonce={nonce}&X-TC-Timestamp={timestamp}");
    let string_to_sign = format!("{method}\n{header_string}\n{uri}\n{body}");

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret_key.as_bytes());
    let tag = hmac::sign(&key, string_to_sign.as_bytes());
    STANDARD.encode(hex::encode(tag.as_ref()))
}

#[derive(Deserialize)]
struct MeetingListResponse {
    #[serde(default)]
    meeting_info_list: Vec<MeetingDetail>,
}

#[derive(Deserialize)]
struct RecordMeetingsResponse {
    #[serde(default)]
    record_meetings: Vec<RecordMeeting>,
}

#[derive(Deserialize)]
struct RecordMeeting {
    meeting_record_id: String,
}

#[derive(Deserialize)]
struct AddressResponse {
    #[serde(default, deserialize_with = "crate::models::lenient_i64")]
    total_count: i64,
    #[serde(default)]
    record_files: Vec<RecordFile>,
}

#[derive(Deserialize)]
struct RecordFile {
    #[serde(default)]
    view_address: String,
}

#[derive(Deserialize)]
struct ParticipantsResponse {
    #[serde(default)]
    participants: Vec<Participant>,
}

#[derive(Deserialize)]
struct Participant {
    #[serde(default)]
    userid: String,
}

/// Signed HTTP client for the WeMeet REST API.
pub struct WemeetClient {
    http: reqwest::Client,
    base_url: String,
    credentials: WemeetCredentials,
    rng: SystemRandom,
}

impl WemeetClient {
    /// # Errors
    ///
    /// Returns `BridgeError::Internal` if the HTTP client cannot be built.
    pub fn new(base_url: String, credentials: WemeetCredentials) -> Result<Self, BridgeError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::Internal(format!("Failed to build WeMeet client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            credentials,
            rng: SystemRandom::new(),
        })
    }

    fn nonce(&self) -> Result<String, BridgeError> {
        let mut bytes = [0u8; 4];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| BridgeError::Internal("Failed to generate request nonce".into()))?;
        // WeMeet expects a positive integer
        Ok((u32::from_be_bytes(bytes) % 9_000_000 + 1_000_000).to_string())
    }

    /// Signed GET of `uri` (path plus query) decoded as `T`.
    async fn get<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        uri: &str,
    ) -> Result<T, BridgeError> {
        let start = Instant::now();
        let nonce = self.nonce()?;
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = sign_request(
            &self.credentials.secret_id,
            self.credentials.secret_key.expose_secret(),
            "GET",
            &nonce,
            &timestamp,
            uri,
            "",
        );

        let result = self
            .http
            .get(format!("{}{uri}", self.base_url))
            .header("Content-Type", "application/json")
            .header("Wemeet-Version", API_VERSION)
            .header("X-TC-Key", &self.credentials.secret_id)
            .header("X-TC-Timestamp", &timestamp)
            .header("X-TC-Nonce", &nonce)
            .header("X-TC-Signature", signature)
            .header("X-TC-Registered", "1")
            .header("AppId", &self.credentials.app_id)
            .header("SdkId", &self.credentials.sdk_id)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                metrics::record_downstream_request("wemeet", operation, "error", start.elapsed());
                warn!(target: "bridge.wemeet", operation, error = %e, "WeMeet request failed");
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            metrics::record_downstream_request("wemeet", operation, "error", start.elapsed());
            warn!(
                target: "bridge.wemeet",
                operation,
                status = %status,
                body = %body,
                "WeMeet returned an error"
            );
            return Err(BridgeError::Downstream(format!(
                "WeMeet {operation} returned {status}"
            )));
        }

        let parsed = response.json::<T>().await;
        let outcome = if parsed.is_ok() { "success" } else { "error" };
        metrics::record_downstream_request("wemeet", operation, outcome, start.elapsed());

        parsed.map_err(|e| {
            warn!(target: "bridge.wemeet", operation, error = %e, "Unparseable WeMeet response");
            BridgeError::Downstream(format!("WeMeet {operation} response invalid: {e}"))
        })
    }
}

fn encode(value: &str) -> std::borrow::Cow<'_, str> {
    urlencoding::encode(value)
}

#[async_trait::async_trait]
impl MeetingDirectory for WemeetClient {
    #[instrument(skip_all, name = "bridge.wemeet.meeting_detail", fields(meeting_id = %meeting_id))]
    async fn meeting_detail(
        &self,
        meeting_id: &str,
        operator_userid: &str,
    ) -> Result<Option<MeetingDetail>, BridgeError> {
        let uri = format!(
            "/v1/meetings/{}?userid={}&instanceid=1",
            encode(meeting_id),
            encode(operator_userid)
        );
        let response: MeetingListResponse = self.get("meeting_detail", &uri).await?;
        Ok(response.meeting_info_list.into_iter().next())
    }

    #[instrument(skip_all, name = "bridge.wemeet.latest_recording", fields(meeting_id = %meeting_id))]
    async fn latest_recording(
        &self,
        meeting_id: &str,
        operator_userid: &str,
        since_epoch_secs: i64,
    ) -> Result<Option<String>, BridgeError> {
        let now = chrono::Utc::now().timestamp();
        let uri = format!(
            "/v1/records?meeting_id={}&start_time={since_epoch_secs}&end_time={now}&operator_id={}&operator_id_type=1",
            encode(meeting_id),
            encode(operator_userid)
        );
        let response: RecordMeetingsResponse = self.get("list_records", &uri).await?;
        Ok(response
            .record_meetings
            .into_iter()
            .next()
            .map(|record| record.meeting_record_id))
    }

    #[instrument(skip_all, name = "bridge.wemeet.recording_address")]
    async fn recording_address(
        &self,
        meeting_record_id: &str,
        userid: &str,
    ) -> Result<Option<String>, BridgeError> {
        let uri = format!(
            "/v1/addresses?meeting_record_id={}&userid={}",
            encode(meeting_record_id),
            encode(userid)
        );
        let response: AddressResponse = self.get("recording_address", &uri).await?;

        if response.total_count == 0 {
            debug!(target: "bridge.wemeet", "Recording has no files yet");
            return Ok(None);
        }

        Ok(response
            .record_files
            .into_iter()
            .map(|file| file.view_address)
            .find(|address| !address.is_empty()))
    }

    #[instrument(skip_all, name = "bridge.wemeet.participants", fields(meeting_id = %meeting_id))]
    async fn meeting_participants(
        &self,
        meeting_id: &str,
        userid: &str,
    ) -> Result<Vec<String>, BridgeError> {
        let uri = format!(
            "/v1/meetings/{}/participants?userid={}&size={PARTICIPANT_PAGE_SIZE}",
            encode(meeting_id),
            encode(userid)
        );
        let response: ParticipantsResponse = self.get("participants", &uri).await?;
        Ok(response
            .participants
            .into_iter()
            .map(|participant| participant.userid)
            .filter(|id| !id.is_empty())
            .collect())
    }
}

/// In-process `MeetingDirectory` for tests.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves canned meeting data. Unknown ids resolve to `None` / empty.
    #[derive(Default)]
    pub struct MockMeetingDirectory {
        details: HashMap<String, MeetingDetail>,
        recordings: HashMap<String, String>,
        addresses: HashMap<String, String>,
        participants: HashMap<String, Vec<String>>,
        fail: bool,
        call_count: AtomicUsize,
    }

    impl MockMeetingDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every call returns `BridgeError::Downstream`.
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        #[must_use]
        pub fn with_meeting(mut self, detail: MeetingDetail) -> Self {
            self.details.insert(detail.meeting_id.clone(), detail);
            self
        }

        #[must_use]
        pub fn with_recording(mut self, meeting_id: &str, record_id: &str, address: &str) -> Self {
            self.recordings
                .insert(meeting_id.to_string(), record_id.to_string());
            self.addresses
                .insert(record_id.to_string(), address.to_string());
            self
        }

        #[must_use]
        pub fn with_participants(mut self, meeting_id: &str, userids: &[&str]) -> Self {
            self.participants.insert(
                meeting_id.to_string(),
                userids.iter().map(|id| (*id).to_string()).collect(),
            );
            self
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        fn record_call(&self) -> Result<(), BridgeError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BridgeError::Downstream("Mock WeMeet error".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl MeetingDirectory for MockMeetingDirectory {
        async fn meeting_detail(
            &self,
            meeting_id: &str,
            _operator_userid: &str,
        ) -> Result<Option<MeetingDetail>, BridgeError> {
            self.record_call()?;
            Ok(self.details.get(meeting_id).cloned())
        }

        async fn latest_recording(
            &self,
            meeting_id: &str,
            _operator_userid: &str,
            _since_epoch_secs: i64,
        ) -> Result<Option<String>, BridgeError> {
            self.record_call()?;
            Ok(self.recordings.get(meeting_id).cloned())
        }

        async fn recording_address(
            &self,
            meeting_record_id: &str,
            _userid: &str,
        ) -> Result<Option<String>, BridgeError> {
            self.record_call()?;
            Ok(self.addresses.get(meeting_record_id).cloned())
        }

        async fn meeting_participants(
            &self,
            meeting_id: &str,
            _userid: &str,
        ) -> Result<Vec<String>, BridgeError> {
            self.record_call()?;
            Ok(self
                .participants
                .get(meeting_id)
                .cloned()
                .unwrap_or_default())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn credentials() -> WemeetCredentials {
        WemeetCredentials {
            app_id: "app-1".to_string(),
            sdk_id: "sdk-1".to_string(),
            secret_id: "secret-id".to_string(),
            secret_key: SecretString::from("secret-key"),
        }
    }

    async fn client_for(server: &MockServer) -> WemeetClient {
        WemeetClient::new(server.uri(), credentials()).unwrap()
    }

    fn header_value(request: &Request, name: &str) -> String {
        request
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn test_sign_request_matches_manual_computation() {
        let expected_input =
            "GET\nX-TC-Key=sid&X-TC-Nonce=1234567&X-TC-Timestamp=1700000000\n/v1/meetings/m-1?userid=u&instanceid=1\n";
        let key = hmac::Key::new(hmac::HMAC_SHA256, b"skey");
        let expected = STANDARD.encode(hex::encode(
            hmac::sign(&key, expected_input.as_bytes()).as_ref(),
        ));

        let signature = sign_request(
            "sid",
            "skey",
            "GET",
            "1234567",
            "1700000000",
            "/v1/meetings/m-1?userid=u&instanceid=1",
            "",
        );

        assert_eq!(signature, expected);
    }

    #[test]
    fn test_credentials_debug_redacts_key() {
        let debug_str = format!("{:?}", credentials());
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("secret-key"));
    }

    #[tokio::test]
    async fn test_meeting_detail_sends_signed_request() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/meetings/m-1"))
            .and(query_param("userid", "creator"))
            .and(query_param("instanceid", "1"))
            .and(header("X-TC-Key", "secret-id"))
            .and(header("X-TC-Registered", "1"))
            .and(header("AppId", "app-1"))
            .and(header("SdkId", "sdk-1"))
            .and(header_exists("X-TC-Signature"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "meeting_number": 1,
                "meeting_info_list": [{
                    "meeting_id": "m-1",
                    "meeting_code": "123456789",
                    "subject": "Review",
                    "meeting_type": 0,
                    "start_time": "1700000000",
                    "end_time": "1700003600",
                    "join_url": "https://meeting.tencent.com/dm/x",
                    "hosts": [{"userid": "h-1"}],
                    "participants": [{"userid": "p-1"}]
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let detail = client_for(&server)
            .await
            .meeting_detail("m-1", "creator")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(detail.meeting_code, "123456789");
        assert_eq!(detail.start_time, 1_700_000_000);

        // Signature verifies against the headers that were sent
        let received = server.received_requests().await.unwrap();
        let request = received.first().unwrap();
        let uri = format!(
            "{}?{}",
            request.url.path(),
            request.url.query().unwrap_or_default()
        );
        let expected = sign_request(
            "secret-id",
            "secret-key",
            "GET",
            &header_value(request, "X-TC-Nonce"),
            &header_value(request, "X-TC-Timestamp"),
            &uri,
            "",
        );
        assert_eq!(header_value(request, "X-TC-Signature"), expected);
    }

    #[tokio::test]
    async fn test_meeting_detail_empty_list_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/meetings/m-2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"meeting_info_list": []})),
            )
            .mount(&server)
            .await;

        let detail = client_for(&server)
            .await
            .meeting_detail("m-2", "u")
            .await
            .unwrap();
        assert!(detail.is_none());
    }

    #[tokio::test]
    async fn test_error_status_is_downstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error_info": {"error_code": 200003, "message": "bad"}
            })))
            .mount(&server)
            .await;

        let result = client_for(&server).await.meeting_detail("m-1", "u").await;
        assert!(matches!(result, Err(BridgeError::Downstream(_))));
    }

    #[tokio::test]
    async fn test_latest_recording_returns_first_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/records"))
            .and(query_param("meeting_id", "m-1"))
            .and(query_param("start_time", "1699913600"))
            .and(query_param("operator_id", "creator"))
            .and(query_param("operator_id_type", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "record_meetings": [
                    {"meeting_record_id": "rec-2"},
                    {"meeting_record_id": "rec-1"}
                ]
            })))
            .mount(&server)
            .await;

        let record = client_for(&server)
            .await
            .latest_recording("m-1", "creator", 1_699_913_600)
            .await
            .unwrap();
        assert_eq!(record.as_deref(), Some("rec-2"));
    }

    #[tokio::test]
    async fn test_recording_address_zero_total_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/addresses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 0,
                "record_files": []
            })))
            .mount(&server)
            .await;

        let address = client_for(&server)
            .await
            .recording_address("rec-1", "u")
            .await
            .unwrap();
        assert!(address.is_none());
    }

    #[tokio::test]
    async fn test_recording_address_returns_view_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/addresses"))
            .and(query_param("meeting_record_id", "rec-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 1,
                "record_files": [{"record_file_id": "f", "view_address": "https://meeting.tencent.com/v/rec"}]
            })))
            .mount(&server)
            .await;

        let address = client_for(&server)
            .await
            .recording_address("rec-1", "u")
            .await
            .unwrap();
        assert_eq!(address.as_deref(), Some("https://meeting.tencent.com/v/rec"));
    }

    #[tokio::test]
    async fn test_participants_skip_blank_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/meetings/m-1/participants"))
            .and(query_param("size", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "participants": [
                    {"userid": "p-1"},
                    {"userid": ""},
                    {"userid": "p-2"}
                ]
            })))
            .mount(&server)
            .await;

        let participants = client_for(&server)
            .await
            .meeting_participants("m-1", "creator")
            .await
            .unwrap();
        assert_eq!(participants, vec!["p-1", "p-2"]);
    }

    #[tokio::test]
    async fn test_mock_directory() {
        let mock = mock::MockMeetingDirectory::new()
            .with_meeting(MeetingDetail {
                meeting_id: "m-1".to_string(),
                ..MeetingDetail::default()
            })
            .with_recording("m-1", "rec-1", "https://view")
            .with_participants("m-1", &["p-1"]);

        assert!(mock.meeting_detail("m-1", "u").await.unwrap().is_some());
        assert!(mock.meeting_detail("m-2", "u").await.unwrap().is_none());
        assert_eq!(
            mock.latest_recording("m-1", "u", 0).await.unwrap().as_deref(),
            Some("rec-1")
        );
        assert_eq!(
            mock.recording_address("rec-1", "u").await.unwrap().as_deref(),
            Some("https://view")
        );
        assert_eq!(mock.meeting_participants("m-1", "u").await.unwrap(), vec!["p-1"]);
        assert_eq!(mock.call_count(), 5);

        let failing = mock::MockMeetingDirectory::failing();
        assert!(failing.meeting_detail("m-1", "u").await.is_err());
    }
}
