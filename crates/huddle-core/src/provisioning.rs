use serde::{Deserialize, Serialize};

use crate::errors::HuddleError;
use crate::expectation::{RtcType, SessionExpectation};

const SOURCE_CHANNEL_ID: &str = "channel_app";
const DEVICE_TYPE: &str = "app";

/// Room description returned by the provisioning API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomResponse {
    #[serde(default)]
    pub source_channel_id: String,
    #[serde(default)]
    pub source_channel_type: i64,
    pub room_id: String,
    #[serde(default)]
    pub creator: String,
    pub token: String,
    pub url: String,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub created_at: String,
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub rtc_type: i64,
    #[serde(default)]
    pub uids: Vec<String>,
}

fn default_max_participants() -> usize {
    2
}

fn default_timeout() -> u64 {
    30
}

impl RoomResponse {
    /// Describe the session `login_identity` is about to join.
    pub fn into_expectation(self, login_identity: &str) -> SessionExpectation {
        SessionExpectation {
            room_name: self.room_id,
            url: self.url,
            token: self.token,
            max_participants: self.max_participants,
            rtc_type: RtcType::from_code(self.rtc_type),
            is_p2p: false,
            identities: self.uids,
            creator: self.creator,
            login_identity: login_identity.to_string(),
            timeout_secs: self.timeout,
        }
    }
}

#[derive(Serialize)]
struct CreateRoomBody<'a> {
    source_channel_id: &'a str,
    source_channel_type: i64,
    creator: &'a str,
    room_id: &'a str,
    rtc_type: i64,
    invite_on: i64,
    max_participants: usize,
    uids: &'a [String],
    device_type: &'a str,
}

#[derive(Serialize)]
struct JoinRoomBody<'a> {
    uid: &'a str,
    device_type: &'a str,
}

#[derive(Serialize)]
struct LeaveRoomBody<'a> {
    uid: &'a str,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Generate a fresh room id.
pub fn new_room_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Client for the HTTP room-provisioning API.
pub struct ProvisioningClient {
    base_url: String,
    http: reqwest::Client,
}

impl ProvisioningClient {
    /// Build a client for `base_url`. A missing scheme defaults to `http://`.
    pub fn new(base_url: &str) -> Result<Self, HuddleError> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            http: reqwest::Client::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a room owned by `creator`, inviting `uids`.
    pub async fn create_room(
        &self,
        room_id: &str,
        creator: &str,
        uids: &[String],
        max_participants: usize,
        rtc_type: RtcType,
    ) -> Result<RoomResponse, HuddleError> {
        let body = CreateRoomBody {
            source_channel_id: SOURCE_CHANNEL_ID,
            source_channel_type: 0,
            creator,
            room_id,
            rtc_type: rtc_type.code(),
            invite_on: 0,
            max_participants,
            uids,
            device_type: DEVICE_TYPE,
        };
        tracing::info!("creating room {room_id} for {creator}");
        self.post("/api/v1/rooms", &body).await
    }

    pub async fn join_room(&self, room_id: &str, uid: &str) -> Result<RoomResponse, HuddleError> {
        let path = format!("/api/v1/rooms/{}/join", urlencoding::encode(room_id));
        tracing::info!("joining room {room_id} as {uid}");
        self.post(
            &path,
            &JoinRoomBody {
                uid,
                device_type: DEVICE_TYPE,
            },
        )
        .await
    }

    /// Tell the server `uid` left. Failures are logged and otherwise ignored.
    pub async fn leave_room(&self, room_id: &str, uid: &str) {
        let path = format!("/api/v1/rooms/{}/leave", urlencoding::encode(room_id));
        if let Err(e) = self.send(&path, &LeaveRoomBody { uid }).await {
            tracing::warn!("leave room {room_id} failed: {e}");
        }
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<RoomResponse, HuddleError> {
        let resp = self.send(path, body).await?;
        resp.json()
            .await
            .map_err(|e| HuddleError::Decode(e.to_string()))
    }

    async fn send<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response, HuddleError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| HuddleError::Http(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::OK {
            return Ok(resp);
        }
        let message = resp
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| format!("server error ({})", status.as_u16()));
        Err(HuddleError::Server(message))
    }
}

fn normalize_base_url(input: &str) -> Result<String, HuddleError> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(HuddleError::InvalidUrl("empty base URL".into()));
    }
    let lower = trimmed.to_ascii_lowercase();
    let with_scheme = if lower.starts_with("http://") || lower.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    url::Url::parse(&with_scheme).map_err(|e| HuddleError::InvalidUrl(format!("{input}: {e}")))?;
    Ok(with_scheme)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn room_json() -> serde_json::Value {
        json!({
            "source_channel_id": "channel_app",
            "source_channel_type": 0,
            "room_id": "room-1",
            "creator": "alice",
            "token": "jwt",
            "url": "wss://rtc.example.test",
            "status": 1,
            "created_at": "2026-01-18 10:00:00",
            "max_participants": 4,
            "timeout": 45,
            "rtc_type": 1,
            "uids": ["alice", "bob"]
        })
    }

    #[test]
    fn base_url_is_normalized() {
        assert_eq!(normalize_base_url("  example.test:8080/ ").unwrap(), "http://example.test:8080");
        assert_eq!(normalize_base_url("https://example.test//").unwrap(), "https://example.test");
        assert_eq!(normalize_base_url("HTTP://example.test").unwrap(), "HTTP://example.test");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(normalize_base_url("   "), Err(HuddleError::InvalidUrl(_))));
        assert!(matches!(normalize_base_url("http://exa mple"), Err(HuddleError::InvalidUrl(_))));
    }

    #[test]
    fn response_becomes_expectation() {
        let response: RoomResponse = serde_json::from_value(room_json()).unwrap();
        let e = response.into_expectation("bob");

        assert_eq!(e.room_name, "room-1");
        assert_eq!(e.max_participants, 4);
        assert_eq!(e.timeout_secs, 45);
        assert_eq!(e.rtc_type, RtcType::Video);
        assert_eq!(e.identities, vec!["alice", "bob"]);
        assert_eq!(e.login_identity, "bob");
        assert!(!e.is_creator());
        assert!(!e.is_p2p);
    }

    #[test]
    fn sparse_response_uses_defaults() {
        let response: RoomResponse = serde_json::from_value(json!({
            "room_id": "r", "token": "t", "url": "wss://u"
        }))
        .unwrap();
        assert_eq!(response.max_participants, 2);
        assert_eq!(response.timeout, 30);
        assert!(response.uids.is_empty());
    }

    #[test]
    fn room_ids_are_unique() {
        assert_ne!(new_room_id(), new_room_id());
    }

    #[tokio::test]
    async fn create_room_posts_request_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/rooms"))
            .and(body_json(json!({
                "source_channel_id": "channel_app",
                "source_channel_type": 0,
                "creator": "alice",
                "room_id": "room-1",
                "rtc_type": 1,
                "invite_on": 0,
                "max_participants": 4,
                "uids": ["bob"],
                "device_type": "app"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(room_json()))
            .expect(1)
            .mount(&server)
            .await;

        let client = ProvisioningClient::new(&server.uri()).unwrap();
        let room = client
            .create_room("room-1", "alice", &["bob".to_string()], 4, RtcType::Video)
            .await
            .unwrap();

        assert_eq!(room.room_id, "room-1");
        assert_eq!(room.token, "jwt");
    }

    #[tokio::test]
    async fn join_room_surfaces_server_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/rooms/room-1/join"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "room not found"})))
            .mount(&server)
            .await;

        let client = ProvisioningClient::new(&server.uri()).unwrap();
        let err = client.join_room("room-1", "bob").await.unwrap_err();

        assert!(matches!(err, HuddleError::Server(ref m) if m == "room not found"));
    }

    #[tokio::test]
    async fn error_without_message_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/rooms/room-1/join"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;

        let client = ProvisioningClient::new(&server.uri()).unwrap();
        let err = client.join_room("room-1", "bob").await.unwrap_err();

        assert!(matches!(err, HuddleError::Server(ref m) if m == "server error (500)"));
    }

    #[tokio::test]
    async fn join_room_rejects_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/rooms/room-1/join"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = ProvisioningClient::new(&server.uri()).unwrap();
        let err = client.join_room("room-1", "bob").await.unwrap_err();

        assert!(matches!(err, HuddleError::Decode(_)));
    }

    #[tokio::test]
    async fn leave_room_ignores_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/rooms/room-1/leave"))
            .and(body_json(json!({"uid": "bob"})))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let client = ProvisioningClient::new(&server.uri()).unwrap();
        client.leave_room("room-1", "bob").await;
    }
}
