//! Thin façade over the external room-provisioning API.
//!
//! Exactly four calls: create a room for a document/context pair, join
//! an existing room, leave a room, and fetch a bootstrap snapshot. The
//! session decides whether a failure is surfaced or retried; this
//! module only classifies it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tandem_crdt::Snapshot;

use crate::presence::PresenceUser;

/// Connection credentials for one room. Immutable once issued — on
/// token expiry a new `RoomInfo` is requested, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: String,
    pub ws_url: String,
    pub join_token: String,
    /// Milliseconds since the epoch.
    pub expires_at: u64,
}

/// Bootstrap payload for a newly joining client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    pub snapshot: Snapshot,
    pub presence: Vec<PresenceUser>,
}

/// Provisioning failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Network failure or server-side error; retrying may help.
    RoomUnavailable(String),
    /// The room id (or document) does not exist.
    RoomNotFound(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoomUnavailable(msg) => write!(f, "room unavailable: {msg}"),
            Self::RoomNotFound(msg) => write!(f, "room not found: {msg}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

/// The four provisioning calls the session depends on.
///
/// Trait-object seam so tests and embedders can swap the HTTP client
/// for an in-memory directory.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn create_room(
        &self,
        document_id: &str,
        context_id: &str,
    ) -> Result<RoomInfo, DirectoryError>;

    async fn join_room(&self, room_id: &str) -> Result<RoomInfo, DirectoryError>;

    async fn leave_room(&self, room_id: &str) -> Result<(), DirectoryError>;

    async fn get_bootstrap(&self, document_id: &str) -> Result<Bootstrap, DirectoryError>;
}

/// HTTP implementation against the provisioning service.
pub struct HttpRoomDirectory {
    base_url: String,
    http: reqwest::Client,
}

impl HttpRoomDirectory {
    pub fn new(base_url: impl Into<String>) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| DirectoryError::RoomUnavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn expect_json<T: serde::de::DeserializeOwned>(
        result: Result<reqwest::Response, reqwest::Error>,
        what: &str,
    ) -> Result<T, DirectoryError> {
        let response = result.map_err(|e| DirectoryError::RoomUnavailable(e.to_string()))?;
        Self::classify_status(&response, what)?;
        response
            .json::<T>()
            .await
            .map_err(|e| DirectoryError::RoomUnavailable(format!("{what}: {e}")))
    }

    fn classify_status(response: &reqwest::Response, what: &str) -> Result<(), DirectoryError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DirectoryError::RoomNotFound(what.to_string()));
        }
        if !status.is_success() {
            return Err(DirectoryError::RoomUnavailable(format!(
                "{what}: HTTP {status}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RoomDirectory for HttpRoomDirectory {
    async fn create_room(
        &self,
        document_id: &str,
        context_id: &str,
    ) -> Result<RoomInfo, DirectoryError> {
        let result = self
            .http
            .post(self.url("rooms"))
            .json(&serde_json::json!({
                "documentId": document_id,
                "contextId": context_id,
            }))
            .send()
            .await;
        Self::expect_json(result, "create room").await
    }

    async fn join_room(&self, room_id: &str) -> Result<RoomInfo, DirectoryError> {
        let result = self
            .http
            .post(self.url(&format!("rooms/{room_id}/join")))
            .send()
            .await;
        Self::expect_json(result, "join room").await
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), DirectoryError> {
        let result = self
            .http
            .post(self.url(&format!("rooms/{room_id}/leave")))
            .send()
            .await;
        let response = result.map_err(|e| DirectoryError::RoomUnavailable(e.to_string()))?;
        Self::classify_status(&response, "leave room")
    }

    async fn get_bootstrap(&self, document_id: &str) -> Result<Bootstrap, DirectoryError> {
        let result = self
            .http
            .get(self.url(&format!("documents/{document_id}/bootstrap")))
            .send()
            .await;
        Self::expect_json(result, "bootstrap").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_info_wire_shape() {
        let info = RoomInfo {
            room_id: "r1".into(),
            ws_url: "wss://collab.example.test/rooms/r1".into(),
            join_token: "tok".into(),
            expires_at: 1_000,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"roomId\":\"r1\""));
        assert!(json.contains("\"wsUrl\""));
        assert!(json.contains("\"joinToken\""));
        assert!(json.contains("\"expiresAt\":1000"));
        let back: RoomInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_bootstrap_wire_shape() {
        let boot = Bootstrap {
            snapshot: Snapshot::empty(),
            presence: Vec::new(),
        };
        let json = serde_json::to_string(&boot).unwrap();
        let back: Bootstrap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, boot);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            DirectoryError::RoomNotFound("join room".into()).to_string(),
            "room not found: join room"
        );
        assert_eq!(
            DirectoryError::RoomUnavailable("HTTP 503".into()).to_string(),
            "room unavailable: HTTP 503"
        );
    }

    #[test]
    fn test_base_url_normalization() {
        let dir = HttpRoomDirectory::new("https://api.example.test/").unwrap();
        assert_eq!(dir.url("rooms"), "https://api.example.test/rooms");
    }
}
