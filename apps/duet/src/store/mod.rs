//! Typed client for the external call-session store.
//!
//! The store owns the durable `CallSession` record that both participants
//! poll and append to; this module is a thin RPC wrapper with error
//! normalization and no call logic of its own.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Calling,
    Active,
    Ended,
    Declined,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Declined)
    }

    /// Legal status advancement: `calling -> active -> ended` and
    /// `calling -> declined`. Terminal states never move again.
    pub fn may_advance_to(self, next: CallStatus) -> bool {
        if self == next {
            return false;
        }
        match self {
            CallStatus::Calling => matches!(
                next,
                CallStatus::Active | CallStatus::Ended | CallStatus::Declined
            ),
            CallStatus::Active => matches!(next, CallStatus::Ended),
            CallStatus::Ended | CallStatus::Declined => false,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Calling => "calling",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
            CallStatus::Declined => "declined",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn wants_video(self) -> bool {
        matches!(self, CallType::Video)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallType::Voice => "voice",
            CallType::Video => "video",
        })
    }
}

/// The shared negotiation record for one call attempt. `offerSDP` and
/// `answerSDP` are write-once; the ICE sequences are append-only and each
/// side writes only to its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: String,
    pub status: CallStatus,
    pub call_type: CallType,
    pub caller_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub caller_username: String,
    #[serde(default)]
    pub receiver_username: String,
    #[serde(rename = "offerSDP", default)]
    pub offer_sdp: Option<String>,
    #[serde(rename = "answerSDP", default)]
    pub answer_sdp: Option<String>,
    #[serde(rename = "callerICE", default)]
    pub caller_ice: Vec<String>,
    #[serde(rename = "receiverICE", default)]
    pub receiver_ice: Vec<String>,
    pub created_at: i64,
}

impl CallSession {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The ICE sequence written by the side opposite to `caller`.
    pub fn remote_ice(&self, caller: bool) -> &[String] {
        if caller {
            &self.receiver_ice
        } else {
            &self.caller_ice
        }
    }
}

/// Terminal outcome recorded by the store once a session dies. A `calling`
/// session that ends without an answer is recorded as `missed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Missed,
    Ended,
    Declined,
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HistoryStatus::Missed => "missed",
            HistoryStatus::Ended => "ended",
            HistoryStatus::Declined => "declined",
        })
    }
}

/// Derived, read-only history record. The core renders it and never
/// computes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistory {
    pub id: String,
    pub status: HistoryStatus,
    pub call_type: CallType,
    pub caller_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub caller_username: String,
    #[serde(default)]
    pub receiver_username: String,
    pub duration_seconds: u64,
    pub timestamp: i64,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("store rejected request: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// RPC surface of the external store. Call components hold this as a
/// trait object so tests can swap in an in-memory store.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn create_call_session(
        &self,
        receiver_id: &str,
        call_type: CallType,
    ) -> Result<CallSession, StoreError>;

    async fn get_call_session(&self, session_id: &str) -> Result<Option<CallSession>, StoreError>;

    /// Most recent non-terminal session addressed to or from the caller;
    /// the incoming-call poller runs on this.
    async fn get_active_call_session(&self) -> Result<Option<CallSession>, StoreError>;

    async fn set_offer(&self, session_id: &str, sdp: &str) -> Result<(), StoreError>;

    async fn set_answer(&self, session_id: &str, sdp: &str) -> Result<(), StoreError>;

    async fn add_ice_candidate(
        &self,
        session_id: &str,
        candidate: &str,
        is_caller_candidate: bool,
    ) -> Result<(), StoreError>;

    async fn update_call_status(
        &self,
        session_id: &str,
        status: CallStatus,
    ) -> Result<(), StoreError>;

    /// Append-ordered, oldest first.
    async fn get_call_history(&self) -> Result<Vec<CallHistory>, StoreError>;
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    base_url: Url,
}

impl StoreConfig {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let mut base = base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(StoreError::InvalidConfig(
                "store base url cannot be empty".into(),
            ));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            base = format!("http://{}", base);
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        let parsed = Url::parse(&base)
            .map_err(|err| StoreError::InvalidConfig(format!("invalid store url: {err}")))?;
        Ok(Self { base_url: parsed })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

/// Production store client speaking JSON over HTTP.
pub struct HttpCallStore {
    config: StoreConfig,
    client: reqwest::Client,
}

impl HttpCallStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url, StoreError> {
        self.config
            .base_url()
            .join(path)
            .map_err(|err| StoreError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<Ack, StoreError> {
        let response = self
            .client
            .post(self.endpoint(path)?)
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::HttpStatus(response.status()));
        }
        Ok(response.json::<Ack>().await?)
    }
}

#[derive(Debug, Deserialize)]
struct Ack {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

impl Ack {
    fn into_result(self) -> Result<(), StoreError> {
        if self.success {
            Ok(())
        } else {
            Err(StoreError::Rejected(
                self.message.unwrap_or_else(|| "unspecified error".into()),
            ))
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    receiver_id: &'a str,
    call_type: CallType,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    session: Option<CallSession>,
}

#[derive(Debug, Serialize)]
struct SdpRequest<'a> {
    sdp: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CandidateRequest<'a> {
    candidate: &'a str,
    is_caller_candidate: bool,
}

#[derive(Debug, Serialize)]
struct StatusRequest {
    status: CallStatus,
}

#[async_trait]
impl CallStore for HttpCallStore {
    async fn create_call_session(
        &self,
        receiver_id: &str,
        call_type: CallType,
    ) -> Result<CallSession, StoreError> {
        let request = CreateSessionRequest {
            receiver_id,
            call_type,
        };
        let response = self
            .client
            .post(self.endpoint("calls")?)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::HttpStatus(response.status()));
        }
        let payload = response.json::<CreateSessionResponse>().await?;
        if !payload.success {
            return Err(StoreError::Rejected(
                payload
                    .message
                    .unwrap_or_else(|| "session creation failed".into()),
            ));
        }
        payload
            .session
            .ok_or_else(|| StoreError::InvalidResponse("missing session in response".into()))
    }

    async fn get_call_session(&self, session_id: &str) -> Result<Option<CallSession>, StoreError> {
        let response = self
            .client
            .get(self.endpoint(&format!("calls/{session_id}"))?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::HttpStatus(response.status()));
        }
        Ok(response.json::<Option<CallSession>>().await?)
    }

    async fn get_active_call_session(&self) -> Result<Option<CallSession>, StoreError> {
        let response = self.client.get(self.endpoint("calls/active")?).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::HttpStatus(response.status()));
        }
        Ok(response.json::<Option<CallSession>>().await?)
    }

    async fn set_offer(&self, session_id: &str, sdp: &str) -> Result<(), StoreError> {
        self.post(&format!("calls/{session_id}/offer"), &SdpRequest { sdp })
            .await?
            .into_result()
    }

    async fn set_answer(&self, session_id: &str, sdp: &str) -> Result<(), StoreError> {
        self.post(&format!("calls/{session_id}/answer"), &SdpRequest { sdp })
            .await?
            .into_result()
    }

    async fn add_ice_candidate(
        &self,
        session_id: &str,
        candidate: &str,
        is_caller_candidate: bool,
    ) -> Result<(), StoreError> {
        self.post(
            &format!("calls/{session_id}/candidates"),
            &CandidateRequest {
                candidate,
                is_caller_candidate,
            },
        )
        .await?
        .into_result()
    }

    async fn update_call_status(
        &self,
        session_id: &str,
        status: CallStatus,
    ) -> Result<(), StoreError> {
        self.post(&format!("calls/{session_id}/status"), &StatusRequest { status })
            .await?
            .into_result()
    }

    async fn get_call_history(&self) -> Result<Vec<CallHistory>, StoreError> {
        let response = self
            .client
            .get(self.endpoint("calls/history")?)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::HttpStatus(response.status()));
        }
        Ok(response.json::<Vec<CallHistory>>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag_allows_only_forward_moves() {
        use CallStatus::*;
        assert!(Calling.may_advance_to(Active));
        assert!(Calling.may_advance_to(Declined));
        assert!(Calling.may_advance_to(Ended));
        assert!(Active.may_advance_to(Ended));

        assert!(!Active.may_advance_to(Calling));
        assert!(!Ended.may_advance_to(Calling));
        assert!(!Ended.may_advance_to(Active));
        assert!(!Declined.may_advance_to(Active));
        assert!(!Declined.may_advance_to(Ended));
        assert!(!Active.may_advance_to(Active));
    }

    #[test]
    fn store_config_normalizes_scheme_and_trailing_slash() {
        let config = StoreConfig::new("store.example.com:9090").unwrap();
        assert_eq!(config.base_url().as_str(), "http://store.example.com:9090/");

        let config = StoreConfig::new("https://store.example.com").unwrap();
        assert_eq!(config.base_url().as_str(), "https://store.example.com/");

        assert!(matches!(
            StoreConfig::new("   "),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn session_record_round_trips_store_field_names() {
        let json = r#"{
            "id": "s1",
            "status": "calling",
            "callType": "video",
            "callerId": "alice",
            "receiverId": "bob",
            "callerUsername": "Alice",
            "receiverUsername": "Bob",
            "offerSDP": "{\"type\":\"offer\",\"sdp\":\"v=0\"}",
            "callerICE": ["cand-1"],
            "receiverICE": [],
            "createdAt": 1700000000
        }"#;
        let session: CallSession = serde_json::from_str(json).unwrap();
        assert_eq!(session.id, "s1");
        assert_eq!(session.status, CallStatus::Calling);
        assert_eq!(session.call_type, CallType::Video);
        assert!(session.offer_sdp.is_some());
        assert!(session.answer_sdp.is_none());
        assert_eq!(session.caller_ice, vec!["cand-1".to_string()]);
        assert_eq!(session.remote_ice(true).len(), 0);
        assert_eq!(session.remote_ice(false).len(), 1);

        let back = serde_json::to_value(&session).unwrap();
        assert_eq!(back["offerSDP"], session.offer_sdp.clone().unwrap());
        assert_eq!(back["callType"], "video");
    }

    #[test]
    fn history_status_maps_missed_variant() {
        let json = r#"{
            "id": "h1",
            "status": "missed",
            "callType": "voice",
            "callerId": "alice",
            "receiverId": "bob",
            "durationSeconds": 0,
            "timestamp": 1700000100
        }"#;
        let entry: CallHistory = serde_json::from_str(json).unwrap();
        assert_eq!(entry.status, HistoryStatus::Missed);
        assert_eq!(entry.duration_seconds, 0);
    }
}
