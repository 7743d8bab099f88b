use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ServerId = String;
pub type SessionId = String;
pub type MessageId = String;
pub type CorrelationId = String;

pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 120;

/// Resolves the per-turn watchdog interval; absent or zero means the default.
pub fn effective_timeout(secs: Option<u64>) -> Duration {
    match secs {
        Some(secs) if secs > 0 => Duration::from_secs(secs),
        _ => Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClientId {
    Standalone,
    Popup,
}

impl ClientId {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientId::Standalone => "standalone",
            ClientId::Popup => "popup",
        }
    }

    /// Host event carrying inbound frames for this client.
    pub fn message_event(self) -> String {
        format!("ws-message-{}", self.as_str())
    }

    /// Host event signalling a channel failure for this client.
    pub fn error_event(self) -> String {
        format!("ws-error-{}", self.as_str())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ServerConfig {
    pub id: ServerId,
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

const fn default_enabled() -> bool {
    true
}

/// Stages of an assistant response, declared in pipeline order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    QueryIntent,
    Tools,
    FetchSource,
    PickSource,
    DeepRead,
    Think,
    Response,
    ReplyEnd,
}

impl StageKind {
    pub fn is_terminal(self) -> bool {
        self == StageKind::ReplyEnd
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::QueryIntent => "query_intent",
            StageKind::Tools => "tools",
            StageKind::FetchSource => "fetch_source",
            StageKind::PickSource => "pick_source",
            StageKind::DeepRead => "deep_read",
            StageKind::Think => "think",
            StageKind::Response => "response",
            StageKind::ReplyEnd => "reply_end",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded fragment of a streaming assistant response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    #[serde(rename = "reply_to_message")]
    pub reply_to_message_id: CorrelationId,
    #[serde(rename = "chunk_type")]
    pub stage: StageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_sequence: Option<u64>,
}

impl Chunk {
    pub fn text(&self) -> &str {
        self.message_chunk.as_deref().unwrap_or_default()
    }

    pub fn replies_to(&self, correlation_id: Option<&str>) -> bool {
        correlation_id == Some(self.reply_to_message_id.as_str())
    }
}

/// A frozen stage record attached to an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageDetail {
    #[serde(rename = "type")]
    pub stage: StageKind,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<StageDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn user(id: impl Into<MessageId>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: MessageRole::User,
            text: text.into(),
            assistant_id: None,
            details: Vec::new(),
            question: None,
            created_at: Some(Utc::now()),
        }
    }

    pub fn assistant(
        id: impl Into<MessageId>,
        text: impl Into<String>,
        details: Vec<StageDetail>,
        question: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            role: MessageRole::Assistant,
            text: text.into(),
            assistant_id: None,
            details,
            question: Some(question.into()),
            created_at: Some(Utc::now()),
        }
    }

    pub fn detail(&self, stage: StageKind) -> Option<&StageDetail> {
        self.details.iter().find(|detail| detail.stage == stage)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// Server-assigned; `None` while the session is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    pub fn pending() -> Self {
        let now = Utc::now();
        Self {
            id: None,
            title: None,
            created_at: Some(now),
            updated_at: Some(now),
            messages: Vec::new(),
        }
    }

    pub fn confirmed(id: impl Into<SessionId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_none()
    }
}

/// Request-scoped feature flags sent with every chat turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FeatureFlags {
    pub search: bool,
    pub deep_thinking: bool,
    pub mcp: bool,
    #[serde(default)]
    pub datasource_ids: Vec<String>,
    #[serde(default)]
    pub mcp_server_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,
}

impl FeatureFlags {
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("search", self.search.to_string()),
            ("deep_thinking", self.deep_thinking.to_string()),
            ("mcp", self.mcp.to_string()),
            ("datasource", self.datasource_ids.join(",")),
            ("mcp_servers", self.mcp_server_ids.join(",")),
            (
                "assistant_id",
                self.assistant_id.clone().unwrap_or_default(),
            ),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTurn {
    pub session: Session,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentTurn {
    pub correlation_id: CorrelationId,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SessionQuery {
    pub from: u32,
    pub size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl SessionQuery {
    pub fn first_page(size: u32) -> Self {
        Self {
            from: 0,
            size,
            query: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

/// Request/response calls against a chat server.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn new_turn(
        &self,
        server_id: &str,
        channel_token: &str,
        message: &str,
        flags: &FeatureFlags,
    ) -> Result<NewTurn>;

    async fn send_turn(
        &self,
        server_id: &str,
        channel_token: &str,
        session_id: &str,
        message: &str,
        flags: &FeatureFlags,
    ) -> Result<SentTurn>;

    async fn open_session(&self, server_id: &str, session_id: &str) -> Result<Session>;
    async fn cancel_turn(&self, server_id: &str, session_id: &str) -> Result<()>;
    async fn close_session(&self, server_id: &str, session_id: &str) -> Result<()>;
    async fn list_sessions(&self, server_id: &str, query: &SessionQuery) -> Result<Page<Session>>;

    async fn session_history(
        &self,
        server_id: &str,
        session_id: &str,
        from: u32,
        size: u32,
    ) -> Result<Page<Message>>;

    async fn rename_session(&self, server_id: &str, session_id: &str, title: &str)
    -> Result<bool>;
    async fn delete_session(&self, server_id: &str, session_id: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_chunk() {
        let chunk: Chunk = serde_json::from_str(
            r#"{"reply_to_message":"c1","chunk_type":"response","message_chunk":"Hi","chunk_sequence":3}"#,
        )
        .expect("chunk");
        assert_eq!(chunk.stage, StageKind::Response);
        assert_eq!(chunk.text(), "Hi");
        assert!(chunk.replies_to(Some("c1")));
        assert!(!chunk.replies_to(Some("c2")));
        assert!(!chunk.replies_to(None));
    }

    #[test]
    fn stage_order_follows_pipeline() {
        assert!(StageKind::QueryIntent < StageKind::Tools);
        assert!(StageKind::Think < StageKind::Response);
        assert!(StageKind::Response < StageKind::ReplyEnd);
    }

    #[test]
    fn zero_timeout_falls_back_to_default() {
        assert_eq!(effective_timeout(None), Duration::from_secs(120));
        assert_eq!(effective_timeout(Some(0)), Duration::from_secs(120));
        assert_eq!(effective_timeout(Some(2)), Duration::from_secs(2));
    }

    #[test]
    fn feature_flags_join_ids() {
        let flags = FeatureFlags {
            search: true,
            datasource_ids: vec!["a".into(), "b".into()],
            ..FeatureFlags::default()
        };
        let pairs = flags.to_query_pairs();
        assert!(pairs.contains(&("search", "true".to_string())));
        assert!(pairs.contains(&("datasource", "a,b".to_string())));
        assert!(pairs.contains(&("assistant_id", String::new())));
    }
}
