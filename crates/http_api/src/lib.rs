//! `ChatApi` over the chat server's HTTP endpoints.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use core_types::{
    ChatApi, FeatureFlags, Message, NewTurn, Page, SentTurn, ServerConfig, ServerId, Session,
    SessionQuery,
};
use parking_lot::RwLock;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

mod error;
mod wire;

pub use error::ApiError;

use wire::{Created, Document, Hits, MessageSource, SessionSource};

const API_TOKEN_HEADER: &str = "X-API-TOKEN";
const CHANNEL_TOKEN_HEADER: &str = "WEBSOCKET-SESSION-ID";

pub struct HttpChatApi {
    http: Client,
    servers: RwLock<HashMap<ServerId, ServerConfig>>,
}

impl HttpChatApi {
    /// `allow_self_signature` makes the client accept invalid TLS certificates.
    pub fn new(allow_self_signature: bool) -> Result<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(allow_self_signature)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            servers: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_servers(
        allow_self_signature: bool,
        servers: impl IntoIterator<Item = ServerConfig>,
    ) -> Result<Self> {
        let api = Self::new(allow_self_signature)?;
        for server in servers {
            api.upsert_server(server);
        }
        Ok(api)
    }

    pub fn upsert_server(&self, server: ServerConfig) {
        self.servers.write().insert(server.id.clone(), server);
    }

    fn server(&self, server_id: &str) -> Result<ServerConfig, ApiError> {
        self.servers
            .read()
            .get(server_id)
            .cloned()
            .ok_or_else(|| ApiError::UnknownServer(server_id.to_string()))
    }

    fn request(
        &self,
        method: Method,
        server_id: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<RequestBuilder, ApiError> {
        let server = self.server(server_id)?;
        let url = join_url(&server.endpoint, path)?;
        debug!(server_id, %method, %url, "chat server request");
        let mut builder = self.http.request(method, url);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(token) = server.api_token.as_deref().filter(|token| !token.is_empty()) {
            builder = builder.header(API_TOKEN_HEADER, token);
        }
        Ok(builder)
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let body = read_body(builder.send().await?).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn post_action(&self, server_id: &str, session_id: &str, action: &str) -> Result<String> {
        let path = format!("/chat/{session_id}/{action}");
        let builder = self.request(Method::POST, server_id, &path, &[])?;
        let response = builder
            .send()
            .await
            .with_context(|| format!("failed to {action} session {session_id}"))?;
        Ok(read_body(response).await?)
    }
}

fn join_url(endpoint: &str, path: &str) -> Result<Url, ApiError> {
    let joined = format!("{}{}", endpoint.trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|_| ApiError::InvalidEndpoint(endpoint.to_string()))
}

/// Paging parameters; zero values are left to the server's defaults.
fn paging(from: u32, size: u32) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if from > 0 {
        query.push(("from", from.to_string()));
    }
    if size > 0 {
        query.push(("size", size.to_string()));
    }
    query
}

async fn read_body(response: Response) -> Result<String, ApiError> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        return Ok(body);
    }
    warn!(status = status.as_u16(), "chat server rejected request");
    Err(ApiError::from_failure(status.as_u16(), &body))
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn new_turn(
        &self,
        server_id: &str,
        channel_token: &str,
        message: &str,
        flags: &FeatureFlags,
    ) -> Result<NewTurn> {
        let builder = self
            .request(Method::POST, server_id, "/chat/_new", &flags.to_query_pairs())?
            .header(CHANNEL_TOKEN_HEADER, channel_token)
            .json(&json!({ "message": message }));
        let created: Created = self
            .fetch(builder)
            .await
            .context("failed to create chat session")?;
        let correlation_id = created.correlation_id()?;
        let mut session = wire::session(Document {
            id: created.id,
            source: created.source,
        });
        session.messages.push(Message::user(correlation_id.clone(), message));
        Ok(NewTurn {
            session,
            correlation_id,
        })
    }

    async fn send_turn(
        &self,
        server_id: &str,
        channel_token: &str,
        session_id: &str,
        message: &str,
        flags: &FeatureFlags,
    ) -> Result<SentTurn> {
        let path = format!("/chat/{session_id}/_send");
        let builder = self
            .request(Method::POST, server_id, &path, &flags.to_query_pairs())?
            .header(CHANNEL_TOKEN_HEADER, channel_token)
            .json(&json!({ "message": message }));
        let documents: Vec<Document<MessageSource>> = self
            .fetch(builder)
            .await
            .with_context(|| format!("failed to send message to session {session_id}"))?;
        let messages: Vec<Message> = documents.into_iter().map(wire::message).collect();
        let correlation_id = messages
            .first()
            .map(|message| message.id.clone())
            .ok_or(ApiError::MissingField("message id"))?;
        Ok(SentTurn {
            correlation_id,
            messages,
        })
    }

    async fn open_session(&self, server_id: &str, session_id: &str) -> Result<Session> {
        let body = self.post_action(server_id, session_id, "_open").await?;
        let opened = serde_json::from_str::<Document<SessionSource>>(&body)
            .map(wire::session)
            .unwrap_or_else(|_| Session::confirmed(session_id));
        Ok(opened)
    }

    async fn cancel_turn(&self, server_id: &str, session_id: &str) -> Result<()> {
        self.post_action(server_id, session_id, "_cancel").await?;
        Ok(())
    }

    async fn close_session(&self, server_id: &str, session_id: &str) -> Result<()> {
        self.post_action(server_id, session_id, "_close").await?;
        Ok(())
    }

    async fn list_sessions(&self, server_id: &str, query: &SessionQuery) -> Result<Page<Session>> {
        let mut params = paging(query.from, query.size);
        if let Some(text) = query.query.as_deref().filter(|text| !text.is_empty()) {
            params.push(("query", text.to_string()));
        }
        let builder = self.request(Method::GET, server_id, "/chat/_history", &params)?;
        let hits: Hits<SessionSource> = self
            .fetch(builder)
            .await
            .context("failed to list chat sessions")?;
        Ok(hits.into_page(wire::session))
    }

    async fn session_history(
        &self,
        server_id: &str,
        session_id: &str,
        from: u32,
        size: u32,
    ) -> Result<Page<Message>> {
        let path = format!("/chat/{session_id}/_history");
        let builder = self.request(Method::GET, server_id, &path, &paging(from, size))?;
        let hits: Hits<MessageSource> = self
            .fetch(builder)
            .await
            .with_context(|| format!("failed to load history of session {session_id}"))?;
        Ok(hits.into_page(wire::message))
    }

    async fn rename_session(&self, server_id: &str, session_id: &str, title: &str) -> Result<bool> {
        let path = format!("/chat/{session_id}");
        let response = self
            .request(Method::PUT, server_id, &path, &[])?
            .json(&json!({ "title": title }))
            .send()
            .await
            .with_context(|| format!("failed to rename session {session_id}"))?;
        Ok(response.status().is_success())
    }

    async fn delete_session(&self, server_id: &str, session_id: &str) -> Result<bool> {
        let path = format!("/chat/{session_id}");
        let response = self
            .request(Method::DELETE, server_id, &path, &[])?
            .send()
            .await
            .with_context(|| format!("failed to delete session {session_id}"))?;
        read_body(response).await?;
        Ok(true)
    }
}
