//! Document shapes returned by the chat server.

use chrono::{DateTime, Utc};
use core_types::{Message, MessageRole, Page, Session, StageDetail};
use serde::Deserialize;
use serde_json::Value;

use crate::ApiError;

#[derive(Debug, Deserialize)]
pub(crate) struct Document<T> {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source", default)]
    pub source: T,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de> + Default"))]
pub(crate) struct Hits<T> {
    hits: HitList<T>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de> + Default"))]
struct HitList<T> {
    #[serde(default)]
    total: Total,
    #[serde(default = "Vec::new")]
    hits: Vec<Document<T>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Total {
    Count(u64),
    Tracked { value: u64 },
}

impl Default for Total {
    fn default() -> Self {
        Total::Count(0)
    }
}

impl Total {
    fn value(&self) -> u64 {
        match self {
            Total::Count(value) | Total::Tracked { value } => *value,
        }
    }
}

impl<T> Hits<T> {
    pub fn into_page<U>(self, convert: impl Fn(Document<T>) -> U) -> Page<U> {
        let total = self.hits.total.value();
        Page {
            items: self.hits.hits.into_iter().map(convert).collect(),
            total,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SessionSource {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct MessageSource {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Vec<Value>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
}

/// Answer of `POST /chat/_new`.
#[derive(Debug, Deserialize)]
pub(crate) struct Created {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source", default)]
    pub source: SessionSource,
    pub result: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl Created {
    /// The created user message id, which replies reference.
    pub fn correlation_id(&self) -> Result<String, ApiError> {
        if self.result != "created" {
            return Err(ApiError::UnexpectedResult(self.result.clone()));
        }
        self.payload
            .as_ref()
            .and_then(|payload| payload.get("id"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or(ApiError::MissingField("payload.id"))
    }
}

fn timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

pub(crate) fn session(document: Document<SessionSource>) -> Session {
    Session {
        id: Some(document.id),
        title: document.source.title.filter(|title| !title.is_empty()),
        created_at: timestamp(document.source.created.as_deref()),
        updated_at: timestamp(document.source.updated.as_deref()),
        messages: Vec::new(),
    }
}

pub(crate) fn message(document: Document<MessageSource>) -> Message {
    let source = document.source;
    let role = match source.kind.as_deref() {
        Some("assistant") => MessageRole::Assistant,
        _ => MessageRole::User,
    };
    Message {
        id: document.id,
        role,
        text: source.message,
        assistant_id: source.assistant_id,
        details: source
            .details
            .into_iter()
            .filter_map(|detail| serde_json::from_value::<StageDetail>(detail).ok())
            .collect(),
        question: source.question,
        created_at: timestamp(source.created.as_deref()),
    }
}
