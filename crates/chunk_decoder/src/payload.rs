use std::sync::LazyLock;

use core_types::StageKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static JSON_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<JSON>(.*?)</JSON>").expect("json block regex"));
static PAYLOAD_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Payload total=(\d+)>").expect("payload total regex"));
static JSON_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[.*\]").expect("json array regex"));

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryIntent {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub query: Vec<String>,
    #[serde(default)]
    pub keyword: Vec<String>,
    #[serde(default)]
    pub suggestion: Vec<String>,
}

impl QueryIntent {
    /// Reads the last complete `<JSON>` block of a query-intent chunk.
    pub fn parse(text: &str) -> Option<Self> {
        let cleaned = text.trim_matches('"');
        let block = JSON_BLOCK.captures_iter(cleaned).last()?;
        serde_json::from_str(block.get(1)?.as_str()).ok()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceDocument {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SourceList {
    pub total: Option<u64>,
    pub sources: Vec<SourceDocument>,
}

impl SourceList {
    pub fn parse(text: &str) -> Option<Self> {
        let total: Option<u64> = PAYLOAD_TOTAL
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|total| total.as_str().parse().ok());
        let sources: Vec<SourceDocument> = source_array(text)
            .and_then(|array| serde_json::from_value(array).ok())
            .unwrap_or_default();
        if total.is_none() && sources.is_empty() {
            return None;
        }
        Some(Self { total, sources })
    }
}

fn source_array(text: &str) -> Option<Value> {
    let found = JSON_ARRAY.find(text)?;
    serde_json::from_str::<Value>(found.as_str())
        .ok()
        .filter(Value::is_array)
}

/// Value stored for a stage once the turn is frozen into message details.
///
/// Structured stages keep their parsed JSON when the text carries it; any
/// other text is stored verbatim.
pub fn stage_payload(stage: StageKind, text: &str) -> Value {
    let structured = match stage {
        StageKind::QueryIntent => {
            QueryIntent::parse(text).and_then(|intent| serde_json::to_value(intent).ok())
        }
        StageKind::FetchSource => source_array(text),
        _ => None,
    };
    structured.unwrap_or_else(|| Value::String(text.to_string()))
}
