//! Turns raw channel frames into typed chunks of an assistant response.
//!
//! Only frames carrying the chat marker are considered; everything else on
//! the channel (heartbeats, transport notices) decodes to `None`.

use core_types::{Chunk, StageKind};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

mod payload;
mod watchdog;

pub use payload::{QueryIntent, SourceDocument, SourceList, stage_payload};
pub use watchdog::Watchdog;

pub const CHAT_FRAME_PREFIX: &str = "PRIVATE ";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed chat frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("malformed chat frame: no reply_to_message")]
    MissingCorrelation,
}

/// A chat frame whose body is valid JSON but not yet typed.
struct Envelope {
    reply_to: String,
    body: Value,
}

fn open(raw: &str) -> Result<Option<Envelope>, DecodeError> {
    let Some(body) = raw.strip_prefix(CHAT_FRAME_PREFIX) else {
        trace!(len = raw.len(), "ignoring non-chat frame");
        return Ok(None);
    };
    let body: Value = serde_json::from_str(body)?;
    let reply_to = body
        .get("reply_to_message")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingCorrelation)?
        .to_string();
    Ok(Some(Envelope { reply_to, body }))
}

/// Types the envelope. Stages this client does not know are skipped.
fn typed(envelope: Envelope) -> Result<Option<Chunk>, DecodeError> {
    let stage = envelope.body.get("chunk_type").cloned().unwrap_or(Value::Null);
    if serde_json::from_value::<StageKind>(stage.clone()).is_err() {
        trace!(reply_to = %envelope.reply_to, chunk_type = %stage, "ignoring unknown stage");
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(envelope.body)?))
}

/// Parses a chat frame without checking which turn it belongs to.
pub fn parse_frame(raw: &str) -> Result<Option<Chunk>, DecodeError> {
    match open(raw)? {
        Some(envelope) => typed(envelope),
        None => Ok(None),
    }
}

/// Decodes a frame for the turn identified by `current`.
///
/// Chunks addressed to any other correlation id are stale and dropped before
/// their stage is looked at, so a cancelled turn can never leak into, or
/// fail, a newer one.
pub fn decode(raw: &str, current: Option<&str>) -> Result<Option<Chunk>, DecodeError> {
    let Some(envelope) = open(raw)? else {
        return Ok(None);
    };
    if current != Some(envelope.reply_to.as_str()) {
        trace!(reply_to = %envelope.reply_to, current = ?current, "discarding stale chunk");
        return Ok(None);
    }
    typed(envelope)
}
