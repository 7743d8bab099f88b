use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chunk_decoder::{QueryIntent, SourceList, stage_payload};
use core_types::{Chunk, CorrelationId, Message, ServerId, SessionId, StageDetail, StageKind};
use serde::Serialize;

/// Chat frames held while the correlation id of a turn is still unknown.
pub(crate) const EARLY_FRAME_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Sending,
    Streaming,
    Completed,
    TimedOut,
    Cancelled,
}

impl TurnPhase {
    pub fn is_live(self) -> bool {
        matches!(self, TurnPhase::Sending | TurnPhase::Streaming)
    }
}

/// Latest content per stage of the reply being streamed.
///
/// The server resends the whole stage content with every chunk, so a chunk
/// replaces what was held for its stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageFold {
    stages: BTreeMap<StageKind, String>,
    active_stage: Option<StageKind>,
}

impl StageFold {
    pub fn apply(&mut self, chunk: &Chunk) {
        self.stages.insert(chunk.stage, chunk.text().to_string());
        self.active_stage = Some(chunk.stage);
    }

    pub fn stage(&self, stage: StageKind) -> Option<&str> {
        self.stages.get(&stage).map(String::as_str)
    }

    pub fn active_stage(&self) -> Option<StageKind> {
        self.active_stage
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn response(&self) -> &str {
        self.stage(StageKind::Response).unwrap_or_default()
    }

    pub fn suggestions(&self) -> Vec<String> {
        self.stage(StageKind::QueryIntent)
            .and_then(QueryIntent::parse)
            .map(|intent| intent.suggestion)
            .unwrap_or_default()
    }

    /// Documents the server reported fetching, once the list is readable.
    pub fn sources(&self) -> Option<SourceList> {
        self.stage(StageKind::FetchSource).and_then(SourceList::parse)
    }

    /// Stage records in pipeline order.
    pub fn freeze(&self) -> Vec<StageDetail> {
        self.stages
            .iter()
            .map(|(stage, text)| StageDetail {
                stage: *stage,
                payload: stage_payload(*stage, text),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LiveTurn {
    pub ticket: u64,
    pub server_id: ServerId,
    /// `None` while the session itself is being created.
    pub session_id: Option<SessionId>,
    pub correlation_id: Option<CorrelationId>,
    pub question: String,
    pub assistant_id: Option<String>,
    pub phase: TurnPhase,
    pub started_at: DateTime<Utc>,
    pub timeout: Duration,
    pub fold: StageFold,
    pub early: Vec<Chunk>,
}

impl LiveTurn {
    pub fn new(
        ticket: u64,
        server_id: ServerId,
        session_id: Option<SessionId>,
        question: String,
        assistant_id: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            ticket,
            server_id,
            session_id,
            correlation_id: None,
            question,
            assistant_id,
            phase: TurnPhase::Sending,
            started_at: Utc::now(),
            timeout,
            fold: StageFold::default(),
            early: Vec::new(),
        }
    }

    pub fn belongs_to(&self, session_id: Option<&str>) -> bool {
        self.session_id.as_deref() == session_id
    }

    /// Freezes the folded stages into the assistant message of this turn.
    pub fn finish(&self, message_id: String) -> Message {
        let mut message = Message::assistant(
            message_id,
            self.fold.response(),
            self.fold.freeze(),
            self.question.clone(),
        );
        message.assistant_id = self.assistant_id.clone();
        message
    }

    pub fn snapshot(&self) -> LiveMessage {
        LiveMessage {
            correlation_id: self.correlation_id.clone(),
            session_id: self.session_id.clone(),
            question: self.question.clone(),
            phase: self.phase,
            active_stage: self.fold.active_stage(),
            stages: self.fold.stages.clone(),
            suggestions: self.fold.suggestions(),
            sources: self.fold.sources(),
            started_at: self.started_at,
        }
    }
}

/// In-progress assistant reply as shown to the user.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LiveMessage {
    pub correlation_id: Option<CorrelationId>,
    pub session_id: Option<SessionId>,
    pub question: String,
    pub phase: TurnPhase,
    pub active_stage: Option<StageKind>,
    pub stages: BTreeMap<StageKind, String>,
    pub suggestions: Vec<String>,
    pub sources: Option<SourceList>,
    pub started_at: DateTime<Utc>,
}

impl LiveMessage {
    pub fn text(&self) -> &str {
        self.stages
            .get(&StageKind::Response)
            .map(String::as_str)
            .unwrap_or_default()
    }
}
