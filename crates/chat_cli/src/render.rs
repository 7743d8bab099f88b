use core_orchestrator::LiveMessage;
use core_types::{Message, MessageRole, Session, StageKind};

/// Turns live snapshots into incremental terminal output.
#[derive(Debug, Default)]
pub struct LiveRender {
    printed: String,
    stage: Option<StageKind>,
    sources: usize,
}

impl LiveRender {
    /// Text still to be written for `live`. A response that no longer extends
    /// what was printed is written again on a fresh line.
    pub fn delta(&mut self, live: &LiveMessage) -> String {
        let text = live.text();
        let out = match text.strip_prefix(self.printed.as_str()) {
            Some(rest) => rest.to_string(),
            None => format!("\n{text}"),
        };
        self.printed = text.to_string();
        out
    }

    pub fn printed(&self) -> &str {
        &self.printed
    }

    /// The stage `live` moved into, if it changed since the last snapshot.
    pub fn stage_change(&mut self, live: &LiveMessage) -> Option<StageKind> {
        if live.active_stage == self.stage {
            return None;
        }
        self.stage = live.active_stage;
        self.stage
    }

    /// Number of fetched sources, when it grew since the last snapshot.
    pub fn new_sources(&mut self, live: &LiveMessage) -> Option<usize> {
        let count = live.sources.as_ref().map_or(0, |list| list.sources.len());
        if count <= self.sources {
            return None;
        }
        self.sources = count;
        Some(count)
    }
}

pub fn session_line(session: &Session) -> String {
    let id = session.id.as_deref().unwrap_or("(pending)");
    let title = session.title.as_deref().unwrap_or("untitled");
    match session.updated_at {
        Some(updated) => format!("{id}\t{}\t{title}", updated.format("%Y-%m-%d %H:%M")),
        None => format!("{id}\t-\t{title}"),
    }
}

pub fn message_line(message: &Message) -> String {
    let speaker = match message.role {
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
    };
    format!("{speaker}> {}", message.text)
}
