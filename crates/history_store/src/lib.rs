//! Local mirror of a user's remote session list.
//!
//! Sessions are keyed by server id; repeated listings merge into the same
//! entry (last write wins) so pagination never duplicates a session.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use core_types::{ChatApi, Message, Page, Session, SessionId, SessionQuery};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub struct SessionHistoryStore {
    api: Arc<dyn ChatApi>,
    sessions: RwLock<IndexMap<SessionId, Session>>,
    /// Ids whose optimistic edit was not confirmed by the server.
    diverged: Mutex<HashSet<SessionId>>,
}

impl SessionHistoryStore {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self {
            api,
            sessions: RwLock::new(IndexMap::new()),
            diverged: Mutex::new(HashSet::new()),
        }
    }

    /// Fetches one page of sessions and merges it into the local list.
    pub async fn list_sessions(&self, server_id: &str, query: &SessionQuery) -> Result<Page<Session>> {
        let page = self
            .api
            .list_sessions(server_id, query)
            .await
            .with_context(|| format!("failed to list sessions on {server_id}"))?;

        let mut sessions = self.sessions.write();
        let mut diverged = self.diverged.lock();
        for incoming in &page.items {
            let Some(id) = incoming.id.clone() else {
                continue;
            };
            if diverged.remove(&id) {
                info!(session_id = %id, "reconciled diverged session with server state");
            }
            match sessions.get_mut(&id) {
                Some(existing) => {
                    let messages = std::mem::take(&mut existing.messages);
                    *existing = incoming.clone();
                    if existing.messages.is_empty() {
                        existing.messages = messages;
                    }
                }
                None => {
                    sessions.insert(id, incoming.clone());
                }
            }
        }
        debug!(
            server_id,
            fetched = page.items.len(),
            total = page.total,
            cached = sessions.len(),
            "session list merged"
        );
        Ok(page)
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn is_diverged(&self, session_id: &str) -> bool {
        self.diverged.lock().contains(session_id)
    }

    /// Messages of one session, oldest first.
    pub async fn session_messages(
        &self,
        server_id: &str,
        session_id: &str,
        from: u32,
        size: u32,
    ) -> Result<Vec<Message>> {
        let page = self
            .api
            .session_history(server_id, session_id, from, size)
            .await
            .with_context(|| format!("failed to load history of session {session_id}"))?;
        let mut messages = page.items;
        messages.sort_by_key(|message| message.created_at);
        Ok(messages)
    }

    /// Replaces the cached transcript of a session with a fresh copy from the
    /// server.
    pub async fn refresh_messages(
        &self,
        server_id: &str,
        session_id: &str,
        size: u32,
    ) -> Result<Vec<Message>> {
        let messages = self.session_messages(server_id, session_id, 0, size).await?;
        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::confirmed(session_id));
        entry.messages = messages.clone();
        Ok(messages)
    }

    /// Inserts or replaces a session and moves it to the head of the list.
    pub fn record_session(&self, session: &Session) {
        let Some(id) = session.id.clone() else {
            return;
        };
        let mut sessions = self.sessions.write();
        sessions.shift_remove(&id);
        sessions.shift_insert(0, id, session.clone());
    }

    pub fn append_message(&self, session_id: &str, message: Message) {
        let mut sessions = self.sessions.write();
        let mut session = sessions
            .shift_remove(session_id)
            .unwrap_or_else(|| Session::confirmed(session_id));
        session.updated_at = Some(Utc::now());
        session.messages.push(message);
        sessions.shift_insert(0, session_id.to_string(), session);
    }

    /// Renames locally right away, then confirms with the server.
    ///
    /// The local title is kept even when the server call fails; the session is
    /// marked diverged until the next listing.
    pub async fn rename(&self, server_id: &str, session_id: &str, title: &str) -> Result<()> {
        {
            let mut sessions = self.sessions.write();
            if let Some(mut session) = sessions.shift_remove(session_id) {
                session.title = Some(title.to_string());
                session.updated_at = Some(Utc::now());
                sessions.shift_insert(0, session_id.to_string(), session);
            }
        }

        let outcome = self.api.rename_session(server_id, session_id, title).await;
        self.settle(session_id, "rename", outcome)
    }

    /// Removes locally right away, then deletes on the server.
    pub async fn delete(&self, server_id: &str, session_id: &str) -> Result<()> {
        self.sessions.write().shift_remove(session_id);
        let outcome = self.api.delete_session(server_id, session_id).await;
        self.settle(session_id, "delete", outcome)
    }

    fn settle(&self, session_id: &str, action: &str, outcome: Result<bool>) -> Result<()> {
        let failure = match outcome {
            Ok(true) => {
                self.diverged.lock().remove(session_id);
                return Ok(());
            }
            Ok(false) => anyhow::anyhow!("server rejected {action}"),
            Err(err) => err,
        };
        warn!(session_id, action, error = %failure, "remote session edit failed; keeping local state");
        self.diverged.lock().insert(session_id.to_string());
        bail!("{action} of session {session_id} failed: {failure:#}")
    }
}
