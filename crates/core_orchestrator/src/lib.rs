//! Session lifecycle and the per-turn state machine.
//!
//! A turn moves `Sending -> Streaming -> {Completed, TimedOut, Cancelled}`.
//! Only one turn is live at a time; every terminal state is final for its
//! correlation id, and frames that arrive for it afterwards are dropped.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use channel_transport::ChannelRegistry;
use chrono::Utc;
use chunk_decoder::{DecodeError, Watchdog, decode, parse_frame};
use config::IdentityContext;
use core_types::{
    ChatApi, Chunk, ClientId, CorrelationId, Message, NewTurn, Page, ServerConfig, ServerId,
    Session, SessionId, SessionQuery, effective_timeout,
};
use history_store::SessionHistoryStore;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

mod error;
mod turn;

pub use error::ChatError;
pub use turn::{LiveMessage, StageFold, TurnPhase};

use turn::{EARLY_FRAME_LIMIT, LiveTurn};

/// Messages fetched when a session is opened or refreshed before a send.
const HISTORY_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    ConnectionChanged {
        connected: bool,
    },
    ChannelFault {
        reason: String,
    },
    LiveUpdated(LiveMessage),
    TurnCompleted {
        session_id: SessionId,
        message: Message,
    },
    /// A malformed frame ended the turn; `partial` keeps what had streamed.
    TurnFailed {
        correlation_id: CorrelationId,
        reason: String,
        partial: Option<Message>,
    },
    TurnTimedOut {
        correlation_id: Option<CorrelationId>,
        session_id: Option<SessionId>,
        question: String,
    },
    TurnCancelled {
        correlation_id: Option<CorrelationId>,
        session_id: Option<SessionId>,
    },
    /// Transient user-visible notification for a failed command.
    Notice {
        message: String,
    },
}

#[derive(Debug, Clone)]
struct ActiveChat {
    server_id: ServerId,
    session: Session,
}

#[derive(Default)]
struct State {
    channel_token: Option<String>,
    active: Option<ActiveChat>,
    turn: Option<LiveTurn>,
    next_ticket: u64,
}

/// Server-side generation to stop after a local cancel.
struct RemoteCancel {
    server_id: ServerId,
    session_id: SessionId,
}

struct Inner {
    api: Arc<dyn ChatApi>,
    identity: IdentityContext,
    history: Arc<SessionHistoryStore>,
    state: Mutex<State>,
    watchdog: Watchdog,
    events: broadcast::Sender<ChatEvent>,
    switching: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(api: Arc<dyn ChatApi>, identity: IdentityContext) -> Self {
        let history = Arc::new(SessionHistoryStore::new(api.clone()));
        let (events, _) = broadcast::channel(256);
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            Inner {
                api,
                identity,
                history,
                state: Mutex::new(State::default()),
                watchdog: Watchdog::new(move |ticket, generation| {
                    if let Some(inner) = weak.upgrade() {
                        Orchestrator { inner }.handle_watchdog(ticket, generation);
                    }
                }),
                events,
                switching: tokio::sync::Mutex::new(()),
            }
        });
        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.events.subscribe()
    }

    pub fn identity(&self) -> &IdentityContext {
        &self.inner.identity
    }

    pub fn history(&self) -> &Arc<SessionHistoryStore> {
        &self.inner.history
    }

    pub fn channel_token(&self) -> Option<String> {
        self.inner.state.lock().channel_token.clone()
    }

    pub fn active_session(&self) -> Option<Session> {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .map(|active| active.session.clone())
    }

    pub fn live_message(&self) -> Option<LiveMessage> {
        self.inner.state.lock().turn.as_ref().map(LiveTurn::snapshot)
    }

    /// Routes the frames, handshake and connectivity of `client_id` into this
    /// orchestrator. Re-attaching replaces the previous handlers in place.
    pub async fn attach(&self, registry: &ChannelRegistry, client_id: ClientId) -> Result<(), ChatError> {
        let weak = Arc::downgrade(&self.inner);
        registry
            .on_frame(
                client_id,
                Arc::new(move |raw: String| {
                    if let Some(inner) = weak.upgrade() {
                        Orchestrator { inner }.handle_frame(&raw);
                    }
                }),
            )
            .await?;

        let weak = Arc::downgrade(&self.inner);
        registry
            .on_handshake(
                client_id,
                Arc::new(move |token: String| {
                    if let Some(inner) = weak.upgrade() {
                        Orchestrator { inner }.handle_handshake(token);
                    }
                }),
            )
            .await?;

        let mut connected = registry.subscribe_connected(client_id).await?;
        let mut faults = registry.subscribe_faults(client_id).await?;
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = connected.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let is_open = *connected.borrow_and_update();
                        let Some(inner) = weak.upgrade() else { break };
                        Orchestrator { inner }.handle_connection(is_open);
                    }
                    fault = faults.recv() => match fault {
                        Ok(fault) => {
                            let Some(inner) = weak.upgrade() else { break };
                            Orchestrator { inner }.emit(ChatEvent::ChannelFault { reason: fault.reason });
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        info!(client_id = %client_id, "orchestrator attached to channel");
        Ok(())
    }

    pub fn handle_handshake(&self, token: String) {
        info!("channel session token received");
        self.inner.state.lock().channel_token = Some(token);
    }

    pub fn handle_connection(&self, connected: bool) {
        if !connected {
            self.inner.state.lock().channel_token = None;
        }
        info!(connected, "chat channel connectivity changed");
        self.emit(ChatEvent::ConnectionChanged { connected });
    }

    /// Applies one raw inbound frame to the live turn.
    pub fn handle_frame(&self, raw: &str) {
        let current = self.current_correlation();
        let decoded = match current.as_deref() {
            Some(current) => decode(raw, Some(current)),
            None => parse_frame(raw),
        };
        match decoded {
            Ok(Some(chunk)) => self.apply_chunk(chunk),
            Ok(None) => {}
            Err(err) => self.fail_turn(err),
        }
    }

    fn current_correlation(&self) -> Option<CorrelationId> {
        self.inner
            .state
            .lock()
            .turn
            .as_ref()
            .filter(|turn| turn.phase.is_live())
            .and_then(|turn| turn.correlation_id.clone())
    }

    fn apply_chunk(&self, chunk: Chunk) {
        let mut state = self.inner.state.lock();
        let Some(turn) = state.turn.as_mut().filter(|turn| turn.phase.is_live()) else {
            trace!(reply_to = %chunk.reply_to_message_id, "no live turn; chunk dropped");
            return;
        };
        let Some(correlation_id) = turn.correlation_id.as_deref() else {
            if turn.early.len() < EARLY_FRAME_LIMIT {
                turn.early.push(chunk);
            } else {
                warn!(reply_to = %chunk.reply_to_message_id, "early frame buffer full; chunk dropped");
            }
            return;
        };
        if !chunk.replies_to(Some(correlation_id)) {
            trace!(reply_to = %chunk.reply_to_message_id, "stale chunk dropped");
            return;
        }
        self.step(&mut state, chunk);
    }

    /// Advances the live turn with a chunk already known to belong to it.
    fn step(&self, state: &mut State, chunk: Chunk) {
        let Some(turn) = state.turn.as_mut() else {
            return;
        };
        if turn.phase == TurnPhase::Sending {
            turn.phase = TurnPhase::Streaming;
            debug!(correlation_id = ?turn.correlation_id, "turn streaming");
        }
        self.inner.watchdog.reset(turn.ticket);

        if !chunk.stage.is_terminal() {
            turn.fold.apply(&chunk);
            let snapshot = turn.snapshot();
            self.emit(ChatEvent::LiveUpdated(snapshot));
            return;
        }

        turn.phase = TurnPhase::Completed;
        self.inner.watchdog.disarm(turn.ticket);
        let message_id = chunk
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let message = turn.finish(message_id);
        turn.fold = StageFold::default();
        let session_id = turn.session_id.clone();
        info!(
            correlation_id = ?turn.correlation_id,
            session_id = ?session_id,
            stages = message.details.len(),
            elapsed_ms = (Utc::now() - turn.started_at).num_milliseconds(),
            "turn completed"
        );

        match session_id {
            Some(session_id) => {
                self.persist(state, &session_id, message.clone());
                self.emit(ChatEvent::TurnCompleted {
                    session_id,
                    message,
                });
            }
            None => warn!("completed turn has no session; reply not persisted"),
        }
    }

    fn persist(&self, state: &mut State, session_id: &str, message: Message) {
        match state
            .active
            .as_mut()
            .filter(|active| active.session.id.as_deref() == Some(session_id))
        {
            Some(active) => {
                active.session.messages.push(message);
                active.session.updated_at = Some(Utc::now());
                self.inner.history.record_session(&active.session);
            }
            None => self.inner.history.append_message(session_id, message),
        }
    }

    /// A malformed chat frame ends the live turn instead of leaving it hanging.
    fn fail_turn(&self, err: DecodeError) {
        let mut state = self.inner.state.lock();
        let Some(turn) = state.turn.as_mut().filter(|turn| turn.phase.is_live()) else {
            warn!(error = %err, "malformed chat frame with no live turn");
            return;
        };
        let Some(correlation_id) = turn.correlation_id.clone() else {
            warn!(error = %err, "malformed chat frame before the turn was correlated");
            return;
        };
        error!(%correlation_id, error = %err, "malformed chat frame; ending turn");
        turn.phase = TurnPhase::Completed;
        self.inner.watchdog.disarm(turn.ticket);
        let partial = (!turn.fold.is_empty()).then(|| turn.finish(Uuid::new_v4().to_string()));
        turn.fold = StageFold::default();
        let session_id = turn.session_id.clone();

        if let (Some(session_id), Some(message)) = (session_id.as_deref(), partial.as_ref()) {
            self.persist(&mut state, session_id, message.clone());
        }
        self.emit(ChatEvent::TurnFailed {
            correlation_id,
            reason: err.to_string(),
            partial,
        });
    }

    /// Times the turn out unless a chunk reset the countdown after this
    /// expiry fired. Resets happen under the state lock, so checking the
    /// generation while holding it closes that race.
    fn handle_watchdog(&self, ticket: u64, generation: u64) {
        let remote = {
            let mut state = self.inner.state.lock();
            let Some(turn) = state
                .turn
                .as_mut()
                .filter(|turn| turn.ticket == ticket && turn.phase.is_live())
            else {
                return;
            };
            if !self.inner.watchdog.is_current(ticket, generation) {
                debug!(ticket, generation, "stale watchdog expiry ignored");
                return;
            }
            turn.phase = TurnPhase::TimedOut;
            turn.fold = StageFold::default();
            turn.early.clear();
            warn!(
                correlation_id = ?turn.correlation_id,
                timeout_secs = turn.timeout.as_secs(),
                "turn timed out waiting for the server"
            );
            self.emit(ChatEvent::TurnTimedOut {
                correlation_id: turn.correlation_id.clone(),
                session_id: turn.session_id.clone(),
                question: turn.question.clone(),
            });
            turn.session_id.clone().map(|session_id| RemoteCancel {
                server_id: turn.server_id.clone(),
                session_id,
            })
        };
        self.inner.watchdog.disarm(ticket);
        if let Some(remote) = remote {
            self.spawn_remote_cancel(remote);
        }
    }

    /// Starts a new session with `text` as its first message.
    ///
    /// `timeout_secs` overrides the configured response timeout for this turn.
    pub async fn create_session(
        &self,
        text: &str,
        timeout_secs: Option<u64>,
    ) -> Result<Session, ChatError> {
        let question = text.trim().to_string();
        if question.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let identity = self.inner.identity.snapshot();
        let server = identity.server.clone().ok_or(ChatError::NoServerSelected)?;
        let flags = identity.feature_flags();
        let timeout = match timeout_secs {
            Some(secs) => effective_timeout(Some(secs)),
            None => identity.response_timeout(),
        };

        let (ticket, token, superseded) = {
            let mut state = self.inner.state.lock();
            let token = state
                .channel_token
                .clone()
                .ok_or(ChatError::MissingChannelToken)?;
            let superseded = self.guard_turn(&mut state, None)?;
            let ticket = self.begin_turn(
                &mut state,
                &server.id,
                None,
                &question,
                flags.assistant_id.clone(),
                timeout,
            );
            state.active = Some(ActiveChat {
                server_id: server.id.clone(),
                session: Session::pending(),
            });
            (ticket, token, superseded)
        };
        if let Some(remote) = superseded {
            self.spawn_remote_cancel(remote);
        }

        let NewTurn {
            mut session,
            correlation_id,
        } = match self
            .inner
            .api
            .new_turn(&server.id, &token, &question, &flags)
            .await
        {
            Ok(created) => created,
            Err(err) => return Err(self.abandon_turn(ticket, err)),
        };
        let Some(session_id) = session.id.clone() else {
            return Err(self.abandon_turn(ticket, anyhow!("server created a session without id")));
        };
        if !session.messages.iter().any(|message| message.id == correlation_id) {
            session
                .messages
                .push(Message::user(correlation_id.clone(), question.clone()));
        }
        self.inner.history.record_session(&session);

        let mut state = self.inner.state.lock();
        let Some(turn) = state
            .turn
            .as_mut()
            .filter(|turn| turn.ticket == ticket && turn.phase.is_live())
        else {
            if state.active.as_ref().is_some_and(|active| active.session.is_pending()) {
                state.active = Some(ActiveChat {
                    server_id: server.id.clone(),
                    session: session.clone(),
                });
            }
            drop(state);
            self.spawn_remote_cancel(RemoteCancel {
                server_id: server.id.clone(),
                session_id,
            });
            return Err(ChatError::Superseded);
        };
        turn.session_id = Some(session_id.clone());
        turn.correlation_id = Some(correlation_id.clone());
        state.active = Some(ActiveChat {
            server_id: server.id.clone(),
            session: session.clone(),
        });
        info!(%session_id, %correlation_id, server_id = %server.id, "session created");
        self.replay_early(&mut state);
        Ok(session)
    }

    /// Sends `text` as a new turn of an existing session.
    pub async fn send_message(&self, text: &str, session: &Session) -> Result<CorrelationId, ChatError> {
        let session_id = session.id.clone().ok_or(ChatError::PendingSession)?;
        let question = text.trim().to_string();
        if question.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let identity = self.inner.identity.snapshot();
        let server = identity.server.clone().ok_or(ChatError::NoServerSelected)?;
        let flags = identity.feature_flags();

        let (ticket, token, superseded) = {
            let mut state = self.inner.state.lock();
            let token = state
                .channel_token
                .clone()
                .ok_or(ChatError::MissingChannelToken)?;
            let superseded = self.guard_turn(&mut state, Some(session_id.as_str()))?;
            let ticket = self.begin_turn(
                &mut state,
                &server.id,
                Some(session_id.clone()),
                &question,
                flags.assistant_id.clone(),
                identity.response_timeout(),
            );
            (ticket, token, superseded)
        };
        if let Some(remote) = superseded {
            self.spawn_remote_cancel(remote);
        }

        if let Err(err) = self
            .inner
            .history
            .refresh_messages(&server.id, &session_id, HISTORY_PAGE_SIZE)
            .await
        {
            warn!(%session_id, error = %err, "could not refresh history before send");
        }
        let mut current = self
            .inner
            .history
            .session(&session_id)
            .unwrap_or_else(|| session.clone());
        if current.title.is_none() {
            current.title = session.title.clone();
        }
        {
            let mut state = self.inner.state.lock();
            if !state.turn.as_ref().is_some_and(|turn| turn.ticket == ticket) {
                return Err(ChatError::Superseded);
            }
            state.active = Some(ActiveChat {
                server_id: server.id.clone(),
                session: current,
            });
        }

        let sent = match self
            .inner
            .api
            .send_turn(&server.id, &token, &session_id, &question, &flags)
            .await
        {
            Ok(sent) => sent,
            Err(err) => return Err(self.abandon_turn(ticket, err)),
        };

        let mut state = self.inner.state.lock();
        let Some(turn) = state
            .turn
            .as_mut()
            .filter(|turn| turn.ticket == ticket && turn.phase.is_live())
        else {
            return Err(ChatError::Superseded);
        };
        turn.correlation_id = Some(sent.correlation_id.clone());
        if let Some(active) = state
            .active
            .as_mut()
            .filter(|active| active.session.id.as_deref() == Some(session_id.as_str()))
        {
            let mut incoming = sent.messages;
            if incoming.is_empty() {
                incoming.push(Message::user(sent.correlation_id.clone(), question));
            }
            for message in incoming {
                if !active.session.messages.iter().any(|known| known.id == message.id) {
                    active.session.messages.push(message);
                }
            }
            active.session.updated_at = Some(Utc::now());
            self.inner.history.record_session(&active.session);
        }
        info!(%session_id, correlation_id = %sent.correlation_id, "message sent");
        self.replay_early(&mut state);
        Ok(sent.correlation_id)
    }

    /// Replays a previous question, e.g. after a timed-out reply.
    pub async fn resend_from_question(&self, session: &Session, question: &str) -> Result<(), ChatError> {
        if session.is_pending() {
            self.create_session(question, None).await.map(|_| ())
        } else {
            self.send_message(question, session).await.map(|_| ())
        }
    }

    /// Cancels the live turn of `session_id` (`None` for a session still being
    /// created). Local state changes immediately; the server is told in the
    /// background.
    pub fn cancel(&self, session_id: Option<&str>) -> bool {
        let remote = {
            let mut state = self.inner.state.lock();
            if !state
                .turn
                .as_ref()
                .is_some_and(|turn| turn.phase.is_live() && turn.belongs_to(session_id))
            {
                return false;
            }
            self.cancel_live(&mut state)
        };
        if let Some(remote) = remote {
            self.spawn_remote_cancel(remote);
        }
        true
    }

    /// Releases server-side resources of a session; errors are only logged.
    pub fn close_session(&self, session_id: &str) {
        self.cancel(Some(session_id));
        let Some(server_id) = self.server_of(session_id) else {
            return;
        };
        self.spawn_close(server_id, session_id.to_string());
    }

    /// Like [`Orchestrator::close_session`], but waits for the server to stop
    /// the turn and release the session. For callers about to shut down.
    pub async fn leave_session(&self, session_id: &str) -> Result<(), ChatError> {
        let remote = {
            let mut state = self.inner.state.lock();
            if state
                .turn
                .as_ref()
                .is_some_and(|turn| turn.phase.is_live() && turn.belongs_to(Some(session_id)))
            {
                self.cancel_live(&mut state)
            } else {
                None
            }
        };
        if let Some(remote) = remote
            && let Err(err) = self.inner.api.cancel_turn(&remote.server_id, &remote.session_id).await
        {
            warn!(session_id = %remote.session_id, error = %err, "remote cancel failed");
        }
        let Some(server_id) = self.server_of(session_id) else {
            return Err(ChatError::NoServerSelected);
        };
        self.inner
            .api
            .close_session(&server_id, session_id)
            .await
            .map_err(|err| self.remote_failure(err))?;
        debug!(%session_id, "session closed");
        Ok(())
    }

    /// Server the session lives on: the active chat's, else the selected one.
    fn server_of(&self, session_id: &str) -> Option<ServerId> {
        let active_server = self
            .inner
            .state
            .lock()
            .active
            .as_ref()
            .filter(|active| active.session.id.as_deref() == Some(session_id))
            .map(|active| active.server_id.clone());
        active_server.or_else(|| self.inner.identity.snapshot().server.map(|server| server.id))
    }

    /// Switches to another session: cancel the live turn, close the current
    /// session, open the target and load its history, strictly in that order.
    pub async fn select_session(&self, session_id: &str) -> Result<Session, ChatError> {
        let _switching = self.inner.switching.lock().await;
        let server = self.current_server()?;

        let (remote, previous) = {
            let mut state = self.inner.state.lock();
            let remote = self.cancel_live(&mut state);
            let previous = state.active.take().and_then(|active| {
                active
                    .session
                    .id
                    .map(|id| (active.server_id, id))
            });
            (remote, previous)
        };
        if let Some(remote) = remote
            && let Err(err) = self
                .inner
                .api
                .cancel_turn(&remote.server_id, &remote.session_id)
                .await
        {
            warn!(session_id = %remote.session_id, error = %err, "remote cancel failed");
        }
        if let Some((previous_server, previous_id)) = previous
            && let Err(err) = self
                .inner
                .api
                .close_session(&previous_server, &previous_id)
                .await
        {
            warn!(session_id = %previous_id, error = %err, "close session failed");
        }

        let opened = self
            .inner
            .api
            .open_session(&server.id, session_id)
            .await
            .map_err(|err| self.remote_failure(err))?;
        let messages = self
            .inner
            .history
            .refresh_messages(&server.id, session_id, HISTORY_PAGE_SIZE)
            .await
            .map_err(|err| self.remote_failure(err))?;

        let mut session = self.inner.history.session(session_id).unwrap_or(opened);
        session.id = Some(session_id.to_string());
        session.messages = messages;
        self.inner.state.lock().active = Some(ActiveChat {
            server_id: server.id.clone(),
            session: session.clone(),
        });
        info!(%session_id, "session selected");
        Ok(session)
    }

    /// Leaves the current session so the next message starts a new one.
    pub fn clear_active(&self) {
        let (remote, previous) = {
            let mut state = self.inner.state.lock();
            let remote = self.cancel_live(&mut state);
            (remote, state.active.take())
        };
        if let Some(remote) = remote {
            self.spawn_remote_cancel(remote);
        }
        if let Some(ActiveChat {
            server_id,
            session:
                Session {
                    id: Some(session_id),
                    ..
                },
        }) = previous
        {
            self.spawn_close(server_id, session_id);
        }
    }

    pub async fn list_sessions(&self, query: &SessionQuery) -> Result<Page<Session>, ChatError> {
        let server = self.current_server()?;
        self.inner
            .history
            .list_sessions(&server.id, query)
            .await
            .map_err(|err| self.remote_failure(err))
    }

    pub async fn session_messages(
        &self,
        session_id: &str,
        from: u32,
        size: u32,
    ) -> Result<Vec<Message>, ChatError> {
        let server = self.current_server()?;
        self.inner
            .history
            .session_messages(&server.id, session_id, from, size)
            .await
            .map_err(|err| self.remote_failure(err))
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> Result<(), ChatError> {
        let server = self.current_server()?;
        {
            let mut state = self.inner.state.lock();
            if let Some(active) = state
                .active
                .as_mut()
                .filter(|active| active.session.id.as_deref() == Some(session_id))
            {
                active.session.title = Some(title.to_string());
            }
        }
        self.inner
            .history
            .rename(&server.id, session_id, title)
            .await
            .map_err(|err| self.remote_failure(err))
    }

    /// Deletes a session. When it is the open one, the chat moves to the first
    /// remaining session, or to a fresh chat when none is left.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), ChatError> {
        let server = self.current_server()?;
        let (was_active, remote) = {
            let mut state = self.inner.state.lock();
            let was_active = state
                .active
                .as_ref()
                .is_some_and(|active| active.session.id.as_deref() == Some(session_id));
            let remote = if was_active {
                self.cancel_live(&mut state)
            } else {
                None
            };
            (was_active, remote)
        };
        if let Some(remote) = remote {
            self.spawn_remote_cancel(remote);
        }
        if was_active {
            if let Err(err) = self.inner.api.close_session(&server.id, session_id).await {
                warn!(%session_id, error = %err, "close before delete failed");
            }
            self.inner.state.lock().active = None;
        }

        let outcome = self.inner.history.delete(&server.id, session_id).await;

        if was_active {
            let next = self
                .inner
                .history
                .sessions()
                .into_iter()
                .find_map(|session| session.id);
            if let Some(next) = next
                && let Err(err) = self.select_session(&next).await
            {
                warn!(session_id = %next, error = %err, "could not open next session after delete");
            }
        }
        outcome.map_err(|err| self.remote_failure(err))
    }

    fn current_server(&self) -> Result<ServerConfig, ChatError> {
        self.inner
            .identity
            .snapshot()
            .server
            .ok_or(ChatError::NoServerSelected)
    }

    /// Rejects a second turn for the same session and supersedes a live turn
    /// of any other session.
    fn guard_turn(
        &self,
        state: &mut State,
        session_id: Option<&str>,
    ) -> Result<Option<RemoteCancel>, ChatError> {
        let Some(turn) = state.turn.as_ref().filter(|turn| turn.phase.is_live()) else {
            return Ok(None);
        };
        if turn.belongs_to(session_id) {
            return Err(ChatError::TurnInProgress);
        }
        debug!(previous = ?turn.correlation_id, "superseding live turn of another session");
        Ok(self.cancel_live(state))
    }

    fn begin_turn(
        &self,
        state: &mut State,
        server_id: &str,
        session_id: Option<SessionId>,
        question: &str,
        assistant_id: Option<String>,
        timeout: Duration,
    ) -> u64 {
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        debug!(ticket, session_id = ?session_id, "turn sending");
        state.turn = Some(LiveTurn::new(
            ticket,
            server_id.to_string(),
            session_id,
            question.to_string(),
            assistant_id,
            timeout,
        ));
        self.inner.watchdog.arm(ticket, timeout);
        ticket
    }

    /// Moves the live turn, if any, to `Cancelled`.
    fn cancel_live(&self, state: &mut State) -> Option<RemoteCancel> {
        let turn = state.turn.as_mut().filter(|turn| turn.phase.is_live())?;
        turn.phase = TurnPhase::Cancelled;
        turn.fold = StageFold::default();
        turn.early.clear();
        self.inner.watchdog.disarm(turn.ticket);
        info!(correlation_id = ?turn.correlation_id, session_id = ?turn.session_id, "turn cancelled");
        self.emit(ChatEvent::TurnCancelled {
            correlation_id: turn.correlation_id.clone(),
            session_id: turn.session_id.clone(),
        });
        turn.session_id.clone().map(|session_id| RemoteCancel {
            server_id: turn.server_id.clone(),
            session_id,
        })
    }

    /// Drops a turn whose request failed before the server accepted it.
    fn abandon_turn(&self, ticket: u64, err: anyhow::Error) -> ChatError {
        {
            let mut state = self.inner.state.lock();
            if state.turn.as_ref().is_some_and(|turn| turn.ticket == ticket) {
                state.turn = None;
                if state.active.as_ref().is_some_and(|active| active.session.is_pending()) {
                    state.active = None;
                }
            }
        }
        self.inner.watchdog.disarm(ticket);
        self.remote_failure(err)
    }

    fn replay_early(&self, state: &mut State) {
        let Some(turn) = state.turn.as_mut() else {
            return;
        };
        let early = std::mem::take(&mut turn.early);
        let correlation_id = turn.correlation_id.clone();
        for chunk in early {
            if !state.turn.as_ref().is_some_and(|turn| turn.phase.is_live()) {
                break;
            }
            if chunk.replies_to(correlation_id.as_deref()) {
                self.step(state, chunk);
            } else {
                trace!(reply_to = %chunk.reply_to_message_id, "buffered chunk belongs to another turn");
            }
        }
    }

    fn remote_failure(&self, err: anyhow::Error) -> ChatError {
        warn!(error = %err, "chat command failed");
        self.emit(ChatEvent::Notice {
            message: format!("{err:#}"),
        });
        ChatError::Remote(err)
    }

    fn spawn_remote_cancel(&self, remote: RemoteCancel) {
        let api = self.inner.api.clone();
        tokio::spawn(async move {
            if let Err(err) = api.cancel_turn(&remote.server_id, &remote.session_id).await {
                warn!(session_id = %remote.session_id, error = %err, "remote cancel failed");
            }
        });
    }

    fn spawn_close(&self, server_id: ServerId, session_id: SessionId) {
        let api = self.inner.api.clone();
        tokio::spawn(async move {
            if let Err(err) = api.close_session(&server_id, &session_id).await {
                warn!(%session_id, error = %err, "close session failed");
            }
        });
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.inner.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use channel_transport::{Channel, ChannelError, FrameDispatch, HANDSHAKE_PREFIX};
    use config::Identity;
    use core_types::{ConnectionState, FeatureFlags, MessageRole, SentTurn, StageKind};
    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;

    #[derive(Default)]
    struct FakeApi {
        calls: Mutex<Vec<String>>,
        flags: Mutex<Vec<FeatureFlags>>,
        created: Mutex<VecDeque<(String, String)>>,
        sent: Mutex<VecDeque<String>>,
        listed: Mutex<Vec<Session>>,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        fail_rename: bool,
    }

    impl FakeApi {
        fn scripted(created: &[(&str, &str)], sent: &[&str]) -> Self {
            let api = Self::default();
            *api.created.lock() = created
                .iter()
                .map(|(session, correlation)| (session.to_string(), correlation.to_string()))
                .collect();
            *api.sent.lock() = sent.iter().map(|id| id.to_string()).collect();
            api
        }

        fn log(&self, call: String) {
            self.calls.lock().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ChatApi for FakeApi {
        async fn new_turn(
            &self,
            _server_id: &str,
            channel_token: &str,
            message: &str,
            flags: &FeatureFlags,
        ) -> Result<NewTurn> {
            self.log(format!("new:{channel_token}:{message}"));
            self.flags.lock().push(flags.clone());
            let gate = self.gate.lock().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            let Some((session_id, correlation_id)) = self.created.lock().pop_front() else {
                bail!("chat/_new returned 500");
            };
            Ok(NewTurn {
                session: Session::confirmed(session_id),
                correlation_id,
            })
        }

        async fn send_turn(
            &self,
            _server_id: &str,
            _channel_token: &str,
            session_id: &str,
            message: &str,
            _flags: &FeatureFlags,
        ) -> Result<SentTurn> {
            self.log(format!("send:{session_id}:{message}"));
            let Some(correlation_id) = self.sent.lock().pop_front() else {
                bail!("chat/_send returned 500");
            };
            Ok(SentTurn {
                messages: vec![Message::user(correlation_id.clone(), message)],
                correlation_id,
            })
        }

        async fn open_session(&self, _server_id: &str, session_id: &str) -> Result<Session> {
            self.log(format!("open:{session_id}"));
            Ok(Session::confirmed(session_id))
        }

        async fn cancel_turn(&self, _server_id: &str, session_id: &str) -> Result<()> {
            self.log(format!("cancel:{session_id}"));
            Ok(())
        }

        async fn close_session(&self, _server_id: &str, session_id: &str) -> Result<()> {
            self.log(format!("close:{session_id}"));
            Ok(())
        }

        async fn list_sessions(&self, _server_id: &str, _query: &SessionQuery) -> Result<Page<Session>> {
            let items = self.listed.lock().clone();
            Ok(Page {
                total: items.len() as u64,
                items,
            })
        }

        async fn session_history(
            &self,
            _server_id: &str,
            session_id: &str,
            _from: u32,
            _size: u32,
        ) -> Result<Page<Message>> {
            self.log(format!("history:{session_id}"));
            Ok(Page::default())
        }

        async fn rename_session(&self, _server_id: &str, session_id: &str, _title: &str) -> Result<bool> {
            self.log(format!("rename:{session_id}"));
            if self.fail_rename {
                bail!("PUT /chat/{session_id} returned 503");
            }
            Ok(true)
        }

        async fn delete_session(&self, _server_id: &str, session_id: &str) -> Result<bool> {
            self.log(format!("delete:{session_id}"));
            Ok(true)
        }
    }

    fn identity() -> IdentityContext {
        IdentityContext::new(Identity {
            server: Some(ServerConfig {
                id: "srv".into(),
                name: "Test".into(),
                endpoint: "http://localhost:9000".into(),
                enabled: true,
                api_token: None,
            }),
            connection_timeout_secs: Some(120),
            ..Identity::default()
        })
    }

    fn orchestrator(api: Arc<FakeApi>) -> Orchestrator {
        let chat = Orchestrator::new(api, identity());
        chat.handle_handshake("tok".into());
        chat
    }

    fn frame(correlation_id: &str, stage: &str, text: &str) -> String {
        let body = json!({
            "reply_to_message": correlation_id,
            "chunk_type": stage,
            "message_chunk": text,
        });
        format!("PRIVATE {body}")
    }

    fn reply_end(correlation_id: &str) -> String {
        let body = json!({
            "reply_to_message": correlation_id,
            "chunk_type": "reply_end",
            "message_id": format!("reply-{correlation_id}"),
        });
        format!("PRIVATE {body}")
    }

    fn drain(events: &mut broadcast::Receiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn phase(chat: &Orchestrator) -> Option<TurnPhase> {
        chat.live_message().map(|live| live.phase)
    }

    fn replies(session: &Session) -> Vec<&Message> {
        session
            .messages
            .iter()
            .filter(|message| message.role == MessageRole::Assistant)
            .collect()
    }

    #[tokio::test]
    async fn first_message_creates_session_and_streams_reply() {
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &[]));
        let chat = orchestrator(api.clone());
        let mut events = chat.subscribe();

        let session = chat.create_session("Hello", None).await.expect("session");
        assert_eq!(session.id.as_deref(), Some("s1"));
        assert_eq!(api.calls(), vec!["new:tok:Hello"]);
        assert!(!api.flags.lock()[0].search);
        assert_eq!(phase(&chat), Some(TurnPhase::Sending));

        chat.handle_frame(&frame("c1", "response", "Hi"));
        let live = chat.live_message().expect("live");
        assert_eq!(live.text(), "Hi");
        assert_eq!(live.phase, TurnPhase::Streaming);
        assert_eq!(live.active_stage, Some(StageKind::Response));

        chat.handle_frame(&reply_end("c1"));
        let active = chat.active_session().expect("active");
        let replies = replies(&active);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text, "Hi");
        assert_eq!(replies[0].question.as_deref(), Some("Hello"));
        assert_eq!(phase(&chat), Some(TurnPhase::Completed));
        assert_eq!(chat.history().session("s1").expect("recorded").messages.len(), 2);
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            ChatEvent::TurnCompleted { session_id, .. } if session_id == "s1"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_turn_times_out_and_retry_uses_new_correlation() {
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &["c2"]));
        let chat = orchestrator(api.clone());
        let mut events = chat.subscribe();

        let session = chat.create_session("Hello", Some(2)).await.expect("session");
        chat.handle_frame(&frame("c1", "think", "hmm"));
        tokio::time::sleep(Duration::from_secs(3)).await;

        let timed_out = loop {
            if let ChatEvent::TurnTimedOut {
                correlation_id,
                question,
                ..
            } = events.recv().await.expect("event")
            {
                break (correlation_id, question);
            }
        };
        assert_eq!(timed_out, (Some("c1".to_string()), "Hello".to_string()));
        assert_eq!(phase(&chat), Some(TurnPhase::TimedOut));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(api.calls().contains(&"cancel:s1".to_string()));

        chat.handle_frame(&frame("c1", "response", "too late"));
        assert_eq!(phase(&chat), Some(TurnPhase::TimedOut));

        chat.resend_from_question(&session, "Hello").await.expect("retry");
        let live = chat.live_message().expect("live");
        assert_eq!(live.correlation_id.as_deref(), Some("c2"));
        assert_eq!(live.question, "Hello");
        assert_eq!(live.phase, TurnPhase::Sending);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_chunks_keep_turn_alive() {
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &[]));
        let chat = orchestrator(api);
        chat.create_session("Hello", Some(2)).await.expect("session");

        for step in 0..5 {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            chat.handle_frame(&frame("c1", "response", &"x".repeat(step + 1)));
        }
        assert_eq!(phase(&chat), Some(TurnPhase::Streaming));

        chat.handle_frame(&reply_end("c1"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(phase(&chat), Some(TurnPhase::Completed));
    }

    #[tokio::test]
    async fn cancelled_turn_ignores_late_chunks() {
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &[]));
        let chat = orchestrator(api);
        chat.create_session("Hello", None).await.expect("session");
        chat.handle_frame(&frame("c1", "response", "par"));

        assert!(chat.cancel(Some("s1")));
        let mut events = chat.subscribe();
        chat.handle_frame(&frame("c1", "think", "still going"));

        let live = chat.live_message().expect("turn");
        assert_eq!(live.phase, TurnPhase::Cancelled);
        assert!(live.stages.is_empty());
        assert!(drain(&mut events).is_empty());
        assert!(!chat.cancel(Some("s1")));
    }

    #[tokio::test]
    async fn repeated_stage_keeps_only_latest_content() {
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &[]));
        let chat = orchestrator(api);
        chat.create_session("Hello", None).await.expect("session");

        chat.handle_frame(&frame("c1", "query_intent", "partial"));
        chat.handle_frame(&frame("c1", "query_intent", "partial full"));
        chat.handle_frame(&frame("c1", "response", "done"));
        chat.handle_frame(&reply_end("c1"));
        chat.handle_frame(&reply_end("c1"));

        let active = chat.active_session().expect("active");
        let replies = replies(&active);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, "reply-c1");
        let intent = replies[0].detail(StageKind::QueryIntent).expect("intent");
        assert_eq!(intent.payload, json!("partial full"));
        assert_eq!(replies[0].details.len(), 2);
    }

    #[tokio::test]
    async fn second_submit_for_same_session_is_rejected() {
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &["c2"]));
        let chat = orchestrator(api.clone());
        let session = chat.create_session("Hello", None).await.expect("session");
        chat.handle_frame(&frame("c1", "response", "x"));

        let err = chat.send_message("again", &session).await.expect_err("busy");
        assert!(matches!(err, ChatError::TurnInProgress));

        let mut events = chat.subscribe();
        let correlation_id = chat
            .send_message("elsewhere", &Session::confirmed("s2"))
            .await
            .expect("send");
        assert_eq!(correlation_id, "c2");
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            ChatEvent::TurnCancelled { correlation_id: Some(id), .. } if id == "c1"
        )));

        chat.handle_frame(&frame("c1", "response", "stale"));
        chat.handle_frame(&frame("c2", "response", "fresh"));
        let live = chat.live_message().expect("live");
        assert_eq!(live.session_id.as_deref(), Some("s2"));
        assert_eq!(live.text(), "fresh");
        assert!(api.calls().contains(&"send:s2:elsewhere".to_string()));
    }

    #[tokio::test]
    async fn frames_before_correlation_are_replayed() {
        let (release, gate) = oneshot::channel();
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &[]));
        *api.gate.lock() = Some(gate);
        let chat = orchestrator(api.clone());

        let pending = tokio::spawn({
            let chat = chat.clone();
            async move { chat.create_session("Hello", None).await }
        });
        while api.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        let err = chat.create_session("again", None).await.expect_err("pending");
        assert!(matches!(err, ChatError::TurnInProgress));
        chat.handle_frame(&frame("c0", "response", "stale"));
        chat.handle_frame(&frame("c1", "response", "early"));
        assert_eq!(phase(&chat), Some(TurnPhase::Sending));

        let _ = release.send(());
        pending.await.expect("join").expect("session");
        let live = chat.live_message().expect("live");
        assert_eq!(live.text(), "early");
        assert_eq!(live.phase, TurnPhase::Streaming);
    }

    #[tokio::test]
    async fn rejects_submits_it_cannot_attribute() {
        let api = Arc::new(FakeApi::default());
        let chat = Orchestrator::new(api.clone(), identity());

        let err = chat.create_session("Hi", None).await.expect_err("no token");
        assert!(matches!(err, ChatError::MissingChannelToken));

        chat.handle_handshake("tok".into());
        let err = chat.create_session("   ", None).await.expect_err("empty");
        assert!(matches!(err, ChatError::EmptyMessage));
        let err = chat
            .send_message("Hi", &Session::pending())
            .await
            .expect_err("pending");
        assert!(matches!(err, ChatError::PendingSession));

        chat.handle_connection(false);
        assert!(chat.channel_token().is_none());
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_create_notifies_and_clears_pending_chat() {
        let api = Arc::new(FakeApi::default());
        let chat = orchestrator(api);
        let mut events = chat.subscribe();

        let err = chat.create_session("Hello", None).await.expect_err("remote");
        assert!(matches!(err, ChatError::Remote(_)));
        assert!(chat.live_message().is_none());
        assert!(chat.active_session().is_none());
        assert!(drain(&mut events)
            .iter()
            .any(|event| matches!(event, ChatEvent::Notice { .. })));
    }

    #[tokio::test]
    async fn malformed_frame_ends_turn_and_keeps_partial_reply() {
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &[]));
        let chat = orchestrator(api);
        let mut events = chat.subscribe();
        chat.create_session("Hello", None).await.expect("session");
        chat.handle_frame(&frame("c1", "response", "partial answer"));

        chat.handle_frame("PRIVATE {oops");

        assert_eq!(phase(&chat), Some(TurnPhase::Completed));
        let failed = drain(&mut events).into_iter().find_map(|event| match event {
            ChatEvent::TurnFailed {
                correlation_id,
                partial,
                ..
            } => Some((correlation_id, partial)),
            _ => None,
        });
        let (correlation_id, partial) = failed.expect("turn failed event");
        assert_eq!(correlation_id, "c1");
        assert_eq!(partial.map(|message| message.text).as_deref(), Some("partial answer"));
        let active = chat.active_session().expect("active");
        assert_eq!(replies(&active)[0].text, "partial answer");
    }

    #[tokio::test]
    async fn unknown_stages_never_end_the_turn() {
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &[]));
        let chat = orchestrator(api);
        let mut events = chat.subscribe();
        chat.create_session("Hello", None).await.expect("session");
        chat.handle_frame(&frame("c1", "response", "Hi"));

        chat.handle_frame(&frame("c0", "reference", "from an older turn"));
        chat.handle_frame(&frame("c1", "reference", "not understood here"));

        let live = chat.live_message().expect("live");
        assert_eq!(live.phase, TurnPhase::Streaming);
        assert_eq!(live.text(), "Hi");
        assert!(
            !drain(&mut events)
                .iter()
                .any(|event| matches!(event, ChatEvent::TurnFailed { .. }))
        );

        chat.handle_frame(&reply_end("c1"));
        assert_eq!(phase(&chat), Some(TurnPhase::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_raced_by_a_chunk_is_ignored() {
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &[]));
        let chat = orchestrator(api);
        chat.create_session("Hello", Some(2)).await.expect("session");
        let (ticket, armed_generation) = (1, 1);

        chat.handle_frame(&frame("c1", "think", "hmm"));
        chat.handle_watchdog(ticket, armed_generation);
        assert_eq!(phase(&chat), Some(TurnPhase::Streaming));

        chat.handle_watchdog(ticket, armed_generation + 1);
        assert_eq!(phase(&chat), Some(TurnPhase::TimedOut));
    }

    #[tokio::test]
    async fn leaving_a_session_waits_for_the_server() {
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &[]));
        let chat = orchestrator(api.clone());
        chat.create_session("Hello", None).await.expect("session");
        chat.handle_frame(&frame("c1", "response", "par"));

        chat.leave_session("s1").await.expect("leave");

        assert_eq!(phase(&chat), Some(TurnPhase::Cancelled));
        assert_eq!(api.calls(), vec!["new:tok:Hello", "cancel:s1", "close:s1"]);
    }

    #[tokio::test]
    async fn switching_sessions_runs_in_order() {
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &[]));
        let chat = orchestrator(api.clone());
        chat.create_session("Hello", None).await.expect("session");
        chat.handle_frame(&frame("c1", "response", "x"));

        let opened = chat.select_session("s2").await.expect("select");

        assert_eq!(opened.id.as_deref(), Some("s2"));
        assert_eq!(
            api.calls()[1..].to_vec(),
            vec!["cancel:s1", "close:s1", "open:s2", "history:s2"]
        );
        assert_eq!(phase(&chat), Some(TurnPhase::Cancelled));
        assert_eq!(
            chat.active_session().and_then(|session| session.id).as_deref(),
            Some("s2")
        );
    }

    #[tokio::test]
    async fn failed_rename_keeps_local_title_and_notifies() {
        let api = Arc::new(FakeApi {
            fail_rename: true,
            ..FakeApi::scripted(&[("s1", "c1")], &[])
        });
        let chat = orchestrator(api);
        chat.create_session("Hello", None).await.expect("session");
        let mut events = chat.subscribe();

        let err = chat
            .rename_session("s1", "Greetings")
            .await
            .expect_err("remote failure");
        assert!(matches!(err, ChatError::Remote(_)));
        assert_eq!(
            chat.active_session().and_then(|session| session.title).as_deref(),
            Some("Greetings")
        );
        assert!(chat.history().is_diverged("s1"));
        assert!(drain(&mut events)
            .iter()
            .any(|event| matches!(event, ChatEvent::Notice { .. })));
    }

    #[tokio::test]
    async fn deleting_open_session_moves_to_next_one() {
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &[]));
        *api.listed.lock() = vec![Session::confirmed("s2"), Session::confirmed("s3")];
        let chat = orchestrator(api.clone());
        chat.create_session("Hello", None).await.expect("session");
        chat.list_sessions(&SessionQuery::first_page(20))
            .await
            .expect("list");

        chat.delete_session("s1").await.expect("delete");

        let calls = api.calls();
        assert!(calls.contains(&"close:s1".to_string()));
        assert!(calls.contains(&"delete:s1".to_string()));
        assert!(calls.contains(&"open:s2".to_string()));
        assert_eq!(
            chat.active_session().and_then(|session| session.id).as_deref(),
            Some("s2")
        );
        assert!(chat.history().session("s1").is_none());
    }

    #[tokio::test]
    async fn deleting_last_session_starts_fresh_chat() {
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &[]));
        let chat = orchestrator(api);
        chat.create_session("Hello", None).await.expect("session");
        chat.handle_frame(&reply_end("c1"));

        chat.delete_session("s1").await.expect("delete");
        assert!(chat.active_session().is_none());
    }

    /// Echoes sent text back as inbound frames.
    struct Loopback {
        dispatch: Arc<FrameDispatch>,
    }

    #[async_trait]
    impl Channel for Loopback {
        fn dispatch(&self) -> &Arc<FrameDispatch> {
            &self.dispatch
        }

        async fn connect(&self, server: &ServerConfig) {
            self.dispatch.set_state(ConnectionState::Open);
            self.dispatch
                .deliver(format!("{HANDSHAKE_PREFIX}token-{}", server.id));
        }

        async fn send(&self, text: &str) -> std::result::Result<(), ChannelError> {
            self.dispatch.deliver(text.to_string());
            Ok(())
        }

        async fn disconnect(&self) {
            self.dispatch.set_state(ConnectionState::Closed);
        }
    }

    #[tokio::test]
    async fn attached_channel_feeds_the_live_turn() {
        let registry = ChannelRegistry::new();
        registry
            .register(Arc::new(Loopback {
                dispatch: Arc::new(FrameDispatch::new(ClientId::Standalone)),
            }))
            .await;
        let api = Arc::new(FakeApi::scripted(&[("s1", "c1")], &[]));
        let chat = Orchestrator::new(api.clone(), identity());
        let mut events = chat.subscribe();
        chat.attach(&registry, ClientId::Standalone)
            .await
            .expect("attach");

        let server = chat.identity().snapshot().server.expect("server");
        registry.connect(&server, ClientId::Standalone).await;
        assert_eq!(chat.channel_token().as_deref(), Some("token-srv"));
        loop {
            if let ChatEvent::ConnectionChanged { connected } = events.recv().await.expect("event") {
                assert!(connected);
                break;
            }
        }

        chat.create_session("Hello", None).await.expect("session");
        assert_eq!(api.calls(), vec!["new:token-srv:Hello"]);
        registry
            .send(ClientId::Standalone, &frame("c1", "response", "over the wire"))
            .await
            .expect("send");
        assert_eq!(
            chat.live_message().map(|live| live.text().to_string()).as_deref(),
            Some("over the wire")
        );

        registry.disconnect(ClientId::Standalone).await;
        loop {
            if let ChatEvent::ConnectionChanged { connected } = events.recv().await.expect("event") {
                assert!(!connected);
                break;
            }
        }
        assert!(chat.channel_token().is_none());
    }
}
