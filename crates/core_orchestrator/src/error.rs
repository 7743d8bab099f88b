use channel_transport::ChannelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat channel has no session token yet; wait for it to reconnect")]
    MissingChannelToken,
    #[error("no chat server is selected")]
    NoServerSelected,
    #[error("session has not been created on the server yet")]
    PendingSession,
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("a reply is still in progress for this session")]
    TurnInProgress,
    #[error("message is empty")]
    EmptyMessage,
    #[error("turn was superseded before the server answered")]
    Superseded,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Remote(#[from] anyhow::Error),
}

impl ChatError {
    /// Errors the user can fix by waiting or retrying, as opposed to misuse.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChatError::MissingChannelToken
                | ChatError::TurnInProgress
                | ChatError::Superseded
                | ChatError::Channel(_)
                | ChatError::Remote(_)
        )
    }
}
