use std::sync::Arc;

use core_types::{ClientId, ConnectionState};
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

pub const HANDSHAKE_PREFIX: &str = "websocket-session-id:";

pub type FrameHandler = Arc<dyn Fn(String) + Send + Sync>;
pub type HandshakeHandler = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFault {
    pub client_id: ClientId,
    pub reason: String,
}

/// Returns the channel token if `raw` is the handshake frame.
pub fn parse_handshake(raw: &str) -> Option<&str> {
    raw.strip_prefix(HANDSHAKE_PREFIX)
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Inbound side shared by every channel variant: the current handlers, the
/// connection state and the error side-channel.
pub struct FrameDispatch {
    client_id: ClientId,
    frame_handler: RwLock<Option<FrameHandler>>,
    handshake_handler: RwLock<Option<HandshakeHandler>>,
    state: watch::Sender<ConnectionState>,
    connected: watch::Sender<bool>,
    faults: broadcast::Sender<ChannelFault>,
}

impl FrameDispatch {
    pub fn new(client_id: ClientId) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (connected, _) = watch::channel(false);
        let (faults, _) = broadcast::channel(16);
        Self {
            client_id,
            frame_handler: RwLock::new(None),
            handshake_handler: RwLock::new(None),
            state,
            connected,
            faults,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Swaps the frame handler in place; the channel itself is untouched.
    pub fn update_handler(&self, handler: FrameHandler) {
        *self.frame_handler.write() = Some(handler);
    }

    pub fn update_handshake_handler(&self, handler: HandshakeHandler) {
        *self.handshake_handler.write() = Some(handler);
    }

    pub fn deliver(&self, raw: String) {
        if let Some(token) = parse_handshake(&raw) {
            debug!(client_id = %self.client_id, "channel handshake received");
            let handler = self.handshake_handler.read().clone();
            match handler {
                Some(handler) => handler(token.to_string()),
                None => warn!(client_id = %self.client_id, "handshake dropped: no handler"),
            }
            return;
        }

        let handler = self.frame_handler.read().clone();
        if let Some(handler) = handler {
            handler(raw);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
        let open = next.is_open();
        let flipped = self.connected.send_if_modified(|connected| {
            let changed = *connected != open;
            *connected = open;
            changed
        });
        if flipped {
            debug!(client_id = %self.client_id, connected = open, "channel connectivity changed");
        }
    }

    pub fn report_fault(&self, reason: impl Into<String>) {
        let fault = ChannelFault {
            client_id: self.client_id,
            reason: reason.into(),
        };
        warn!(client_id = %fault.client_id, reason = %fault.reason, "channel fault");
        let _ = self.faults.send(fault);
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn subscribe_faults(&self) -> broadcast::Receiver<ChannelFault> {
        self.faults.subscribe()
    }
}
