//! One bidirectional message channel per logical client.
//!
//! The registry only moves raw text in and out; interpretation of frames is
//! left to whoever installs the frame handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use core_types::{ClientId, ConnectionState, ServerConfig};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::info;

mod dispatch;
mod endpoint;
mod native;
mod proxied;

pub use dispatch::{
    ChannelFault, FrameDispatch, FrameHandler, HANDSHAKE_PREFIX, HandshakeHandler, parse_handshake,
};
pub use endpoint::websocket_endpoint;
pub use native::{NativeSocketChannel, ReconnectPolicy};
pub use proxied::{HostBridge, HostCommand, HostEvent, ProxiedEventChannel, SocketHostBridge};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {0} is not connected")]
    NotConnected(ClientId),
    #[error("invalid server endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("socket error: {0}")]
    Socket(String),
}

/// Transport-agnostic channel contract.
///
/// `connect` never fails to the caller: errors surface through the fault
/// side-channel and leave the channel `Closed`.
#[async_trait]
pub trait Channel: Send + Sync {
    fn dispatch(&self) -> &Arc<FrameDispatch>;

    async fn connect(&self, server: &ServerConfig);
    async fn send(&self, text: &str) -> Result<(), ChannelError>;
    async fn disconnect(&self);

    fn client_id(&self) -> ClientId {
        self.dispatch().client_id()
    }
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ClientId, Arc<dyn Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `channel` for its client id, releasing any channel it replaces.
    pub async fn register(&self, channel: Arc<dyn Channel>) {
        let client_id = channel.client_id();
        let previous = self.channels.write().await.insert(client_id, channel);
        if let Some(previous) = previous {
            previous.disconnect().await;
        }
        info!(client_id = %client_id, "channel registered");
    }

    pub async fn channel(&self, client_id: ClientId) -> Result<Arc<dyn Channel>, ChannelError> {
        self.channels
            .read()
            .await
            .get(&client_id)
            .cloned()
            .ok_or(ChannelError::NotConnected(client_id))
    }

    pub async fn connect(&self, server: &ServerConfig, client_id: ClientId) {
        match self.channel(client_id).await {
            Ok(channel) => channel.connect(server).await,
            Err(err) => tracing::warn!(client_id = %client_id, error = %err, "connect on unknown channel"),
        }
    }

    pub async fn send(&self, client_id: ClientId, text: &str) -> Result<(), ChannelError> {
        self.channel(client_id).await?.send(text).await
    }

    pub async fn disconnect(&self, client_id: ClientId) {
        if let Ok(channel) = self.channel(client_id).await {
            channel.disconnect().await;
        }
    }

    pub async fn on_frame(
        &self,
        client_id: ClientId,
        handler: FrameHandler,
    ) -> Result<(), ChannelError> {
        self.channel(client_id).await?.dispatch().update_handler(handler);
        Ok(())
    }

    pub async fn on_handshake(
        &self,
        client_id: ClientId,
        handler: HandshakeHandler,
    ) -> Result<(), ChannelError> {
        self.channel(client_id)
            .await?
            .dispatch()
            .update_handshake_handler(handler);
        Ok(())
    }

    pub async fn state(&self, client_id: ClientId) -> ConnectionState {
        match self.channel(client_id).await {
            Ok(channel) => channel.dispatch().state(),
            Err(_) => ConnectionState::Closed,
        }
    }

    pub async fn subscribe_connected(
        &self,
        client_id: ClientId,
    ) -> Result<watch::Receiver<bool>, ChannelError> {
        Ok(self.channel(client_id).await?.dispatch().subscribe_connected())
    }

    pub async fn subscribe_faults(
        &self,
        client_id: ClientId,
    ) -> Result<broadcast::Receiver<ChannelFault>, ChannelError> {
        Ok(self.channel(client_id).await?.dispatch().subscribe_faults())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    /// Loopback channel: `send` echoes the text back as an inbound frame.
    struct Loopback {
        dispatch: Arc<FrameDispatch>,
        server: Mutex<Option<String>>,
        connects: Mutex<u32>,
    }

    impl Loopback {
        fn new(client_id: ClientId) -> Self {
            Self {
                dispatch: Arc::new(FrameDispatch::new(client_id)),
                server: Mutex::new(None),
                connects: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Channel for Loopback {
        fn dispatch(&self) -> &Arc<FrameDispatch> {
            &self.dispatch
        }

        async fn connect(&self, server: &ServerConfig) {
            if self.server.lock().as_deref() == Some(server.id.as_str()) {
                return;
            }
            *self.connects.lock() += 1;
            *self.server.lock() = Some(server.id.clone());
            self.dispatch.set_state(ConnectionState::Open);
            self.dispatch.deliver(format!("{HANDSHAKE_PREFIX}token-{}", server.id));
        }

        async fn send(&self, text: &str) -> Result<(), ChannelError> {
            if !self.dispatch.state().is_open() {
                return Err(ChannelError::NotConnected(self.client_id()));
            }
            self.dispatch.deliver(text.to_string());
            Ok(())
        }

        async fn disconnect(&self) {
            self.server.lock().take();
            self.dispatch.set_state(ConnectionState::Closed);
        }
    }

    fn server(id: &str) -> ServerConfig {
        ServerConfig {
            id: id.into(),
            name: id.into(),
            endpoint: "http://localhost:9000".into(),
            enabled: true,
            api_token: None,
        }
    }

    #[tokio::test]
    async fn connect_is_idempotent_per_server() {
        let registry = ChannelRegistry::new();
        let channel = Arc::new(Loopback::new(ClientId::Standalone));
        registry.register(channel.clone()).await;

        let tokens = Arc::new(Mutex::new(Vec::new()));
        let sink = tokens.clone();
        registry
            .on_handshake(ClientId::Standalone, Arc::new(move |token: String| sink.lock().push(token)))
            .await
            .expect("handler");

        registry.connect(&server("a"), ClientId::Standalone).await;
        registry.connect(&server("a"), ClientId::Standalone).await;
        assert_eq!(*channel.connects.lock(), 1);
        assert_eq!(*tokens.lock(), vec!["token-a".to_string()]);
        assert!(registry.state(ClientId::Standalone).await.is_open());
    }

    #[tokio::test]
    async fn frames_reach_only_the_latest_handler() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(Loopback::new(ClientId::Popup))).await;
        registry.connect(&server("a"), ClientId::Popup).await;

        let old = Arc::new(Mutex::new(Vec::new()));
        let new = Arc::new(Mutex::new(Vec::new()));
        let sink = old.clone();
        registry
            .on_frame(ClientId::Popup, Arc::new(move |raw: String| sink.lock().push(raw)))
            .await
            .expect("handler");
        let sink = new.clone();
        registry
            .on_frame(ClientId::Popup, Arc::new(move |raw: String| sink.lock().push(raw)))
            .await
            .expect("handler");

        registry.send(ClientId::Popup, "PRIVATE {}").await.expect("send");
        assert!(old.lock().is_empty());
        assert_eq!(*new.lock(), vec!["PRIVATE {}".to_string()]);
    }

    #[tokio::test]
    async fn disconnect_is_safe_when_absent_or_closed() {
        let registry = ChannelRegistry::new();
        registry.disconnect(ClientId::Popup).await;

        registry.register(Arc::new(Loopback::new(ClientId::Popup))).await;
        registry.disconnect(ClientId::Popup).await;
        registry.disconnect(ClientId::Popup).await;

        let err = registry.send(ClientId::Popup, "hi").await.expect_err("closed");
        assert!(matches!(err, ChannelError::NotConnected(ClientId::Popup)));
        assert!(registry.send(ClientId::Standalone, "hi").await.is_err());
    }
}
