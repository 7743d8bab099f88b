use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use core_types::{ClientId, ConnectionState, ServerConfig, ServerId};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dispatch::FrameDispatch;
use crate::native::{NativeSocketChannel, ReconnectPolicy};
use crate::{Channel, ChannelError};

/// Command issued to the host process that owns the real sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    ConnectToServer { server_id: ServerId, client_id: ClientId },
    Disconnect { client_id: ClientId },
    Send { client_id: ClientId, text: String },
}

/// Symbolic event pushed by the host, e.g. `ws-message-popup`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostEvent {
    pub name: String,
    pub payload: Value,
}

#[async_trait]
pub trait HostBridge: Send + Sync {
    async fn invoke(&self, command: HostCommand) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<HostEvent>;
}

/// Channel whose socket lives in a host process and is reached only through
/// commands and named events.
pub struct ProxiedEventChannel {
    dispatch: Arc<FrameDispatch>,
    bridge: Arc<dyn HostBridge>,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Server the host socket was last connected to. Held across connect and
    /// disconnect so they run one at a time.
    bound: Mutex<Option<ServerId>>,
}

impl ProxiedEventChannel {
    pub fn new(client_id: ClientId, bridge: Arc<dyn HostBridge>) -> Self {
        Self {
            dispatch: Arc::new(FrameDispatch::new(client_id)),
            bridge,
            listener: Mutex::new(None),
            bound: Mutex::new(None),
        }
    }

    async fn release(&self) {
        if self.dispatch.state() == ConnectionState::Closed {
            return;
        }
        self.dispatch.set_state(ConnectionState::Closing);
        let command = HostCommand::Disconnect {
            client_id: self.dispatch.client_id(),
        };
        if let Err(err) = self.bridge.invoke(command).await {
            debug!(client_id = %self.dispatch.client_id(), error = %err, "host disconnect failed");
        }
        self.dispatch.set_state(ConnectionState::Closed);
    }

    async fn ensure_listener(&self) {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let mut events = self.bridge.subscribe();
        let dispatch = self.dispatch.clone();
        let message_event = dispatch.client_id().message_event();
        let error_event = dispatch.client_id().error_event();
        *listener = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.name == message_event => match event.payload {
                        Value::String(text) => dispatch.deliver(text),
                        other => dispatch.deliver(other.to_string()),
                    },
                    Ok(event) if event.name == error_event => {
                        dispatch.report_fault(format!("host channel error: {}", event.payload));
                        dispatch.set_state(ConnectionState::Closed);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(client_id = %dispatch.client_id(), skipped, "host events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }
}

impl Drop for ProxiedEventChannel {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

#[async_trait]
impl Channel for ProxiedEventChannel {
    fn dispatch(&self) -> &Arc<FrameDispatch> {
        &self.dispatch
    }

    async fn connect(&self, server: &ServerConfig) {
        let mut bound = self.bound.lock().await;
        if bound.as_deref() == Some(server.id.as_str()) && self.dispatch.state().is_open() {
            debug!(client_id = %self.dispatch.client_id(), server_id = %server.id, "already connected");
            return;
        }
        if let Some(previous) = bound.take() {
            debug!(client_id = %self.dispatch.client_id(), server_id = %previous, "leaving previous server");
            self.release().await;
        }
        self.ensure_listener().await;
        self.dispatch.set_state(ConnectionState::Connecting);
        let command = HostCommand::ConnectToServer {
            server_id: server.id.clone(),
            client_id: self.dispatch.client_id(),
        };
        match self.bridge.invoke(command).await {
            Ok(()) => {
                *bound = Some(server.id.clone());
                self.dispatch.set_state(ConnectionState::Open);
            }
            Err(err) => {
                self.dispatch.report_fault(format!("{err:#}"));
                self.dispatch.set_state(ConnectionState::Closed);
            }
        }
    }

    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        if !self.dispatch.state().is_open() {
            return Err(ChannelError::NotConnected(self.dispatch.client_id()));
        }
        let command = HostCommand::Send {
            client_id: self.dispatch.client_id(),
            text: text.to_string(),
        };
        self.bridge
            .invoke(command)
            .await
            .map_err(|err| ChannelError::Socket(format!("{err:#}")))
    }

    async fn disconnect(&self) {
        let mut bound = self.bound.lock().await;
        bound.take();
        self.release().await;
    }
}

/// In-process host: owns one native socket per client and re-publishes its
/// traffic as named events.
pub struct SocketHostBridge {
    servers: RwLock<HashMap<ServerId, ServerConfig>>,
    sockets: RwLock<HashMap<ClientId, Arc<NativeSocketChannel>>>,
    policy: ReconnectPolicy,
    events: broadcast::Sender<HostEvent>,
}

impl SocketHostBridge {
    pub fn new(servers: impl IntoIterator<Item = ServerConfig>, policy: ReconnectPolicy) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            servers: RwLock::new(
                servers
                    .into_iter()
                    .map(|server| (server.id.clone(), server))
                    .collect(),
            ),
            sockets: RwLock::new(HashMap::new()),
            policy,
            events,
        }
    }

    pub async fn upsert_server(&self, server: ServerConfig) {
        self.servers.write().await.insert(server.id.clone(), server);
    }

    async fn socket(&self, client_id: ClientId) -> Arc<NativeSocketChannel> {
        if let Some(socket) = self.sockets.read().await.get(&client_id) {
            return socket.clone();
        }
        let mut sockets = self.sockets.write().await;
        sockets
            .entry(client_id)
            .or_insert_with(|| {
                let socket = Arc::new(NativeSocketChannel::new(client_id, self.policy));
                self.forward(&socket, client_id);
                socket
            })
            .clone()
    }

    fn forward(&self, socket: &NativeSocketChannel, client_id: ClientId) {
        let events = self.events.clone();
        let message_event = client_id.message_event();
        socket.dispatch().update_handler(Arc::new(move |raw: String| {
            let _ = events.send(HostEvent {
                name: message_event.clone(),
                payload: Value::String(raw),
            });
        }));

        let events = self.events.clone();
        let message_event = client_id.message_event();
        socket.dispatch().update_handshake_handler(Arc::new(move |token: String| {
            let _ = events.send(HostEvent {
                name: message_event.clone(),
                payload: Value::String(format!("{}{token}", crate::HANDSHAKE_PREFIX)),
            });
        }));

        let events = self.events.clone();
        let error_event = client_id.error_event();
        let mut faults = socket.dispatch().subscribe_faults();
        tokio::spawn(async move {
            while let Ok(fault) = faults.recv().await {
                let _ = events.send(HostEvent {
                    name: error_event.clone(),
                    payload: Value::String(fault.reason),
                });
            }
        });
    }
}

#[async_trait]
impl HostBridge for SocketHostBridge {
    async fn invoke(&self, command: HostCommand) -> Result<()> {
        match command {
            HostCommand::ConnectToServer {
                server_id,
                client_id,
            } => {
                let server = self
                    .servers
                    .read()
                    .await
                    .get(&server_id)
                    .cloned()
                    .with_context(|| format!("server {server_id} not found"))?;
                let socket = self.socket(client_id).await;
                socket.connect(&server).await;
                anyhow::ensure!(
                    socket.dispatch().state().is_open(),
                    "failed to connect {client_id} to {server_id}"
                );
                Ok(())
            }
            HostCommand::Disconnect { client_id } => {
                let socket = self.sockets.read().await.get(&client_id).cloned();
                if let Some(socket) = socket {
                    socket.disconnect().await;
                }
                Ok(())
            }
            HostCommand::Send { client_id, text } => {
                let socket = self.socket(client_id).await;
                socket.send(&text).await.map_err(anyhow::Error::from)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }
}
