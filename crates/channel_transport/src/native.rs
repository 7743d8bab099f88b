use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use core_types::{ClientId, ConnectionState, ServerConfig, ServerId};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::dispatch::FrameDispatch;
use crate::{Channel, ChannelError, websocket_endpoint};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const API_TOKEN_HEADER: &str = "X-API-TOKEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Extra attempts after the first failed connect.
    pub limit: u32,
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            interval: Duration::from_secs(3),
        }
    }
}

struct Connection {
    server_id: ServerId,
    outbox: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn is_live(&self) -> bool {
        !self.reader.is_finished()
    }
}

/// Channel backed by a socket owned by this process.
pub struct NativeSocketChannel {
    dispatch: Arc<FrameDispatch>,
    policy: ReconnectPolicy,
    connection: Mutex<Option<Connection>>,
}

impl NativeSocketChannel {
    pub fn new(client_id: ClientId, policy: ReconnectPolicy) -> Self {
        Self {
            dispatch: Arc::new(FrameDispatch::new(client_id)),
            policy,
            connection: Mutex::new(None),
        }
    }

    /// Server the channel is currently bound to, if any.
    pub async fn server_id(&self) -> Option<ServerId> {
        self.connection
            .lock()
            .await
            .as_ref()
            .filter(|connection| connection.is_live())
            .map(|connection| connection.server_id.clone())
    }

    async fn open(&self, server: &ServerConfig) -> Result<WsStream, ChannelError> {
        let endpoint = websocket_endpoint(&server.endpoint)?;
        let mut attempt = 0;
        loop {
            let request = build_request(&endpoint, server.api_token.as_deref())?;
            match connect_async(request).await {
                Ok((stream, _response)) => return Ok(stream),
                Err(err) if attempt < self.policy.limit => {
                    attempt += 1;
                    warn!(
                        client_id = %self.dispatch.client_id(),
                        server_id = %server.id,
                        attempt,
                        error = %err,
                        "socket connect failed; retrying"
                    );
                    tokio::time::sleep(self.policy.interval).await;
                }
                Err(err) => return Err(ChannelError::Socket(err.to_string())),
            }
        }
    }

    fn start(&self, server_id: ServerId, stream: WsStream) -> Connection {
        let (mut sink, mut source) = stream.split();
        let (outbox, mut outbox_rx) = mpsc::channel::<Message>(32);

        let writer = tokio::spawn(async move {
            while let Some(message) = outbox_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let dispatch = self.dispatch.clone();
        let reader = tokio::spawn(async move {
            while let Some(next) = source.next().await {
                match next {
                    Ok(Message::Text(text)) => dispatch.deliver(text.as_str().to_owned()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        dispatch.report_fault(err.to_string());
                        break;
                    }
                }
            }
            debug!(client_id = %dispatch.client_id(), "socket reader finished");
            dispatch.set_state(ConnectionState::Closed);
        });

        Connection {
            server_id,
            outbox,
            reader,
            writer,
        }
    }

    async fn release(&self, connection: Connection) {
        self.dispatch.set_state(ConnectionState::Closing);
        let _ = connection.outbox.send(Message::Close(None)).await;
        connection.reader.abort();
        drop(connection.outbox);
        let _ = connection.writer.await;
        self.dispatch.set_state(ConnectionState::Closed);
        info!(
            client_id = %self.dispatch.client_id(),
            server_id = %connection.server_id,
            "socket disconnected"
        );
    }
}

fn build_request(endpoint: &str, token: Option<&str>) -> Result<Request, ChannelError> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|err| ChannelError::InvalidEndpoint(err.to_string()))?;
    if let Some(token) = token.filter(|token| !token.is_empty()) {
        let value = HeaderValue::from_str(token)
            .map_err(|err| ChannelError::Socket(format!("invalid api token: {err}")))?;
        request.headers_mut().insert(API_TOKEN_HEADER, value);
    }
    Ok(request)
}

#[async_trait]
impl Channel for NativeSocketChannel {
    fn dispatch(&self) -> &Arc<FrameDispatch> {
        &self.dispatch
    }

    async fn connect(&self, server: &ServerConfig) {
        let mut slot = self.connection.lock().await;
        if let Some(current) = slot.as_ref()
            && current.server_id == server.id
            && current.is_live()
        {
            debug!(client_id = %self.dispatch.client_id(), server_id = %server.id, "already connected");
            return;
        }
        if let Some(previous) = slot.take() {
            self.release(previous).await;
        }

        self.dispatch.set_state(ConnectionState::Connecting);
        match self.open(server).await {
            Ok(stream) => {
                *slot = Some(self.start(server.id.clone(), stream));
                self.dispatch.set_state(ConnectionState::Open);
                info!(client_id = %self.dispatch.client_id(), server_id = %server.id, "socket connected");
            }
            Err(err) => {
                self.dispatch.report_fault(err.to_string());
                self.dispatch.set_state(ConnectionState::Closed);
            }
        }
    }

    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        let slot = self.connection.lock().await;
        let Some(connection) = slot.as_ref().filter(|connection| connection.is_live()) else {
            return Err(ChannelError::NotConnected(self.dispatch.client_id()));
        };
        connection
            .outbox
            .send(Message::Text(text.to_owned().into()))
            .await
            .map_err(|_| ChannelError::NotConnected(self.dispatch.client_id()))
    }

    async fn disconnect(&self) {
        let previous = self.connection.lock().await.take();
        if let Some(previous) = previous {
            self.release(previous).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(endpoint: &str) -> ServerConfig {
        ServerConfig {
            id: "local".into(),
            name: "Local".into(),
            endpoint: endpoint.into(),
            enabled: true,
            api_token: Some("secret".into()),
        }
    }

    #[test]
    fn request_carries_api_token() {
        let request = build_request("ws://localhost:9000/ws", Some("secret")).expect("request");
        assert_eq!(
            request.headers().get(API_TOKEN_HEADER).map(|value| value.as_bytes()),
            Some("secret".as_bytes())
        );

        let anonymous = build_request("ws://localhost:9000/ws", Some("")).expect("request");
        assert!(anonymous.headers().get(API_TOKEN_HEADER).is_none());
    }

    #[tokio::test]
    async fn send_without_connection_is_rejected() {
        let channel = NativeSocketChannel::new(ClientId::Standalone, ReconnectPolicy::default());
        let err = channel.send("hello").await.expect_err("not connected");
        assert!(matches!(err, ChannelError::NotConnected(ClientId::Standalone)));
        channel.disconnect().await;
        assert_eq!(channel.dispatch().state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn failed_connect_reports_fault_and_stays_closed() {
        let channel = NativeSocketChannel::new(
            ClientId::Popup,
            ReconnectPolicy {
                limit: 0,
                interval: Duration::from_millis(1),
            },
        );
        let mut faults = channel.dispatch().subscribe_faults();

        channel.connect(&server("::not a url::")).await;

        let fault = faults.recv().await.expect("fault");
        assert_eq!(fault.client_id, ClientId::Popup);
        assert_eq!(channel.dispatch().state(), ConnectionState::Closed);
        assert!(channel.server_id().await.is_none());
    }
}
