use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use channel_transport::{
    Channel, ChannelRegistry, NativeSocketChannel, ProxiedEventChannel, ReconnectPolicy,
    SocketHostBridge,
};
use config::{AppConfig, IdentityContext, TransportKind};
use core_orchestrator::{ChatEvent, Orchestrator};
use core_types::{ClientId, SessionQuery};
use http_api::HttpChatApi;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::render::{LiveRender, message_line, session_line};

const HANDSHAKE_WAIT: Duration = Duration::from_secs(15);

fn orchestrator(config: &AppConfig) -> Result<Orchestrator> {
    let api = HttpChatApi::with_servers(config.allow_self_signature, config.servers.clone())?;
    let identity = IdentityContext::from_config(config);
    if identity.snapshot().server.is_none() {
        bail!("no enabled chat server is selected in the config");
    }
    Ok(Orchestrator::new(Arc::new(api), identity))
}

fn channel(config: &AppConfig, client_id: ClientId) -> Arc<dyn Channel> {
    let policy = ReconnectPolicy {
        limit: config.socket.reconnect_limit,
        interval: config.socket.reconnect_interval(),
    };
    match config.transport {
        TransportKind::Native => Arc::new(NativeSocketChannel::new(client_id, policy)),
        TransportKind::Proxied => {
            let bridge = SocketHostBridge::new(config.servers.clone(), policy);
            Arc::new(ProxiedEventChannel::new(client_id, Arc::new(bridge)))
        }
    }
}

async fn wait_for_token(chat: &Orchestrator) -> Result<()> {
    tokio::time::timeout(HANDSHAKE_WAIT, async {
        while chat.channel_token().is_none() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("chat server did not hand out a channel session in time"))
}

pub async fn ask(
    config: &AppConfig,
    question: &str,
    session_id: Option<&str>,
    client_id: ClientId,
    timeout: Option<u64>,
) -> Result<()> {
    let chat = orchestrator(config)?;
    if timeout.is_some() {
        chat.identity().set_connection_timeout(timeout);
    }
    let server = chat
        .identity()
        .snapshot()
        .server
        .context("no chat server selected")?;

    let registry = ChannelRegistry::new();
    registry.register(channel(config, client_id)).await;
    chat.attach(&registry, client_id).await?;
    let mut events = chat.subscribe();
    registry.connect(&server, client_id).await;
    wait_for_token(&chat).await?;

    let session = match session_id {
        Some(id) => Some(chat.select_session(id).await?),
        None => None,
    };
    let current = match &session {
        Some(session) => {
            chat.send_message(question, session).await?;
            session.id.clone()
        }
        None => chat.create_session(question, None).await?.id,
    };
    info!(session_id = ?current, "waiting for reply");

    let mut render = LiveRender::default();
    let mut stdout = io::stdout();
    let outcome = loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                chat.cancel(current.as_deref());
                break Err(anyhow!("cancelled"));
            }
        };
        match event {
            Ok(ChatEvent::LiveUpdated(live)) => {
                if let Some(stage) = render.stage_change(&live) {
                    eprintln!("[{stage}]");
                }
                if let Some(count) = render.new_sources(&live) {
                    eprintln!("[{count} sources]");
                }
                write!(stdout, "{}", render.delta(&live))?;
                stdout.flush()?;
            }
            Ok(ChatEvent::TurnCompleted { session_id, message }) => {
                if render.printed().is_empty() {
                    writeln!(stdout, "{}", message.text)?;
                } else {
                    writeln!(stdout)?;
                }
                eprintln!("session {session_id}");
                break Ok(());
            }
            Ok(ChatEvent::TurnFailed { reason, .. }) => break Err(anyhow!("reply failed: {reason}")),
            Ok(ChatEvent::TurnTimedOut { .. }) => {
                break Err(anyhow!("no reply from the server in time; try again"));
            }
            Ok(ChatEvent::TurnCancelled { .. }) => break Err(anyhow!("reply was cancelled")),
            Ok(ChatEvent::ChannelFault { reason }) => eprintln!("channel: {reason}"),
            Ok(ChatEvent::Notice { message }) => eprintln!("{message}"),
            Ok(ChatEvent::ConnectionChanged { connected }) => {
                if !connected {
                    warn!("chat channel dropped while waiting for a reply");
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "terminal fell behind the reply stream"),
            Err(RecvError::Closed) => break Err(anyhow!("chat stopped unexpectedly")),
        }
    };

    if let Some(id) = current.as_deref()
        && let Err(err) = chat.leave_session(id).await
    {
        warn!(session_id = %id, error = %err, "failed to close session");
    }
    registry.disconnect(client_id).await;
    outcome
}

pub async fn sessions(config: &AppConfig, query: Option<String>, from: u32, size: u32) -> Result<()> {
    let chat = orchestrator(config)?;
    let page = chat
        .list_sessions(&SessionQuery { from, size, query })
        .await?;
    for session in &page.items {
        println!("{}", session_line(session));
    }
    eprintln!("{} of {} sessions", page.items.len(), page.total);
    Ok(())
}

pub async fn history(config: &AppConfig, session_id: &str, size: u32) -> Result<()> {
    let chat = orchestrator(config)?;
    for message in chat.session_messages(session_id, 0, size).await? {
        println!("{}", message_line(&message));
    }
    Ok(())
}

pub async fn rename(config: &AppConfig, session_id: &str, title: &str) -> Result<()> {
    orchestrator(config)?.rename_session(session_id, title).await?;
    eprintln!("renamed {session_id}");
    Ok(())
}

pub async fn delete(config: &AppConfig, session_id: &str) -> Result<()> {
    orchestrator(config)?.delete_session(session_id).await?;
    eprintln!("deleted {session_id}");
    Ok(())
}
