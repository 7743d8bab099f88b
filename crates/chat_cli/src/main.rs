use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::ConfigStore;
use core_types::ClientId;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod commands;
mod render;

#[derive(Parser)]
#[command(name = "coco-chat")]
#[command(about = "Chat with a Coco server from the terminal", long_about = None)]
struct Cli {
    /// Directory holding config.json; defaults to the platform config dir.
    #[arg(long, env = "COCO_CHAT_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question and stream the reply
    Ask {
        question: String,
        /// Continue this session instead of starting a new one
        #[arg(long)]
        session: Option<String>,
        #[arg(long, value_enum, default_value_t = ClientArg::Standalone)]
        client: ClientArg,
        /// Seconds to wait between reply chunks before giving up
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List chat sessions
    Sessions {
        #[arg(long)]
        query: Option<String>,
        #[arg(long, default_value_t = 0)]
        from: u32,
        #[arg(long, default_value_t = 20)]
        size: u32,
    },
    /// Print the messages of a session
    History {
        session: String,
        #[arg(long, default_value_t = 100)]
        size: u32,
    },
    /// Rename a session
    Rename { session: String, title: String },
    /// Delete a session
    Delete { session: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClientArg {
    Standalone,
    Popup,
}

impl From<ClientArg> for ClientId {
    fn from(value: ClientArg) -> Self {
        match value {
            ClientArg::Standalone => ClientId::Standalone,
            ClientArg::Popup => ClientId::Popup,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    data_dir.push("coco-chat");
    let _log_guard = init_local_logger(&data_dir.join("logs"));

    let store = match cli.config_dir {
        Some(dir) => ConfigStore::from_dir(dir),
        None => ConfigStore::from_default_location()?,
    };
    let config = store
        .load_or_init()
        .with_context(|| format!("failed to load {}", store.path().display()))?;
    info!(path = %store.path().display(), transport = ?config.transport, "config loaded");

    let outcome = match cli.command {
        Commands::Ask {
            question,
            session,
            client,
            timeout,
        } => commands::ask(&config, &question, session.as_deref(), client.into(), timeout).await,
        Commands::Sessions { query, from, size } => {
            commands::sessions(&config, query, from, size).await
        }
        Commands::History { session, size } => commands::history(&config, &session, size).await,
        Commands::Rename { session, title } => commands::rename(&config, &session, &title).await,
        Commands::Delete { session } => commands::delete(&config, &session).await,
    };
    if let Err(err) = &outcome {
        error!(error = %format!("{err:#}"), "command failed");
    }
    outcome
}

fn init_local_logger(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "coco-chat.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,core_orchestrator=debug,channel_transport=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(writer)
        .init();

    guard
}
