use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use core_types::{DEFAULT_CONNECTION_TIMEOUT_SECS, FeatureFlags, ServerConfig, ServerId};
use serde::{Deserialize, Serialize};
use tracing::warn;

mod identity;

pub use identity::{Identity, IdentityContext};

pub const CURRENT_SCHEMA_VERSION: u32 = 2;
pub const DEFAULT_SERVER_ID: &str = "default_coco_server";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Native,
    Proxied,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SocketConfig {
    #[serde(default = "default_reconnect_limit")]
    pub reconnect_limit: u32,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl SocketConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            reconnect_limit: default_reconnect_limit(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

const fn default_reconnect_limit() -> u32 {
    3
}

const fn default_reconnect_interval_ms() -> u64 {
    3000
}

/// Per-assistant switches forwarded with every turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FeatureToggles {
    #[serde(default)]
    pub search: bool,
    #[serde(default)]
    pub deep_thinking: bool,
    #[serde(default)]
    pub mcp: bool,
    #[serde(default)]
    pub datasource_ids: Vec<String>,
    #[serde(default)]
    pub mcp_server_ids: Vec<String>,
}

impl FeatureToggles {
    pub fn to_flags(&self, assistant_id: Option<&str>) -> FeatureFlags {
        FeatureFlags {
            search: self.search,
            deep_thinking: self.deep_thinking,
            mcp: self.mcp,
            datasource_ids: self.datasource_ids.clone(),
            mcp_server_ids: self.mcp_server_ids.clone(),
            assistant_id: assistant_id.map(ToString::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssistantProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub toggles: FeatureToggles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub schema_version: u32,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_server_id: Option<ServerId>,
    #[serde(default)]
    pub assistants: Vec<AssistantProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_assistant_id: Option<String>,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub allow_self_signature: bool,
}

const fn default_connection_timeout() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT_SECS
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            servers: vec![default_server()],
            current_server_id: Some(DEFAULT_SERVER_ID.to_string()),
            assistants: Vec::new(),
            current_assistant_id: None,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            transport: TransportKind::Native,
            socket: SocketConfig::default(),
            allow_self_signature: false,
        }
    }
}

impl AppConfig {
    pub fn server(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| server.id == id)
    }

    pub fn current_server(&self) -> Option<&ServerConfig> {
        self.current_server_id
            .as_deref()
            .and_then(|id| self.server(id))
            .filter(|server| server.enabled)
    }

    pub fn current_assistant(&self) -> Option<&AssistantProfile> {
        let id = self.current_assistant_id.as_deref()?;
        self.assistants.iter().find(|assistant| assistant.id == id)
    }
}

fn default_server() -> ServerConfig {
    ServerConfig {
        id: DEFAULT_SERVER_ID.to_string(),
        name: "Coco Cloud".to_string(),
        endpoint: "https://coco.infini.cloud".to_string(),
        enabled: true,
        api_token: None,
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("config.json"),
        }
    }

    pub fn from_default_location() -> Result<Self> {
        let mut dir = dirs::config_dir().context("platform has no config directory")?;
        dir.push("coco-chat");
        Ok(Self::from_dir(dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            let config = AppConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut config: AppConfig = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not a valid chat config", self.path.display()))?;
        self.migrate(&mut config);
        self.save(&config)?;
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let text = serde_json::to_string_pretty(config).context("failed to encode chat config")?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn migrate(&self, config: &mut AppConfig) {
        if config.schema_version >= CURRENT_SCHEMA_VERSION {
            return;
        }

        warn!(
            from = config.schema_version,
            to = CURRENT_SCHEMA_VERSION,
            "upgrading chat config"
        );

        if config.servers.is_empty() {
            config.servers = vec![default_server()];
        }
        if config.current_server_id.is_none() {
            config.current_server_id = config.servers.first().map(|server| server.id.clone());
        }
        if config.connection_timeout_secs == 0 {
            config.connection_timeout_secs = DEFAULT_CONNECTION_TIMEOUT_SECS;
        }
        config.schema_version = CURRENT_SCHEMA_VERSION;
    }
}
