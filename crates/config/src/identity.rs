//! Read-shared view of the current server, assistant and turn settings.
//!
//! The orchestrator takes a fresh [`Identity`] snapshot at every send, so a
//! change made through one of the setters applies to the next turn and never
//! to a turn that is already in flight.

use std::time::Duration;

use core_types::{FeatureFlags, ServerConfig, effective_timeout};
use tokio::sync::watch;
use tracing::debug;

use crate::{AppConfig, AssistantProfile, FeatureToggles};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    pub server: Option<ServerConfig>,
    pub assistant: Option<AssistantProfile>,
    /// Toggles used when no assistant is selected.
    pub default_toggles: FeatureToggles,
    pub connection_timeout_secs: Option<u64>,
}

impl Identity {
    pub fn feature_flags(&self) -> FeatureFlags {
        match &self.assistant {
            Some(assistant) => assistant.toggles.to_flags(Some(&assistant.id)),
            None => self.default_toggles.to_flags(None),
        }
    }

    pub fn response_timeout(&self) -> Duration {
        effective_timeout(self.connection_timeout_secs)
    }
}

#[derive(Clone)]
pub struct IdentityContext {
    tx: watch::Sender<Identity>,
}

impl IdentityContext {
    pub fn new(identity: Identity) -> Self {
        let (tx, _rx) = watch::channel(identity);
        Self { tx }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(Identity {
            server: config.current_server().cloned(),
            assistant: config.current_assistant().cloned(),
            default_toggles: FeatureToggles::default(),
            connection_timeout_secs: Some(config.connection_timeout_secs),
        })
    }

    pub fn snapshot(&self) -> Identity {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Identity> {
        self.tx.subscribe()
    }

    pub fn set_current_server(&self, server: Option<ServerConfig>) {
        debug!(server_id = ?server.as_ref().map(|s| s.id.as_str()), "current server changed");
        self.tx.send_modify(|identity| identity.server = server);
    }

    pub fn set_current_assistant(&self, assistant: Option<AssistantProfile>) {
        debug!(assistant_id = ?assistant.as_ref().map(|a| a.id.as_str()), "current assistant changed");
        self.tx.send_modify(|identity| identity.assistant = assistant);
    }

    /// Replaces the toggles of the current assistant, or the defaults when
    /// none is selected.
    pub fn set_features(&self, toggles: FeatureToggles) {
        self.tx.send_modify(|identity| match identity.assistant.as_mut() {
            Some(assistant) => assistant.toggles = toggles,
            None => identity.default_toggles = toggles,
        });
    }

    pub fn set_connection_timeout(&self, secs: Option<u64>) {
        self.tx
            .send_modify(|identity| identity.connection_timeout_secs = secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant() -> AssistantProfile {
        AssistantProfile {
            id: "a1".to_string(),
            name: "Researcher".to_string(),
            toggles: FeatureToggles {
                search: true,
                mcp_server_ids: vec!["tools-1".to_string()],
                ..FeatureToggles::default()
            },
        }
    }

    #[test]
    fn flags_follow_current_assistant() {
        let context = IdentityContext::new(Identity::default());
        assert_eq!(context.snapshot().feature_flags(), FeatureFlags::default());

        context.set_current_assistant(Some(assistant()));
        let flags = context.snapshot().feature_flags();
        assert!(flags.search);
        assert_eq!(flags.assistant_id.as_deref(), Some("a1"));
        assert_eq!(flags.mcp_server_ids, vec!["tools-1".to_string()]);
    }

    #[test]
    fn set_features_updates_selected_assistant_only() {
        let context = IdentityContext::new(Identity::default());
        context.set_current_assistant(Some(assistant()));
        context.set_features(FeatureToggles {
            deep_thinking: true,
            ..FeatureToggles::default()
        });

        let identity = context.snapshot();
        assert!(identity.feature_flags().deep_thinking);
        assert!(!identity.feature_flags().search);
        assert_eq!(identity.default_toggles, FeatureToggles::default());
    }

    #[tokio::test]
    async fn subscribers_observe_setter_calls() {
        let context = IdentityContext::from_config(&AppConfig::default());
        let mut rx = context.subscribe();
        assert_eq!(rx.borrow().response_timeout(), Duration::from_secs(120));

        context.set_connection_timeout(Some(2));
        rx.changed().await.expect("changed");
        assert_eq!(rx.borrow().response_timeout(), Duration::from_secs(2));

        context.set_connection_timeout(Some(0));
        assert_eq!(
            context.snapshot().response_timeout(),
            Duration::from_secs(120)
        );
    }
}
