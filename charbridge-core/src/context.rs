// ABOUTME: Process-wide state built once at startup and handed to every bot
// ABOUTME: Holds the validated config, the global enable switch, and the shutdown token

use crate::config::{BotConfig, Config};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared application context. Cloning is cheap; clones see the same flag
/// and token.
#[derive(Debug, Clone)]
pub struct AppContext {
    config: Arc<Config>,
    enabled: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            enabled: Arc::new(AtomicBool::new(true)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bot(&self, name: &str) -> Option<&BotConfig> {
        self.config.bot(name)
    }

    /// Global switch; when off every bot ignores submissions
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "Global bridge switch changed");
    }

    /// Cancelled when the process is shutting down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
