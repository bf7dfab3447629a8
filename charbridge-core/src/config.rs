// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates required fields and provides sensible defaults for optional ones
use crate::linger::Dropoff;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "charbridge.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bots: Vec<BotConfig>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub lingering: LingeringConfig,
    #[serde(default)]
    pub templates: TemplateConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

/// One bot identity: a chat account speaking for one character
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub name: String,
    pub character_id: String,
    /// Ask the backend for the character's greeting when a surface gets a new session
    #[serde(default = "default_true")]
    pub greeting_on_new_session: bool,
    /// Surface keys (e.g. "server-123") where bot authors still get mentioned
    #[serde(default)]
    pub respond_to_bots: Vec<String>,
}

impl BotConfig {
    pub fn new(name: impl Into<String>, character_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            character_id: character_id.into(),
            greeting_on_new_session: true,
            respond_to_bots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Delivery attempts per queued message (only auth expiry consumes retries)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// [min, max] seconds of random delay before each delivery
    #[serde(default = "default_typing_delay")]
    pub typing_delay_secs: [f64; 2],
    #[serde(default = "default_true")]
    pub mention_author: bool,
    /// Posted instead of a reply the backend's moderation filtered
    #[serde(default = "default_filtered_message")]
    pub filtered_message: String,
    /// Shown in place of the previous reply while a retry is generated
    #[serde(default = "default_retry_placeholder")]
    pub retry_placeholder: String,
    #[serde(default = "default_max_reply_chars")]
    pub max_reply_chars: usize,
    #[serde(default = "default_diagnostic_title")]
    pub diagnostic_title: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            typing_delay_secs: default_typing_delay(),
            mention_author: true,
            filtered_message: default_filtered_message(),
            retry_placeholder: default_retry_placeholder(),
            max_reply_chars: default_max_reply_chars(),
            diagnostic_title: default_diagnostic_title(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LingeringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Continuation chance right after the triggering message (0-100)
    #[serde(default = "default_linger_chance")]
    pub chance: f64,
    /// Seconds after which the chance reaches zero
    #[serde(default = "default_linger_timeout")]
    pub timeout_secs: f64,
    /// Curve exponent for the plateau and slide dropoffs
    #[serde(default = "default_exponent_curve")]
    pub exponent_curve: f64,
    #[serde(default)]
    pub dropoff: Dropoff,
}

impl LingeringConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

impl Default for LingeringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chance: default_linger_chance(),
            timeout_secs: default_linger_timeout(),
            exponent_curve: default_exponent_curve(),
            dropoff: Dropoff::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Used for guild surfaces. Placeholders: {name}, {display_name}, {global_name}, {message}
    #[serde(default = "default_message_format")]
    pub message_format: String,
    /// Used for private surfaces
    #[serde(default = "default_dm_message_format")]
    pub dm_message_format: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            message_format: default_message_format(),
            dm_message_format: default_dm_message_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Seconds to wait before repeating a call whose response could not be decoded
    #[serde(default = "default_backoff_secs")]
    pub malformed_backoff_secs: u64,
}

impl BackendConfig {
    pub fn malformed_backoff(&self) -> Duration {
        Duration::from_secs(self.malformed_backoff_secs)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            malformed_backoff_secs: default_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_path")]
    pub path: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            path: default_workspace_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_typing_delay() -> [f64; 2] {
    [0.1, 0.2]
}

fn default_filtered_message() -> String {
    "[filtered]".to_string()
}

fn default_retry_placeholder() -> String {
    "...".to_string()
}

fn default_max_reply_chars() -> usize {
    2000
}

fn default_diagnostic_title() -> String {
    "Error occurred".to_string()
}

fn default_linger_chance() -> f64 {
    100.0
}

fn default_linger_timeout() -> f64 {
    10.0
}

fn default_exponent_curve() -> f64 {
    4.0
}

fn default_message_format() -> String {
    "{name}: {message}".to_string()
}

fn default_dm_message_format() -> String {
    "{message}".to_string()
}

fn default_backoff_secs() -> u64 {
    30
}

fn default_workspace_path() -> String {
    "./workspace".to_string()
}

impl Config {
    /// Config with default sections for the given bots
    pub fn new(bots: Vec<BotConfig>) -> Self {
        Self {
            bots,
            dispatch: DispatchConfig::default(),
            lingering: LingeringConfig::default(),
            templates: TemplateConfig::default(),
            backend: BackendConfig::default(),
            workspace: WorkspaceConfig::default(),
        }
    }

    /// Load configuration from a TOML file with environment variable overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("CHARBRIDGE_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE)),
        };

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str::<Config>(content).context("Invalid configuration")
    }

    /// Override selected fields from environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("CHARBRIDGE_WORKSPACE") {
            self.workspace.path = val;
        }
        if let Ok(val) = std::env::var("CHARBRIDGE_BACKOFF_SECS") {
            self.backend.malformed_backoff_secs = val.parse().with_context(|| {
                format!("CHARBRIDGE_BACKOFF_SECS must be a whole number of seconds, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("CHARBRIDGE_LINGER_TIMEOUT") {
            self.lingering.timeout_secs = val.parse().with_context(|| {
                format!("CHARBRIDGE_LINGER_TIMEOUT must be a number of seconds, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("CHARBRIDGE_LINGER_DROPOFF") {
            self.lingering.dropoff = val.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.bots.is_empty() {
            anyhow::bail!("At least one [[bots]] entry is required");
        }

        let mut names = HashSet::new();
        for bot in &self.bots {
            if bot.name.trim().is_empty() {
                anyhow::bail!("bots.name must not be empty");
            }
            if bot.character_id.trim().is_empty() {
                anyhow::bail!("bots.character_id is required for bot '{}'", bot.name);
            }
            if !names.insert(bot.name.as_str()) {
                anyhow::bail!("Duplicate bot name: {}", bot.name);
            }
        }

        if self.dispatch.max_attempts == 0 {
            anyhow::bail!("dispatch.max_attempts must be at least 1");
        }
        let [min_delay, max_delay] = self.dispatch.typing_delay_secs;
        let finite = min_delay.is_finite() && max_delay.is_finite();
        if !finite || min_delay < 0.0 || max_delay < min_delay {
            anyhow::bail!(
                "dispatch.typing_delay_secs must be [min, max] with 0 <= min <= max, got [{}, {}]",
                min_delay,
                max_delay
            );
        }

        let linger = &self.lingering;
        if !(linger.timeout_secs > 0.0 && linger.timeout_secs.is_finite()) {
            anyhow::bail!("lingering.timeout_secs must be a positive number, got {}", linger.timeout_secs);
        }
        if !(0.0..=100.0).contains(&linger.chance) {
            anyhow::bail!("lingering.chance must be between 0 and 100, got {}", linger.chance);
        }
        if !(linger.exponent_curve > 0.0 && linger.exponent_curve.is_finite()) {
            anyhow::bail!("lingering.exponent_curve must be a positive number");
        }

        Ok(())
    }

    pub fn bot(&self, name: &str) -> Option<&BotConfig> {
        self.bots.iter().find(|b| b.name == name)
    }

    /// Directory holding one bot's persisted state
    pub fn bot_data_dir(&self, bot_name: &str) -> PathBuf {
        Path::new(&self.workspace.path).join(bot_name)
    }
}
