//! Configuration loading, validation, and management for toolweave.
//!
//! An [`OrchestratorConfig`] is built once (from TOML, from defaults, or by
//! hand) and passed to the orchestrator's constructor. Nothing here is
//! global; two orchestrators in one process can run with different settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Model and loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Retry policy around model calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Streaming pipeline settings
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Tool dispatch settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Sub-agent delegation settings
    #[serde(default)]
    pub delegation: DelegationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Name used in logs, traces and recursion contexts
    #[serde(default = "default_agent_name")]
    pub name: String,

    #[serde(default)]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Tool-executing rounds before the forced final call
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Messages seeded from memory at the start of a run
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Instruction appended for the forced final call
    #[serde(default = "default_final_instruction")]
    pub final_instruction: String,
}

fn default_agent_name() -> String {
    "assistant".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_iterations() -> u32 {
    2
}
fn default_history_limit() -> usize {
    50
}
fn default_final_instruction() -> String {
    "You have used all available tool rounds. Provide a final response now using the \
     information gathered so far. Do not request further tools."
        .into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            model: String::new(),
            temperature: default_temperature(),
            max_tokens: None,
            max_iterations: default_max_iterations(),
            system_prompt: None,
            history_limit: default_history_limit(),
            final_instruction: default_final_instruction(),
        }
    }
}

/// Bounded retries with exponential backoff and a ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based), capped at `max_backoff_ms`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let raw = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Bounded event queue size
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Hold back text from tool-using iterations and replay it before `message_stop`
    #[serde(default = "default_true")]
    pub buffer_intermediate_content: bool,
}

fn default_channel_capacity() -> usize {
    64
}
fn default_true() -> bool {
    true
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            buffer_intermediate_content: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Identical calls allowed before the repetition warning is attached
    #[serde(default = "default_repetition_threshold")]
    pub repetition_threshold: u32,

    /// Per-call execution timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_timeout_secs: Option<u64>,
}

fn default_repetition_threshold() -> u32 {
    3
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            repetition_threshold: default_repetition_threshold(),
            tool_timeout_secs: None,
        }
    }
}

impl ToolsConfig {
    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs.map(Duration::from_secs)
    }
}

/// How a sub-agent treats a caller deadline shorter than its own timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlinePolicy {
    /// Never outlive the caller's deadline
    Inherit,
    /// Replace a shorter caller deadline with the sub-agent's own timeout
    #[default]
    Extend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    #[serde(default = "default_delegation_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub deadline_policy: DeadlinePolicy,
}

fn default_delegation_timeout_secs() -> u64 {
    30 * 60
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_delegation_timeout_secs(),
            deadline_policy: DeadlinePolicy::default(),
        }
    }
}

impl DelegationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl OrchestratorConfig {
    /// Load configuration from the default path (~/.toolweave/config.toml),
    /// then apply environment overrides:
    /// - `TOOLWEAVE_MODEL`
    /// - `TOOLWEAVE_MAX_ITERATIONS`
    /// - `TOOLWEAVE_STREAM_BUFFERING` (`true`/`false`)
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content)
    }

    fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the environment in production).
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(model) = lookup("TOOLWEAVE_MODEL") {
            self.agent.model = model;
        }

        if let Some(raw) = lookup("TOOLWEAVE_MAX_ITERATIONS") {
            self.agent.max_iterations = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "TOOLWEAVE_MAX_ITERATIONS must be a positive integer, got '{raw}'"
                ))
            })?;
        }

        if let Some(raw) = lookup("TOOLWEAVE_STREAM_BUFFERING") {
            self.streaming.buffer_intermediate_content = match raw.trim() {
                "true" | "1" => true,
                "false" | "0" => false,
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "TOOLWEAVE_STREAM_BUFFERING must be true or false, got '{other}'"
                    )));
                }
            };
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".toolweave")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.temperature < 0.0 || self.agent.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "agent.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "retry.multiplier must be >= 1.0".into(),
            ));
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::ValidationError(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }

        if self.streaming.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "streaming.channel_capacity must be at least 1".into(),
            ));
        }

        if self.tools.repetition_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "tools.repetition_threshold must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
