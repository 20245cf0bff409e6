//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RESPLEX_CONFIG or explicitly)
//! 3. Environment variables

use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default read size hint (16 KiB).
pub const DEFAULT_READ_HINT: usize = 16 * 1024;

/// Minimum read size hint (1 KiB).
pub const MIN_READ_HINT: usize = 1024;

/// Maximum read size hint (1 MiB).
pub const MAX_READ_HINT: usize = 1024 * 1024;

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server endpoints, `host:port` or `unix:/path/to/socket`.
    pub endpoints: Vec<String>,
    /// Prefix prepended to every key argument.
    pub key_prefix: Option<String>,
    pub timeouts: TimeoutConfig,
    /// Command renames and disabled commands.
    pub commands: CommandMap,
    pub retry: RetryConfig,
    pub buffers: BufferConfig,
    pub reconnect: ReconnectConfig,
    /// Capacity of the push broadcast channel.
    pub push_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![format!("127.0.0.1:{}", resplex_protocol::DEFAULT_PORT)],
            key_prefix: None,
            timeouts: TimeoutConfig::default(),
            commands: CommandMap::default(),
            retry: RetryConfig::default(),
            buffers: BufferConfig::default(),
            reconnect: ReconnectConfig::default(),
            push_channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
            ..Self::default()
        }
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RESPLEX_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(endpoints) = std::env::var("RESPLEX_ENDPOINTS") {
            let parsed: Vec<String> = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
            if !parsed.is_empty() {
                self.endpoints = parsed;
            }
        }

        if let Ok(prefix) = std::env::var("RESPLEX_KEY_PREFIX") {
            self.key_prefix = (!prefix.is_empty()).then_some(prefix);
        }

        self.timeouts.apply_env_overrides();
        self.retry.apply_env_overrides();
    }

    /// Checks values that have no sensible fallback.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one endpoint is required".to_string(),
            ));
        }
        if self.buffers.segment_size == 0 {
            return Err(ConfigError::ValidationError(
                "buffers.segment_size must be non-zero".to_string(),
            ));
        }
        if self.push_channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "push_channel_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.sync_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_async_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.async_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry.policy = policy;
        self
    }

    pub fn with_retry_queue_length(mut self, max: usize) -> Self {
        self.retry.max_queue_length = max;
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_segment_size(mut self, size: usize) -> Self {
        self.buffers.segment_size = size.max(1);
        self
    }

    pub fn with_read_hint(mut self, size: usize) -> Self {
        self.buffers.read_hint = size.clamp(MIN_READ_HINT, MAX_READ_HINT);
        self
    }

    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect.enabled = enabled;
        self
    }

    pub fn with_renamed_command(
        mut self,
        command: impl Into<String>,
        renamed: impl Into<String>,
    ) -> Self {
        self.commands
            .renamed
            .insert(command.into().to_ascii_uppercase(), renamed.into());
        self
    }

    pub fn with_disabled_command(mut self, command: impl Into<String>) -> Self {
        self.commands
            .disabled
            .insert(command.into().to_ascii_uppercase());
        self
    }
}

/// Per-call timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_timeout_ms: u64,
    /// Used by blocking waits.
    pub sync_timeout_ms: u64,
    /// Used by `Client::execute`.
    pub async_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            sync_timeout_ms: 5_000,
            async_timeout_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout_ms)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_u64("RESPLEX_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("RESPLEX_SYNC_TIMEOUT_MS") {
            self.sync_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("RESPLEX_ASYNC_TIMEOUT_MS") {
            self.async_timeout_ms = ms;
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

/// Command renames and disabled commands.
///
/// Keys are upper-case command names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandMap {
    pub renamed: HashMap<String, String>,
    pub disabled: HashSet<String>,
}

impl CommandMap {
    /// Wire name of `command`.
    pub fn resolve<'a>(&'a self, command: &'a str) -> Result<Cow<'a, str>, ClientError> {
        if self.renamed.is_empty() && self.disabled.is_empty() {
            return Ok(Cow::Borrowed(command));
        }
        let key = command.to_ascii_uppercase();
        if self.disabled.contains(&key) {
            return Err(ClientError::CommandDisabled(command.to_string()));
        }
        match self.renamed.get(&key) {
            Some(renamed) if renamed.is_empty() => {
                Err(ClientError::CommandDisabled(command.to_string()))
            }
            Some(renamed) => Ok(Cow::Borrowed(renamed.as_str())),
            None => Ok(Cow::Borrowed(command)),
        }
    }
}

/// When a failed operation may be replayed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Only operations that never reached the transport.
    #[default]
    IfNotSent,
    /// Any retry-eligible operation, sent or not.
    Always,
}

impl std::str::FromStr for RetryPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "if_not_sent" | "ifnotsent" => Ok(RetryPolicy::IfNotSent),
            "always" => Ok(RetryPolicy::Always),
            other => Err(ConfigError::ValidationError(format!(
                "unknown retry policy '{}'",
                other
            ))),
        }
    }
}

/// Retry queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub policy: RetryPolicy,
    /// Queue bound; 0 disables retries.
    pub max_queue_length: usize,
    /// Entries older than this (from their first send) fail with a timeout.
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::IfNotSent,
            max_queue_length: 1024,
            timeout_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(policy) = std::env::var("RESPLEX_RETRY_POLICY") {
            match policy.parse() {
                Ok(parsed) => self.policy = parsed,
                Err(e) => tracing::warn!("Ignoring RESPLEX_RETRY_POLICY: {}", e),
            }
        }
    }
}

/// Buffer sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Capacity of pooled segments.
    pub segment_size: usize,
    /// Bytes requested from the arena per socket read.
    pub read_hint: usize,
    /// Idle segments kept by the pool.
    pub max_idle_segments: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            segment_size: resplex_protocol::DEFAULT_SEGMENT_SIZE,
            read_hint: DEFAULT_READ_HINT,
            max_idle_segments: resplex_protocol::arena::DEFAULT_MAX_IDLE_SEGMENTS,
        }
    }
}

/// Reconnection backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (0-based), doubling up to the maximum.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms.max(self.base_delay_ms));
        Duration::from_millis(ms)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    IoError(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    ParseError(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}
