//! Configuration file parser for ~/.config/tidings/config.toml.
//!
//! The config file is optional — a missing or empty file yields
//! `Config::default()` (no accounts, stock timings). The `[retry]` and
//! `[sync]` knobs are the only tunable parameters of the sync core.
use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use crate::account::{Account, AccountKind};
use crate::sync::retry::RetryPolicy;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All sections use `#[serde(default)]` so any subset of keys can be
/// specified. Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub retry: RetryConfig,
    pub accounts: Vec<AccountConfig>,
}

/// Debounce tuning for the two coordinator pipelines.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period in milliseconds: a burst of state changes must go
    /// this long without a new change before a pipeline acts on it.
    pub quiet_period_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: 2_000,
        }
    }
}

/// Retry/backoff knobs applied to every remote call.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first (minimum 1).
    pub attempts: u32,
    /// Time box for a single attempt, in seconds.
    pub attempt_timeout_secs: u64,
    /// Delay before the second attempt, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Ceiling for the grown backoff delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Multiplier applied to the backoff after each failed attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 2,
            attempt_timeout_secs: 10,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts.max(1),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// One `[[accounts]]` entry.
///
/// Custom Debug impl masks the password to prevent secret leakage in
/// logs, error messages, and debug output.
#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: AccountKind,
    /// Service root, e.g. `https://host/fever` or `https://host/greader`.
    /// Required for remote kinds, ignored for local.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<SecretString>,
}

impl AccountConfig {
    pub fn account(&self) -> Account {
        Account {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            kind: self.kind,
        }
    }
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        Ok(toml::from_str(&content)?)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.sync.quiet_period_ms)
    }

    /// Find an account by id, or the first configured one when no id is
    /// given.
    pub fn find_account(&self, id: Option<&str>) -> Option<&AccountConfig> {
        match id {
            Some(id) => self.accounts.iter().find(|a| a.id == id),
            None => self.accounts.first(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
