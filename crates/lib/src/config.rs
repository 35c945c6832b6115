//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.forwarder/config.json`) and environment, then
//! validated into an immutable [`Settings`] that the forwarder runs with.

use crate::delivery::RetryPolicy;
use crate::error::Error;
use crate::forwarder::ForwarderOptions;
use crate::routing::{ForwardMode, ForwardTarget, Router, TargetFilter};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Source chats to forward from: chat ids or @usernames.
    #[serde(default)]
    pub sources: Vec<String>,

    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub status: StatusConfig,

    /// Instance lock file (default: database path + ".lock"). Overridden by LOCK_FILE env.
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
}

/// SQLite database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Database file. Relative paths are resolved against the config file's directory.
    /// Overridden by DB_PATH env.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            pool_size: default_pool_size(),
        }
    }
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    /// Bot token from BotFather. Overridden by BOT_TOKEN or TELEGRAM_BOT_TOKEN env.
    #[serde(default)]
    pub bot_token: Option<String>,

    /// Bot API base URL (default https://api.telegram.org). Overridden by TELEGRAM_API_BASE env.
    #[serde(default)]
    pub api_base: Option<String>,

    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Chat that receives failure notices. Overridden by OWNER_ID env.
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: None,
            poll_timeout_secs: default_poll_timeout_secs(),
            owner_id: None,
        }
    }
}

/// One forward target as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    /// Stable name; keys delivery records, so renaming a target re-sends nothing but orphans its history.
    pub id: String,
    pub chat_id: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub mode: ForwardMode,
    #[serde(default)]
    pub filter: TargetFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            max_pending: default_max_pending(),
        }
    }
}

/// Status HTTP server. Disabled unless a port is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
    #[serde(default = "default_status_bind")]
    pub bind: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            bind: default_status_bind(),
            port: None,
        }
    }
}

fn default_pool_size() -> u32 {
    5
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_ms() -> u64 {
    500
}

fn default_max_ms() -> u64 {
    60_000
}

fn default_jitter_ms() -> u64 {
    250
}

fn default_concurrency() -> usize {
    4
}

fn default_attempt_timeout_secs() -> u64 {
    30
}

fn default_drain_timeout_secs() -> u64 {
    10
}

fn default_max_pending() -> usize {
    256
}

fn default_status_bind() -> String {
    "127.0.0.1".to_string()
}

/// Validated runtime settings. Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub pool_size: u32,
    pub lock_path: PathBuf,
    pub bot_token: String,
    pub api_base: String,
    pub poll_timeout_secs: u64,
    pub owner_chat: Option<String>,
    pub sources: Vec<String>,
    pub targets: Vec<ForwardTarget>,
    pub retry: RetryPolicy,
    pub concurrency: usize,
    pub attempt_timeout: Duration,
    pub drain_timeout: Duration,
    pub max_pending: usize,
    /// `bind:port` of the status server, when enabled.
    pub status_addr: Option<String>,
}

impl Settings {
    /// Apply environment overrides to `config` and validate the result.
    pub fn from_config(config: &Config, config_path: &Path) -> Result<Self, Error> {
        Self::resolve(config, config_path, &env_var)
    }

    fn resolve(
        config: &Config,
        config_path: &Path,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, Error> {
        let bot_token = env("BOT_TOKEN")
            .or_else(|| env("TELEGRAM_BOT_TOKEN"))
            .or_else(|| trimmed(config.telegram.bot_token.as_deref()))
            .ok_or_else(|| {
                Error::Configuration(
                    "telegram bot token not configured (set telegram.botToken or BOT_TOKEN)".to_string(),
                )
            })?;

        let mut sources: Vec<String> = config
            .sources
            .iter()
            .filter_map(|s| trimmed(Some(s.as_str())))
            .collect();
        if let Some(extra) = env("SOURCE_CHANNEL") {
            sources.extend(extra.split(',').filter_map(|s| trimmed(Some(s))));
        }
        if sources.is_empty() {
            return Err(Error::Configuration(
                "no source channels configured (set sources or SOURCE_CHANNEL)".to_string(),
            ));
        }

        if config.targets.is_empty() {
            return Err(Error::Configuration("no forward targets configured".to_string()));
        }
        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(config.targets.len());
        for t in &config.targets {
            let id = t.id.trim();
            if id.is_empty() {
                return Err(Error::Configuration("target with empty id".to_string()));
            }
            if !seen.insert(id.to_string()) {
                return Err(Error::Configuration(format!("duplicate target id {:?}", id)));
            }
            let chat_id = t.chat_id.trim();
            if chat_id.is_empty() {
                return Err(Error::Configuration(format!("target {:?} has no chatId", id)));
            }
            targets.push(ForwardTarget {
                id: id.to_string(),
                chat_id: chat_id.to_string(),
                sources: t.sources.clone(),
                mode: t.mode,
                filter: t.filter.clone(),
            });
        }

        let r = &config.retry;
        if r.max_attempts == 0 {
            return Err(Error::Configuration("retry.maxAttempts must be at least 1".to_string()));
        }
        let d = &config.delivery;
        if d.concurrency == 0 || d.max_pending == 0 {
            return Err(Error::Configuration(
                "delivery.concurrency and delivery.maxPending must be at least 1".to_string(),
            ));
        }

        let pool_size = match env("DB_POOLSIZE") {
            Some(v) => v
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| Error::Configuration(format!("invalid DB_POOLSIZE {:?}", v)))?,
            None => config.database.pool_size.max(1),
        };
        let db_path = resolve_db_path_with(config, config_path, env);
        let lock_path = env("LOCK_FILE")
            .map(PathBuf::from)
            .or_else(|| config.lock_file.clone())
            .unwrap_or_else(|| default_lock_path(&db_path));

        let status_addr = config.status.port.map(|port| {
            let bind = config.status.bind.trim();
            if !is_loopback_bind(bind) {
                log::warn!("status server bound to non-loopback address {}", bind);
            }
            format!("{}:{}", bind, port)
        });

        Ok(Self {
            db_path,
            pool_size,
            lock_path,
            bot_token,
            api_base: env("TELEGRAM_API_BASE")
                .or_else(|| trimmed(config.telegram.api_base.as_deref()))
                .unwrap_or_else(|| crate::channels::TELEGRAM_API_BASE.to_string()),
            poll_timeout_secs: config.telegram.poll_timeout_secs,
            owner_chat: env("OWNER_ID").or_else(|| trimmed(config.telegram.owner_id.as_deref())),
            sources,
            targets,
            retry: RetryPolicy {
                max_attempts: r.max_attempts,
                base: Duration::from_millis(r.base_ms),
                max: Duration::from_millis(r.max_ms),
                jitter: Duration::from_millis(r.jitter_ms),
            },
            concurrency: d.concurrency,
            attempt_timeout: Duration::from_secs(d.attempt_timeout_secs.max(1)),
            drain_timeout: Duration::from_secs(d.drain_timeout_secs),
            max_pending: d.max_pending,
            status_addr,
        })
    }

    pub fn router(&self) -> Router {
        Router::new(self.sources.clone(), self.targets.clone())
    }

    pub fn forwarder_options(&self) -> ForwarderOptions {
        ForwarderOptions {
            retry: self.retry.clone(),
            concurrency: self.concurrency,
            attempt_timeout: self.attempt_timeout,
            drain_timeout: self.drain_timeout,
            max_pending: self.max_pending,
            owner_chat: self.owner_chat.clone(),
            ..ForwarderOptions::new(self.router())
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| trimmed(Some(s.as_str())))
}

fn trimmed(s: Option<&str>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve the database path: DB_PATH env, then `database.path`, then `$DATA_DIR/forwarder.db`,
/// then `forwarder.db` next to the config file.
pub fn resolve_db_path(config: &Config, config_path: &Path) -> PathBuf {
    resolve_db_path_with(config, config_path, &env_var)
}

fn resolve_db_path_with(
    config: &Config,
    config_path: &Path,
    env: &dyn Fn(&str) -> Option<String>,
) -> PathBuf {
    if let Some(p) = env("DB_PATH") {
        return PathBuf::from(p);
    }
    let config_parent = config_dir(config_path);
    match &config.database.path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_parent.join(p)
            }
        }
        _ => match env("DATA_DIR") {
            Some(dir) => PathBuf::from(dir).join("forwarder.db"),
            None => config_parent.join("forwarder.db"),
        },
    }
}

fn default_lock_path(db_path: &Path) -> PathBuf {
    let mut s = db_path.as_os_str().to_os_string();
    s.push(".lock");
    PathBuf::from(s)
}

fn config_dir(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("FORWARDER_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".forwarder").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, the default path or FORWARDER_CONFIG_PATH. Missing file =>
/// default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
