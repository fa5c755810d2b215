//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.moltqq/config.json`) and environment.
//! Credentials and the allow-list can be supplied through the environment instead of the file.

use crate::gateway::{ClientOptions, ReconnectPolicy, DEFAULT_GATEWAY_URL};
use crate::routing::{is_allowed, AllowList};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway connection settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Who may talk to the bot.
    #[serde(default)]
    pub access: AccessConfig,

    /// Verbose logging (same as `--debug`).
    #[serde(default)]
    pub debug: bool,
}

/// Gateway URL, credentials, and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// WebSocket URL (default "ws://127.0.0.1:18789"). Overridden by MOLTBOT_GATEWAY_URL env.
    #[serde(default = "default_gateway_url")]
    pub url: String,

    /// Shared token for `connect.auth.token`. Overridden by MOLTBOT_TOKEN env.
    pub token: Option<String>,

    /// Password for `connect.auth.password`. Overridden by MOLTBOT_PASSWORD env.
    pub password: Option<String>,

    /// Client id announced to the gateway (default "gateway-client").
    #[serde(default = "default_client_name")]
    pub client_name: String,

    #[serde(default = "default_client_version")]
    pub client_version: String,

    /// Seconds to wait for a reply (default 60).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Event name the gateway uses to push messages to chat users (default "chat.push").
    #[serde(default = "default_push_event")]
    pub push_event: String,
}

/// Reconnect backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of each delay that may be shaved off at random (0 disables).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// Allow-list and what denied users see.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    /// User ids allowed to chat: "1,2" or [1, "2"]. Empty allows everyone.
    /// Overridden by MOLTBOT_ALLOWED_USERS env.
    #[serde(default)]
    pub allowed_users: AllowList,

    /// Reply for users outside the allow-list. Unset: no reply.
    pub deny_reply: Option<String>,
}

fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

fn default_client_name() -> String {
    "gateway-client".to_string()
}

fn default_client_version() -> String {
    "1.0.0".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_push_event() -> String {
    crate::bridge::DEFAULT_PUSH_EVENT.to_string()
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            token: None,
            password: None,
            client_name: default_client_name(),
            client_version: default_client_version(),
            timeout_secs: default_timeout_secs(),
            reconnect: ReconnectConfig::default(),
            push_event: default_push_event(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
            jitter: self.jitter.clamp(0.0, 1.0),
        }
    }
}

/// Trimmed, non-empty value of an env var.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the gateway URL: env MOLTBOT_GATEWAY_URL overrides config.
pub fn resolve_gateway_url(config: &Config) -> String {
    env_value("MOLTBOT_GATEWAY_URL")
        .or_else(|| non_empty(Some(&config.gateway.url)))
        .unwrap_or_else(default_gateway_url)
}

/// Resolve the gateway token: env MOLTBOT_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    env_value("MOLTBOT_TOKEN").or_else(|| non_empty(config.gateway.token.as_ref()))
}

/// Resolve the gateway password: env MOLTBOT_PASSWORD overrides config.
pub fn resolve_gateway_password(config: &Config) -> Option<String> {
    env_value("MOLTBOT_PASSWORD").or_else(|| non_empty(config.gateway.password.as_ref()))
}

/// Resolve the allow-list: env MOLTBOT_ALLOWED_USERS (comma-separated) overrides config.
pub fn resolve_allowed_users(config: &Config) -> AllowList {
    env_value("MOLTBOT_ALLOWED_USERS")
        .map(|s| AllowList::parse(&s))
        .unwrap_or_else(|| config.access.allowed_users.clone())
}

/// Whether `user_id` may talk to the gateway under the resolved allow-list.
pub fn user_admitted(config: &Config, user_id: &str) -> bool {
    is_allowed(user_id, &resolve_allowed_users(config))
}

/// Client options from config plus env overrides.
pub fn client_options(config: &Config) -> ClientOptions {
    ClientOptions {
        url: resolve_gateway_url(config),
        token: resolve_gateway_token(config),
        password: resolve_gateway_password(config),
        client_name: config.gateway.client_name.clone(),
        client_version: config.gateway.client_version.clone(),
        request_timeout: config.gateway.timeout(),
        reconnect: config.gateway.reconnect.policy(),
        ..ClientOptions::default()
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("MOLTQQ_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".moltqq").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, else the default path (or MOLTQQ_CONFIG_PATH).
/// Missing file => default config. Returns the config and the path that was used.
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
