//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Session cookies come from KL_COOKIE or `pool.cookies_file`, never from
//! the TOML itself, so the config file can be committed without secrets.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use upstream::ChatMessage;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Absent section means no reactivation collaborator
    #[serde(default)]
    pub reactivation: Option<ReactivationConfig>,
    #[serde(default)]
    pub request: RequestConfig,
}

/// Inbound HTTP settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Path prefix for the /v1 routes, e.g. "/kilo"
    #[serde(default)]
    pub route_prefix: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Outbound connection to the Kilo upstream
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_rate_limit_lock")]
    pub rate_limit_lock_secs: u64,
    /// File holding cookies separated by commas or newlines
    #[serde(default)]
    pub cookies_file: Option<PathBuf>,
    #[serde(skip)]
    pub cookies: Vec<Secret<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ReactivationConfig {
    pub url: String,
}

/// Request shaping applied before relaying
#[derive(Debug, Deserialize)]
pub struct RequestConfig {
    #[serde(default)]
    pub pre_messages_json: Option<String>,
    #[serde(skip)]
    pub pre_messages: Vec<ChatMessage>,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
}

fn default_max_connections() -> usize {
    1000
}

fn default_base_url() -> String {
    "https://kilocode.ai".to_string()
}

fn default_timeout() -> u64 {
    600
}

fn default_rate_limit_lock() -> u64 {
    600
}

fn default_max_tokens() -> u32 {
    8000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            proxy_url: None,
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            rate_limit_lock_secs: default_rate_limit_lock(),
            cookies_file: None,
            cookies: Vec::new(),
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            pre_messages_json: None,
            pre_messages: Vec::new(),
            default_max_tokens: default_max_tokens(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PoolConfig {
    pub fn rate_limit_lock(&self) -> Duration {
        Duration::from_secs(self.rate_limit_lock_secs)
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn non_blank_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Split a cookie list on commas and newlines, dropping blanks.
fn split_cookies(raw: &str) -> Vec<Secret<String>> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| Secret::new(c.to_string()))
        .collect()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Cookie resolution order:
    /// 1. KL_COOKIE env var
    /// 2. cookies_file path from config
    ///
    /// PROXY_URL and PRE_MESSAGES_JSON override their TOML counterparts.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !is_http_url(&config.upstream.base_url) {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.upstream.base_url
            )));
        }
        config.upstream.base_url = config.upstream.base_url.trim_end_matches('/').to_string();

        if config.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.pool.rate_limit_lock_secs == 0 {
            return Err(common::Error::Config(
                "rate_limit_lock_secs must be greater than 0".into(),
            ));
        }

        if config.request.default_max_tokens == 0 {
            return Err(common::Error::Config(
                "default_max_tokens must be greater than 0".into(),
            ));
        }

        let prefix = config.server.route_prefix.trim_end_matches('/');
        if !prefix.is_empty() && !prefix.starts_with('/') {
            return Err(common::Error::Config(format!(
                "route_prefix must start with '/', got: {}",
                config.server.route_prefix
            )));
        }
        config.server.route_prefix = prefix.to_string();

        if let Some(ref reactivation) = config.reactivation {
            if !is_http_url(&reactivation.url) {
                return Err(common::Error::Config(format!(
                    "reactivation url must start with http:// or https://, got: {}",
                    reactivation.url
                )));
            }
        }

        if let Some(proxy) = non_blank_env("PROXY_URL") {
            config.upstream.proxy_url = Some(proxy);
        }

        if let Some(json) = non_blank_env("PRE_MESSAGES_JSON") {
            config.request.pre_messages_json = Some(json);
        }
        if let Some(ref json) = config.request.pre_messages_json {
            config.request.pre_messages = upstream::openai::parse_pre_messages(json)
                .map_err(|e| common::Error::Config(format!("invalid pre_messages_json: {e}")))?;
        }

        // Env var takes precedence over file
        if let Ok(cookies) = std::env::var("KL_COOKIE") {
            config.pool.cookies = split_cookies(&cookies);
        } else if let Some(ref cookies_file) = config.pool.cookies_file {
            let cookies = std::fs::read_to_string(cookies_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read cookies_file {}: {e}",
                    cookies_file.display()
                ))
            })?;
            config.pool.cookies = split_cookies(&cookies);
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("kilo-gateway.toml")
    }
}
