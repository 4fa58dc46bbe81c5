//! Proxy configuration types.
//!
//! Configuration is read from the environment (the deployment contract) and
//! can be overridden field by field by the CLI. All knobs have defaults
//! except the API key pool, which the server validates at startup.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8091";

/// The one origin hostname this proxy intercepts by default.
pub const DEFAULT_INTERCEPT_HOST: &str = "generativelanguage.googleapis.com";

/// Development fallback for the sealed-token secret. Deployments should set
/// `TOKEN_SECRET`; clients must share the same value to mint envelopes.
const DEFAULT_TOKEN_SECRET: &str = "d41d8cd98f00b204e9800998ecf8427e12345678";

/// Where the client credential is presented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// `x-goog-api-key` request header (default)
    #[default]
    Header,
    /// `auth_key` URL query parameter
    Query,
}

impl FromStr for KeySource {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "header" => Ok(KeySource::Header),
            "query" => Ok(KeySource::Query),
            other => Err(ProxyError::Config(format!(
                "AUTH_KEY_SOURCE must be 'header' or 'query', got '{}'",
                other
            ))),
        }
    }
}

/// Configuration for the proxy server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listen address (default: 0.0.0.0:8091)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Ordered upstream API credential pool. Must be non-empty to start.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// The origin hostname to TLS-intercept. Everything else is tunneled.
    #[serde(default = "default_intercept_host")]
    pub intercept_host: String,

    /// Optional upstream HTTP CONNECT proxy URL for egress.
    #[serde(default)]
    pub upstream_proxy: Option<String>,

    /// Directory holding the root CA material.
    #[serde(default = "default_ca_dir")]
    pub ca_dir: PathBuf,

    /// Secret for the sealed-token day keys.
    #[serde(default = "default_token_secret")]
    pub token_secret: String,

    /// Defense subsystem knobs.
    #[serde(default)]
    pub defense: DefenseConfig,

    /// Authorization service settings.
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            api_keys: Vec::new(),
            intercept_host: default_intercept_host(),
            upstream_proxy: None,
            ca_dir: default_ca_dir(),
            token_secret: default_token_secret(),
            defense: DefenseConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    // The literal is valid; parse cannot fail.
    DEFAULT_LISTEN_ADDR.parse().unwrap_or_else(|_| {
        SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 8091)
    })
}

fn default_intercept_host() -> String {
    DEFAULT_INTERCEPT_HOST.to_string()
}

fn default_ca_dir() -> PathBuf {
    PathBuf::from(".goproxy-ca")
}

fn default_token_secret() -> String {
    DEFAULT_TOKEN_SECRET.to_string()
}

/// Knobs for the rate limiter, domain blocklist, and log throttle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefenseConfig {
    /// Rate limiter toggle
    #[serde(default = "default_true")]
    pub enable_rate_limit: bool,
    /// Window length in seconds
    #[serde(default = "default_rate_window")]
    pub rate_limit_window: u64,
    /// Maximum requests per window
    #[serde(default = "default_max_requests")]
    pub max_requests_per_window: u32,
    /// Ban duration in minutes once the window is exceeded
    #[serde(default = "default_ban_minutes")]
    pub blacklist_timeout: u64,

    /// Domain blocklist toggle
    #[serde(default = "default_true")]
    pub enable_domain_block: bool,
    /// Extra blocked domains on top of the built-in seed list
    #[serde(default)]
    pub domain_blacklist: Vec<String>,

    /// Log suppression toggle
    #[serde(default = "default_true")]
    pub enable_log_suppression: bool,
    /// Suppression window in seconds
    #[serde(default = "default_log_window")]
    pub log_suppression_window: u64,
    /// Error count inside the window before suppression starts
    #[serde(default = "default_log_threshold")]
    pub log_suppression_threshold: u32,
}

impl Default for DefenseConfig {
    fn default() -> Self {
        Self {
            enable_rate_limit: true,
            rate_limit_window: default_rate_window(),
            max_requests_per_window: default_max_requests(),
            blacklist_timeout: default_ban_minutes(),
            enable_domain_block: true,
            domain_blacklist: Vec::new(),
            enable_log_suppression: true,
            log_suppression_window: default_log_window(),
            log_suppression_threshold: default_log_threshold(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_rate_window() -> u64 {
    60
}

fn default_max_requests() -> u32 {
    30
}

fn default_ban_minutes() -> u64 {
    30
}

fn default_log_window() -> u64 {
    60
}

fn default_log_threshold() -> u32 {
    5
}

/// Settings for the external authorization service.
///
/// When `api_url` or `shared_secret` is missing, validation fails closed:
/// every client credential is rejected with an internal error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Authorizer endpoint URL (`MAIN_SERVER_AUTH_API_URL`)
    #[serde(default)]
    pub api_url: Option<String>,

    /// Proxy-to-authorizer shared secret (`PROXY_MAIN_SERVER_SECRET`),
    /// distinct from the upstream API credential pool.
    #[serde(default)]
    pub shared_secret: Option<String>,

    /// Where clients present their credential.
    #[serde(default)]
    pub key_source: KeySource,

    /// Skip TLS certificate verification for the authorizer endpoint.
    /// Off by default; only for deployments where the authorizer uses a
    /// private PKI. Never applies to origin connections.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl ProxyConfig {
    /// Build a configuration from the process environment.
    ///
    /// Unset variables fall back to defaults; malformed values are errors
    /// rather than silent fallbacks so a typo cannot weaken a deployment.
    pub fn from_env() -> Result<Self> {
        let mut config = ProxyConfig::default();

        if let Some(addr) = env_var("LISTEN_ADDR") {
            config.listen_addr = addr
                .parse()
                .map_err(|e| ProxyError::Config(format!("invalid LISTEN_ADDR '{}': {}", addr, e)))?;
        }
        if let Some(keys) = env_var("API_KEYS") {
            config.api_keys = split_list(&keys);
        }
        if let Some(host) = env_var("INTERCEPT_HOST") {
            config.intercept_host = host.to_ascii_lowercase();
        }
        if let Some(proxy) = env_var("UPSTREAM_PROXY") {
            url::Url::parse(&proxy)
                .map_err(|e| ProxyError::Config(format!("invalid UPSTREAM_PROXY '{}': {}", proxy, e)))?;
            config.upstream_proxy = Some(proxy);
        }
        if let Some(dir) = env_var("CA_DIR") {
            config.ca_dir = PathBuf::from(dir);
        }
        if let Some(secret) = env_var("TOKEN_SECRET") {
            config.token_secret = secret;
        }

        let d = &mut config.defense;
        if let Some(v) = env_var("ENABLE_RATE_LIMIT") {
            d.enable_rate_limit = parse_bool("ENABLE_RATE_LIMIT", &v)?;
        }
        if let Some(v) = env_var("RATE_LIMIT_WINDOW") {
            d.rate_limit_window = parse_num("RATE_LIMIT_WINDOW", &v)?;
        }
        if let Some(v) = env_var("MAX_REQUESTS_PER_WINDOW") {
            d.max_requests_per_window = parse_num("MAX_REQUESTS_PER_WINDOW", &v)?;
        }
        if let Some(v) = env_var("BLACKLIST_TIMEOUT") {
            d.blacklist_timeout = parse_num("BLACKLIST_TIMEOUT", &v)?;
        }
        if let Some(v) = env_var("ENABLE_DOMAIN_BLOCK") {
            d.enable_domain_block = parse_bool("ENABLE_DOMAIN_BLOCK", &v)?;
        }
        if let Some(v) = env_var("DOMAIN_BLACKLIST") {
            d.domain_blacklist = split_list(&v);
        }
        if let Some(v) = env_var("ENABLE_LOG_SUPPRESSION") {
            d.enable_log_suppression = parse_bool("ENABLE_LOG_SUPPRESSION", &v)?;
        }
        if let Some(v) = env_var("LOG_SUPPRESSION_WINDOW") {
            d.log_suppression_window = parse_num("LOG_SUPPRESSION_WINDOW", &v)?;
        }
        if let Some(v) = env_var("LOG_SUPPRESSION_THRESHOLD") {
            d.log_suppression_threshold = parse_num("LOG_SUPPRESSION_THRESHOLD", &v)?;
        }

        let a = &mut config.auth;
        a.api_url = env_var("MAIN_SERVER_AUTH_API_URL");
        a.shared_secret = env_var("PROXY_MAIN_SERVER_SECRET");
        if let Some(v) = env_var("AUTH_KEY_SOURCE") {
            a.key_source = v.parse()?;
        }
        if let Some(v) = env_var("AUTH_INSECURE_SKIP_VERIFY") {
            a.insecure_skip_verify = parse_bool("AUTH_INSECURE_SKIP_VERIFY", &v)?;
        }

        Ok(config)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ProxyError::Config(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}

fn parse_num<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ProxyError::Config(format!("{} must be a number, got '{}'", name, value)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr.port(), 8091);
        assert_eq!(config.intercept_host, DEFAULT_INTERCEPT_HOST);
        assert!(config.api_keys.is_empty());
        assert!(config.upstream_proxy.is_none());
        assert!(config.defense.enable_rate_limit);
        assert_eq!(config.defense.rate_limit_window, 60);
        assert_eq!(config.defense.max_requests_per_window, 30);
        assert_eq!(config.defense.blacklist_timeout, 30);
        assert_eq!(config.auth.key_source, KeySource::Header);
        assert!(!config.auth.insecure_skip_verify);
    }

    #[test]
    fn test_config_serialization() {
        let config = ProxyConfig {
            api_keys: vec!["K1".to_string(), "K2".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: ProxyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.api_keys, vec!["K1", "K2"]);
        assert_eq!(deserialized.intercept_host, DEFAULT_INTERCEPT_HOST);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("X", "true").unwrap());
        assert!(parse_bool("X", "1").unwrap());
        assert!(!parse_bool("X", "off").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn test_key_source_from_str() {
        assert_eq!(KeySource::from_str("header").unwrap(), KeySource::Header);
        assert_eq!(KeySource::from_str("QUERY").unwrap(), KeySource::Query);
        assert!(KeySource::from_str("body").is_err());
    }
}
