use crate::api::HEALTH_PATH;
use crate::message::Message;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("web_path cannot be empty")]
    EmptyWebPath,

    #[error("web_path cannot be the health check path")]
    ReservedWebPath,

    #[error("redis_manager url cannot be empty")]
    EmptyRedisUrl,
}

/// Errors raised while resolving or interpreting per-call settings.
///
/// These fail the call that hit them but never the service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("HTTP Authentication method {0:?} not supported")]
    UnsupportedAuthMethod(String),

    #[error("rapidsms_url is not configured")]
    MissingRemoteUrl,

    #[error("invalid rapidsms_http_method {0:?}")]
    InvalidHttpMethod(String),

    #[error("credentials cannot be encoded as a header value")]
    InvalidCredentials,

    #[error("config resolution failed: {0}")]
    Resolution(String),
}

/// Relay configuration.
///
/// The static part (listener, reply support, store) is fixed for the
/// lifetime of the service. `settings` holds the options that may vary per
/// routing context and is only ever read through a [`ConfigResolver`].
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Host to listen on for outbound messages from RapidSMS
    #[serde(default = "default_web_host")]
    pub web_host: String,
    /// Port to listen on for outbound messages from RapidSMS
    pub web_port: u16,
    /// Path to listen on for outbound messages from RapidSMS
    pub web_path: String,
    /// Whether to support replies via the `in_reply_to` argument
    #[serde(default = "default_true")]
    pub allow_replies: bool,
    /// Redis connection for reply correlation. Only consulted when
    /// `allow_replies` is set; without it an in-process store is used.
    #[serde(default)]
    pub redis_manager: Option<RedisManagerConfig>,
    #[serde(flatten)]
    pub settings: RelaySettings,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.web_port == 0 {
            return Err(ValidationError::InvalidPort);
        }

        let path = normalize_path(&self.web_path);
        if path.is_empty() {
            return Err(ValidationError::EmptyWebPath);
        }
        if path == HEALTH_PATH {
            return Err(ValidationError::ReservedWebPath);
        }

        if let Some(redis) = &self.redis_manager
            && redis.url.trim().is_empty()
        {
            return Err(ValidationError::EmptyRedisUrl);
        }

        if self.settings.rapidsms_url.is_none() {
            tracing::warn!("rapidsms_url is not configured, forwarding will fail");
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RedisManagerConfig {
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Options that are re-resolved on every call.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RelaySettings {
    /// Username required when calling `web_path` (default: no authentication)
    #[serde(default)]
    pub vumi_username: Option<String>,
    #[serde(default)]
    pub vumi_password: Option<String>,
    #[serde(default = "default_auth_method")]
    pub vumi_auth_method: String,
    /// Seconds to keep original messages so replies may use `in_reply_to`
    #[serde(default = "default_reply_timeout")]
    pub vumi_reply_timeout: u64,

    #[serde(default)]
    pub rapidsms_url: Option<Url>,
    #[serde(default)]
    pub rapidsms_username: Option<String>,
    #[serde(default)]
    pub rapidsms_password: Option<String>,
    #[serde(default = "default_auth_method")]
    pub rapidsms_auth_method: String,
    #[serde(default = "default_http_method")]
    pub rapidsms_http_method: String,
}

impl RelaySettings {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.vumi_reply_timeout)
    }

    pub fn http_method(&self) -> Result<http::Method, ConfigError> {
        http::Method::from_bytes(self.rapidsms_http_method.to_uppercase().as_bytes())
            .map_err(|_| ConfigError::InvalidHttpMethod(self.rapidsms_http_method.clone()))
    }

    pub fn remote_url(&self) -> Result<&Url, ConfigError> {
        self.rapidsms_url.as_ref().ok_or(ConfigError::MissingRemoteUrl)
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        RelaySettings {
            vumi_username: None,
            vumi_password: None,
            vumi_auth_method: default_auth_method(),
            vumi_reply_timeout: default_reply_timeout(),
            rapidsms_url: None,
            rapidsms_username: None,
            rapidsms_password: None,
            rapidsms_auth_method: default_auth_method(),
            rapidsms_http_method: default_http_method(),
        }
    }
}

/// What a settings lookup is about: the authenticating caller, the message
/// being relayed, or neither.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigContext<'a> {
    pub username: Option<&'a str>,
    pub message: Option<&'a Message>,
}

impl<'a> ConfigContext<'a> {
    pub fn for_username(username: Option<&'a str>) -> Self {
        ConfigContext {
            username,
            message: None,
        }
    }

    pub fn for_message(message: &'a Message) -> Self {
        ConfigContext {
            username: None,
            message: Some(message),
        }
    }
}

/// Source of per-call settings. Implementations must be cheap to call; the
/// relay asks on every authentication, forward and dispatch.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve(&self, context: &ConfigContext<'_>) -> Result<Arc<RelaySettings>, ConfigError>;
}

/// Resolver that hands out the same settings for every context.
pub struct StaticResolver {
    settings: Arc<RelaySettings>,
}

impl StaticResolver {
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

#[async_trait]
impl ConfigResolver for StaticResolver {
    async fn resolve(&self, _context: &ConfigContext<'_>) -> Result<Arc<RelaySettings>, ConfigError> {
        Ok(self.settings.clone())
    }
}

pub(crate) fn normalize_path(path: &str) -> &str {
    path.trim().trim_matches('/')
}

fn default_web_host() -> String {
    "0.0.0.0".into()
}

fn default_true() -> bool {
    true
}

fn default_key_prefix() -> String {
    "rapidsms_relay".into()
}

fn default_auth_method() -> String {
    "basic".into()
}

fn default_reply_timeout() -> u64 {
    10 * 60
}

fn default_http_method() -> String {
    "POST".into()
}
