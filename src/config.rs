use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::http::transport::{ReqwestTransport, Transport};
use crate::ratelimit::RestBucketManager;

/// Construction parameters for [`Client`](crate::Client).
#[derive(Clone, Default)]
pub struct Config {
    pub api_version: u8,
    pub bot_token: String,
    pub transport: Option<Arc<dyn Transport>>,
    /// Defaults to a fresh [`BucketManager`](crate::ratelimit::BucketManager).
    pub bucket_manager: Option<Arc<dyn RestBucketManager>>,
    /// Fail instead of waiting when a bucket is known to be exhausted.
    /// Only applies to the default bucket manager.
    pub cancel_request_when_rate_limited: bool,
    pub user_agent_source_url: String,
    pub user_agent_version: String,
    pub user_agent_extra: String,
    /// Overrides `https://discord.com/api`.
    pub base_url: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_version", &self.api_version)
            .field("bot_token", &"<redacted>")
            .field("transport", &self.transport.is_some())
            .field("bucket_manager", &self.bucket_manager.is_some())
            .field(
                "cancel_request_when_rate_limited",
                &self.cancel_request_when_rate_limited,
            )
            .field("user_agent_source_url", &self.user_agent_source_url)
            .field("user_agent_version", &self.user_agent_version)
            .field("user_agent_extra", &self.user_agent_extra)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment, wiring in a reqwest transport.
    ///
    /// Env vars:
    /// - DISCORD_TOKEN [required]
    /// - DISCORD_API_VERSION (default: 10)
    /// - DISCORD_API_URL (default: https://discord.com/api)
    /// - DISCORD_USER_AGENT_URL (default: crate repository)
    /// - DISCORD_USER_AGENT_VERSION (default: crate version)
    /// - DISCORD_HTTP_TIMEOUT_SECS (default: 30)
    /// - DISCORD_CANCEL_WHEN_RATE_LIMITED (default: false)
    pub fn from_env() -> Result<Self> {
        let bot_token = env::var("DISCORD_TOKEN")
            .map_err(|_| Error::Configuration("Missing DISCORD_TOKEN".to_string()))?;
        let api_version = match env::var("DISCORD_API_VERSION") {
            Ok(v) => v.trim().parse::<u8>().map_err(|_| {
                Error::Configuration(format!("DISCORD_API_VERSION is not a number: {}", v))
            })?,
            Err(_) => 10,
        };
        let base_url = env::var("DISCORD_API_URL").ok();
        let user_agent_source_url = env::var("DISCORD_USER_AGENT_URL")
            .unwrap_or_else(|_| env!("CARGO_PKG_REPOSITORY").to_string());
        let user_agent_version = env::var("DISCORD_USER_AGENT_VERSION")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());
        let timeout_secs = env::var("DISCORD_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);
        let cancel_request_when_rate_limited = env::var("DISCORD_CANCEL_WHEN_RATE_LIMITED")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let transport = ReqwestTransport::new(Duration::from_secs(timeout_secs))
            .map_err(|e| Error::Configuration(format!("unable to build http client: {}", e)))?;

        Ok(Self {
            api_version,
            bot_token,
            transport: Some(Arc::new(transport)),
            bucket_manager: None,
            cancel_request_when_rate_limited,
            user_agent_source_url,
            user_agent_version,
            user_agent_extra: String::new(),
            base_url,
        })
    }
}
