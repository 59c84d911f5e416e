pub mod headers;
pub mod request;
pub mod transport;

use chrono::Utc;
use flate2::read::GzDecoder;
use futures::FutureExt;
use log::{debug, trace, warn};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING,
    CONTENT_TYPE, USER_AGENT,
};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::error::{Error, RestError, Result};
use crate::ratelimit::{BucketManager, RestBucketManager};
use crate::types::Response;
use request::{Request, CONTENT_TYPE_JSON};
use transport::Transport;

pub const BASE_URL: &str = "https://discord.com/api";
pub const SUPPORTED_API_VERSIONS: &[u8] = &[8, 9, 10];
pub const X_AUDIT_LOG_REASON: &str = "x-audit-log-reason";
const GZIP: &str = "gzip";

pub fn supports_api_version(version: u8) -> bool {
    SUPPORTED_API_VERSIONS.contains(&version)
}

/// `DiscordBot ($url, $versionNumber) $extra`, as the API requires.
pub fn user_agent(source_url: &str, version: &str, extra: &str) -> String {
    format!("DiscordBot ({}, {}) {}", source_url, version, extra)
        .trim_end()
        .to_string()
}

fn authorization(token: &str) -> String {
    if token.starts_with("Bot ") || token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bot {}", token)
    }
}

/// `[200, 300)` and 304 count as success.
pub fn is_success(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::NOT_MODIFIED
}

/// Undo the declared content encoding; anything but gzip passes through.
pub fn decode_body(headers: &HeaderMap, body: Vec<u8>) -> Result<Vec<u8>> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    if !encoding.is_some_and(|e| e.eq_ignore_ascii_case(GZIP)) {
        return Ok(body);
    }
    let mut decoded = Vec::with_capacity(body.len() * 2);
    GzDecoder::new(body.as_slice())
        .read_to_end(&mut decoded)
        .map_err(Error::Decompression)?;
    Ok(decoded)
}

/// Discord REST client.
///
/// Cheap to clone; clones share the transport and the rate limit buckets.
#[derive(Clone)]
pub struct Client {
    url: String,
    /// Never mutated after construction; every dispatch works on a copy.
    default_headers: Arc<HeaderMap>,
    transport: Arc<dyn Transport>,
    buckets: Arc<dyn RestBucketManager>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("url", &self.url).finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(config: Config) -> Result<Self> {
        if !supports_api_version(config.api_version) {
            return Err(Error::Configuration(format!(
                "Discord API version {} is not supported",
                config.api_version
            )));
        }
        if config.bot_token.trim().is_empty() {
            return Err(Error::Configuration(
                "no Discord bot token was provided".to_string(),
            ));
        }
        let Some(transport) = config.transport else {
            return Err(Error::Configuration("missing http transport".to_string()));
        };
        if config.user_agent_source_url.is_empty() || config.user_agent_version.is_empty() {
            return Err(Error::Configuration(
                "both a source url and a version are required for the user agent".to_string(),
            ));
        }

        let base = config.base_url.as_deref().unwrap_or(BASE_URL);
        let base = Url::parse(base)
            .map_err(|e| Error::Configuration(format!("invalid base url {}: {}", base, e)))?;
        let url = format!(
            "{}/v{}",
            base.as_str().trim_end_matches('/'),
            config.api_version
        );

        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            AUTHORIZATION,
            header_value(&authorization(&config.bot_token), "authorization")?,
        );
        let ua = user_agent(
            &config.user_agent_source_url,
            &config.user_agent_version,
            &config.user_agent_extra,
        );
        default_headers.insert(USER_AGENT, header_value(&ua, "user agent")?);
        default_headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(GZIP));

        let buckets: Arc<dyn RestBucketManager> = match config.bucket_manager {
            Some(manager) => manager,
            None => Arc::new(BucketManager::with_cancel_when_rate_limited(
                config.cancel_request_when_rate_limited,
            )),
        };

        Ok(Self {
            url,
            default_headers: Arc::new(default_headers),
            transport,
            buckets,
        })
    }

    /// Server bucket id to the local bucket keys discovered to share it.
    pub fn bucket_grouping(&self) -> HashMap<String, Vec<String>> {
        self.buckets.bucket_grouping()
    }

    /// Send `request` through its rate limit bucket and the global bucket.
    ///
    /// The request is finalized first if needed. Statuses outside `[200, 300)`
    /// other than 304 come back as [`Error::Rest`].
    pub async fn dispatch(
        &self,
        request: &mut Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        request.finalize()?;
        let key = request
            .bucket_key()
            .map(str::to_string)
            .unwrap_or_default();
        let outgoing = self.build_request(request)?;
        trace!("{} {} (bucket {})", request.method, request.endpoint, key);

        let global = self.buckets.global();
        let bucket = self.buckets.bucket(&key);
        let work = self.exchange(outgoing, &key).boxed();
        // global innermost: its window is checked after any route wait
        let response = bucket
            .transaction(cancel, global.transaction(cancel, work))
            .await?;

        if is_success(response.status) {
            return Ok(response);
        }
        debug!("{} {} failed with {}", request.method, request.endpoint, response.status);
        let diagnostics = self.bucket_diagnostics(&key);
        Err(RestError::new(response.status, &response.body, diagnostics, &key).into())
    }

    fn build_request(&self, request: &Request) -> Result<reqwest::Request> {
        let separator = if request.endpoint.starts_with('/') { "" } else { "/" };
        let url = Url::parse(&format!("{}{}{}", self.url, separator, request.endpoint))
            .map_err(|e| {
                Error::RequestValidation(format!("invalid endpoint {}: {}", request.endpoint, e))
            })?;

        let mut headers = (*self.default_headers).clone();
        let content_type = request.content_type.as_deref().unwrap_or(CONTENT_TYPE_JSON);
        headers.insert(
            CONTENT_TYPE,
            header_value(content_type, "content type").map_err(into_validation)?,
        );
        let audit = HeaderName::from_static(X_AUDIT_LOG_REASON);
        match request.reason.as_deref().filter(|r| !r.is_empty()) {
            Some(reason) => {
                let encoded = urlencoding::encode(reason);
                headers.insert(
                    audit,
                    header_value(&encoded, "audit log reason").map_err(into_validation)?,
                );
            }
            None => {
                headers.remove(audit);
            }
        }

        let mut outgoing = reqwest::Request::new(request.method.clone(), url);
        *outgoing.headers_mut() = headers;
        if let Some(body) = request.encoded_body() {
            *outgoing.body_mut() = Some(body.to_vec().into());
        }
        Ok(outgoing)
    }

    // Runs inside the bucket transactions.
    async fn exchange(&self, outgoing: reqwest::Request, key: &str) -> Result<Response> {
        let raw = self.transport.send(outgoing).await?;
        let received_at = Utc::now();
        let body = decode_body(&raw.headers, raw.body)?;
        let rate_limit = headers::normalize(raw.status, &raw.headers, &body, received_at)
            .inspect_err(|e| warn!("{}: {}", key, e))?;
        if let Some(server_bucket) = &rate_limit.bucket {
            self.buckets.record_association(key, server_bucket);
        }
        Ok(Response {
            status: raw.status,
            headers: raw.headers,
            rate_limit,
            body,
        })
    }

    fn bucket_diagnostics(&self, key: &str) -> Vec<String> {
        self.buckets
            .bucket_grouping()
            .into_values()
            .find(|keys| keys.iter().any(|k| k == key))
            .unwrap_or_else(|| vec![key.to_string()])
    }
}

fn header_value(value: &str, what: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::Configuration(format!("{} is not a valid header value", what)))
}

fn into_validation(err: Error) -> Error {
    match err {
        Error::Configuration(msg) => Error::RequestValidation(msg),
        other => other,
    }
}
