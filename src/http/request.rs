use reqwest::Method;
use serde::Serialize;

use crate::error::{Error, Result};

pub const CONTENT_TYPE_JSON: &str = "application/json";

// Path segments whose ids partition Discord's buckets and so stay in the key.
const MAJOR_PARAMETERS: &[&str] = &["channels", "guilds", "webhooks"];

/// Request payload, either ready bytes or a structured value awaiting serialization.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Raw(Vec<u8>),
    Json(serde_json::Value),
}

/// One REST call. Built by callers, finalized once by the client before dispatch.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Concrete path below the versioned base URL, e.g. `/channels/123/messages`.
    pub endpoint: String,
    pub body: Option<Body>,
    pub content_type: Option<String>,
    /// Audit log annotation, sent as `X-Audit-Log-Reason`.
    pub reason: Option<String>,
    bucket_key: Option<String>,
    encoded_body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body: None,
            content_type: None,
            reason: None,
            bucket_key: None,
            encoded_body: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn patch(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PATCH, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PUT, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self.encoded_body = None;
        self
    }

    /// Attach any serializable value as a JSON body.
    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::RequestValidation(format!("body is not serializable: {}", e)))?;
        Ok(self.with_body(Body::Json(value)))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self.encoded_body = None;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Local bucket key, available once the request has been finalized.
    pub fn bucket_key(&self) -> Option<&str> {
        self.bucket_key.as_deref()
    }

    pub fn is_finalized(&self) -> bool {
        self.bucket_key.is_some()
    }

    /// Derive the bucket key, default the content type and encode the body.
    ///
    /// The bucket key is derived once, so a retried request keeps its bucket.
    /// A body replaced after finalization is encoded on the next call.
    pub fn finalize(&mut self) -> Result<()> {
        let content_type = self
            .content_type
            .get_or_insert_with(|| CONTENT_TYPE_JSON.to_string());
        if self.encoded_body.is_none() {
            if let Some(body) = &self.body {
                self.encoded_body = Some(encode(body, content_type)?);
            }
        }
        if self.bucket_key.is_none() {
            self.bucket_key = Some(bucket_key(&self.method, &self.endpoint));
        }
        Ok(())
    }

    pub(crate) fn encoded_body(&self) -> Option<&[u8]> {
        self.encoded_body.as_deref()
    }
}

fn encode(body: &Body, content_type: &str) -> Result<Vec<u8>> {
    match body {
        Body::Raw(bytes) => Ok(bytes.clone()),
        Body::Json(value) => {
            if !is_json(content_type) {
                return Err(Error::RequestValidation(format!(
                    "structured bodies can only be sent as {}, not {}",
                    CONTENT_TYPE_JSON, content_type
                )));
            }
            serde_json::to_vec(value)
                .map_err(|e| Error::RequestValidation(format!("body is not serializable: {}", e)))
        }
    }
}

// Parameters such as `charset` do not change the media type.
fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(CONTENT_TYPE_JSON))
}

/// Collapse a concrete endpoint into the key shared by structurally identical routes.
///
/// Ids become `{id}` unless they follow a major parameter; the reaction emoji
/// becomes `{emoji}`; the query string is dropped.
pub fn bucket_key(method: &Method, endpoint: &str) -> String {
    let path = endpoint.split(['?', '#']).next().unwrap_or_default();
    let mut key = String::with_capacity(path.len() + 8);
    key.push_str(method.as_str());
    key.push(':');

    let mut previous = "";
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        key.push('/');
        if previous == "reactions" {
            key.push_str("{emoji}");
        } else if is_snowflake(segment) && !MAJOR_PARAMETERS.contains(&previous) {
            key.push_str("{id}");
        } else {
            key.push_str(segment);
        }
        previous = segment;
    }
    if key.ends_with(':') {
        key.push('/');
    }
    key
}

fn is_snowflake(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Percent-encode a single path segment such as a reaction emoji.
pub fn encode_path_segment(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}
