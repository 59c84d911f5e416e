use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every way a dispatch can fail. A call yields either a response or exactly one of these.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid client configuration: {0}")]
    Configuration(String),

    #[error("invalid request: {0}")]
    RequestValidation(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unable to decompress response body: {0}")]
    Decompression(#[source] std::io::Error),

    #[error("rate limit protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Rest(Box<RestError>),

    #[error("request was cancelled")]
    Cancelled,

    #[error("bucket {bucket_key} is rate limited for another {retry_after:?}")]
    RateLimited {
        bucket_key: String,
        retry_after: Duration,
    },
}

impl Error {
    /// The structured remote error, when the server answered with a non-success status.
    pub fn as_rest(&self) -> Option<&RestError> {
        match self {
            Error::Rest(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<RestError> for Error {
    fn from(e: RestError) -> Self {
        Error::Rest(Box::new(e))
    }
}

/// Failure of the injected transport. Surfaced to the caller unmodified.
#[derive(Debug, Error)]
#[error("transport error: {0}")]
pub struct TransportError(#[source] pub Box<dyn std::error::Error + Send + Sync>);

impl TransportError {
    pub fn new<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self(err.into())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self(Box::new(e))
    }
}

/// A non-success answer from the remote API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestError {
    /// Server error code from the JSON body, 0 when absent.
    pub code: u64,
    pub message: String,
    /// Raw response body text.
    pub suggestion: String,
    pub status: StatusCode,
    /// Local bucket keys known to share this request's server bucket.
    pub bucket: Vec<String>,
    pub bucket_key: String,
    pub errors: Option<serde_json::Value>,
}

// Fields the server may supply in an error body.
#[derive(Debug, Deserialize)]
struct ServerErrorBody {
    #[serde(default)]
    code: Option<u64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

impl RestError {
    pub fn new(status: StatusCode, body: &[u8], bucket: Vec<String>, bucket_key: &str) -> Self {
        let mut err = RestError {
            code: 0,
            message: format!(
                "response was not within the successful http code range [200, 300). code: {}",
                status.as_u16()
            ),
            suggestion: String::from_utf8_lossy(body).into_owned(),
            status,
            bucket,
            bucket_key: bucket_key.to_string(),
            errors: None,
        };
        if !body.is_empty() {
            err.overlay_server_fields(body);
        }
        err
    }

    // A body that does not decode leaves the status-based message in place.
    fn overlay_server_fields(&mut self, body: &[u8]) {
        let Ok(server) = serde_json::from_slice::<ServerErrorBody>(body) else {
            return;
        };
        if let Some(code) = server.code {
            self.code = code;
        }
        if let Some(message) = server.message.filter(|m| !m.is_empty()) {
            self.message = message;
        }
        self.errors = server.errors;
    }
}

impl fmt::Display for RestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\n{}\n{} => {:?}",
            self.message, self.suggestion, self.bucket_key, self.bucket
        )
    }
}

impl std::error::Error for RestError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_fields_overlay_status_message() {
        let body = br#"{"code":50001,"message":"Missing Access"}"#;
        let e = RestError::new(StatusCode::FORBIDDEN, body, vec![], "GET:/channels/1");
        assert_eq!(e.code, 50001);
        assert_eq!(e.message, "Missing Access");
        assert_eq!(e.status, StatusCode::FORBIDDEN);
        assert_eq!(e.suggestion, r#"{"code":50001,"message":"Missing Access"}"#);
    }

    #[test]
    fn undecodable_body_keeps_status_message() {
        let e = RestError::new(StatusCode::BAD_GATEWAY, b"<html>oops</html>", vec![], "k");
        assert_eq!(e.code, 0);
        assert!(e.message.contains("502"));
        assert_eq!(e.suggestion, "<html>oops</html>");
    }

    #[test]
    fn empty_message_does_not_erase_status_message() {
        let e = RestError::new(StatusCode::NOT_FOUND, br#"{"code":10003,"message":""}"#, vec![], "k");
        assert_eq!(e.code, 10003);
        assert!(e.message.contains("404"));
    }

    #[test]
    fn display_lists_bucket_diagnostics() {
        let e = RestError::new(StatusCode::NOT_FOUND, b"", vec!["a".into(), "b".into()], "k");
        let s = e.to_string();
        assert!(s.contains("k => [\"a\", \"b\"]"));
    }
}
