//! Rate limit header normalization.
//!
//! Discord declares its limits only through response headers (and, for 429s,
//! the response body). [`normalize`] folds those into [`RateLimitHeaders`].

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, DATE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Error, Result};

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";
pub const X_RATELIMIT_RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const X_RATELIMIT_BUCKET: &str = "x-ratelimit-bucket";
pub const X_RATELIMIT_GLOBAL: &str = "x-ratelimit-global";
pub const X_RATELIMIT_SCOPE: &str = "x-ratelimit-scope";

/// Canonical rate limit fields of one response.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitHeaders {
    pub status: StatusCode,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Server-declared absolute reset time.
    pub reset: Option<DateTime<Utc>>,
    pub reset_after: Option<Duration>,
    /// Server-assigned bucket id, absent on many routes.
    pub bucket: Option<String>,
    pub global: bool,
    pub scope: Option<String>,
    /// Server `Date` header, used to correct for clock skew against `reset`.
    pub server_date: Option<DateTime<Utc>>,
    /// When this client received the response.
    pub received_at: DateTime<Utc>,
}

impl RateLimitHeaders {
    pub fn is_rate_limited(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS
    }

    /// How long after receipt the current window closes, if known.
    pub fn retry_in(&self) -> Option<Duration> {
        if let Some(after) = self.reset_after {
            return Some(after);
        }
        let reset = self.reset?;
        let anchor = self.server_date.unwrap_or(self.received_at);
        Some((reset - anchor).to_std().unwrap_or(Duration::ZERO))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitedBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: Option<bool>,
}

/// Parse the rate limit fields of a response.
///
/// For a 429 the wait duration is mandatory; it is taken from the first
/// parsable of `Retry-After`, `X-RateLimit-Reset-After` and the body's
/// `retry_after`. Missing all three is a protocol violation. For any other
/// status, malformed fields are simply left out.
pub fn normalize(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    received_at: DateTime<Utc>,
) -> Result<RateLimitHeaders> {
    let mut normalized = RateLimitHeaders {
        status,
        limit: parse_header(headers, X_RATELIMIT_LIMIT),
        remaining: parse_header(headers, X_RATELIMIT_REMAINING),
        reset: header_str(headers, X_RATELIMIT_RESET)
            .and_then(parse_seconds)
            .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)),
        reset_after: header_str(headers, X_RATELIMIT_RESET_AFTER).and_then(parse_duration),
        bucket: header_str(headers, X_RATELIMIT_BUCKET)
            .filter(|b| !b.is_empty())
            .map(str::to_string),
        global: header_str(headers, X_RATELIMIT_GLOBAL)
            .is_some_and(|v| v.eq_ignore_ascii_case("true")),
        scope: header_str(headers, X_RATELIMIT_SCOPE).map(str::to_string),
        server_date: header_str(headers, DATE.as_str())
            .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
            .map(|d| d.with_timezone(&Utc)),
        received_at,
    };

    if status != StatusCode::TOO_MANY_REQUESTS {
        return Ok(normalized);
    }

    let body: RateLimitedBody = serde_json::from_slice(body).unwrap_or_default();
    let retry_after = header_str(headers, RETRY_AFTER.as_str())
        .and_then(parse_duration)
        .or(normalized.reset_after)
        .or_else(|| body.retry_after.and_then(duration_from_secs));
    let Some(retry_after) = retry_after else {
        return Err(Error::ProtocolViolation(
            "429 response carried no parsable retry-after duration".to_string(),
        ));
    };

    normalized.reset_after = Some(retry_after);
    normalized.remaining = Some(0);
    normalized.global |= body.global.unwrap_or(false);
    Ok(normalized)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn parse_header(headers: &HeaderMap, name: &str) -> Option<u32> {
    header_str(headers, name).and_then(|s| s.parse::<u32>().ok())
}

fn parse_seconds(value: &str) -> Option<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
}

fn parse_duration(value: &str) -> Option<Duration> {
    parse_seconds(value).and_then(duration_from_secs)
}

fn duration_from_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn parses_route_fields() {
        let now = Utc::now();
        let h = headers(&[
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "4"),
            ("x-ratelimit-reset", "1470173023.123"),
            ("x-ratelimit-reset-after", "1.5"),
            ("x-ratelimit-bucket", "abcd1234"),
        ]);
        let n = normalize(StatusCode::OK, &h, b"", now).unwrap();
        assert_eq!(n.limit, Some(5));
        assert_eq!(n.remaining, Some(4));
        assert_eq!(n.reset.unwrap().timestamp_millis(), 1_470_173_023_123);
        assert_eq!(n.reset_after, Some(Duration::from_millis(1500)));
        assert_eq!(n.bucket.as_deref(), Some("abcd1234"));
        assert_eq!(n.received_at, now);
        assert!(!n.global);
        assert!(!n.is_rate_limited());
    }

    #[test]
    fn malformed_fields_on_success_are_ignored() {
        let h = headers(&[
            ("x-ratelimit-remaining", "lots"),
            ("x-ratelimit-reset-after", "-3"),
        ]);
        let n = normalize(StatusCode::OK, &h, b"", Utc::now()).unwrap();
        assert_eq!(n.remaining, None);
        assert_eq!(n.reset_after, None);
        assert_eq!(n.retry_in(), None);
    }

    #[test]
    fn rate_limited_without_wait_is_a_protocol_violation() {
        let h = headers(&[("retry-after", "soon")]);
        let err = normalize(StatusCode::TOO_MANY_REQUESTS, &h, b"", Utc::now()).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn rate_limited_wait_falls_back_to_body() {
        let body = br#"{"message":"You are being rate limited.","retry_after":0.25,"global":true}"#;
        let n = normalize(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), body, Utc::now())
            .unwrap();
        assert_eq!(n.reset_after, Some(Duration::from_millis(250)));
        assert_eq!(n.remaining, Some(0));
        assert!(n.global);
        assert!(n.is_rate_limited());
    }

    #[test]
    fn retry_after_header_wins_over_reset_after() {
        let h = headers(&[
            ("retry-after", "3"),
            ("x-ratelimit-reset-after", "1"),
            ("x-ratelimit-global", "true"),
        ]);
        let n = normalize(StatusCode::TOO_MANY_REQUESTS, &h, b"", Utc::now()).unwrap();
        assert_eq!(n.retry_in(), Some(Duration::from_secs(3)));
        assert!(n.global);
    }

    #[test]
    fn reset_is_measured_against_server_date() {
        let h = headers(&[
            ("date", "Wed, 01 Jan 2025 00:00:00 GMT"),
            ("x-ratelimit-reset", "1735689602"),
        ]);
        // a client clock far ahead of the server must not erase the window
        let skewed = DateTime::from_timestamp(1_735_689_700, 0).unwrap();
        let n = normalize(StatusCode::OK, &h, b"", skewed).unwrap();
        assert_eq!(n.retry_in(), Some(Duration::from_secs(2)));
    }
}
