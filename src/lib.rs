//! Discord REST client that discovers rate limit buckets from response headers.
//!
//! Requests are serialized per bucket and gated by an account-wide bucket;
//! see [`ratelimit`] for how buckets are discovered and shared.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod types;

pub use config::Config;
pub use error::{Error, RestError, Result, TransportError};
pub use http::request::{Body, Request};
pub use http::transport::{ReqwestTransport, Transport, TransportResponse};
pub use http::Client;
pub use types::Response;
pub use tokio_util::sync::CancellationToken;
