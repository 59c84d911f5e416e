use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Request, StatusCode};
use std::time::Duration;

use crate::error::TransportError;

/// A response as it came off the wire: body bytes are still encoded.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Performs one HTTP exchange. TLS, pooling and timeouts live behind this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] backed by a `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

pub fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    // Default headers are owned by the dispatch pipeline, not the transport.
    reqwest::Client::builder()
        .timeout(timeout)
        .use_rustls_tls()
        .build()
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: Request) -> Result<TransportResponse, TransportError> {
        let res = self.client.execute(request).await?;
        let status = res.status();
        let headers = res.headers().clone();
        let body = res.bytes().await?.to_vec();
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
