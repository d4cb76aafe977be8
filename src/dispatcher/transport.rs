use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use thiserror::Error;

use crate::translator::ProviderRequest;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

pub enum TransportBody {
    Unary(Bytes),
    Streaming(ByteStream),
}

pub struct TransportResponse {
    pub status: u16,
    pub body: TransportBody,
}

/// Transport-layer failure: socket, TLS, DNS, or timeout. Always
/// retryable against another key/URL/channel (spec §7 `TransportError`).
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
}

/// One async method, request in, response out — the dispatcher's state
/// machine is exercised in tests against a fake implementation instead of
/// live network I/O (SPEC_FULL.md §4.5 ambient note).
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(
        &self,
        req: ProviderRequest,
        is_stream: bool,
        insecure_skip_verify: bool,
    ) -> Result<TransportResponse, TransportError>;
}

/// Production implementation backed by `reqwest`. Unary default timeout is
/// 60s; callers needing the 5s `ping` timeout build a short-lived client
/// via [`ReqwestTransport::with_timeout`].
pub struct ReqwestTransport {
    client: reqwest::Client,
    insecure_client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(60))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builds"),
            insecure_client: reqwest::Client::builder()
                .timeout(timeout)
                .danger_accept_invalid_certs(true)
                .build()
                .expect("reqwest client builds"),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamTransport for ReqwestTransport {
    async fn send(
        &self,
        req: ProviderRequest,
        is_stream: bool,
        insecure_skip_verify: bool,
    ) -> Result<TransportResponse, TransportError> {
        let client = if insecure_skip_verify {
            &self.insecure_client
        } else {
            &self.client
        };

        let mut builder = client.post(&req.url).json(&req.body);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;
        let status = resp.status().as_u16();

        if is_stream {
            let stream = resp.bytes_stream().map(|chunk| {
                chunk.map_err(|e| TransportError::StreamInterrupted(e.to_string()))
            });
            Ok(TransportResponse {
                status,
                body: TransportBody::Streaming(Box::pin(stream)),
            })
        } else {
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| TransportError::StreamInterrupted(e.to_string()))?;
            Ok(TransportResponse {
                status,
                body: TransportBody::Unary(bytes),
            })
        }
    }
}
