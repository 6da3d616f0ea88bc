//! Streaming ingestion sinks.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::config::ExportConfig;
use crate::error::ExportResult;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Errors from sink delivery.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("HTTP error: status {status}, body: {body}")]
    Http { status: u16, body: String },
}

/// Acknowledgement of one delivered batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkAck {
    pub latency_ms: u64,
}

/// Destination for serialized event batches.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Sends one batch of newline-delimited JSON records.
    async fn send_batch(&self, batch: &[u8]) -> Result<SinkAck, SinkError>;
}

/// Posts batches to an HTTP ingestion endpoint.
pub struct HttpEventSink {
    url: String,
    authorization: Option<SecretString>,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEventSink")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpEventSink {
    pub fn new(
        url: impl Into<String>,
        authorization: Option<SecretString>,
        timeout: Duration,
    ) -> ExportResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            authorization,
            timeout,
            client,
        })
    }

    pub fn from_config(config: &ExportConfig) -> ExportResult<Self> {
        Self::new(
            config.sink_url.clone(),
            config.sink_authorization.clone(),
            config.request_timeout(),
        )
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn send_batch(&self, batch: &[u8]) -> Result<SinkAck, SinkError> {
        let start = Instant::now();

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, NDJSON_CONTENT_TYPE)
            .body(batch.to_vec());
        if let Some(auth) = &self.authorization {
            request = request.header(AUTHORIZATION, auth.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SinkError::Timeout(format!("sink timeout after {:?}", self.timeout))
            } else if e.is_connect() {
                SinkError::ConnectionFailed(format!("connect to {} failed: {e}", self.url))
            } else {
                SinkError::SendFailed(e.to_string())
            }
        })?;

        let latency_ms = start.elapsed().as_millis() as u64;
        let status = response.status();
        if status.is_success() {
            Ok(SinkAck { latency_ms })
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());
            Err(SinkError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }
}
