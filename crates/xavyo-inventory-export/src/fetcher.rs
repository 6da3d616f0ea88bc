//! Paginated listing against the management and directory APIs.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, Stream};
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::auth::{Audience, TokenProvider};
use crate::error::{ExportError, ExportResult};
use crate::metrics::ExportMetrics;
use crate::rate_limit::{BackoffPolicy, RateBudget};

/// One page of a list response.
///
/// ARM spells the continuation `nextLink`, Graph `@odata.nextLink`.
#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub value: Vec<Value>,
    #[serde(rename = "nextLink", alias = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

/// Error body returned by ARM and Graph.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

struct PageCursor {
    next: Option<Url>,
    buffered: VecDeque<Value>,
    pending_error: Option<ExportError>,
}

/// Fetches list endpoints page by page under the shared retry and pacing policy.
#[derive(Debug)]
pub struct PagedFetcher {
    http_client: reqwest::Client,
    tokens: Arc<TokenProvider>,
    budget: Arc<RateBudget>,
    backoff: BackoffPolicy,
    metrics: Arc<ExportMetrics>,
    cancel: CancellationToken,
}

impl PagedFetcher {
    pub fn new(
        tokens: Arc<TokenProvider>,
        budget: Arc<RateBudget>,
        backoff: BackoffPolicy,
        metrics: Arc<ExportMetrics>,
        timeout: std::time::Duration,
    ) -> ExportResult<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            tokens,
            budget,
            backoff,
            metrics,
            cancel: CancellationToken::new(),
        })
    }

    /// Stops new requests once `cancel` fires. Requests already sent still
    /// complete, including their retries.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Lazily streams every record of a list endpoint.
    ///
    /// Follows continuation links until the server stops returning one. The
    /// stream yields at most one error and then ends; restarting means
    /// calling `fetch` again. After cancellation the next page is not
    /// requested and the stream ends with [`ExportError::Cancelled`].
    pub fn fetch(
        &self,
        endpoint: Url,
        audience: Audience,
        page_size: u32,
    ) -> impl Stream<Item = ExportResult<Value>> + Send + '_ {
        let cursor = PageCursor {
            next: Some(with_top(endpoint, page_size)),
            buffered: VecDeque::new(),
            pending_error: None,
        };

        stream::unfold(cursor, move |mut cursor| async move {
            loop {
                if let Some(record) = cursor.buffered.pop_front() {
                    return Some((Ok(record), cursor));
                }
                if let Some(err) = cursor.pending_error.take() {
                    return Some((Err(err), cursor));
                }
                let url = cursor.next.take()?;
                if self.cancel.is_cancelled() {
                    debug!(url = %url, "Cancelled, not requesting next page");
                    let err = ExportError::Cancelled {
                        url: url.to_string(),
                    };
                    return Some((Err(err), cursor));
                }
                match self
                    .request_json::<Page>(&url, audience, self.backoff.max_retries)
                    .await
                {
                    Ok(page) => {
                        debug!(url = %url, records = page.value.len(), "Fetched page");
                        cursor.buffered = page.value.into();
                        match page.next_link.filter(|link| !link.is_empty()) {
                            Some(link) => match Url::parse(&link) {
                                Ok(next) => cursor.next = Some(next),
                                Err(e) => cursor.pending_error = Some(e.into()),
                            },
                            None => cursor.next = None,
                        }
                    }
                    Err(e) => return Some((Err(e), cursor)),
                }
            }
        })
    }

    /// Single non-paginated GET.
    pub async fn get_json(&self, url: &Url, audience: Audience) -> ExportResult<Value> {
        self.ensure_not_cancelled(url)?;
        self.request_json(url, audience, self.backoff.max_retries).await
    }

    /// Single GET without throttle or server-error retries.
    ///
    /// A rejected credential is still refreshed once. Used for lookups that
    /// must not hold up a traversal.
    pub async fn get_json_once(&self, url: &Url, audience: Audience) -> ExportResult<Value> {
        self.ensure_not_cancelled(url)?;
        self.request_json(url, audience, 0).await
    }

    fn ensure_not_cancelled(&self, url: &Url) -> ExportResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ExportError::Cancelled {
                url: url.to_string(),
            });
        }
        Ok(())
    }

    /// GET with the credential, throttling and retry policy applied.
    #[instrument(skip(self, url), fields(url = %url))]
    async fn request_json<T: DeserializeOwned>(
        &self,
        url: &Url,
        audience: Audience,
        max_retries: u32,
    ) -> ExportResult<T> {
        let mut throttle_attempts = 0u32;
        let mut server_attempts = 0u32;
        let mut refreshed = false;
        let mut credential = self.tokens.get_token(audience).await?;

        loop {
            self.budget.acquire(audience.into()).await;
            self.metrics.record_request();

            let sent = self
                .http_client
                .get(url.clone())
                .bearer_auth(credential.token())
                .header(ACCEPT, "application/json")
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    if server_attempts < max_retries {
                        self.back_off(server_attempts, None, &e.to_string()).await;
                        server_attempts += 1;
                        continue;
                    }
                    return Err(ExportError::Server {
                        status: None,
                        attempts: server_attempts + 1,
                        message: e.to_string(),
                    });
                }
            };

            let status = response.status();
            if status.is_success() {
                let body = response.text().await?;
                return Ok(serde_json::from_str(&body)?);
            }

            match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    if refreshed {
                        return Err(ExportError::Auth(format!(
                            "{status} from {url} after refreshing the {audience} credential"
                        )));
                    }
                    debug!(status = %status, "Credential rejected, refreshing once");
                    refreshed = true;
                    credential = self.tokens.refresh_rejected(audience, &credential).await?;
                }
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                    self.metrics.record_throttled();
                    if throttle_attempts >= max_retries {
                        return Err(ExportError::Throttled {
                            url: url.to_string(),
                            attempts: throttle_attempts + 1,
                        });
                    }
                    let retry_after = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(BackoffPolicy::parse_retry_after);
                    self.back_off(throttle_attempts, retry_after, status.as_str())
                        .await;
                    throttle_attempts += 1;
                }
                s if s.is_client_error() => {
                    let body = response.text().await.unwrap_or_default();
                    let (code, message) = match serde_json::from_str::<ApiError>(&body) {
                        Ok(api) => (api.error.code, api.error.message),
                        Err(_) => (s.to_string(), body),
                    };
                    return Err(ExportError::Client {
                        status: s.as_u16(),
                        code,
                        message,
                    });
                }
                s => {
                    let body = response.text().await.unwrap_or_default();
                    if server_attempts < max_retries {
                        self.back_off(server_attempts, None, s.as_str()).await;
                        server_attempts += 1;
                        continue;
                    }
                    return Err(ExportError::Server {
                        status: Some(s.as_u16()),
                        attempts: server_attempts + 1,
                        message: body,
                    });
                }
            }
        }
    }

    async fn back_off(&self, attempt: u32, retry_after_secs: Option<u64>, reason: &str) {
        let delay = self.backoff.delay_for(attempt, retry_after_secs);
        warn!(
            reason,
            attempt = attempt + 1,
            max_retries = self.backoff.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Request failed, backing off"
        );
        self.metrics.record_retry(delay.as_millis() as u64);
        tokio::time::sleep(delay).await;
    }
}

fn with_top(mut endpoint: Url, page_size: u32) -> Url {
    if !endpoint.query_pairs().any(|(k, _)| k == "$top") {
        endpoint
            .query_pairs_mut()
            .append_pair("$top", &page_size.to_string());
    }
    endpoint
}
