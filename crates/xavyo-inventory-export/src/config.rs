//! Export configuration.
//!
//! Configuration can be deserialized (every field but `tenantId` and
//! `sinkUrl` has a default), assembled with [`ExportConfig::builder`], or
//! loaded from `XAVYO_EXPORT_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{ExportError, ExportResult};
use crate::rate_limit::BackoffPolicy;

const ENV_PREFIX: &str = "XAVYO_EXPORT_";

/// Azure cloud the tenant lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CloudEnvironment {
    #[default]
    Commercial,
    UsGovernment,
    China,
}

impl CloudEnvironment {
    #[must_use]
    pub fn login_endpoint(&self) -> &'static str {
        match self {
            Self::Commercial => "https://login.microsoftonline.com",
            Self::UsGovernment => "https://login.microsoftonline.us",
            Self::China => "https://login.chinacloudapi.cn",
        }
    }

    #[must_use]
    pub fn management_endpoint(&self) -> &'static str {
        match self {
            Self::Commercial => "https://management.azure.com",
            Self::UsGovernment => "https://management.usgovcloudapi.net",
            Self::China => "https://management.chinacloudapi.cn",
        }
    }

    #[must_use]
    pub fn graph_endpoint(&self) -> &'static str {
        match self {
            Self::Commercial => "https://graph.microsoft.com",
            Self::UsGovernment => "https://graph.microsoft.us",
            Self::China => "https://microsoftgraph.chinacloudapi.cn",
        }
    }
}

impl FromStr for CloudEnvironment {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "commercial" | "azurecloud" | "public" => Ok(Self::Commercial),
            "usgovernment" | "usgov" | "azureusgovernment" => Ok(Self::UsGovernment),
            "china" | "azurechinacloud" => Ok(Self::China),
            _ => Err(ExportError::Config(format!("Unknown cloud environment: {s}"))),
        }
    }
}

/// Base URLs the engine talks to.
///
/// Derived from the [`CloudEnvironment`] unless overridden (sovereign clouds,
/// private links, tests).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudEndpoints {
    pub login: String,
    pub management: String,
    pub graph: String,
}

impl CloudEndpoints {
    #[must_use]
    pub fn for_environment(environment: CloudEnvironment) -> Self {
        Self {
            login: environment.login_endpoint().to_string(),
            management: environment.management_endpoint().to_string(),
            graph: environment.graph_endpoint().to_string(),
        }
    }

    /// Points every plane at the same base URL.
    #[must_use]
    pub fn uniform(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            login: base.clone(),
            management: base.clone(),
            graph: base,
        }
    }
}

/// Which subscriptions a run traverses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "subscriptionIds", rename_all = "camelCase")]
pub enum SubscriptionScope {
    /// Every subscription the identity can list.
    #[default]
    All,
    /// Only these subscription GUIDs, in this order.
    Explicit(Vec<String>),
}

/// ARM `api-version` per listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiVersions {
    pub subscriptions: String,
    pub resource_groups: String,
    pub resources: String,
    pub role_assignments: String,
}

impl Default for ApiVersions {
    fn default() -> Self {
        Self {
            subscriptions: "2022-12-01".to_string(),
            resource_groups: "2021-04-01".to_string(),
            resources: "2021-04-01".to_string(),
            role_assignments: "2022-04-01".to_string(),
        }
    }
}

/// Service principal used for the client-credentials flow.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportCredentials {
    pub client_id: String,
    pub client_secret: SecretString,
}

impl ExportCredentials {
    /// Loads `XAVYO_EXPORT_CLIENT_ID` and `XAVYO_EXPORT_CLIENT_SECRET`.
    pub fn from_env() -> ExportResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> ExportResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            client_id: required(&lookup, "CLIENT_ID")?,
            client_secret: required(&lookup, "CLIENT_SECRET")?.into(),
        })
    }
}

/// Configuration for one export run.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    /// Directory tenant the run enumerates.
    pub tenant_id: String,

    #[serde(default)]
    pub cloud_environment: CloudEnvironment,

    /// Overrides the endpoints derived from `cloud_environment`.
    #[serde(default)]
    pub endpoints: Option<CloudEndpoints>,

    #[serde(default)]
    pub subscription_scope: SubscriptionScope,

    /// `$top` requested on listing endpoints (default: 200).
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Byte ceiling per sink batch (default: 1 MiB).
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,

    /// Event ceiling per sink batch (default: 500).
    #[serde(default = "default_batch_max_count")]
    pub batch_max_count: usize,

    /// Retries for throttled, failing or rejected calls (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Request ceiling per API audience and for the sink; 0 disables (default: 20).
    #[serde(default = "default_rate_limit_per_second")]
    pub rate_limit_per_second: u32,

    /// Subscription workers running at once (default: 4).
    #[serde(default = "default_max_concurrent_subscriptions")]
    pub max_concurrent_subscriptions: usize,

    /// Credentials expiring within this margin are refreshed (default: 60).
    #[serde(default = "default_token_safety_margin_secs")]
    pub token_safety_margin_secs: u64,

    /// Timeout applied to every HTTP call (default: 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Base backoff delay (default: 1000ms).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap, also caps `Retry-After` (default: 60000ms).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter as a fraction of the delay (default: 0.25).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Look up role-assignment principals in the directory (default: true).
    #[serde(default = "default_resolve_principals")]
    pub resolve_principals: bool,

    #[serde(default)]
    pub api_versions: ApiVersions,

    /// Ingestion endpoint receiving newline-delimited JSON batches.
    pub sink_url: String,

    /// Value of the `Authorization` header sent to the sink.
    #[serde(default)]
    pub sink_authorization: Option<SecretString>,
}

fn default_page_size() -> u32 {
    200
}

fn default_batch_max_bytes() -> usize {
    1024 * 1024
}

fn default_batch_max_count() -> usize {
    500
}

fn default_max_retries() -> u32 {
    5
}

fn default_rate_limit_per_second() -> u32 {
    20
}

fn default_max_concurrent_subscriptions() -> usize {
    4
}

fn default_token_safety_margin_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter_factor() -> f64 {
    0.25
}

fn default_resolve_principals() -> bool {
    true
}

impl ExportConfig {
    /// Creates a builder with every default applied.
    #[must_use]
    pub fn builder() -> ExportConfigBuilder {
        ExportConfigBuilder::default()
    }

    /// Loads configuration from `XAVYO_EXPORT_*` environment variables.
    ///
    /// Required: `TENANT_ID`, `SINK_URL`.
    /// Optional: `CLOUD`, `SUBSCRIPTIONS` (comma separated, empty means all),
    /// `PAGE_SIZE`, `BATCH_MAX_BYTES`, `BATCH_MAX_COUNT`, `MAX_RETRIES`,
    /// `RATE_LIMIT_PER_SECOND`, `MAX_CONCURRENT_SUBSCRIPTIONS`,
    /// `SINK_AUTHORIZATION`, `RESOLVE_PRINCIPALS`.
    pub fn from_env() -> ExportResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ExportConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> ExportResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder()
            .tenant_id(required(&lookup, "TENANT_ID")?)
            .sink_url(required(&lookup, "SINK_URL")?);

        if let Some(cloud) = optional(&lookup, "CLOUD") {
            builder = builder.cloud_environment(cloud.parse()?);
        }
        if let Some(list) = optional(&lookup, "SUBSCRIPTIONS") {
            let ids: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !ids.is_empty() {
                builder = builder.subscription_scope(SubscriptionScope::Explicit(ids));
            }
        }
        if let Some(v) = parsed(&lookup, "PAGE_SIZE")? {
            builder = builder.page_size(v);
        }
        if let Some(v) = parsed(&lookup, "BATCH_MAX_BYTES")? {
            builder = builder.batch_max_bytes(v);
        }
        if let Some(v) = parsed(&lookup, "BATCH_MAX_COUNT")? {
            builder = builder.batch_max_count(v);
        }
        if let Some(v) = parsed(&lookup, "MAX_RETRIES")? {
            builder = builder.max_retries(v);
        }
        if let Some(v) = parsed(&lookup, "RATE_LIMIT_PER_SECOND")? {
            builder = builder.rate_limit_per_second(v);
        }
        if let Some(v) = parsed(&lookup, "MAX_CONCURRENT_SUBSCRIPTIONS")? {
            builder = builder.max_concurrent_subscriptions(v);
        }
        if let Some(v) = parsed(&lookup, "RESOLVE_PRINCIPALS")? {
            builder = builder.resolve_principals(v);
        }
        if let Some(auth) = optional(&lookup, "SINK_AUTHORIZATION") {
            builder = builder.sink_authorization(auth);
        }

        builder.build()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ExportResult<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(ExportError::Config("tenant_id is required".to_string()));
        }
        url::Url::parse(&self.sink_url)
            .map_err(|e| ExportError::Config(format!("sink_url is invalid: {e}")))?;
        if self.page_size == 0 {
            return Err(ExportError::Config("page_size must be > 0".to_string()));
        }
        if self.batch_max_bytes == 0 || self.batch_max_count == 0 {
            return Err(ExportError::Config(
                "batch_max_bytes and batch_max_count must be > 0".to_string(),
            ));
        }
        if self.max_concurrent_subscriptions == 0 {
            return Err(ExportError::Config(
                "max_concurrent_subscriptions must be > 0".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ExportError::Config(
                "request_timeout_secs must be > 0".to_string(),
            ));
        }
        if let SubscriptionScope::Explicit(ids) = &self.subscription_scope {
            if ids.is_empty() {
                return Err(ExportError::Config(
                    "explicit subscription scope must list at least one subscription".to_string(),
                ));
            }
        }
        self.backoff_policy().validate().map_err(ExportError::Config)?;
        Ok(())
    }

    /// Endpoints in effect (override or cloud defaults).
    #[must_use]
    pub fn endpoints(&self) -> CloudEndpoints {
        self.endpoints
            .clone()
            .unwrap_or_else(|| CloudEndpoints::for_environment(self.cloud_environment))
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter_factor: self.jitter_factor,
            max_retries: self.max_retries,
        }
    }

    #[must_use]
    pub fn token_safety_margin(&self) -> Duration {
        Duration::from_secs(self.token_safety_margin_secs)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Builder for [`ExportConfig`].
#[derive(Debug, Clone)]
pub struct ExportConfigBuilder {
    config: ExportConfig,
}

impl Default for ExportConfigBuilder {
    fn default() -> Self {
        Self {
            config: ExportConfig {
                tenant_id: String::new(),
                cloud_environment: CloudEnvironment::default(),
                endpoints: None,
                subscription_scope: SubscriptionScope::default(),
                page_size: default_page_size(),
                batch_max_bytes: default_batch_max_bytes(),
                batch_max_count: default_batch_max_count(),
                max_retries: default_max_retries(),
                rate_limit_per_second: default_rate_limit_per_second(),
                max_concurrent_subscriptions: default_max_concurrent_subscriptions(),
                token_safety_margin_secs: default_token_safety_margin_secs(),
                request_timeout_secs: default_request_timeout_secs(),
                base_delay_ms: default_base_delay_ms(),
                max_delay_ms: default_max_delay_ms(),
                jitter_factor: default_jitter_factor(),
                resolve_principals: default_resolve_principals(),
                api_versions: ApiVersions::default(),
                sink_url: String::new(),
                sink_authorization: None,
            },
        }
    }
}

impl ExportConfigBuilder {
    #[must_use]
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.config.tenant_id = tenant_id.into();
        self
    }

    #[must_use]
    pub fn cloud_environment(mut self, environment: CloudEnvironment) -> Self {
        self.config.cloud_environment = environment;
        self
    }

    #[must_use]
    pub fn endpoints(mut self, endpoints: CloudEndpoints) -> Self {
        self.config.endpoints = Some(endpoints);
        self
    }

    #[must_use]
    pub fn subscription_scope(mut self, scope: SubscriptionScope) -> Self {
        self.config.subscription_scope = scope;
        self
    }

    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.config.page_size = page_size;
        self
    }

    #[must_use]
    pub fn batch_max_bytes(mut self, bytes: usize) -> Self {
        self.config.batch_max_bytes = bytes;
        self
    }

    #[must_use]
    pub fn batch_max_count(mut self, count: usize) -> Self {
        self.config.batch_max_count = count;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    #[must_use]
    pub fn rate_limit_per_second(mut self, rate: u32) -> Self {
        self.config.rate_limit_per_second = rate;
        self
    }

    #[must_use]
    pub fn max_concurrent_subscriptions(mut self, workers: usize) -> Self {
        self.config.max_concurrent_subscriptions = workers;
        self
    }

    #[must_use]
    pub fn token_safety_margin_secs(mut self, secs: u64) -> Self {
        self.config.token_safety_margin_secs = secs;
        self
    }

    #[must_use]
    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    /// Applies all backoff settings at once.
    #[must_use]
    pub fn backoff(mut self, policy: &BackoffPolicy) -> Self {
        self.config.base_delay_ms = policy.base_delay_ms;
        self.config.max_delay_ms = policy.max_delay_ms;
        self.config.jitter_factor = policy.jitter_factor;
        self.config.max_retries = policy.max_retries;
        self
    }

    #[must_use]
    pub fn resolve_principals(mut self, resolve: bool) -> Self {
        self.config.resolve_principals = resolve;
        self
    }

    #[must_use]
    pub fn api_versions(mut self, versions: ApiVersions) -> Self {
        self.config.api_versions = versions;
        self
    }

    #[must_use]
    pub fn sink_url(mut self, url: impl Into<String>) -> Self {
        self.config.sink_url = url.into();
        self
    }

    #[must_use]
    pub fn sink_authorization(mut self, value: impl Into<String>) -> Self {
        self.config.sink_authorization = Some(value.into().into());
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> ExportResult<ExportConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn optional<F>(lookup: &F, suffix: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(&format!("{ENV_PREFIX}{suffix}"))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required<F>(lookup: &F, suffix: &str) -> ExportResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    optional(lookup, suffix)
        .ok_or_else(|| ExportError::Config(format!("{ENV_PREFIX}{suffix} is required")))
}

fn parsed<F, T>(lookup: &F, suffix: &str) -> ExportResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional(lookup, suffix)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| {
                ExportError::Config(format!("{ENV_PREFIX}{suffix} is invalid: {e}"))
            })
        })
        .transpose()
}
