//! Azure inventory export for xavyo
//!
//! This crate enumerates the management hierarchy of an Azure tenant
//! (subscriptions, resource groups, resources and role assignments) and
//! streams it as normalized events to an ingestion endpoint in
//! newline-delimited JSON batches.
//!
//! # Features
//!
//! - `OAuth2` client credentials authentication with per-audience token caching
//! - Paginated ARM and Graph listing with throttling and retry handling
//! - Bounded concurrent traversal, one worker per subscription
//! - Best-effort principal resolution for role assignments
//! - Size- and count-bounded batching with per-event failure accounting
//! - Cooperative cancellation with partial results
//!
//! # Example
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use xavyo_inventory_export::{ExportConfig, ExportCredentials, RunOrchestrator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ExportConfig::builder()
//!     .tenant_id("your-tenant-id")
//!     .sink_url("https://your-namespace.servicebus.windows.net/inventory/messages")
//!     .sink_authorization("SharedAccessSignature sr=...")
//!     .build()?;
//!
//! let credentials = ExportCredentials {
//!     client_id: "your-client-id".to_string(),
//!     client_secret: "your-client-secret".to_string().into(),
//! };
//!
//! let orchestrator = RunOrchestrator::from_config(config, credentials)?;
//! let result = orchestrator.run(CancellationToken::new()).await?;
//! println!("{} events emitted", result.events_emitted);
//! # Ok(())
//! # }
//! ```

mod auth;
mod config;
mod emitter;
mod error;
mod fetcher;
mod metrics;
mod model;
mod normalize;
mod orchestrator;
mod principal;
mod rate_limit;
mod result;
mod sink;
mod walker;

// Re-exports
pub use auth::{
    AccessToken, Audience, ClientCredentialsProvider, Credential, IdentityProvider, TokenProvider,
};
pub use config::{
    ApiVersions, CloudEndpoints, CloudEnvironment, ExportConfig, ExportConfigBuilder,
    ExportCredentials, SubscriptionScope,
};
pub use emitter::{BatchingEmitter, EmitterStats, FlushOutcome};
pub use error::{EventError, ExportError, ExportResult};
pub use fetcher::{Page, PagedFetcher};
pub use metrics::{ExportMetrics, MetricsSnapshot};
pub use model::{role_assignment_principal_id, ExportEvent, HierarchyNode, NodeKind, PrincipalRef};
pub use normalize::{normalize, normalize_at, Normalized, FALLBACK_SCHEMA_VERSION, SCHEMA_VERSION};
pub use orchestrator::RunOrchestrator;
pub use principal::PrincipalResolver;
pub use rate_limit::{BackoffPolicy, Lane, RateBudget};
pub use result::{
    ErrorScope, RunError, RunErrorKind, RunResult, SubscriptionOutcome, SubscriptionStatus,
};
pub use sink::{EventSink, HttpEventSink, SinkAck, SinkError, NDJSON_CONTENT_TYPE};
pub use walker::{HierarchyWalker, SubscriptionListing, WalkMessage};
