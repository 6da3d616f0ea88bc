//! Common test utilities for xavyo-inventory-export integration tests.

#![cfg(feature = "integration")]
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use xavyo_inventory_export::{
    AccessToken, Audience, BackoffPolicy, CloudEndpoints, ExportConfig, ExportConfigBuilder,
    ExportError, ExportMetrics, ExportResult, IdentityProvider, PagedFetcher, RateBudget, SinkAck,
    SinkError, TokenProvider,
};

pub const TENANT_ID: &str = "tenant-1";

/// Test data factory for ARM subscriptions.
pub fn create_subscription(guid: &str, name: &str) -> Value {
    json!({
        "id": format!("/subscriptions/{guid}"),
        "subscriptionId": guid,
        "displayName": name,
        "state": "Enabled",
        "tenantId": TENANT_ID
    })
}

/// Test data factory for resource groups.
pub fn create_resource_group(sub: &str, name: &str) -> Value {
    json!({
        "id": format!("/subscriptions/{sub}/resourceGroups/{name}"),
        "name": name,
        "location": "westeurope",
        "properties": {"provisioningState": "Succeeded"}
    })
}

/// Test data factory for resources.
pub fn create_resource(sub: &str, group: &str, name: &str) -> Value {
    json!({
        "id": format!("/subscriptions/{sub}/resourceGroups/{group}/providers/Microsoft.Compute/virtualMachines/{name}"),
        "name": name,
        "type": "Microsoft.Compute/virtualMachines",
        "location": "westeurope",
        "tags": {"owner": "platform"}
    })
}

/// Test data factory for role assignments.
pub fn create_role_assignment(sub: &str, id: &str, principal_id: &str) -> Value {
    json!({
        "id": format!("/subscriptions/{sub}/providers/Microsoft.Authorization/roleAssignments/{id}"),
        "name": id,
        "properties": {
            "roleDefinitionId": format!("/subscriptions/{sub}/providers/Microsoft.Authorization/roleDefinitions/reader"),
            "principalId": principal_id,
            "principalType": "User",
            "scope": format!("/subscriptions/{sub}")
        }
    })
}

/// Wraps items in an ARM list response.
pub fn arm_page(items: Vec<Value>, next_link: Option<&str>) -> Value {
    let mut response = json!({ "value": items });
    if let Some(link) = next_link {
        response["nextLink"] = json!(link);
    }
    response
}

/// Creates an ARM error response.
pub fn create_arm_error(code: &str, message: &str) -> Value {
    json!({
        "error": {
            "code": code,
            "message": message
        }
    })
}

/// Creates a mock OAuth token response.
pub fn create_token_response(access_token: &str, expires_in: u64) -> Value {
    json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": expires_in
    })
}

/// Serves the given responses in order, repeating the last one.
pub struct SequenceResponder {
    responses: Vec<ResponseTemplate>,
    calls: Arc<AtomicU32>,
}

impl SequenceResponder {
    pub fn new(responses: Vec<ResponseTemplate>) -> Self {
        Self {
            responses,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl Respond for SequenceResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let idx = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        self.responses
            .get(idx)
            .or_else(|| self.responses.last())
            .cloned()
            .unwrap_or_else(|| ResponseTemplate::new(200).set_body_json(arm_page(vec![], None)))
    }
}

/// Identity provider issuing `"{audience}-token-{n}"` tokens.
pub struct StaticIdentity {
    pub calls: AtomicU32,
    pub fail_audience: Option<Audience>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_audience: None,
        }
    }

    pub fn failing_for(audience: Audience) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_audience: Some(audience),
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn acquire_token(&self, audience: Audience) -> ExportResult<AccessToken> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_audience == Some(audience) {
            return Err(ExportError::Auth(format!(
                "AADSTS7000215: invalid client secret for {audience}"
            )));
        }
        Ok(AccessToken {
            token: format!("{audience}-token-{n}"),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }
}

/// In-memory sink recording every delivered batch.
///
/// Batches containing any of `reject_sources` fail on every attempt.
#[derive(Default)]
pub struct RecordingSink {
    pub batches: Mutex<Vec<Vec<u8>>>,
    pub attempts: AtomicU32,
    reject_sources: HashSet<String>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(source_ids: &[&str]) -> Self {
        Self {
            reject_sources: source_ids.iter().map(|s| (*s).to_string()).collect(),
            ..Self::default()
        }
    }

    /// Every delivered event, in delivery order.
    pub fn events(&self) -> Vec<Value> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| {
                String::from_utf8(batch.clone())
                    .unwrap()
                    .lines()
                    .map(|line| serde_json::from_str::<Value>(line).unwrap())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|e| e["eventType"] == event_type)
            .collect()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e["sourceId"].as_str().unwrap().to_string())
            .collect()
    }
}

#[async_trait]
impl xavyo_inventory_export::EventSink for RecordingSink {
    async fn send_batch(&self, batch: &[u8]) -> Result<SinkAck, SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let text = String::from_utf8_lossy(batch);
        let rejected = text.lines().any(|line| {
            serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|v| v["sourceId"].as_str().map(String::from))
                .is_some_and(|id| self.reject_sources.contains(&id))
        });
        if rejected {
            return Err(SinkError::Http {
                status: 400,
                body: "rejected".into(),
            });
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(SinkAck { latency_ms: 0 })
    }
}

/// Config builder pointing every endpoint at the mock server.
pub fn test_config_builder(server: &MockServer) -> ExportConfigBuilder {
    ExportConfig::builder()
        .tenant_id(TENANT_ID)
        .endpoints(CloudEndpoints::uniform(&server.uri()))
        .sink_url("http://sink.invalid/ingest")
        .backoff(&BackoffPolicy::for_testing())
        .rate_limit_per_second(0)
        .request_timeout_secs(5)
}

/// Fetcher wired to a fresh token provider and unlimited budget.
pub fn test_fetcher(identity: Arc<dyn IdentityProvider>) -> (PagedFetcher, Arc<ExportMetrics>) {
    let metrics = Arc::new(ExportMetrics::new());
    let tokens = Arc::new(TokenProvider::new(
        identity,
        std::time::Duration::from_secs(60),
        BackoffPolicy::for_testing(),
        metrics.clone(),
    ));
    let fetcher = PagedFetcher::new(
        tokens,
        Arc::new(RateBudget::unlimited()),
        BackoffPolicy::for_testing(),
        metrics.clone(),
        std::time::Duration::from_secs(5),
    )
    .unwrap();
    (fetcher, metrics)
}

/// Mounts a single-page ARM listing at `list_path`.
pub async fn mount_list(server: &MockServer, list_path: &str, items: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path(list_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(arm_page(items, None)))
        .mount(server)
        .await;
}

/// Mounts the subscription listing.
pub async fn mount_subscriptions(server: &MockServer, subscriptions: Vec<Value>) {
    mount_list(server, "/subscriptions", subscriptions).await;
}

/// Mounts resource groups, their resources and role assignments of one subscription.
pub async fn mount_subscription_tree(
    server: &MockServer,
    sub: &str,
    groups: &[(&str, &[&str])],
    role_assignments: Vec<Value>,
) {
    let group_records = groups
        .iter()
        .map(|(name, _)| create_resource_group(sub, name))
        .collect();
    mount_list(
        server,
        &format!("/subscriptions/{sub}/resourcegroups"),
        group_records,
    )
    .await;

    for (group, resources) in groups {
        let records = resources
            .iter()
            .map(|r| create_resource(sub, group, r))
            .collect();
        mount_list(
            server,
            &format!("/subscriptions/{sub}/resourceGroups/{group}/resources"),
            records,
        )
        .await;
    }

    mount_list(
        server,
        &format!("/subscriptions/{sub}/providers/Microsoft.Authorization/roleAssignments"),
        role_assignments,
    )
    .await;
}
