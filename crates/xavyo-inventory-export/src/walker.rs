//! Subscription traversal.
//!
//! Each subscription is walked with an explicit worklist: resource groups
//! first, then the resources of every group. Role assignments are listed
//! concurrently on a second branch. Nodes and scoped errors are forwarded
//! to the consumer as they are discovered.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::auth::Audience;
use crate::config::{ApiVersions, SubscriptionScope};
use crate::error::{ExportError, ExportResult};
use crate::fetcher::PagedFetcher;
use crate::model::{role_assignment_principal_id, HierarchyNode, PrincipalRef};
use crate::principal::PrincipalResolver;
use crate::result::{ErrorScope, RunError, SubscriptionOutcome, SubscriptionStatus};

/// Message sent from a subscription worker to the run consumer.
#[derive(Debug)]
pub enum WalkMessage {
    Node(HierarchyNode),
    Error(RunError),
}

/// Root subscriptions a run will traverse.
#[derive(Debug, Default)]
pub struct SubscriptionListing {
    /// Subscriptions in listing order.
    pub subscriptions: Vec<HierarchyNode>,
    /// Explicitly requested subscriptions that could not be looked up.
    pub unavailable: Vec<String>,
    pub errors: Vec<RunError>,
    /// Cancellation cut the listing short.
    pub cancelled: bool,
}

#[derive(Debug)]
enum WorkItem {
    ListResourceGroups,
    ListResources { group_id: String, group_name: String },
}

#[derive(Debug, Default)]
struct BranchOutcome {
    nodes: u64,
    failed: bool,
    cancelled: bool,
}

impl BranchOutcome {
    fn merge(self, other: BranchOutcome) -> BranchOutcome {
        BranchOutcome {
            nodes: self.nodes + other.nodes,
            failed: self.failed || other.failed,
            cancelled: self.cancelled || other.cancelled,
        }
    }
}

/// Walks the management hierarchy below subscriptions.
#[derive(Debug, Clone)]
pub struct HierarchyWalker {
    fetcher: Arc<PagedFetcher>,
    management_endpoint: String,
    graph_endpoint: String,
    api_versions: ApiVersions,
    page_size: u32,
    resolve_principals: bool,
    cancel: CancellationToken,
}

impl HierarchyWalker {
    #[must_use]
    pub fn new(
        fetcher: Arc<PagedFetcher>,
        management_endpoint: &str,
        graph_endpoint: &str,
        api_versions: ApiVersions,
        page_size: u32,
        resolve_principals: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            management_endpoint: management_endpoint.to_string(),
            graph_endpoint: graph_endpoint.to_string(),
            api_versions,
            page_size,
            resolve_principals,
            cancel,
        }
    }

    /// Lists the root subscriptions for a run.
    ///
    /// A failed full listing is recorded and yields no subscriptions. With an
    /// explicit scope each id is looked up on its own; failures skip only
    /// that subscription.
    #[instrument(skip(self, scope))]
    pub async fn list_subscriptions(&self, scope: &SubscriptionScope) -> SubscriptionListing {
        let mut listing = SubscriptionListing::default();

        match scope {
            SubscriptionScope::All => {
                let url = self.arm_url(&["subscriptions"], &self.api_versions.subscriptions);
                let url = match url {
                    Ok(url) => url,
                    Err(e) => {
                        listing.errors.push(RunError::fetch(ErrorScope::Run, &e));
                        return listing;
                    }
                };
                let mut records = Box::pin(self.fetcher.fetch(
                    url,
                    Audience::ResourceManager,
                    self.page_size,
                ));
                while let Some(record) = records.next().await {
                    match record {
                        Ok(raw) => listing.subscriptions.push(HierarchyNode::subscription(raw)),
                        Err(ExportError::Cancelled { .. }) => {
                            info!("Cancelled during subscription listing");
                            listing.cancelled = true;
                        }
                        Err(e) => {
                            warn!(error = %e, "Subscription listing failed");
                            listing.errors.push(RunError::fetch(
                                ErrorScope::Listing("/subscriptions".to_string()),
                                &e,
                            ));
                            listing.subscriptions.clear();
                        }
                    }
                }
            }
            SubscriptionScope::Explicit(ids) => {
                for id in ids {
                    if self.cancel.is_cancelled() {
                        listing.cancelled = true;
                        listing.unavailable.push(id.clone());
                        continue;
                    }
                    let url = self.arm_url(
                        &["subscriptions", id.as_str()],
                        &self.api_versions.subscriptions,
                    );
                    let lookup = match url {
                        Ok(url) => self.fetcher.get_json(&url, Audience::ResourceManager).await,
                        Err(e) => Err(e),
                    };
                    match lookup {
                        Ok(raw) => listing.subscriptions.push(HierarchyNode::subscription(raw)),
                        Err(ExportError::Cancelled { .. }) => {
                            listing.cancelled = true;
                            listing.unavailable.push(id.clone());
                        }
                        Err(e) => {
                            warn!(subscription_id = %id, error = %e, "Subscription lookup failed");
                            listing
                                .errors
                                .push(RunError::fetch(ErrorScope::Subscription(id.clone()), &e));
                            listing.unavailable.push(id.clone());
                        }
                    }
                }
            }
        }

        info!(count = listing.subscriptions.len(), "Listed subscriptions");
        listing
    }

    /// Traverses one subscription, forwarding its nodes over `tx`.
    ///
    /// The subscription node itself is sent first. Fetch failures are sent
    /// as errors scoped to the failed listing and mark the outcome `Failed`;
    /// the remaining work items are still attempted.
    pub async fn walk_subscription(
        &self,
        subscription: HierarchyNode,
        tx: &mpsc::Sender<WalkMessage>,
    ) -> SubscriptionOutcome {
        let guid = subscription.subscription_guid();
        let subscription_id = subscription
            .id
            .clone()
            .or_else(|| guid.as_ref().map(|g| format!("/subscriptions/{g}")));

        let Some((guid, subscription_id)) = guid.zip(subscription_id) else {
            // still forwarded so normalization records the malformed record
            let _ = tx.send(WalkMessage::Node(subscription)).await;
            return SubscriptionOutcome {
                subscription_id: String::new(),
                status: SubscriptionStatus::Failed,
                nodes: 1,
            };
        };

        self.walk(&guid, &subscription_id, subscription, tx).await
    }

    #[instrument(
        skip(self, subscription_id, subscription, tx),
        fields(subscription_id = %subscription_id)
    )]
    async fn walk(
        &self,
        guid: &str,
        subscription_id: &str,
        subscription: HierarchyNode,
        tx: &mpsc::Sender<WalkMessage>,
    ) -> SubscriptionOutcome {
        info!("Walking subscription");

        if tx.send(WalkMessage::Node(subscription)).await.is_err() {
            return SubscriptionOutcome {
                subscription_id: subscription_id.to_string(),
                status: SubscriptionStatus::Cancelled,
                nodes: 1,
            };
        }

        let (resources, roles) = tokio::join!(
            self.walk_resources(guid, subscription_id, tx),
            self.walk_role_assignments(guid, subscription_id, tx),
        );
        let outcome = resources.merge(roles);

        let status = if outcome.cancelled {
            SubscriptionStatus::Cancelled
        } else if outcome.failed {
            SubscriptionStatus::Failed
        } else {
            SubscriptionStatus::Done
        };
        info!(status = ?status, nodes = outcome.nodes + 1, "Subscription finished");

        SubscriptionOutcome {
            subscription_id: subscription_id.to_string(),
            status,
            nodes: outcome.nodes + 1,
        }
    }

    async fn walk_resources(
        &self,
        guid: &str,
        subscription_id: &str,
        tx: &mpsc::Sender<WalkMessage>,
    ) -> BranchOutcome {
        let mut outcome = BranchOutcome::default();
        let mut worklist = VecDeque::from([WorkItem::ListResourceGroups]);

        while let Some(item) = worklist.pop_front() {
            if self.cancel.is_cancelled() {
                debug!(pending = worklist.len() + 1, "Cancelled, abandoning worklist");
                outcome.cancelled = true;
                break;
            }

            let (url, scope) = match &item {
                WorkItem::ListResourceGroups => (
                    self.arm_url(
                        &["subscriptions", guid, "resourcegroups"],
                        &self.api_versions.resource_groups,
                    ),
                    format!("{subscription_id}/resourceGroups"),
                ),
                WorkItem::ListResources {
                    group_id,
                    group_name,
                } => (
                    self.arm_url(
                        &[
                            "subscriptions",
                            guid,
                            "resourceGroups",
                            group_name,
                            "resources",
                        ],
                        &self.api_versions.resources,
                    ),
                    format!("{group_id}/resources"),
                ),
            };

            let url = match url {
                Ok(url) => url,
                Err(e) => {
                    outcome.failed = true;
                    if !self.report(tx, ErrorScope::Listing(scope), &e).await {
                        outcome.cancelled = true;
                        break;
                    }
                    continue;
                }
            };

            let mut records = Box::pin(self.fetcher.fetch(
                url,
                Audience::ResourceManager,
                self.page_size,
            ));
            while let Some(record) = records.next().await {
                let delivered = match record {
                    Ok(raw) => {
                        let node = match &item {
                            WorkItem::ListResourceGroups => {
                                let node = HierarchyNode::resource_group(subscription_id, raw);
                                if let (Some(group_id), Some(group_name)) =
                                    (node.id.clone(), node.name())
                                {
                                    worklist.push_back(WorkItem::ListResources {
                                        group_id,
                                        group_name,
                                    });
                                }
                                node
                            }
                            WorkItem::ListResources { group_id, .. } => {
                                HierarchyNode::resource(group_id, raw)
                            }
                        };
                        outcome.nodes += 1;
                        tx.send(WalkMessage::Node(node)).await.is_ok()
                    }
                    Err(ExportError::Cancelled { .. }) => {
                        debug!(pending = worklist.len(), "Cancelled, abandoning listing");
                        outcome.cancelled = true;
                        return outcome;
                    }
                    Err(e) => {
                        outcome.failed = true;
                        self.report(tx, ErrorScope::Listing(scope.clone()), &e)
                            .await
                    }
                };
                if !delivered {
                    outcome.cancelled = true;
                    return outcome;
                }
            }
        }

        outcome
    }

    async fn walk_role_assignments(
        &self,
        guid: &str,
        subscription_id: &str,
        tx: &mpsc::Sender<WalkMessage>,
    ) -> BranchOutcome {
        let mut outcome = BranchOutcome::default();
        if self.cancel.is_cancelled() {
            outcome.cancelled = true;
            return outcome;
        }

        let scope = format!("{subscription_id}/providers/Microsoft.Authorization/roleAssignments");
        let url = match self.arm_url(
            &[
                "subscriptions",
                guid,
                "providers",
                "Microsoft.Authorization",
                "roleAssignments",
            ],
            &self.api_versions.role_assignments,
        ) {
            Ok(url) => url,
            Err(e) => {
                outcome.failed = true;
                self.report(tx, ErrorScope::Listing(scope), &e).await;
                return outcome;
            }
        };

        let mut principals = PrincipalResolver::new(
            Arc::clone(&self.fetcher),
            &self.graph_endpoint,
            self.resolve_principals,
        );

        let mut records = Box::pin(self.fetcher.fetch(
            url,
            Audience::ResourceManager,
            self.page_size,
        ));
        while let Some(record) = records.next().await {
            let delivered = match record {
                Ok(raw) => {
                    let principal = self.principal_for(&mut principals, &raw).await;
                    let node = HierarchyNode::role_assignment(subscription_id, raw, principal);
                    outcome.nodes += 1;
                    tx.send(WalkMessage::Node(node)).await.is_ok()
                }
                Err(ExportError::Cancelled { .. }) => {
                    debug!("Cancelled, abandoning role assignment listing");
                    outcome.cancelled = true;
                    break;
                }
                Err(e) => {
                    outcome.failed = true;
                    self.report(tx, ErrorScope::Listing(scope.clone()), &e)
                        .await
                }
            };
            if !delivered {
                outcome.cancelled = true;
                break;
            }
        }

        outcome
    }

    async fn principal_for(
        &self,
        principals: &mut PrincipalResolver,
        raw: &Value,
    ) -> Option<PrincipalRef> {
        let principal_id = role_assignment_principal_id(raw)?;
        Some(principals.resolve(principal_id).await)
    }

    /// Forwards a scoped fetch error. Returns false once the consumer is gone.
    async fn report(
        &self,
        tx: &mpsc::Sender<WalkMessage>,
        scope: ErrorScope,
        error: &ExportError,
    ) -> bool {
        warn!(scope = ?scope, error = %error, "Listing failed");
        tx.send(WalkMessage::Error(RunError::fetch(scope, error)))
            .await
            .is_ok()
    }

    fn arm_url(&self, segments: &[&str], api_version: &str) -> ExportResult<Url> {
        let mut url = Url::parse(&self.management_endpoint)?;
        url.path_segments_mut()
            .map_err(|()| {
                ExportError::Config(format!(
                    "management endpoint cannot be a base URL: {}",
                    self.management_endpoint
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut().append_pair("api-version", api_version);
        Ok(url)
    }
}
