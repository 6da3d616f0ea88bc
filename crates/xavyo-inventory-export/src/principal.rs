//! Directory lookups for role-assignment principals.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::auth::Audience;
use crate::fetcher::PagedFetcher;
use crate::model::PrincipalRef;

const GRAPH_TYPE_PREFIX: &str = "#microsoft.graph.";

/// Best-effort principal resolver owned by one subscription worker.
///
/// Lookups never fail and are never retried: anything other than a
/// directory object comes back as an unresolved reference. Results,
/// including misses, are cached.
pub struct PrincipalResolver {
    fetcher: Arc<PagedFetcher>,
    graph_endpoint: String,
    enabled: bool,
    cache: HashMap<String, PrincipalRef>,
}

impl PrincipalResolver {
    #[must_use]
    pub fn new(fetcher: Arc<PagedFetcher>, graph_endpoint: &str, enabled: bool) -> Self {
        Self {
            fetcher,
            graph_endpoint: graph_endpoint.trim_end_matches('/').to_string(),
            enabled,
            cache: HashMap::new(),
        }
    }

    pub async fn resolve(&mut self, principal_id: &str) -> PrincipalRef {
        if !self.enabled {
            return PrincipalRef::unresolved(principal_id);
        }
        if let Some(cached) = self.cache.get(principal_id) {
            return cached.clone();
        }

        let resolved = self.lookup(principal_id).await;
        self.cache.insert(principal_id.to_string(), resolved.clone());
        resolved
    }

    async fn lookup(&self, principal_id: &str) -> PrincipalRef {
        let url = match self.directory_object_url(principal_id) {
            Ok(url) => url,
            Err(e) => {
                debug!(principal_id, error = %e, "Cannot build directory lookup URL");
                return PrincipalRef::unresolved(principal_id);
            }
        };

        // single attempt: throttling leaves the principal unresolved
        match self.fetcher.get_json_once(&url, Audience::Graph).await {
            Ok(object) => from_directory_object(principal_id, &object),
            Err(e) => {
                debug!(principal_id, error = %e, "Principal lookup failed, leaving unresolved");
                PrincipalRef::unresolved(principal_id)
            }
        }
    }

    fn directory_object_url(&self, principal_id: &str) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.graph_endpoint)?;
        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(["v1.0", "directoryObjects", principal_id]);
        url.query_pairs_mut()
            .append_pair("$select", "id,displayName,@odata.type");
        Ok(url)
    }
}

fn from_directory_object(principal_id: &str, object: &Value) -> PrincipalRef {
    let display_name = object
        .get("displayName")
        .and_then(Value::as_str)
        .map(String::from);
    let principal_type = object
        .get("@odata.type")
        .and_then(Value::as_str)
        .map(|t| t.strip_prefix(GRAPH_TYPE_PREFIX).unwrap_or(t).to_string());

    PrincipalRef {
        principal_id: principal_id.to_string(),
        resolved: true,
        display_name,
        principal_type,
    }
}
