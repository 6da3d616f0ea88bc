//! Hierarchy nodes discovered during traversal and the events derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of an entity in the management hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Subscription,
    ResourceGroup,
    Resource,
    RoleAssignment,
}

impl NodeKind {
    /// The `eventType` tag consumers dispatch on.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::ResourceGroup => "resourceGroup",
            Self::Resource => "resource",
            Self::RoleAssignment => "roleAssignment",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Subscription => "subscription",
            Self::ResourceGroup => "resource group",
            Self::Resource => "resource",
            Self::RoleAssignment => "role assignment",
        };
        f.write_str(name)
    }
}

/// Principal referenced by a role assignment.
///
/// Resolution is best effort: when the directory lookup fails or is disabled
/// the reference is carried with `resolved = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalRef {
    pub principal_id: String,
    pub resolved: bool,
    pub display_name: Option<String>,
    pub principal_type: Option<String>,
}

impl PrincipalRef {
    /// A reference that was not (or could not be) looked up.
    #[must_use]
    pub fn unresolved(principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            resolved: false,
            display_name: None,
            principal_type: None,
        }
    }
}

/// One entity discovered during a run.
///
/// `id` is taken from the raw record and may be absent; such nodes are still
/// counted as visited and are rejected during normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct HierarchyNode {
    pub kind: NodeKind,
    pub id: Option<String>,
    pub parent_id: Option<String>,
    pub raw: Value,
    pub principal: Option<PrincipalRef>,
}

impl HierarchyNode {
    fn new(kind: NodeKind, parent_id: Option<&str>, raw: Value) -> Self {
        Self {
            kind,
            id: extract_id(&raw),
            parent_id: parent_id.map(String::from),
            raw,
            principal: None,
        }
    }

    #[must_use]
    pub fn subscription(raw: Value) -> Self {
        Self::new(NodeKind::Subscription, None, raw)
    }

    #[must_use]
    pub fn resource_group(subscription_id: &str, raw: Value) -> Self {
        Self::new(NodeKind::ResourceGroup, Some(subscription_id), raw)
    }

    #[must_use]
    pub fn resource(resource_group_id: &str, raw: Value) -> Self {
        Self::new(NodeKind::Resource, Some(resource_group_id), raw)
    }

    #[must_use]
    pub fn role_assignment(
        subscription_id: &str,
        raw: Value,
        principal: Option<PrincipalRef>,
    ) -> Self {
        let mut node = Self::new(NodeKind::RoleAssignment, Some(subscription_id), raw);
        node.principal = principal;
        node
    }

    /// Bare subscription GUID, from `subscriptionId` or the tail of the ARM id.
    #[must_use]
    pub fn subscription_guid(&self) -> Option<String> {
        self.raw
            .get("subscriptionId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .or_else(|| self.id.as_deref().and_then(last_segment))
    }

    /// Name used to address the node in child listing URLs.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.raw
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .or_else(|| self.id.as_deref().and_then(last_segment))
    }
}

/// Principal id referenced by a raw role-assignment record.
#[must_use]
pub fn role_assignment_principal_id(raw: &Value) -> Option<&str> {
    raw.get("properties")
        .and_then(|p| p.get("principalId"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn extract_id(raw: &Value) -> Option<String> {
    raw.get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn last_segment(id: &str) -> Option<String> {
    id.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Canonical event envelope streamed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEvent {
    pub event_type: String,
    pub source_id: String,
    pub parent_id: Option<String>,
    pub timestamp_utc: DateTime<Utc>,
    pub payload: Value,
}

impl ExportEvent {
    /// Serializes the event as one newline-terminated JSON record.
    pub fn to_ndjson_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extracts_id_and_parent() {
        let node = HierarchyNode::resource_group(
            "/subscriptions/sub-1",
            json!({"id": "/subscriptions/sub-1/resourceGroups/rg-a", "name": "rg-a"}),
        );
        assert_eq!(node.kind, NodeKind::ResourceGroup);
        assert_eq!(
            node.id.as_deref(),
            Some("/subscriptions/sub-1/resourceGroups/rg-a")
        );
        assert_eq!(node.parent_id.as_deref(), Some("/subscriptions/sub-1"));
        assert_eq!(node.name().as_deref(), Some("rg-a"));
    }

    #[test]
    fn test_blank_id_is_absent() {
        let node = HierarchyNode::resource("/rg", json!({"id": "  ", "name": "vm"}));
        assert!(node.id.is_none());
    }

    #[test]
    fn test_subscription_guid_falls_back_to_id() {
        let node = HierarchyNode::subscription(json!({"id": "/subscriptions/abc"}));
        assert_eq!(node.subscription_guid().as_deref(), Some("abc"));

        let node = HierarchyNode::subscription(
            json!({"id": "/subscriptions/abc", "subscriptionId": "def"}),
        );
        assert_eq!(node.subscription_guid().as_deref(), Some("def"));
    }

    #[test]
    fn test_principal_id_lookup() {
        let raw = json!({"properties": {"principalId": "p-1"}});
        assert_eq!(role_assignment_principal_id(&raw), Some("p-1"));
        assert_eq!(role_assignment_principal_id(&json!({})), None);
    }

    #[test]
    fn test_ndjson_line_is_camel_case_and_terminated() {
        let event = ExportEvent {
            event_type: "resource".into(),
            source_id: "/r/1".into(),
            parent_id: None,
            timestamp_utc: Utc::now(),
            payload: json!({"name": "vm"}),
        };
        let line = event.to_ndjson_line().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        let text = String::from_utf8(line).unwrap();
        assert!(text.contains("\"eventType\":\"resource\""));
        assert!(text.contains("\"sourceId\""));
        assert!(text.contains("\"timestampUtc\""));
    }
}
