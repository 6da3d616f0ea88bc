//! Conversion of hierarchy nodes into export events.
//!
//! Normalization is pure: the same node and timestamp always produce the same
//! event. Records of an unexpected shape are not rejected; they are carried
//! verbatim under a fallback schema so downstream consumers still see them.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::error::EventError;
use crate::model::{ExportEvent, HierarchyNode, NodeKind};

pub const SCHEMA_VERSION: &str = "1";
pub const FALLBACK_SCHEMA_VERSION: &str = "fallback-1";

/// A normalized event and whether it used the fallback schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub event: ExportEvent,
    pub fallback: bool,
}

/// Normalizes a node, stamped with the current time.
pub fn normalize(node: &HierarchyNode) -> Result<Normalized, EventError> {
    normalize_at(node, Utc::now())
}

/// Normalizes a node with an explicit timestamp.
pub fn normalize_at(
    node: &HierarchyNode,
    timestamp: DateTime<Utc>,
) -> Result<Normalized, EventError> {
    let source_id = source_id(node).ok_or(EventError::MissingId { kind: node.kind })?;

    let (payload, fallback) = match known_payload(node) {
        Some(payload) => (payload, false),
        None => (
            json!({
                "schemaVersion": FALLBACK_SCHEMA_VERSION,
                "raw": node.raw,
            }),
            true,
        ),
    };

    Ok(Normalized {
        event: ExportEvent {
            event_type: node.kind.event_type().to_string(),
            source_id,
            parent_id: node.parent_id.clone(),
            timestamp_utc: timestamp,
            payload,
        },
        fallback,
    })
}

fn source_id(node: &HierarchyNode) -> Option<String> {
    match (&node.id, node.kind) {
        (Some(id), _) => Some(id.clone()),
        (None, NodeKind::Subscription) => str_field(&node.raw, "subscriptionId")
            .map(|guid| format!("/subscriptions/{guid}")),
        (None, _) => None,
    }
}

fn known_payload(node: &HierarchyNode) -> Option<Value> {
    let raw = &node.raw;
    let mut payload = Map::new();
    payload.insert("schemaVersion".into(), SCHEMA_VERSION.into());

    match node.kind {
        NodeKind::Subscription => {
            let display_name = str_field(raw, "displayName")?;
            let subscription_id = node.subscription_guid()?;
            payload.insert("subscriptionId".into(), subscription_id.into());
            payload.insert("displayName".into(), display_name.into());
            payload.insert("state".into(), opt(raw, &["state"]));
            payload.insert("tenantId".into(), opt(raw, &["tenantId"]));
        }
        NodeKind::ResourceGroup => {
            let name = str_field(raw, "name")?;
            payload.insert("name".into(), name.into());
            payload.insert("location".into(), opt(raw, &["location"]));
            payload.insert(
                "provisioningState".into(),
                opt(raw, &["properties", "provisioningState"]),
            );
            payload.insert("tags".into(), opt(raw, &["tags"]));
        }
        NodeKind::Resource => {
            let name = str_field(raw, "name")?;
            let resource_type = str_field(raw, "type")?;
            payload.insert("name".into(), name.into());
            payload.insert("resourceType".into(), resource_type.into());
            payload.insert("location".into(), opt(raw, &["location"]));
            payload.insert("kind".into(), opt(raw, &["kind"]));
            payload.insert("sku".into(), opt(raw, &["sku"]));
            payload.insert("tags".into(), opt(raw, &["tags"]));
        }
        NodeKind::RoleAssignment => {
            let properties = raw.get("properties")?;
            let role_definition_id = str_field(properties, "roleDefinitionId")?;
            let principal_id = str_field(properties, "principalId")?;
            let principal = node.principal.as_ref();

            let principal_type = principal
                .and_then(|p| p.principal_type.clone())
                .map(Value::String)
                .unwrap_or_else(|| opt(properties, &["principalType"]));

            payload.insert("roleDefinitionId".into(), role_definition_id.into());
            payload.insert("principalId".into(), principal_id.into());
            payload.insert("principalType".into(), principal_type);
            payload.insert(
                "principalResolved".into(),
                principal.is_some_and(|p| p.resolved).into(),
            );
            payload.insert(
                "principalDisplayName".into(),
                principal
                    .and_then(|p| p.display_name.clone())
                    .map_or(Value::Null, Value::String),
            );
            payload.insert("scope".into(), opt(properties, &["scope"]));
        }
    }

    Some(Value::Object(payload))
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Value at `path`, or null.
fn opt(value: &Value, path: &[&str]) -> Value {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .cloned()
        .unwrap_or(Value::Null)
}
