//! The knowledge-graph interface, consumed only (spec.md §6): `KGQuery(cypher,
//! params) -> rows`. The core never inspects rows beyond field-name lookup,
//! and never implements this trait — only `SessionManager`/`SessionBridge`
//! consume an `Arc<dyn KnowledgeGraph>` when one is configured.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// One result row from a [`KnowledgeGraph`] query: an opaque field map.
pub type KgRow = HashMap<String, Value>;

/// Errors surfaced by a knowledge-graph backend. Deliberately thin: the core
/// treats the KG as a black box and only needs to know "it failed".
#[derive(Debug, Clone, thiserror::Error)]
#[error("knowledge graph query failed: {0}")]
pub struct KgError(pub String);

/// An opaque, cypher-shaped query surface over a knowledge graph.
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    async fn query(&self, cypher: &str, params: HashMap<String, Value>) -> Result<Vec<KgRow>, KgError>;
}

/// Append `session_id` to an entity's `metadata.sessions`, keeping only the
/// last `keep` anchors. Grounded on spec.md §4.5's checkpoint anchor-write
/// clause; expressed as a cypher template so the actual graph schema stays
/// opaque to this crate.
pub async fn anchor_checkpoint(
    kg: &dyn KnowledgeGraph,
    entity_id: &str,
    session_id: &str,
    keep: usize,
) -> Result<(), KgError> {
    let mut params = HashMap::new();
    params.insert("entityId".to_string(), Value::String(entity_id.to_string()));
    params.insert("sessionId".to_string(), Value::String(session_id.to_string()));
    params.insert("keep".to_string(), Value::from(keep));
    kg.query(
        "MATCH (e {id: $entityId}) \
         SET e.metadata_sessions = ([$sessionId] + coalesce(e.metadata_sessions, []))[0..$keep] \
         RETURN e",
        params,
    )
    .await?;
    Ok(())
}
