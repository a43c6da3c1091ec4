//! Memory record shape and query filters.

use crate::pipewise::workflow::WorkflowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use uuid::Uuid;

/// Metadata key under which the owning tenant id is stamped.
///
/// Every read surface filters on this key; no record is readable across
/// tenant boundaries.
pub const TENANT_METADATA_KEY: &str = "tenant_id";

/// Metadata key stamped when a volatile record is archived to persistent
/// storage.
pub const ARCHIVED_AT_METADATA_KEY: &str = "archived_at";

/// One unit of agent memory.
///
/// Invariants: `created_at <= updated_at`; when `expires_at` is present it
/// is strictly after `created_at`; `(workflow_id, agent_id)` define the
/// access partition. Volatile records always carry `expires_at`; persistent
/// records never do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub agent_id: String,
    pub workflow_id: WorkflowId,
    /// Free-form JSON object payload.
    pub content: Value,
    pub tags: BTreeSet<String>,
    /// JSON object of ancillary keys; includes [`TENANT_METADATA_KEY`].
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    /// Whether this record is expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }

    /// The tenant id stamped in metadata, if any.
    pub fn tenant_id(&self) -> Option<&str> {
        self.metadata.get(TENANT_METADATA_KEY).and_then(|v| v.as_str())
    }

    /// Read a metadata key.
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

/// Filter set for [`query`](crate::pipewise::memory::VolatileMemoryStore::query)
/// operations on either store.
///
/// All populated filters must match (conjunction). Tags are an intersection
/// requirement: a record matches only if it carries every queried tag.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    pub agent_id: Option<String>,
    pub workflow_id: Option<WorkflowId>,
    pub tags: BTreeSet<String>,
    /// Key that must exist in the record's content object.
    pub content_key: Option<String>,
    /// Metadata keys that must equal the given values.
    pub metadata_equals: Vec<(String, Value)>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl MemoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn content_key(mut self, key: impl Into<String>) -> Self {
        self.content_key = Some(key.into());
        self
    }

    pub fn metadata_eq(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata_equals.push((key.into(), value));
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    /// Restrict the query to records owned by this tenant.
    pub fn tenant(self, tenant_id: impl Into<String>) -> Self {
        self.metadata_eq(TENANT_METADATA_KEY, Value::String(tenant_id.into()))
    }

    /// Whether a record satisfies every populated filter.
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(agent_id) = &self.agent_id {
            if &record.agent_id != agent_id {
                return false;
            }
        }
        if let Some(workflow_id) = &self.workflow_id {
            if &record.workflow_id != workflow_id {
                return false;
            }
        }
        if !self.tags.is_subset(&record.tags) {
            return false;
        }
        if let Some(key) = &self.content_key {
            if record.content.get(key).is_none() {
                return false;
            }
        }
        for (key, expected) in &self.metadata_equals {
            if record.metadata.get(key) != Some(expected) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if record.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if record.created_at > before {
                return false;
            }
        }
        true
    }
}

/// Errors surfaced by memory stores and the manager.
#[derive(Debug)]
pub enum MemoryError {
    /// The record violates a store invariant (e.g. a volatile record
    /// without an expiry).
    InvalidRecord(String),
    /// The persistent backend failed.
    Backend(String),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::InvalidRecord(msg) => write!(f, "invalid memory record: {}", msg),
            MemoryError::Backend(msg) => write!(f, "memory backend failure: {}", msg),
        }
    }
}

impl Error for MemoryError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            id: Uuid::new_v4(),
            agent_id: "lead_qualifier".into(),
            workflow_id: WorkflowId::new(),
            content: json!({"lead_id": "L-001", "score": 0.8}),
            tags: ["lead", "qualification"].iter().map(|s| s.to_string()).collect(),
            metadata: json!({TENANT_METADATA_KEY: "tenant-a"}),
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    #[test]
    fn query_matches_on_tag_intersection() {
        let rec = record();
        assert!(MemoryQuery::new().tag("lead").matches(&rec));
        assert!(MemoryQuery::new().tag("lead").tag("qualification").matches(&rec));
        assert!(!MemoryQuery::new().tag("lead").tag("meeting").matches(&rec));
    }

    #[test]
    fn query_matches_content_key_and_metadata() {
        let rec = record();
        assert!(MemoryQuery::new().content_key("lead_id").matches(&rec));
        assert!(!MemoryQuery::new().content_key("missing").matches(&rec));
        assert!(MemoryQuery::new().tenant("tenant-a").matches(&rec));
        assert!(!MemoryQuery::new().tenant("tenant-b").matches(&rec));
    }

    #[test]
    fn query_matches_created_range() {
        let rec = record();
        let earlier = rec.created_at - chrono::Duration::seconds(10);
        let later = rec.created_at + chrono::Duration::seconds(10);
        assert!(MemoryQuery::new()
            .created_after(earlier)
            .created_before(later)
            .matches(&rec));
        assert!(!MemoryQuery::new().created_after(later).matches(&rec));
    }
}
