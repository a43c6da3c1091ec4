//! Persistent memory backend seam.
//!
//! The durable store is an external collaborator (a table with GIN-style
//! indices on tags, content, and metadata); the runtime only depends on the
//! [`PersistentMemoryBackend`] trait. [`InMemoryPersistentBackend`] is the
//! crate-shipped implementation used by tests and by deployments that have
//! not wired a database yet. It answers the same query surface by scanning
//! under a read-write lock.

use crate::pipewise::memory::record::{MemoryError, MemoryQuery, MemoryRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Durable, multi-tenant record storage.
///
/// Implementations must be safe for concurrent readers and writers and must
/// upsert on `save` (last-writer-wins by record id).
#[async_trait]
pub trait PersistentMemoryBackend: Send + Sync {
    async fn save(&self, record: MemoryRecord) -> Result<(), MemoryError>;

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>, MemoryError>;

    /// Records matching every populated filter, most recent first.
    async fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryRecord>, MemoryError>;

    /// Returns whether the record existed.
    async fn delete(&self, id: Uuid) -> Result<bool, MemoryError>;
}

/// Map-backed [`PersistentMemoryBackend`].
#[derive(Default)]
pub struct InMemoryPersistentBackend {
    records: RwLock<HashMap<Uuid, MemoryRecord>>,
}

impl InMemoryPersistentBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl PersistentMemoryBackend for InMemoryPersistentBackend {
    async fn save(&self, record: MemoryRecord) -> Result<(), MemoryError> {
        if record.expires_at.is_some() {
            return Err(MemoryError::InvalidRecord(
                "persistent records must not carry an expiry".into(),
            ));
        }
        self.records.write().await.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>, MemoryError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryRecord>, MemoryError> {
        let records = self.records.read().await;
        let mut matches: Vec<MemoryRecord> = records
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matches)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, MemoryError> {
        Ok(self.records.write().await.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipewise::memory::record::TENANT_METADATA_KEY;
    use crate::pipewise::workflow::WorkflowId;
    use chrono::Utc;
    use serde_json::json;

    fn record(tenant: &str) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            id: Uuid::new_v4(),
            agent_id: "coordinator".into(),
            workflow_id: WorkflowId::new(),
            content: json!({"lead_id": "L-001"}),
            tags: std::iter::once("lead".to_string()).collect(),
            metadata: json!({ TENANT_METADATA_KEY: tenant }),
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn save_get_roundtrip_preserves_content() {
        let backend = InMemoryPersistentBackend::new();
        let rec = record("tenant-a");
        backend.save(rec.clone()).await.unwrap();

        let fetched = backend.get(rec.id).await.unwrap().unwrap();
        assert_eq!(fetched.content, rec.content);
        assert_eq!(fetched.tags, rec.tags);
        assert_eq!(fetched.metadata, rec.metadata);
    }

    #[tokio::test]
    async fn expiring_record_is_rejected() {
        let backend = InMemoryPersistentBackend::new();
        let mut rec = record("tenant-a");
        rec.expires_at = Some(Utc::now() + chrono::Duration::seconds(60));
        assert!(matches!(
            backend.save(rec).await,
            Err(MemoryError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn query_filters_by_tenant_metadata() {
        let backend = InMemoryPersistentBackend::new();
        backend.save(record("tenant-a")).await.unwrap();
        backend.save(record("tenant-b")).await.unwrap();

        let scoped = backend
            .query(&MemoryQuery::new().tenant("tenant-a"))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].tenant_id(), Some("tenant-a"));
    }
}
