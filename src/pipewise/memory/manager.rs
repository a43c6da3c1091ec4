//! Memory coordination across the volatile and persistent tiers.
//!
//! The [`MemoryManager`] is the single write/read surface the rest of the
//! runtime uses. It stamps tenant ownership into record metadata, performs
//! dual writes (volatile first, so later reads within the same workflow see
//! the record immediately), filters every read by the calling tenant, and
//! archives a workflow's volatile records into the persistent tier when the
//! workflow reaches a terminal status.
//!
//! A persistent write that keeps failing after one retry is logged and
//! swallowed; the archival tier being slow must never fail a live
//! workflow.

use crate::pipewise::clock::Clock;
use crate::pipewise::event::{emit, EventHandler, MemoryTier, WorkflowEvent};
use crate::pipewise::memory::persistent::PersistentMemoryBackend;
use crate::pipewise::memory::record::{
    MemoryError, MemoryQuery, MemoryRecord, ARCHIVED_AT_METADATA_KEY, TENANT_METADATA_KEY,
};
use crate::pipewise::memory::volatile::VolatileMemoryStore;
use crate::pipewise::workflow::{TenantContext, WorkflowId};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Tenant-scoped view over both memory tiers.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    pub volatile: Vec<MemoryRecord>,
    pub persistent: Vec<MemoryRecord>,
}

/// Coordinator for the dual memory subsystem.
pub struct MemoryManager {
    volatile: Arc<VolatileMemoryStore>,
    persistent: Arc<dyn PersistentMemoryBackend>,
    clock: Arc<dyn Clock>,
    events: Option<Arc<dyn EventHandler>>,
}

impl MemoryManager {
    pub fn new(
        volatile: Arc<VolatileMemoryStore>,
        persistent: Arc<dyn PersistentMemoryBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            volatile,
            persistent,
            clock,
            events: None,
        }
    }

    /// Attach a telemetry handler (builder pattern).
    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Borrow the volatile tier.
    pub fn volatile(&self) -> &Arc<VolatileMemoryStore> {
        &self.volatile
    }

    /// Borrow the persistent backend.
    pub fn persistent(&self) -> &Arc<dyn PersistentMemoryBackend> {
        &self.persistent
    }

    fn build_record(
        &self,
        agent_id: &str,
        workflow_id: WorkflowId,
        tenant: &TenantContext,
        content: Value,
        tags: &[&str],
        metadata: Value,
    ) -> Result<MemoryRecord, MemoryError> {
        if !content.is_object() {
            return Err(MemoryError::InvalidRecord(
                "record content must be a JSON object".into(),
            ));
        }
        let mut metadata = match metadata {
            Value::Null => json!({}),
            object @ Value::Object(_) => object,
            _ => {
                return Err(MemoryError::InvalidRecord(
                    "record metadata must be a JSON object".into(),
                ))
            }
        };
        metadata[TENANT_METADATA_KEY] = Value::String(tenant.tenant_id.clone());

        let now = self.clock.now();
        Ok(MemoryRecord {
            id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            workflow_id,
            content,
            tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            metadata,
            created_at: now,
            updated_at: now,
            expires_at: None,
        })
    }

    async fn emit_saved(&self, record: &MemoryRecord, tier: MemoryTier) {
        emit(
            &self.events,
            WorkflowEvent::MemoryRecordSaved {
                workflow_id: record.workflow_id,
                agent_id: record.agent_id.clone(),
                tier,
                record_id: record.id,
            },
        )
        .await;
    }

    /// Save a record to the volatile tier with an optional explicit TTL.
    pub async fn save_volatile(
        &self,
        agent_id: &str,
        workflow_id: WorkflowId,
        tenant: &TenantContext,
        content: Value,
        tags: &[&str],
        metadata: Value,
        ttl: Option<Duration>,
    ) -> Result<MemoryRecord, MemoryError> {
        let mut record =
            self.build_record(agent_id, workflow_id, tenant, content, tags, metadata)?;
        if let Some(ttl) = ttl {
            let ttl = chrono::Duration::from_std(ttl)
                .map_err(|e| MemoryError::InvalidRecord(format!("ttl out of range: {}", e)))?;
            record.expires_at = Some(record.created_at + ttl);
        }
        let saved = self.volatile.save(record)?;
        self.emit_saved(&saved, MemoryTier::Volatile).await;
        Ok(saved)
    }

    /// Save a record to the persistent tier.
    pub async fn save_persistent(
        &self,
        agent_id: &str,
        workflow_id: WorkflowId,
        tenant: &TenantContext,
        content: Value,
        tags: &[&str],
        metadata: Value,
    ) -> Result<MemoryRecord, MemoryError> {
        let record = self.build_record(agent_id, workflow_id, tenant, content, tags, metadata)?;
        self.persistent.save(record.clone()).await?;
        self.emit_saved(&record, MemoryTier::Persistent).await;
        Ok(record)
    }

    /// Save to both tiers: volatile first, then persistent.
    ///
    /// The persistent copy shares the volatile record's id (with the expiry
    /// stripped) so archival upserts stay idempotent. A persistent failure
    /// is retried once, then logged and swallowed; the returned flag tells
    /// the caller whether the durable copy landed.
    pub async fn save_both(
        &self,
        agent_id: &str,
        workflow_id: WorkflowId,
        tenant: &TenantContext,
        content: Value,
        tags: &[&str],
        metadata: Value,
        ttl: Option<Duration>,
    ) -> Result<(MemoryRecord, bool), MemoryError> {
        let volatile_record = self
            .save_volatile(agent_id, workflow_id, tenant, content, tags, metadata, ttl)
            .await?;

        let mut persistent_record = volatile_record.clone();
        persistent_record.expires_at = None;
        let persisted = self.save_with_retry(persistent_record).await;
        if persisted {
            self.emit_saved(&volatile_record, MemoryTier::Persistent).await;
        }
        Ok((volatile_record, persisted))
    }

    async fn save_with_retry(&self, record: MemoryRecord) -> bool {
        let record_id = record.id;
        match self.persistent.save(record.clone()).await {
            Ok(()) => true,
            Err(first) => match self.persistent.save(record).await {
                Ok(()) => true,
                Err(second) => {
                    log::error!(
                        "persistent write for record {} failed twice ({}; {}), continuing",
                        record_id,
                        first,
                        second
                    );
                    false
                }
            },
        }
    }

    /// Records visible to one agent within one workflow, filtered to the
    /// calling tenant. Expired volatile records are excluded.
    pub async fn agent_context(
        &self,
        agent_id: &str,
        workflow_id: WorkflowId,
        tenant: &TenantContext,
    ) -> Result<ContextSnapshot, MemoryError> {
        let query = MemoryQuery::new()
            .agent(agent_id)
            .workflow(workflow_id)
            .tenant(&tenant.tenant_id);
        Ok(ContextSnapshot {
            volatile: self.volatile.query(&query),
            persistent: self.persistent.query(&query).await?,
        })
    }

    /// Records visible across a whole workflow, filtered to the calling
    /// tenant.
    pub async fn workflow_context(
        &self,
        workflow_id: WorkflowId,
        tenant: &TenantContext,
    ) -> Result<ContextSnapshot, MemoryError> {
        let query = MemoryQuery::new()
            .workflow(workflow_id)
            .tenant(&tenant.tenant_id);
        Ok(ContextSnapshot {
            volatile: self.volatile.query(&query),
            persistent: self.persistent.query(&query).await?,
        })
    }

    /// Copy every volatile record of the workflow into persistent storage
    /// (stamped with `archived_at`), then delete the volatile copies.
    ///
    /// Idempotent: a second call finds nothing left to move. Returns the
    /// number of records archived.
    pub async fn archive(&self, workflow_id: WorkflowId) -> Result<usize, MemoryError> {
        let records = self
            .volatile
            .query(&MemoryQuery::new().workflow(workflow_id));
        let archived_at = self.clock.now();
        let mut archived = 0;

        for record in records {
            let record_id = record.id;
            let mut durable = record;
            durable.expires_at = None;
            durable.metadata[ARCHIVED_AT_METADATA_KEY] =
                Value::String(archived_at.to_rfc3339());
            if self.save_with_retry(durable).await {
                archived += 1;
            }
            self.volatile.delete(record_id);
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipewise::clock::ManualClock;
    use crate::pipewise::memory::persistent::InMemoryPersistentBackend;

    fn manager() -> (Arc<ManualClock>, Arc<InMemoryPersistentBackend>, MemoryManager) {
        let clock = Arc::new(ManualClock::starting_now());
        let volatile = Arc::new(VolatileMemoryStore::new(
            clock.clone(),
            Duration::from_secs(3600),
        ));
        let persistent = Arc::new(InMemoryPersistentBackend::new());
        let mgr = MemoryManager::new(volatile, persistent.clone(), clock.clone());
        (clock, persistent, mgr)
    }

    fn tenant(id: &str) -> TenantContext {
        TenantContext::new(id, "user-1")
    }

    #[tokio::test]
    async fn save_both_lands_in_both_tiers_with_shared_id() {
        let (_clock, persistent, mgr) = manager();
        let workflow = WorkflowId::new();
        let (record, persisted) = mgr
            .save_both(
                "coordinator",
                workflow,
                &tenant("tenant-a"),
                json!({"step": "start"}),
                &["workflow-start"],
                Value::Null,
                None,
            )
            .await
            .unwrap();

        assert!(persisted);
        assert!(record.expires_at.is_some());
        let durable = persistent.get(record.id).await.unwrap().unwrap();
        assert!(durable.expires_at.is_none());
        assert_eq!(durable.content, record.content);
    }

    #[tokio::test]
    async fn context_reads_are_tenant_scoped() {
        let (_clock, _persistent, mgr) = manager();
        let workflow = WorkflowId::new();
        mgr.save_both(
            "coordinator",
            workflow,
            &tenant("tenant-a"),
            json!({"who": "a"}),
            &[],
            Value::Null,
            None,
        )
        .await
        .unwrap();
        mgr.save_both(
            "coordinator",
            workflow,
            &tenant("tenant-b"),
            json!({"who": "b"}),
            &[],
            Value::Null,
            None,
        )
        .await
        .unwrap();

        let snapshot = mgr
            .agent_context("coordinator", workflow, &tenant("tenant-a"))
            .await
            .unwrap();
        assert_eq!(snapshot.volatile.len(), 1);
        assert_eq!(snapshot.persistent.len(), 1);
        assert_eq!(snapshot.volatile[0].content["who"], "a");
    }

    #[tokio::test]
    async fn archive_moves_and_is_idempotent() {
        let (_clock, persistent, mgr) = manager();
        let workflow = WorkflowId::new();
        mgr.save_volatile(
            "scheduler",
            workflow,
            &tenant("tenant-a"),
            json!({"meeting": "m1"}),
            &["meeting_scheduled"],
            Value::Null,
            None,
        )
        .await
        .unwrap();

        let first = mgr.archive(workflow).await.unwrap();
        assert_eq!(first, 1);
        assert!(mgr.volatile().is_empty());
        assert_eq!(persistent.len().await, 1);

        let second = mgr.archive(workflow).await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(persistent.len().await, 1);

        let archived = persistent
            .query(&MemoryQuery::new().workflow(workflow))
            .await
            .unwrap();
        assert!(archived[0]
            .metadata_value(ARCHIVED_AT_METADATA_KEY)
            .is_some());
    }
}
