//! Volatile workflow memory.
//!
//! An in-process, TTL-bounded store keyed by record id with secondary
//! indices on `(workflow_id)`, `(agent_id, workflow_id)`, and tags, plus a
//! time-ordered expiry index that lets the sweeper evict in batches without
//! scanning every record. A single lock guards the record map and all
//! indices; the sweeper acquires the same lock briefly per pass.
//!
//! Reads transparently skip expired records even when the sweeper has not
//! run yet: expiry is a property of the read, eviction is an optimization.

use crate::pipewise::clock::Clock;
use crate::pipewise::memory::record::{MemoryError, MemoryQuery, MemoryRecord};
use crate::pipewise::workflow::WorkflowId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct Indexed {
    records: HashMap<Uuid, MemoryRecord>,
    by_workflow: HashMap<WorkflowId, HashSet<Uuid>>,
    by_agent_workflow: HashMap<(String, WorkflowId), HashSet<Uuid>>,
    by_tag: HashMap<String, HashSet<Uuid>>,
    // Expiry instant -> record ids expiring at that instant.
    expiry: BTreeMap<DateTime<Utc>, Vec<Uuid>>,
}

impl Indexed {
    fn index(&mut self, record: &MemoryRecord) {
        self.by_workflow
            .entry(record.workflow_id)
            .or_default()
            .insert(record.id);
        self.by_agent_workflow
            .entry((record.agent_id.clone(), record.workflow_id))
            .or_default()
            .insert(record.id);
        for tag in &record.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(record.id);
        }
        if let Some(expires_at) = record.expires_at {
            self.expiry.entry(expires_at).or_default().push(record.id);
        }
    }

    fn unindex(&mut self, record: &MemoryRecord) {
        if let Some(set) = self.by_workflow.get_mut(&record.workflow_id) {
            set.remove(&record.id);
            if set.is_empty() {
                self.by_workflow.remove(&record.workflow_id);
            }
        }
        let agent_key = (record.agent_id.clone(), record.workflow_id);
        if let Some(set) = self.by_agent_workflow.get_mut(&agent_key) {
            set.remove(&record.id);
            if set.is_empty() {
                self.by_agent_workflow.remove(&agent_key);
            }
        }
        for tag in &record.tags {
            if let Some(set) = self.by_tag.get_mut(tag) {
                set.remove(&record.id);
                if set.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        if let Some(expires_at) = record.expires_at {
            if let Some(ids) = self.expiry.get_mut(&expires_at) {
                ids.retain(|id| *id != record.id);
                if ids.is_empty() {
                    self.expiry.remove(&expires_at);
                }
            }
        }
    }

    /// Narrowest candidate id set for a query, falling back to a full scan.
    fn candidates(&self, query: &MemoryQuery) -> Vec<Uuid> {
        if let (Some(agent_id), Some(workflow_id)) = (&query.agent_id, &query.workflow_id) {
            return self
                .by_agent_workflow
                .get(&(agent_id.clone(), *workflow_id))
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
        }
        if let Some(workflow_id) = &query.workflow_id {
            return self
                .by_workflow
                .get(workflow_id)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
        }
        if let Some(tag) = query.tags.iter().next() {
            return self
                .by_tag
                .get(tag)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
        }
        self.records.keys().copied().collect()
    }
}

/// The TTL-bounded in-process store.
pub struct VolatileMemoryStore {
    inner: Mutex<Indexed>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl VolatileMemoryStore {
    /// Create a store with the given clock and default record TTL.
    pub fn new(clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Indexed::default()),
            clock,
            default_ttl,
        }
    }

    /// The TTL applied when a save does not specify one.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Insert or update a record.
    ///
    /// Volatile records must carry an expiry; saves without one get
    /// `now + default_ttl`. Updates are last-writer-wins on content, with
    /// `updated_at` kept strictly monotonic even under a frozen clock.
    pub fn save(&self, mut record: MemoryRecord) -> Result<MemoryRecord, MemoryError> {
        let now = self.clock.now();
        if record.expires_at.is_none() {
            record.expires_at = Some(
                now + chrono::Duration::from_std(self.default_ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(3600)),
            );
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at <= record.created_at {
                return Err(MemoryError::InvalidRecord(format!(
                    "expires_at {} is not after created_at {}",
                    expires_at, record.created_at
                )));
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(previous) = inner.records.remove(&record.id) {
            inner.unindex(&previous);
            record.created_at = previous.created_at;
            record.updated_at = if now > previous.updated_at {
                now
            } else {
                previous.updated_at + chrono::Duration::milliseconds(1)
            };
        } else {
            record.updated_at = record.updated_at.max(record.created_at);
        }
        inner.index(&record);
        inner.records.insert(record.id, record.clone());
        Ok(record)
    }

    /// Fetch a record by id. Expired records are never returned.
    pub fn get(&self, id: Uuid) -> Option<MemoryRecord> {
        let now = self.clock.now();
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .get(&id)
            .filter(|record| !record.is_expired(now))
            .cloned()
    }

    /// Query live records matching every populated filter, most recent
    /// first.
    pub fn query(&self, query: &MemoryQuery) -> Vec<MemoryRecord> {
        let now = self.clock.now();
        let inner = self.inner.lock().unwrap();
        let mut matches: Vec<MemoryRecord> = inner
            .candidates(query)
            .into_iter()
            .filter_map(|id| inner.records.get(&id))
            .filter(|record| !record.is_expired(now) && query.matches(record))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matches
    }

    /// Remove a record by id. Returns whether it existed.
    pub fn delete(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.records.remove(&id) {
            Some(record) => {
                inner.unindex(&record);
                true
            }
            None => false,
        }
    }

    /// Evict every record whose expiry has passed. Returns the eviction
    /// count.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let due: Vec<Uuid> = inner
            .expiry
            .range(..=now)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        let mut evicted = 0;
        for id in due {
            if let Some(record) = inner.records.remove(&id) {
                inner.unindex(&record);
                evicted += 1;
            }
        }
        // Entries may remain for ids already deleted through other paths.
        let expired_buckets: Vec<DateTime<Utc>> =
            inner.expiry.range(..=now).map(|(at, _)| *at).collect();
        for at in expired_buckets {
            inner.expiry.remove(&at);
        }
        evicted
    }

    /// Number of live (non-expired) records.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .values()
            .filter(|record| !record.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the background sweeper.
    ///
    /// The task holds only a [`Weak`] reference, so dropping the last
    /// [`Arc`] to the store shuts the sweeper down on its next tick.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store: Weak<VolatileMemoryStore> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.upgrade() {
                    Some(store) => {
                        let evicted = store.cleanup_expired();
                        if evicted > 0 {
                            log::debug!("volatile sweeper evicted {} records", evicted);
                        }
                    }
                    None => break,
                }
            }
        })
    }
}
