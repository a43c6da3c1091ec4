//! Dual-memory properties: TTL visibility, tenant isolation, archive
//! idempotence, and round-tripping.

mod common;

use chrono::Duration as ChronoDuration;
use pipewise::pipewise::clock::{Clock, ManualClock};
use pipewise::pipewise::memory::{
    InMemoryPersistentBackend, MemoryManager, MemoryQuery, PersistentMemoryBackend,
    VolatileMemoryStore,
};
use pipewise::pipewise::workflow::{TenantContext, WorkflowId};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    clock: Arc<ManualClock>,
    persistent: Arc<InMemoryPersistentBackend>,
    manager: MemoryManager,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::starting_now());
    let volatile = Arc::new(VolatileMemoryStore::new(
        clock.clone(),
        Duration::from_secs(3600),
    ));
    let persistent = Arc::new(InMemoryPersistentBackend::new());
    let manager = MemoryManager::new(volatile, persistent.clone(), clock.clone());
    Harness {
        clock,
        persistent,
        manager,
    }
}

fn tenant_a() -> TenantContext {
    TenantContext::new("tenant-a", "user-1")
}

fn tenant_b() -> TenantContext {
    TenantContext::new("tenant-b", "user-9")
}

// No read ever returns a record whose expiry has passed, whether or
// not the sweeper has run.
#[tokio::test]
async fn expired_records_are_invisible_to_reads() {
    let h = harness();
    let workflow = WorkflowId::new();

    h.manager
        .save_volatile(
            "coordinator",
            workflow,
            &tenant_a(),
            json!({"note": "short lived"}),
            &["note"],
            Value::Null,
            Some(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    h.manager
        .save_volatile(
            "coordinator",
            workflow,
            &tenant_a(),
            json!({"note": "long lived"}),
            &["note"],
            Value::Null,
            Some(Duration::from_secs(7200)),
        )
        .await
        .unwrap();

    let fresh = h
        .manager
        .agent_context("coordinator", workflow, &tenant_a())
        .await
        .unwrap();
    assert_eq!(fresh.volatile.len(), 2);

    // Cross the first record's expiry without running the sweeper.
    h.clock.advance(ChronoDuration::seconds(61));
    let after = h
        .manager
        .agent_context("coordinator", workflow, &tenant_a())
        .await
        .unwrap();
    assert_eq!(after.volatile.len(), 1);
    assert_eq!(after.volatile[0].content["note"], "long lived");
}

// Context reads never leak records across tenants, in either tier.
#[tokio::test]
async fn tenant_isolation_holds_in_both_tiers() {
    let h = harness();
    let workflow = WorkflowId::new();

    for (tenant, who) in [(tenant_a(), "a"), (tenant_b(), "b")] {
        h.manager
            .save_both(
                "lead_qualifier",
                workflow,
                &tenant,
                json!({"owner": who}),
                &["lead"],
                Value::Null,
                None,
            )
            .await
            .unwrap();
    }

    let for_a = h
        .manager
        .agent_context("lead_qualifier", workflow, &tenant_a())
        .await
        .unwrap();
    assert!(for_a
        .volatile
        .iter()
        .chain(for_a.persistent.iter())
        .all(|r| r.tenant_id() == Some("tenant-a")));
    assert_eq!(for_a.volatile.len(), 1);
    assert_eq!(for_a.persistent.len(), 1);

    let for_b = h
        .manager
        .workflow_context(workflow, &tenant_b())
        .await
        .unwrap();
    assert!(for_b
        .volatile
        .iter()
        .chain(for_b.persistent.iter())
        .all(|r| r.tenant_id() == Some("tenant-b")));
}

// Archiving twice leaves the same persistent state as archiving once,
// and no volatile records either way.
#[tokio::test]
async fn archive_is_idempotent() {
    let h = harness();
    let workflow = WorkflowId::new();

    for i in 0..3 {
        h.manager
            .save_volatile(
                "meeting_scheduler",
                workflow,
                &tenant_a(),
                json!({"meeting": i}),
                &["meeting_scheduled"],
                Value::Null,
                None,
            )
            .await
            .unwrap();
    }

    assert_eq!(h.manager.archive(workflow).await.unwrap(), 3);
    let after_first: Vec<_> = h
        .persistent
        .query(&MemoryQuery::new().workflow(workflow))
        .await
        .unwrap();
    assert!(h.manager.volatile().is_empty());

    assert_eq!(h.manager.archive(workflow).await.unwrap(), 0);
    let after_second: Vec<_> = h
        .persistent
        .query(&MemoryQuery::new().workflow(workflow))
        .await
        .unwrap();

    assert_eq!(after_first.len(), after_second.len());
    let ids_first: Vec<_> = after_first.iter().map(|r| r.id).collect();
    let ids_second: Vec<_> = after_second.iter().map(|r| r.id).collect();
    assert_eq!(ids_first, ids_second);
    assert!(after_second
        .iter()
        .all(|r| r.metadata_value("archived_at").is_some() && r.expires_at.is_none()));
}

// Content, tags, and metadata survive a save/fetch round trip
// set-wise and key-wise.
#[tokio::test]
async fn round_trip_preserves_content_tags_metadata() {
    let h = harness();
    let workflow = WorkflowId::new();

    let content = json!({
        "lead_id": "L-007",
        "score": 0.93,
        "notes": ["called twice", "asked for demo"],
        "nested": {"source": "web-form"},
    });
    let saved = h
        .manager
        .save_both(
            "coordinator",
            workflow,
            &tenant_a(),
            content.clone(),
            &["lead", "scored"],
            json!({"lead_id": "L-007", "origin": "import"}),
            None,
        )
        .await
        .unwrap()
        .0;

    let from_volatile = h.manager.volatile().get(saved.id).unwrap();
    assert_eq!(from_volatile.content, content);
    assert_eq!(from_volatile.tags, saved.tags);
    assert_eq!(from_volatile.metadata_value("origin"), Some(&json!("import")));
    assert_eq!(
        from_volatile.metadata_value("tenant_id"),
        Some(&json!("tenant-a"))
    );

    let from_persistent = h.persistent.get(saved.id).await.unwrap().unwrap();
    assert_eq!(from_persistent.content, content);
    assert_eq!(
        from_persistent.tags.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
        vec!["lead", "scored"]
    );
}

// The persistent query surface: tag intersection, content-key existence,
// metadata equality, and created-at ranges.
#[tokio::test]
async fn persistent_query_filters_compose() {
    let h = harness();
    let workflow = WorkflowId::new();

    h.manager
        .save_persistent(
            "coordinator",
            workflow,
            &tenant_a(),
            json!({"lead_id": "L-1", "email": "x@a.com"}),
            &["lead", "inbound"],
            json!({"lead_id": "L-1"}),
        )
        .await
        .unwrap();
    h.clock.advance(ChronoDuration::seconds(100));
    let cutoff = h.clock.now();
    h.clock.advance(ChronoDuration::seconds(100));
    h.manager
        .save_persistent(
            "coordinator",
            workflow,
            &tenant_a(),
            json!({"lead_id": "L-2"}),
            &["lead"],
            json!({"lead_id": "L-2"}),
        )
        .await
        .unwrap();

    let both_tags = h
        .persistent
        .query(&MemoryQuery::new().tag("lead").tag("inbound"))
        .await
        .unwrap();
    assert_eq!(both_tags.len(), 1);
    assert_eq!(both_tags[0].content["lead_id"], "L-1");

    let with_email = h
        .persistent
        .query(&MemoryQuery::new().content_key("email"))
        .await
        .unwrap();
    assert_eq!(with_email.len(), 1);

    let by_metadata = h
        .persistent
        .query(&MemoryQuery::new().metadata_eq("lead_id", json!("L-2")))
        .await
        .unwrap();
    assert_eq!(by_metadata.len(), 1);

    let recent = h
        .persistent
        .query(&MemoryQuery::new().created_after(cutoff))
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].content["lead_id"], "L-2");
}
