//! Integration tests for the editing-lease lock manager.
//!
//! These run against the in-memory store, which shares its row semantics
//! with the Postgres store (conditional insert, lazy expiry reclaim).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use formari_coedit::{
    AcquireOutcome, AnonymousPrincipal, CoordConfig, InstanceId, Lease, LeaseEvent,
    LeaseLockManager, LeaseStore, MemoryLeaseStore, StaticPrincipal, StoreError,
};

/// Initialize tracing for tests
fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("formari_coedit=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn manager_for(
    store: &Arc<MemoryLeaseStore>,
    user: &str,
) -> (LeaseLockManager, UnboundedReceiver<LeaseEvent>) {
    LeaseLockManager::new(
        Arc::clone(store) as Arc<dyn LeaseStore>,
        Arc::new(StaticPrincipal(user.to_string())),
        InstanceId::generate(),
        CoordConfig::default(),
    )
}

#[tokio::test]
async fn acquire_is_exclusive_between_instances() {
    init_tracing();
    let store = Arc::new(MemoryLeaseStore::new());
    let (alice, _alice_events) = manager_for(&store, "u/alice");
    let (bob, _bob_events) = manager_for(&store, "u/bob");

    let outcome = alice.acquire("form-1").await.unwrap();
    assert!(outcome.granted());

    let outcome = bob.acquire("form-1").await.unwrap();
    assert!(!outcome.granted());
    let existing = outcome.conflicting_lease().expect("conflicting lease");
    assert_eq!(existing.instance_id, alice.instance_id());
    assert_eq!(existing.holder_id, "u/alice");
}

#[tokio::test]
async fn self_acquire_is_not_a_conflict() {
    init_tracing();
    let store = Arc::new(MemoryLeaseStore::new());
    let (alice, _events) = manager_for(&store, "u/alice");

    let first = alice.acquire("form-1").await.unwrap();
    assert!(matches!(first, AcquireOutcome::Granted { .. }));

    let second = alice.acquire("form-1").await.unwrap();
    assert!(matches!(second, AcquireOutcome::AlreadyHeld { .. }));
    assert!(second.granted());
}

#[tokio::test]
async fn release_is_idempotent() {
    init_tracing();
    let store = Arc::new(MemoryLeaseStore::new());
    let (alice, _events) = manager_for(&store, "u/alice");

    alice.acquire("form-1").await.unwrap();
    alice.release("form-1").await.unwrap();
    assert!(store.find_valid("form-1").await.unwrap().is_none());

    // Second release finds nothing owned by this instance and still succeeds.
    alice.release("form-1").await.unwrap();
    assert!(alice.active_documents().await.is_empty());
}

#[tokio::test]
async fn release_never_touches_a_foreign_lease() {
    init_tracing();
    let store = Arc::new(MemoryLeaseStore::new());
    let (alice, _alice_events) = manager_for(&store, "u/alice");
    let (bob, _bob_events) = manager_for(&store, "u/bob");

    alice.acquire("form-1").await.unwrap();
    bob.release("form-1").await.unwrap();

    let lease = store.find_valid("form-1").await.unwrap().expect("lease kept");
    assert_eq!(lease.instance_id, alice.instance_id());
}

#[tokio::test]
async fn refresh_extends_expiry_monotonically() {
    init_tracing();
    let store = Arc::new(MemoryLeaseStore::new());
    let (alice, _events) = manager_for(&store, "u/alice");

    let outcome = alice.acquire("form-1").await.unwrap();
    let AcquireOutcome::Granted { lease } = outcome else {
        panic!("expected a fresh grant");
    };
    let initial_expiry = lease.expires_at;

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(alice.refresh("form-1").await.unwrap());

    let refreshed = store.find_valid("form-1").await.unwrap().expect("lease");
    assert!(refreshed.expires_at > initial_expiry);
    assert!(refreshed.expires_at > Utc::now());
}

#[tokio::test]
async fn refresh_without_a_lease_reports_loss() {
    init_tracing();
    let store = Arc::new(MemoryLeaseStore::new());
    let (alice, _events) = manager_for(&store, "u/alice");

    assert!(!alice.refresh("form-1").await.unwrap());
}

#[tokio::test]
async fn expired_lease_is_reclaimable() {
    init_tracing();
    let store = Arc::new(MemoryLeaseStore::new());

    // An abandoned session's lease whose expiry has passed.
    store
        .put_raw(Lease {
            id: Uuid::new_v4(),
            document_id: "form-1".to_string(),
            holder_id: "u/ghost".to_string(),
            instance_id: InstanceId::generate(),
            acquired_at: Utc::now() - ChronoDuration::minutes(10),
            expires_at: Utc::now() - ChronoDuration::minutes(5),
            metadata: serde_json::json!({}),
        })
        .await;

    let (bob, _events) = manager_for(&store, "u/bob");
    let outcome = bob.acquire("form-1").await.unwrap();
    assert!(matches!(outcome, AcquireOutcome::Granted { .. }));
}

#[tokio::test]
async fn is_locked_reports_only_foreign_leases() {
    init_tracing();
    let store = Arc::new(MemoryLeaseStore::new());
    let (alice, _alice_events) = manager_for(&store, "u/alice");
    let (bob, _bob_events) = manager_for(&store, "u/bob");

    assert!(!alice.is_locked("form-1").await.unwrap().locked);

    alice.acquire("form-1").await.unwrap();
    // Own lease is not "locked" from the holder's point of view.
    assert!(!alice.is_locked("form-1").await.unwrap().locked);

    let status = bob.is_locked("form-1").await.unwrap();
    assert!(status.locked);
    assert_eq!(
        status.lease.expect("foreign lease").instance_id,
        alice.instance_id()
    );
}

#[tokio::test]
async fn anonymous_principal_still_acquires() {
    init_tracing();
    let store = Arc::new(MemoryLeaseStore::new());
    let (manager, _events) = LeaseLockManager::new(
        Arc::clone(&store) as Arc<dyn LeaseStore>,
        Arc::new(AnonymousPrincipal),
        InstanceId::generate(),
        CoordConfig::default(),
    );

    let outcome = manager.acquire("form-1").await.unwrap();
    let AcquireOutcome::Granted { lease } = outcome else {
        panic!("expected a grant despite the unresolved principal");
    };
    assert!(lease.holder_id.is_empty());
}

#[tokio::test]
async fn conflict_then_release_then_retry_succeeds() {
    init_tracing();
    let store = Arc::new(MemoryLeaseStore::new());
    let (tab_a, _a_events) = manager_for(&store, "u/alice");
    let (tab_b, _b_events) = manager_for(&store, "u/alice");

    // Same user, two sessions: still a conflict.
    assert!(tab_a.acquire("doc-1").await.unwrap().granted());
    let blocked = tab_b.acquire("doc-1").await.unwrap();
    assert!(!blocked.granted());
    assert_eq!(
        blocked.conflicting_lease().expect("lease").instance_id,
        tab_a.instance_id()
    );

    tab_a.release("doc-1").await.unwrap();

    let retried = tab_b.acquire("doc-1").await.unwrap();
    assert!(retried.granted());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_surfaces_a_lost_lease() {
    init_tracing();
    let store = Arc::new(MemoryLeaseStore::new());
    let (alice, mut events) = manager_for(&store, "u/alice");

    alice.acquire("form-1").await.unwrap();

    // The lease disappears out-of-band (cleaned up by another caller).
    store
        .delete_for_instance("form-1", alice.instance_id())
        .await
        .unwrap();

    // Let the heartbeat interval elapse; the refresh finds no row.
    tokio::time::sleep(Duration::from_secs(121)).await;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("heartbeat should have emitted an event")
        .expect("event channel open");
    match event {
        LeaseEvent::Lost { document_id } => assert_eq!(document_id, "form-1"),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(alice.active_documents().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_a_held_lease_alive() {
    init_tracing();
    let store = Arc::new(MemoryLeaseStore::new());
    let (alice, mut events) = manager_for(&store, "u/alice");

    alice.acquire("form-1").await.unwrap();

    // Three refresh intervals pass; the lease must still be valid and no
    // loss event may have fired.
    tokio::time::sleep(Duration::from_secs(365)).await;

    assert!(store.find_valid("form-1").await.unwrap().is_some());
    assert!(events.try_recv().is_err());
    assert_eq!(alice.active_documents().await, vec!["form-1".to_string()]);
}

#[tokio::test]
async fn cleanup_releases_every_held_lease() {
    init_tracing();
    let store = Arc::new(MemoryLeaseStore::new());
    let (alice, _events) = manager_for(&store, "u/alice");

    alice.acquire("form-1").await.unwrap();
    alice.acquire("form-2").await.unwrap();
    assert_eq!(alice.active_documents().await.len(), 2);

    alice.cleanup().await;

    assert!(store.find_valid("form-1").await.unwrap().is_none());
    assert!(store.find_valid("form-2").await.unwrap().is_none());
    assert!(alice.active_documents().await.is_empty());
}

/// Store stub whose every call fails, for error-propagation checks
struct UnavailableStore;

#[async_trait]
impl LeaseStore for UnavailableStore {
    async fn delete_expired(&self, _document_id: &str) -> Result<u64, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolClosed))
    }

    async fn find_valid(&self, _document_id: &str) -> Result<Option<Lease>, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolClosed))
    }

    async fn try_insert(
        &self,
        _document_id: &str,
        _holder_id: &str,
        _instance_id: InstanceId,
        _acquired_at: chrono::DateTime<Utc>,
        _expires_at: chrono::DateTime<Utc>,
        _metadata: serde_json::Value,
    ) -> Result<Option<Lease>, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolClosed))
    }

    async fn refresh(
        &self,
        _document_id: &str,
        _instance_id: InstanceId,
        _new_expires_at: chrono::DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolClosed))
    }

    async fn delete_for_instance(
        &self,
        _document_id: &str,
        _instance_id: InstanceId,
    ) -> Result<u64, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolClosed))
    }

    async fn delete_all_for_instance(&self, _instance_id: InstanceId) -> Result<u64, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolClosed))
    }
}

#[tokio::test]
async fn store_unavailability_propagates_to_the_caller() {
    init_tracing();
    let (manager, _events) = LeaseLockManager::new(
        Arc::new(UnavailableStore),
        Arc::new(StaticPrincipal("u/alice".to_string())),
        InstanceId::generate(),
        CoordConfig::default(),
    );

    assert!(manager.acquire("form-1").await.is_err());
    assert!(manager.refresh("form-1").await.is_err());
    assert!(manager.is_locked("form-1").await.is_err());
    assert!(manager.release("form-1").await.is_err());

    // Teardown is best-effort and must not fail even with the store down.
    manager.cleanup().await;
}
