use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::CoordConfig;
use crate::db::{LeaseStore, StoreError};
use crate::models::{AcquireOutcome, InstanceId, LeaseEvent, LockStatus};
use crate::utils::PeriodicTask;

/// Supplies the identity recorded as the lease holder.
///
/// Resolution failure must not block acquisition: an unresolved principal
/// produces an anonymous lease and a warning.
#[async_trait]
pub trait PrincipalProvider: Send + Sync {
    async fn current_principal(&self) -> Option<String>;
}

/// Provider for embedders that know the signed-in user up front
pub struct StaticPrincipal(pub String);

#[async_trait]
impl PrincipalProvider for StaticPrincipal {
    async fn current_principal(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Provider for contexts without an identity layer
pub struct AnonymousPrincipal;

#[async_trait]
impl PrincipalProvider for AnonymousPrincipal {
    async fn current_principal(&self) -> Option<String> {
        None
    }
}

struct ManagerInner {
    store: Arc<dyn LeaseStore>,
    principal: Arc<dyn PrincipalProvider>,
    instance_id: InstanceId,
    config: CoordConfig,
    /// Documents this instance currently holds a lease on
    active: RwLock<HashSet<String>>,
    events: mpsc::UnboundedSender<LeaseEvent>,
    heartbeat: Mutex<Option<PeriodicTask>>,
}

/// Exclusive editing-lease manager.
///
/// Guarantees at-most-one active editor per document across all sessions
/// and devices, with automatic recovery from crashed or abandoned sessions:
/// a lease only stays valid while its holder keeps heartbeating, so a dead
/// session's lease expires and is reclaimed by the next acquire.
///
/// Cheap to clone; all clones share the same instance identity, active set
/// and heartbeat task.
#[derive(Clone)]
pub struct LeaseLockManager {
    inner: Arc<ManagerInner>,
}

impl LeaseLockManager {
    /// Create a manager bound to one session instance.
    ///
    /// # Arguments
    /// * `store` - Shared lease store (Postgres in production)
    /// * `principal` - Identity provider for the lease holder field
    /// * `instance_id` - This session's identity, from `InstanceId::generate()`
    /// * `config` - Lease duration / refresh tunables
    ///
    /// # Returns
    /// The manager and the receiver for lost-lease events emitted by the
    /// heartbeat loop. The embedder must watch the receiver: a
    /// `LeaseEvent::Lost` means the editing session is no longer the holder.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        principal: Arc<dyn PrincipalProvider>,
        instance_id: InstanceId,
        config: CoordConfig,
    ) -> (Self, mpsc::UnboundedReceiver<LeaseEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(ManagerInner {
                store,
                principal,
                instance_id,
                config,
                active: RwLock::new(HashSet::new()),
                events,
                heartbeat: Mutex::new(None),
            }),
        };
        (manager, events_rx)
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance_id
    }

    /// Documents currently held by this instance
    pub async fn active_documents(&self) -> Vec<String> {
        self.inner.active.read().await.iter().cloned().collect()
    }

    fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::seconds(self.inner.config.lease_duration_secs as i64)
    }

    /// Try to take exclusive editing rights on a document.
    ///
    /// Expired rows are cleared first, then a still-valid lease is checked:
    /// a foreign one is returned as a conflict (expected outcome, not an
    /// error), an own one is treated as already-held and its expiry bumped.
    /// Otherwise a conditional insert creates the lease; losing the insert
    /// race to a concurrent acquire also reports a conflict.
    ///
    /// On success the document joins the heartbeat set.
    pub async fn acquire(&self, document_id: &str) -> Result<AcquireOutcome, StoreError> {
        let inner = &self.inner;

        // Opportunistic cleanup so an abandoned session's lease does not
        // block the document forever.
        inner.store.delete_expired(document_id).await?;

        let now = Utc::now();
        let expires_at = self.lease_expiry(now);

        if let Some(existing) = inner.store.find_valid(document_id).await? {
            if existing.instance_id != inner.instance_id {
                info!(
                    "Document {} is already being edited by instance {} (holder {})",
                    document_id, existing.instance_id, existing.holder_id
                );
                return Ok(AcquireOutcome::Conflict {
                    existing: Some(existing),
                });
            }

            // Our own lease from an earlier acquire: not a conflict.
            let mut lease = existing;
            if inner
                .store
                .refresh(document_id, inner.instance_id, expires_at)
                .await?
            {
                lease.expires_at = expires_at;
            }
            self.track(document_id).await;
            return Ok(AcquireOutcome::AlreadyHeld { lease });
        }

        let holder_id = match inner.principal.current_principal().await {
            Some(holder_id) => holder_id,
            None => {
                warn!(
                    "No principal resolved while acquiring {}; creating an anonymous lease",
                    document_id
                );
                String::new()
            }
        };

        let metadata = serde_json::json!({ "acquiredAt": now.to_rfc3339() });
        match inner
            .store
            .try_insert(
                document_id,
                &holder_id,
                inner.instance_id,
                now,
                expires_at,
                metadata,
            )
            .await?
        {
            Some(lease) => {
                info!(
                    "Acquired editing lease {} on document {} until {}",
                    lease.id, document_id, lease.expires_at
                );
                self.track(document_id).await;
                Ok(AcquireOutcome::Granted { lease })
            }
            None => {
                // A concurrent acquire won the insert; report whoever holds
                // the row now. The caller may retry later.
                let existing = inner.store.find_valid(document_id).await?;
                Ok(AcquireOutcome::Conflict { existing })
            }
        }
    }

    /// Give up the lease on a document.
    ///
    /// Only deletes a row owned by this instance; releasing a lease that is
    /// not held is a no-op success. Stops the heartbeat once no active
    /// documents remain.
    pub async fn release(&self, document_id: &str) -> Result<(), StoreError> {
        let removed = self
            .inner
            .store
            .delete_for_instance(document_id, self.inner.instance_id)
            .await?;
        if removed > 0 {
            info!("Released editing lease on document {}", document_id);
        }
        self.untrack(document_id).await;
        Ok(())
    }

    /// Extend the held lease by one full duration.
    ///
    /// Returns `false` when no matching row exists anymore (the lease
    /// expired or was removed out-of-band); the editing session must then
    /// be treated as lost.
    pub async fn refresh(&self, document_id: &str) -> Result<bool, StoreError> {
        let expires_at = self.lease_expiry(Utc::now());
        let refreshed = self
            .inner
            .store
            .refresh(document_id, self.inner.instance_id, expires_at)
            .await?;
        if !refreshed {
            warn!("Refresh found no lease on document {} for this instance", document_id);
        }
        Ok(refreshed)
    }

    /// Whether a different instance currently holds a valid lease
    pub async fn is_locked(&self, document_id: &str) -> Result<LockStatus, StoreError> {
        self.inner.store.delete_expired(document_id).await?;
        match self.inner.store.find_valid(document_id).await? {
            Some(lease) if lease.instance_id != self.inner.instance_id => Ok(LockStatus {
                locked: true,
                lease: Some(lease),
            }),
            _ => Ok(LockStatus {
                locked: false,
                lease: None,
            }),
        }
    }

    /// Best-effort teardown on process/page exit: delete every lease owned
    /// by this instance and stop the heartbeat. If this never runs (hard
    /// crash), the leases simply expire at their `expires_at`.
    pub async fn cleanup(&self) {
        if let Some(task) = self.inner.heartbeat.lock().await.take() {
            task.stop();
        }
        self.inner.active.write().await.clear();

        match self
            .inner
            .store
            .delete_all_for_instance(self.inner.instance_id)
            .await
        {
            Ok(removed) => {
                if removed > 0 {
                    info!("Teardown released {} editing lease(s)", removed);
                }
            }
            Err(e) => warn!("Teardown could not reach the lease store: {}", e),
        }
    }

    async fn track(&self, document_id: &str) {
        self.inner
            .active
            .write()
            .await
            .insert(document_id.to_string());
        self.ensure_heartbeat().await;
    }

    async fn untrack(&self, document_id: &str) {
        let mut active = self.inner.active.write().await;
        active.remove(document_id);
        let empty = active.is_empty();
        drop(active);

        if empty {
            if let Some(task) = self.inner.heartbeat.lock().await.take() {
                task.stop();
                debug!("Heartbeat stopped; no active documents remain");
            }
        }
    }

    async fn ensure_heartbeat(&self) {
        let mut slot = self.inner.heartbeat.lock().await;
        if slot.is_some() {
            return;
        }
        // The task must not keep the manager alive: it holds a weak
        // reference and simply stops ticking once the manager is gone.
        let inner = Arc::downgrade(&self.inner);
        let task = PeriodicTask::spawn(self.inner.config.lease_refresh(), move || {
            let inner = Weak::clone(&inner);
            async move {
                if let Some(inner) = inner.upgrade() {
                    heartbeat_tick(inner).await;
                }
            }
        });
        *slot = Some(task);
        debug!("Heartbeat started for instance {}", self.inner.instance_id);
    }
}

/// One heartbeat round: refresh every active document's lease.
///
/// A refresh that finds no row drops the document from the active set and
/// emits `LeaseEvent::Lost`; the manager never retries a lost lease. A
/// store error keeps the document tracked and surfaces as
/// `LeaseEvent::RefreshError`; the consumer decides whether to abandon.
async fn heartbeat_tick(inner: Arc<ManagerInner>) {
    let documents: Vec<String> = inner.active.read().await.iter().cloned().collect();
    let expires_at =
        Utc::now() + ChronoDuration::seconds(inner.config.lease_duration_secs as i64);

    for document_id in documents {
        match inner
            .store
            .refresh(&document_id, inner.instance_id, expires_at)
            .await
        {
            Ok(true) => {
                debug!("Heartbeat refreshed lease on document {}", document_id);
            }
            Ok(false) => {
                warn!(
                    "Editing lease on document {} was lost; dropping it from the heartbeat set",
                    document_id
                );
                inner.active.write().await.remove(&document_id);
                let _ = inner.events.send(LeaseEvent::Lost { document_id });
            }
            Err(e) => {
                error!("Heartbeat refresh for document {} failed: {}", document_id, e);
                let _ = inner.events.send(LeaseEvent::RefreshError {
                    document_id,
                    error: e.to_string(),
                });
            }
        }
    }
}
