use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for one construction of the coordination manager.
///
/// Regenerated on every page load / session start, so it distinguishes
/// "my session" from "another session by the same user". Passed explicitly
/// wherever ownership of a lease has to be proven.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Generate a fresh instance identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Editing lease row from the shared store
///
/// Exclusive editing rights over one document, valid while `now < expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Lease {
    pub id: Uuid,
    pub document_id: String,
    pub holder_id: String,
    pub instance_id: InstanceId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl Lease {
    /// Whether the lease is still valid at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Result of an acquire attempt
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    /// A new lease was created for this instance
    Granted { lease: Lease },
    /// This instance already held a valid lease; its expiry was extended
    AlreadyHeld { lease: Lease },
    /// A valid lease belonging to another instance blocks acquisition.
    /// `existing` is `None` only in the narrow case where the competing
    /// row vanished between the failed insert and the re-read; the caller
    /// may simply retry.
    Conflict { existing: Option<Lease> },
}

impl AcquireOutcome {
    /// Whether the caller may edit the document
    pub fn granted(&self) -> bool {
        matches!(
            self,
            AcquireOutcome::Granted { .. } | AcquireOutcome::AlreadyHeld { .. }
        )
    }

    /// The lease blocking acquisition, if any
    pub fn conflicting_lease(&self) -> Option<&Lease> {
        match self {
            AcquireOutcome::Conflict { existing } => existing.as_ref(),
            _ => None,
        }
    }
}

/// Result of a lock status query
#[derive(Debug, Clone)]
pub struct LockStatus {
    /// True when a valid lease belonging to a different instance exists
    pub locked: bool,
    pub lease: Option<Lease>,
}

/// Events emitted by the lock manager's heartbeat loop
#[derive(Debug, Clone)]
pub enum LeaseEvent {
    /// The lease row is gone (expired or deleted out-of-band); the editing
    /// session must no longer be treated as the holder.
    Lost { document_id: String },
    /// The store could not be reached during a refresh. The document stays
    /// in the heartbeat set; the consumer decides whether to keep waiting
    /// or abandon the session.
    RefreshError { document_id: String, error: String },
}
