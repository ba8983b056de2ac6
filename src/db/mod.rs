pub mod dblease;
pub mod memlease;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{InstanceId, Lease};

pub use dblease::PgLeaseStore;
pub use memlease::MemoryLeaseStore;

/// Durable, shared store for editing leases.
///
/// Visible to every session on every device; the single source of truth for
/// cross-session exclusivity. Implementations only need the row operations
/// below; the acquire protocol itself lives in the lock manager.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Delete expired lease rows for a document. Returns the number of
    /// rows removed.
    async fn delete_expired(&self, document_id: &str) -> Result<u64, StoreError>;

    /// Find a still-valid lease for a document, if any.
    async fn find_valid(&self, document_id: &str) -> Result<Option<Lease>, StoreError>;

    /// Conditionally insert a new lease. Returns `None` when a competing
    /// row for the same document blocked the insert, so two callers that
    /// both passed the conflict check cannot both end up holding a lease.
    async fn try_insert(
        &self,
        document_id: &str,
        holder_id: &str,
        instance_id: InstanceId,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> Result<Option<Lease>, StoreError>;

    /// Extend the expiry of the lease owned by `instance_id`. Returns
    /// `false` when no matching valid row exists (the lease was lost).
    async fn refresh(
        &self,
        document_id: &str,
        instance_id: InstanceId,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete the lease for a document owned by `instance_id`. Never
    /// touches another instance's row. Returns the number of rows removed.
    async fn delete_for_instance(
        &self,
        document_id: &str,
        instance_id: InstanceId,
    ) -> Result<u64, StoreError>;

    /// Delete every lease owned by `instance_id`, across all documents.
    /// Used by teardown on process exit.
    async fn delete_all_for_instance(&self, instance_id: InstanceId) -> Result<u64, StoreError>;
}

/// Store failure, reported to the caller as-is and never retried internally
#[derive(Debug)]
pub enum StoreError {
    Database(sqlx::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Lease store error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e)
    }
}
