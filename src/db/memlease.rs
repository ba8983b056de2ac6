use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LeaseStore, StoreError};
use crate::models::{InstanceId, Lease};

/// In-memory lease store.
///
/// Same row semantics as `PgLeaseStore` (one row per document, conditional
/// insert, expired rows reclaimed only by an explicit `delete_expired`),
/// with the map mutex standing in for the unique index. Only suitable when
/// every editing session lives in one process; used by single-node
/// deployments and the test suite.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a lease row directly, bypassing the conditional-insert check.
    /// Test hook for staging expired or foreign rows.
    pub async fn put_raw(&self, lease: Lease) {
        self.leases
            .lock()
            .await
            .insert(lease.document_id.clone(), lease);
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn delete_expired(&self, document_id: &str) -> Result<u64, StoreError> {
        let mut leases = self.leases.lock().await;
        let now = Utc::now();
        match leases.get(document_id) {
            Some(lease) if !lease.is_valid_at(now) => {
                leases.remove(document_id);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn find_valid(&self, document_id: &str) -> Result<Option<Lease>, StoreError> {
        let leases = self.leases.lock().await;
        let now = Utc::now();
        Ok(leases
            .get(document_id)
            .filter(|lease| lease.is_valid_at(now))
            .cloned())
    }

    async fn try_insert(
        &self,
        document_id: &str,
        holder_id: &str,
        instance_id: InstanceId,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> Result<Option<Lease>, StoreError> {
        let mut leases = self.leases.lock().await;

        // Any existing row blocks the insert, like the unique index does.
        if leases.contains_key(document_id) {
            return Ok(None);
        }

        let lease = Lease {
            id: Uuid::new_v4(),
            document_id: document_id.to_string(),
            holder_id: holder_id.to_string(),
            instance_id,
            acquired_at,
            expires_at,
            metadata,
        };
        leases.insert(document_id.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn refresh(
        &self,
        document_id: &str,
        instance_id: InstanceId,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock().await;
        let now = Utc::now();
        match leases.get_mut(document_id) {
            Some(lease) if lease.instance_id == instance_id && lease.is_valid_at(now) => {
                lease.expires_at = new_expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_for_instance(
        &self,
        document_id: &str,
        instance_id: InstanceId,
    ) -> Result<u64, StoreError> {
        let mut leases = self.leases.lock().await;
        match leases.get(document_id) {
            Some(lease) if lease.instance_id == instance_id => {
                leases.remove(document_id);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn delete_all_for_instance(&self, instance_id: InstanceId) -> Result<u64, StoreError> {
        let mut leases = self.leases.lock().await;
        let before = leases.len();
        leases.retain(|_, lease| lease.instance_id != instance_id);
        Ok((before - leases.len()) as u64)
    }
}
