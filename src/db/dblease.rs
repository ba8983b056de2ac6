use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Error as SqlxError;
use std::time::Duration;
use tracing::info;

use super::{LeaseStore, StoreError};
use crate::models::{InstanceId, Lease};

/// Lease table DDL.
///
/// The unique index on `document_id` is what turns the insert in
/// `try_insert` into a conditional write: once expired rows are cleared,
/// a conflicting insert means a live competitor and comes back empty.
const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS form_edit_leases (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        document_id TEXT NOT NULL,
        holder_id TEXT NOT NULL DEFAULT '',
        instance_id UUID NOT NULL,
        acquired_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        expires_at TIMESTAMPTZ NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb
    );
    CREATE UNIQUE INDEX IF NOT EXISTS form_edit_leases_document_id_key
        ON form_edit_leases (document_id);
"#;

/// Postgres-backed lease store
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    /// Create a new lease store with its own connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    ///
    /// # Returns
    /// * `Result<Self, SqlxError>` - Lease store or error
    pub async fn connect(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to lease store...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600)) // Close idle connections after 10 minutes
            .max_lifetime(Duration::from_secs(1800)) // Recycle connections after 30 minutes
            .connect(database_url)
            .await?;

        info!("Lease store connection pool created successfully");

        Ok(Self { pool })
    }

    /// Wrap an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the lease table and its uniqueness index if missing
    pub async fn ensure_schema(&self) -> Result<(), SqlxError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        info!("Lease schema ensured");
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn delete_expired(&self, document_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM form_edit_leases
            WHERE document_id = $1 AND expires_at <= NOW()
            "#,
        )
        .bind(document_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!(
                "Removed {} expired lease(s) for document {}",
                result.rows_affected(),
                document_id
            );
        }
        Ok(result.rows_affected())
    }

    async fn find_valid(&self, document_id: &str) -> Result<Option<Lease>, StoreError> {
        let lease = sqlx::query_as::<_, Lease>(
            r#"
            SELECT id, document_id, holder_id, instance_id, acquired_at, expires_at, metadata
            FROM form_edit_leases
            WHERE document_id = $1 AND expires_at > NOW()
            LIMIT 1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(lease)
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
        let lease = sqlx::query_as::<_, Lease>(
            r#"
            INSERT INTO form_edit_leases
                (document_id, holder_id, instance_id, acquired_at, expires_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (document_id) DO NOTHING
            RETURNING id, document_id, holder_id, instance_id, acquired_at, expires_at, metadata
            "#,
        )
        .bind(document_id)
        .bind(holder_id)
        .bind(instance_id)
        .bind(acquired_at)
        .bind(expires_at)
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await?;

        match &lease {
            Some(lease) => info!(
                "Lease {} created for document {} by instance {}",
                lease.id, document_id, instance_id
            ),
            None => info!(
                "Lease insert for document {} blocked by a competing row",
                document_id
            ),
        }
        Ok(lease)
    }

    async fn refresh(
        &self,
        document_id: &str,
        instance_id: InstanceId,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE form_edit_leases
            SET expires_at = $3
            WHERE document_id = $1 AND instance_id = $2 AND expires_at > NOW()
            "#,
        )
        .bind(document_id)
        .bind(instance_id)
        .bind(new_expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_for_instance(
        &self,
        document_id: &str,
        instance_id: InstanceId,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM form_edit_leases
            WHERE document_id = $1 AND instance_id = $2
            "#,
        )
        .bind(document_id)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_all_for_instance(&self, instance_id: InstanceId) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM form_edit_leases
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!(
                "Released {} lease(s) held by instance {}",
                result.rows_affected(),
                instance_id
            );
        }
        Ok(result.rows_affected())
    }
}
