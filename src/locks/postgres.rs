use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::time::Duration;

use crate::error::{AppResult, LockError};

use super::{new_owner_token, DistributedMutex, Lease};

/// Lease table backed mutex shared across processes. A conditional upsert is
/// the acquire: the insert wins an absent key, the update wins an expired
/// one, and an unexpired competitor makes rows_affected zero.
pub struct PgMutex {
    pool: PgPool,
}

impl PgMutex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedMutex for PgMutex {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> AppResult<Option<Lease>> {
        let owner = new_owner_token();
        let ttl_secs = ttl.as_secs_f64();

        let row = sqlx::query(
            r#"
            INSERT INTO leases (key, owner, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
            WHERE leases.expires_at <= NOW()
            RETURNING expires_at
            "#,
        )
        .bind(key)
        .bind(&owner)
        .bind(ttl_secs)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Lease {
                key: key.to_string(),
                owner,
                expires_at: row.try_get("expires_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn renew(&self, lease: &mut Lease, ttl: Duration) -> AppResult<()> {
        let ttl_secs = ttl.as_secs_f64();

        let row = sqlx::query(
            r#"
            UPDATE leases
            SET expires_at = NOW() + make_interval(secs => $3)
            WHERE key = $1 AND owner = $2
            RETURNING expires_at
            "#,
        )
        .bind(&lease.key)
        .bind(&lease.owner)
        .bind(ttl_secs)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                lease.expires_at = row.try_get("expires_at")?;
                Ok(())
            }
            None => Err(LockError::LeaseLost(lease.key.clone()).into()),
        }
    }

    async fn release(&self, lease: Lease) -> AppResult<()> {
        // Owner-guarded: releasing after a steal must not evict the thief
        sqlx::query("DELETE FROM leases WHERE key = $1 AND owner = $2")
            .bind(&lease.key)
            .bind(&lease.owner)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
