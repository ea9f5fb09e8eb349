use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::AppResult;

use super::{BeginOutcome, IdempotencyStore, StoredResult};

/// Postgres idempotency store, shared across processes. The unique key on
/// (requester_id, key) is what turns a race into exactly one executor: the
/// losing insert hits ON CONFLICT DO NOTHING and reads back the winner's
/// record.
pub struct PgIdempotencyStore {
    pool: PgPool,
    ttl_secs: i64,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool, ttl_secs: u64) -> Self {
        Self {
            pool,
            ttl_secs: ttl_secs as i64,
        }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn begin(&self, key: &str, requester_id: Uuid) -> AppResult<BeginOutcome> {
        // Expired claims are cleared eagerly so the key becomes claimable
        // without waiting for the sweep
        sqlx::query(
            "DELETE FROM idempotency_keys \
             WHERE requester_id = $1 AND key = $2 AND expires_at <= NOW()",
        )
        .bind(requester_id)
        .bind(key)
        .execute(&self.pool)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (requester_id, key, created_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3::double precision))
            ON CONFLICT (requester_id, key) DO NOTHING
            "#,
        )
        .bind(requester_id)
        .bind(key)
        .bind(self.ttl_secs)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(BeginOutcome::New);
        }

        let row = sqlx::query(
            "SELECT result_payload, result_status FROM idempotency_keys \
             WHERE requester_id = $1 AND key = $2",
        )
        .bind(requester_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let payload: Option<serde_json::Value> = row.try_get("result_payload")?;
                let status: Option<String> = row.try_get("result_status")?;
                match (payload, status) {
                    (Some(payload), Some(status)) => {
                        Ok(BeginOutcome::Replay(StoredResult { payload, status }))
                    }
                    _ => Ok(BeginOutcome::InProgress),
                }
            }
            // The winner abandoned between our insert and read; the caller's
            // retry will claim it
            None => Ok(BeginOutcome::InProgress),
        }
    }

    async fn complete(
        &self,
        key: &str,
        requester_id: Uuid,
        result: StoredResult,
    ) -> AppResult<()> {
        // result_payload IS NULL keeps the record write-once
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET result_payload = $3, result_status = $4
            WHERE requester_id = $1 AND key = $2 AND result_payload IS NULL
            "#,
        )
        .bind(requester_id)
        .bind(key)
        .bind(&result.payload)
        .bind(&result.status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn abandon(&self, key: &str, requester_id: Uuid) -> AppResult<()> {
        sqlx::query(
            "DELETE FROM idempotency_keys \
             WHERE requester_id = $1 AND key = $2 AND result_payload IS NULL",
        )
        .bind(requester_id)
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_expired(&self) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
