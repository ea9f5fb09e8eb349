use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::BigDecimal;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, AppResult, LedgerError, SettlementError};
use crate::settlement::models::{OperationKind, SettlementOperation, SettlementState};

use super::models::{AccountBalance, AssetCode};
use super::LedgerStore;

/// Postgres-backed ledger. Conditional UPDATEs give the atomic
/// compare-and-mutate primitive; multi-record units run inside one
/// transaction.
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_big(amount: Decimal) -> BigDecimal {
    // A Decimal's string form is always a valid BigDecimal
    BigDecimal::from_str(&amount.to_string()).expect("decimal digits")
}

fn to_decimal(value: BigDecimal, column: &str) -> AppResult<Decimal> {
    Decimal::from_str(&value.to_string())
        .map_err(|_| AppError::Internal(format!("Invalid numeric in column {}", column)))
}

fn balance_from_row(row: &PgRow) -> AppResult<AccountBalance> {
    let asset: String = row.try_get("asset")?;
    Ok(AccountBalance {
        user_id: row.try_get("user_id")?,
        asset: asset.parse()?,
        available: to_decimal(row.try_get("available")?, "available")?,
        pending: to_decimal(row.try_get("pending")?, "pending")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn operation_from_row(row: &PgRow) -> AppResult<SettlementOperation> {
    let kind: String = row.try_get("kind")?;
    let asset: String = row.try_get("asset")?;
    let state: String = row.try_get("state")?;
    let target_asset: Option<String> = row.try_get("target_asset")?;
    let counter_amount: Option<BigDecimal> = row.try_get("counter_amount")?;

    Ok(SettlementOperation {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: OperationKind::from_str(&kind)?,
        asset: asset.parse()?,
        amount: to_decimal(row.try_get("amount")?, "amount")?,
        fee: to_decimal(row.try_get("fee")?, "fee")?,
        destination: row.try_get("destination")?,
        target_asset: target_asset.map(|a| a.parse()).transpose()?,
        counter_amount: counter_amount
            .map(|a| to_decimal(a, "counter_amount"))
            .transpose()?,
        state: SettlementState::from_str(&state)?,
        provider_token: row.try_get("provider_token")?,
        external_reference: row.try_get("external_reference")?,
        failure_reason: row.try_get("failure_reason")?,
        correlation_id: row.try_get("correlation_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
        submitted_at: row.try_get("submitted_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const OPERATION_COLUMNS: &str = "id, user_id, kind, asset, amount, fee, destination, \
     target_asset, counter_amount, state, provider_token, external_reference, \
     failure_reason, correlation_id, idempotency_key, created_at, submitted_at, updated_at";

impl PgLedger {
    fn ensure_positive(amount: Decimal) -> AppResult<()> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::NonPositiveAmount(amount.to_string()).into());
        }
        Ok(())
    }

    /// Conditional reserve inside a caller-owned transaction.
    async fn reserve_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE balances
            SET available = available - $3, pending = pending + $3, updated_at = NOW()
            WHERE user_id = $1 AND asset = $2 AND available >= $3
            "#,
        )
        .bind(user_id)
        .bind(asset.as_str())
        .bind(to_big(amount))
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing row from an underfunded one; the lookup
            // only feeds the error message
            let balance = sqlx::query("SELECT available FROM balances WHERE user_id = $1 AND asset = $2")
                .bind(user_id)
                .bind(asset.as_str())
                .fetch_optional(&mut **tx)
                .await?;

            return match balance {
                Some(row) => Err(LedgerError::InsufficientFunds {
                    required: amount.to_string(),
                    available: to_decimal(row.try_get("available")?, "available")?.to_string(),
                }
                .into()),
                None => Err(LedgerError::NoBalance { asset }.into()),
            };
        }

        Ok(())
    }

    /// Decrement pending, optionally restoring available (release vs settle).
    async fn drain_pending_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
        restore_available: bool,
    ) -> AppResult<()> {
        let query = if restore_available {
            r#"
            UPDATE balances
            SET pending = pending - $3, available = available + $3, updated_at = NOW()
            WHERE user_id = $1 AND asset = $2 AND pending >= $3
            "#
        } else {
            r#"
            UPDATE balances
            SET pending = pending - $3, updated_at = NOW()
            WHERE user_id = $1 AND asset = $2 AND pending >= $3
            "#
        };

        let result = sqlx::query(query)
            .bind(user_id)
            .bind(asset.as_str())
            .bind(to_big(amount))
            .execute(&mut **tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::PendingUnderflow {
                asset,
                amount: amount.to_string(),
            }
            .into());
        }

        Ok(())
    }

    async fn credit_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO balances (user_id, asset, available, pending, updated_at)
            VALUES ($1, $2, $3, 0, NOW())
            ON CONFLICT (user_id, asset)
            DO UPDATE SET available = balances.available + EXCLUDED.available, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(asset.as_str())
        .bind(to_big(amount))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Compare-and-set on the operation state column. Returns false when the
    /// guard missed; errors when the operation does not exist at all.
    async fn transition_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        operation_id: Uuid,
        from: SettlementState,
        to: SettlementState,
        external_reference: Option<&str>,
        failure_reason: Option<&str>,
    ) -> AppResult<bool> {
        SettlementState::ensure_transition(from, to)?;

        let result = sqlx::query(
            r#"
            UPDATE settlement_operations
            SET state = $3,
                external_reference = COALESCE($4, external_reference),
                failure_reason = COALESCE($5, failure_reason),
                submitted_at = CASE WHEN $3 = 'submitted' THEN NOW() ELSE submitted_at END,
                updated_at = NOW()
            WHERE id = $1 AND state = $2
            "#,
        )
        .bind(operation_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(external_reference)
        .bind(failure_reason)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT id FROM settlement_operations WHERE id = $1")
                .bind(operation_id)
                .fetch_optional(&mut **tx)
                .await?;
            if exists.is_none() {
                return Err(SettlementError::NotFound(operation_id.to_string()).into());
            }
            return Ok(false);
        }

        Ok(true)
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn get_balance(
        &self,
        user_id: Uuid,
        asset: AssetCode,
    ) -> AppResult<Option<AccountBalance>> {
        let row = sqlx::query(
            "SELECT user_id, asset, available, pending, updated_at FROM balances \
             WHERE user_id = $1 AND asset = $2",
        )
        .bind(user_id)
        .bind(asset.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| balance_from_row(&r)).transpose()
    }

    async fn credit(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<AccountBalance> {
        Self::ensure_positive(amount)?;

        let row = sqlx::query(
            r#"
            INSERT INTO balances (user_id, asset, available, pending, updated_at)
            VALUES ($1, $2, $3, 0, NOW())
            ON CONFLICT (user_id, asset)
            DO UPDATE SET available = balances.available + EXCLUDED.available, updated_at = NOW()
            RETURNING user_id, asset, available, pending, updated_at
            "#,
        )
        .bind(user_id)
        .bind(asset.as_str())
        .bind(to_big(amount))
        .fetch_one(&self.pool)
        .await?;

        balance_from_row(&row)
    }

    async fn reserve(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<()> {
        Self::ensure_positive(amount)?;
        let mut tx = self.pool.begin().await?;
        self.reserve_tx(&mut tx, user_id, asset, amount).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn settle(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<()> {
        Self::ensure_positive(amount)?;
        let mut tx = self.pool.begin().await?;
        self.drain_pending_tx(&mut tx, user_id, asset, amount, false).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn release(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<()> {
        Self::ensure_positive(amount)?;
        let mut tx = self.pool.begin().await?;
        self.drain_pending_tx(&mut tx, user_id, asset, amount, true).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reserve_and_insert(&self, op: &SettlementOperation) -> AppResult<()> {
        Self::ensure_positive(op.total_debit())?;

        let mut tx = self.pool.begin().await?;

        // An insufficient balance aborts before the insert, so no operation
        // row can exist without its reservation
        self.reserve_tx(&mut tx, op.user_id, op.asset, op.total_debit()).await?;

        sqlx::query(
            r#"
            INSERT INTO settlement_operations (
                id, user_id, kind, asset, amount, fee, destination, target_asset,
                counter_amount, state, provider_token, correlation_id,
                idempotency_key, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW(), NOW())
            "#,
        )
        .bind(op.id)
        .bind(op.user_id)
        .bind(op.kind.as_str())
        .bind(op.asset.as_str())
        .bind(to_big(op.amount))
        .bind(to_big(op.fee))
        .bind(op.destination.as_deref())
        .bind(op.target_asset.map(|a| a.as_str()))
        .bind(op.counter_amount.map(to_big))
        .bind(SettlementState::Reserved.as_str())
        .bind(&op.provider_token)
        .bind(op.correlation_id)
        .bind(&op.idempotency_key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_operation(
        &self,
        operation_id: Uuid,
    ) -> AppResult<Option<SettlementOperation>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM settlement_operations WHERE id = $1",
            OPERATION_COLUMNS
        ))
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| operation_from_row(&r)).transpose()
    }

    async fn get_operation_by_token(
        &self,
        provider_token: &str,
    ) -> AppResult<Option<SettlementOperation>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM settlement_operations WHERE provider_token = $1",
            OPERATION_COLUMNS
        ))
        .bind(provider_token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| operation_from_row(&r)).transpose()
    }

    async fn mark_submitted(&self, operation_id: Uuid) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        let moved = self
            .transition_tx(
                &mut tx,
                operation_id,
                SettlementState::Reserved,
                SettlementState::Submitted,
                None,
                None,
            )
            .await?;
        tx.commit().await?;
        Ok(moved)
    }

    async fn settle_operation(
        &self,
        op: &SettlementOperation,
        external_reference: &str,
    ) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;

        let moved = self
            .transition_tx(
                &mut tx,
                op.id,
                SettlementState::Submitted,
                SettlementState::Settled,
                Some(external_reference),
                None,
            )
            .await?;
        if !moved {
            return Ok(false);
        }

        self.drain_pending_tx(&mut tx, op.user_id, op.asset, op.total_debit(), false)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn settle_swap(
        &self,
        op: &SettlementOperation,
        external_reference: &str,
    ) -> AppResult<bool> {
        let (target_asset, counter_amount) = match (op.target_asset, op.counter_amount) {
            (Some(asset), Some(amount)) => (asset, amount),
            _ => {
                return Err(SettlementError::UnsupportedPair {
                    from: op.asset,
                    to: op.asset,
                }
                .into())
            }
        };

        let mut tx = self.pool.begin().await?;

        let moved = self
            .transition_tx(
                &mut tx,
                op.id,
                SettlementState::Submitted,
                SettlementState::Settled,
                Some(external_reference),
                None,
            )
            .await?;
        if !moved {
            return Ok(false);
        }

        // Debit leg and credit leg commit together or not at all
        self.drain_pending_tx(&mut tx, op.user_id, op.asset, op.total_debit(), false)
            .await?;
        self.credit_tx(&mut tx, op.user_id, target_asset, counter_amount)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn fail_and_compensate(
        &self,
        op: &SettlementOperation,
        reason: &str,
    ) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;

        // The Submitted guard makes the refund exactly-once: concurrent
        // duplicate declines lose the compare-and-set and leave the ledger
        // alone
        let moved = self
            .transition_tx(
                &mut tx,
                op.id,
                SettlementState::Submitted,
                SettlementState::Failed,
                None,
                Some(reason),
            )
            .await?;
        if !moved {
            return Ok(false);
        }

        self.drain_pending_tx(&mut tx, op.user_id, op.asset, op.total_debit(), true)
            .await?;

        let compensated = self
            .transition_tx(
                &mut tx,
                op.id,
                SettlementState::Failed,
                SettlementState::Compensated,
                None,
                None,
            )
            .await?;
        if !compensated {
            // Unreachable inside this transaction; abort rather than commit a
            // half-applied compensation
            return Err(AppError::Internal(format!(
                "Compensation lost its own failed state for operation {}",
                op.id
            )));
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_stuck_submitted(
        &self,
        older_than: DateTime<Utc>,
    ) -> AppResult<Vec<SettlementOperation>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM settlement_operations \
             WHERE state = 'submitted' AND submitted_at < $1 \
             ORDER BY submitted_at ASC",
            OPERATION_COLUMNS
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(operation_from_row).collect()
    }
}
