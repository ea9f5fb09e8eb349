pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::AppResult;
use crate::settlement::models::SettlementOperation;
use models::{AccountBalance, AssetCode};

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

/// Ledger store - THE source of truth for balances and settlement operations.
///
/// Every mutation is a single atomic conditional update; there is no
/// read-modify-write window anywhere behind this trait. Per-(user, asset)
/// mutations are linearized by that primitive, so callers never coordinate
/// balance access themselves.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ========== BALANCE PRIMITIVES ==========

    async fn get_balance(
        &self,
        user_id: Uuid,
        asset: AssetCode,
    ) -> AppResult<Option<AccountBalance>>;

    /// Unconditionally increase available funds. Creates the balance row on
    /// first credit.
    async fn credit(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<AccountBalance>;

    /// Move funds from available to pending, only if `available >= amount`.
    /// Fails with InsufficientFunds otherwise, without touching the row.
    async fn reserve(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<()>;

    /// Success-path terminal mutation: drop settled funds from pending.
    async fn settle(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<()>;

    /// Compensation: move reserved funds back from pending to available.
    async fn release(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<()>;

    // ========== OPERATION LIFECYCLE ==========

    /// Reserve `op.total_debit()` and persist the operation at Reserved, as
    /// one atomic unit. A reservation never exists without its operation
    /// record, and vice versa.
    async fn reserve_and_insert(&self, op: &SettlementOperation) -> AppResult<()>;

    async fn get_operation(
        &self,
        operation_id: Uuid,
    ) -> AppResult<Option<SettlementOperation>>;

    /// Look up an operation by the provider-facing idempotency token
    /// (rail callbacks identify operations this way).
    async fn get_operation_by_token(
        &self,
        provider_token: &str,
    ) -> AppResult<Option<SettlementOperation>>;

    /// Compare-and-set Reserved -> Submitted, stamping `submitted_at`.
    /// Returns false when the operation was not in Reserved.
    async fn mark_submitted(&self, operation_id: Uuid) -> AppResult<bool>;

    /// Submitted -> Settled plus the pending decrement, one atomic unit.
    /// Returns false when the operation already left Submitted (duplicate or
    /// late event); in that case the ledger is untouched.
    async fn settle_operation(
        &self,
        op: &SettlementOperation,
        external_reference: &str,
    ) -> AppResult<bool>;

    /// Swap variant of `settle_operation`: settles the source leg and credits
    /// the target leg inside the same atomic unit, never as two independent
    /// calls.
    async fn settle_swap(
        &self,
        op: &SettlementOperation,
        external_reference: &str,
    ) -> AppResult<bool>;

    /// Submitted -> Failed -> Compensated with exactly one release of the
    /// reserved funds. The Submitted guard makes the compensation
    /// exactly-once under concurrent duplicate decline callbacks; returns
    /// false for the losers, who must not touch the ledger.
    async fn fail_and_compensate(
        &self,
        op: &SettlementOperation,
        reason: &str,
    ) -> AppResult<bool>;

    /// Operations sitting in Submitted since before `older_than`; input for
    /// the reconciliation pass.
    async fn list_stuck_submitted(
        &self,
        older_than: DateTime<Utc>,
    ) -> AppResult<Vec<SettlementOperation>>;
}
