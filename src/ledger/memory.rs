use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppResult, LedgerError, SettlementError};
use crate::settlement::models::{SettlementOperation, SettlementState};

use super::models::{AccountBalance, AssetCode};
use super::LedgerStore;

#[derive(Default)]
struct Inner {
    balances: HashMap<(Uuid, AssetCode), AccountBalance>,
    operations: HashMap<Uuid, SettlementOperation>,
}

/// In-memory ledger with the same contract as the Postgres store. Every
/// mutation takes the single write lock, so each trait call is one atomic
/// critical section. Used for development mode and tests.
pub struct MemoryLedger {
    inner: RwLock<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_positive(amount: Decimal) -> AppResult<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::NonPositiveAmount(amount.to_string()).into());
    }
    Ok(())
}

fn credit_in(inner: &mut Inner, user_id: Uuid, asset: AssetCode, amount: Decimal) {
    let balance = inner
        .balances
        .entry((user_id, asset))
        .or_insert_with(|| AccountBalance::new(user_id, asset));
    balance.available += amount;
    balance.updated_at = Utc::now();
}

fn reserve_in(
    inner: &mut Inner,
    user_id: Uuid,
    asset: AssetCode,
    amount: Decimal,
) -> AppResult<()> {
    let balance = inner
        .balances
        .get_mut(&(user_id, asset))
        .ok_or(LedgerError::NoBalance { asset })?;

    if !balance.has_available(amount) {
        return Err(LedgerError::InsufficientFunds {
            required: amount.to_string(),
            available: balance.available.to_string(),
        }
        .into());
    }

    balance.available -= amount;
    balance.pending += amount;
    balance.updated_at = Utc::now();
    Ok(())
}

fn settle_in(
    inner: &mut Inner,
    user_id: Uuid,
    asset: AssetCode,
    amount: Decimal,
) -> AppResult<()> {
    let balance = inner
        .balances
        .get_mut(&(user_id, asset))
        .ok_or(LedgerError::NoBalance { asset })?;

    if balance.pending < amount {
        return Err(LedgerError::PendingUnderflow {
            asset,
            amount: amount.to_string(),
        }
        .into());
    }

    balance.pending -= amount;
    balance.updated_at = Utc::now();
    Ok(())
}

fn release_in(
    inner: &mut Inner,
    user_id: Uuid,
    asset: AssetCode,
    amount: Decimal,
) -> AppResult<()> {
    let balance = inner
        .balances
        .get_mut(&(user_id, asset))
        .ok_or(LedgerError::NoBalance { asset })?;

    if balance.pending < amount {
        return Err(LedgerError::PendingUnderflow {
            asset,
            amount: amount.to_string(),
        }
        .into());
    }

    balance.pending -= amount;
    balance.available += amount;
    balance.updated_at = Utc::now();
    Ok(())
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn get_balance(
        &self,
        user_id: Uuid,
        asset: AssetCode,
    ) -> AppResult<Option<AccountBalance>> {
        let inner = self.inner.read().await;
        Ok(inner.balances.get(&(user_id, asset)).cloned())
    }

    async fn credit(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<AccountBalance> {
        ensure_positive(amount)?;
        let mut inner = self.inner.write().await;
        credit_in(&mut inner, user_id, asset, amount);
        Ok(inner.balances[&(user_id, asset)].clone())
    }

    async fn reserve(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<()> {
        ensure_positive(amount)?;
        let mut inner = self.inner.write().await;
        reserve_in(&mut inner, user_id, asset, amount)
    }

    async fn settle(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<()> {
        ensure_positive(amount)?;
        let mut inner = self.inner.write().await;
        settle_in(&mut inner, user_id, asset, amount)
    }

    async fn release(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
    ) -> AppResult<()> {
        ensure_positive(amount)?;
        let mut inner = self.inner.write().await;
        release_in(&mut inner, user_id, asset, amount)
    }

    async fn reserve_and_insert(&self, op: &SettlementOperation) -> AppResult<()> {
        ensure_positive(op.total_debit())?;
        let mut inner = self.inner.write().await;

        // Reservation first; an insufficient balance leaves no trace
        reserve_in(&mut inner, op.user_id, op.asset, op.total_debit())?;

        let mut stored = op.clone();
        stored.state = SettlementState::Reserved;
        stored.updated_at = Utc::now();
        inner.operations.insert(stored.id, stored);
        Ok(())
    }

    async fn get_operation(
        &self,
        operation_id: Uuid,
    ) -> AppResult<Option<SettlementOperation>> {
        let inner = self.inner.read().await;
        Ok(inner.operations.get(&operation_id).cloned())
    }

    async fn get_operation_by_token(
        &self,
        provider_token: &str,
    ) -> AppResult<Option<SettlementOperation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .operations
            .values()
            .find(|op| op.provider_token == provider_token)
            .cloned())
    }

    async fn mark_submitted(&self, operation_id: Uuid) -> AppResult<bool> {
        SettlementState::ensure_transition(
            SettlementState::Reserved,
            SettlementState::Submitted,
        )?;

        let mut inner = self.inner.write().await;
        let op = inner
            .operations
            .get_mut(&operation_id)
            .ok_or_else(|| SettlementError::NotFound(operation_id.to_string()))?;

        if op.state != SettlementState::Reserved {
            return Ok(false);
        }

        let now = Utc::now();
        op.state = SettlementState::Submitted;
        op.submitted_at = Some(now);
        op.updated_at = now;
        Ok(true)
    }

    async fn settle_operation(
        &self,
        op: &SettlementOperation,
        external_reference: &str,
    ) -> AppResult<bool> {
        SettlementState::ensure_transition(
            SettlementState::Submitted,
            SettlementState::Settled,
        )?;

        let mut inner = self.inner.write().await;
        let current = inner
            .operations
            .get(&op.id)
            .ok_or_else(|| SettlementError::NotFound(op.id.to_string()))?;

        if current.state != SettlementState::Submitted {
            return Ok(false);
        }

        settle_in(&mut inner, op.user_id, op.asset, op.total_debit())?;

        let stored = inner.operations.get_mut(&op.id).expect("checked above");
        stored.state = SettlementState::Settled;
        stored.external_reference = Some(external_reference.to_string());
        stored.updated_at = Utc::now();
        Ok(true)
    }

    async fn settle_swap(
        &self,
        op: &SettlementOperation,
        external_reference: &str,
    ) -> AppResult<bool> {
        SettlementState::ensure_transition(
            SettlementState::Submitted,
            SettlementState::Settled,
        )?;

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

        let mut inner = self.inner.write().await;
        let current = inner
            .operations
            .get(&op.id)
            .ok_or_else(|| SettlementError::NotFound(op.id.to_string()))?;

        if current.state != SettlementState::Submitted {
            return Ok(false);
        }

        // Both legs under the one write guard: the debit leg settles and the
        // credit leg lands together or not at all
        settle_in(&mut inner, op.user_id, op.asset, op.total_debit())?;
        credit_in(&mut inner, op.user_id, target_asset, counter_amount);

        let stored = inner.operations.get_mut(&op.id).expect("checked above");
        stored.state = SettlementState::Settled;
        stored.external_reference = Some(external_reference.to_string());
        stored.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_and_compensate(
        &self,
        op: &SettlementOperation,
        reason: &str,
    ) -> AppResult<bool> {
        SettlementState::ensure_transition(
            SettlementState::Submitted,
            SettlementState::Failed,
        )?;
        SettlementState::ensure_transition(
            SettlementState::Failed,
            SettlementState::Compensated,
        )?;

        let mut inner = self.inner.write().await;
        let current = inner
            .operations
            .get(&op.id)
            .ok_or_else(|| SettlementError::NotFound(op.id.to_string()))?;

        // The Submitted guard is what makes the refund exactly-once: a
        // duplicate decline finds the operation already Compensated
        if current.state != SettlementState::Submitted {
            return Ok(false);
        }

        release_in(&mut inner, op.user_id, op.asset, op.total_debit())?;

        let stored = inner.operations.get_mut(&op.id).expect("checked above");
        stored.state = SettlementState::Compensated;
        stored.failure_reason = Some(reason.to_string());
        stored.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_stuck_submitted(
        &self,
        older_than: DateTime<Utc>,
    ) -> AppResult<Vec<SettlementOperation>> {
        let inner = self.inner.read().await;
        let mut stuck: Vec<SettlementOperation> = inner
            .operations
            .values()
            .filter(|op| {
                op.state == SettlementState::Submitted
                    && op.submitted_at.map(|t| t < older_than).unwrap_or(false)
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|op| op.submitted_at);
        Ok(stuck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    use crate::error::AppError;

    fn withdrawal(user: Uuid, amount: Decimal) -> SettlementOperation {
        SettlementOperation::new_withdrawal(
            user,
            AssetCode::Btc,
            amount,
            Decimal::ZERO,
            "bc1q-test".to_string(),
            "key_0123456789abcdef".to_string(),
        )
    }

    #[tokio::test]
    async fn test_reserve_moves_available_to_pending() {
        let ledger = MemoryLedger::new();
        let user = Uuid::new_v4();

        ledger.credit(user, AssetCode::Btc, dec!(100)).await.unwrap();
        ledger.reserve(user, AssetCode::Btc, dec!(60)).await.unwrap();

        let balance = ledger.get_balance(user, AssetCode::Btc).await.unwrap().unwrap();
        assert_eq!(balance.available, dec!(40));
        assert_eq!(balance.pending, dec!(60));
    }

    #[tokio::test]
    async fn test_reserve_fails_without_funds() {
        let ledger = MemoryLedger::new();
        let user = Uuid::new_v4();

        ledger.credit(user, AssetCode::Btc, dec!(50)).await.unwrap();
        let err = ledger.reserve(user, AssetCode::Btc, dec!(51)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::InsufficientFunds { .. })
        ));

        // Failed reserve leaves the row untouched
        let balance = ledger.get_balance(user, AssetCode::Btc).await.unwrap().unwrap();
        assert_eq!(balance.available, dec!(50));
        assert_eq!(balance.pending, dec!(0));
    }

    #[tokio::test]
    async fn test_non_positive_amounts_rejected() {
        let ledger = MemoryLedger::new();
        let user = Uuid::new_v4();

        for amount in [dec!(0), dec!(-1)] {
            assert!(ledger.credit(user, AssetCode::Eth, amount).await.is_err());
            assert!(ledger.reserve(user, AssetCode::Eth, amount).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_release_restores_available() {
        let ledger = MemoryLedger::new();
        let user = Uuid::new_v4();

        ledger.credit(user, AssetCode::Btc, dec!(100)).await.unwrap();
        ledger.reserve(user, AssetCode::Btc, dec!(60)).await.unwrap();
        ledger.release(user, AssetCode::Btc, dec!(60)).await.unwrap();

        let balance = ledger.get_balance(user, AssetCode::Btc).await.unwrap().unwrap();
        assert_eq!(balance.available, dec!(100));
        assert_eq!(balance.pending, dec!(0));
    }

    #[tokio::test]
    async fn test_settle_only_from_pending() {
        let ledger = MemoryLedger::new();
        let user = Uuid::new_v4();

        ledger.credit(user, AssetCode::Btc, dec!(100)).await.unwrap();
        ledger.reserve(user, AssetCode::Btc, dec!(30)).await.unwrap();
        ledger.settle(user, AssetCode::Btc, dec!(30)).await.unwrap();

        let balance = ledger.get_balance(user, AssetCode::Btc).await.unwrap().unwrap();
        assert_eq!(balance.available, dec!(70));
        assert_eq!(balance.pending, dec!(0));

        let err = ledger.settle(user, AssetCode::Btc, dec!(1)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::PendingUnderflow { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_reserves_never_go_negative() {
        let ledger = Arc::new(MemoryLedger::new());
        let user = Uuid::new_v4();
        ledger.credit(user, AssetCode::Btc, dec!(100)).await.unwrap();

        // 25 tasks race for 10 units each out of 100; exactly 10 may win
        let tasks: Vec<_> = (0..25)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger.reserve(user, AssetCode::Btc, dec!(10)).await.is_ok()
                })
            })
            .collect();

        let wins = join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(wins, 10);

        let balance = ledger.get_balance(user, AssetCode::Btc).await.unwrap().unwrap();
        assert_eq!(balance.available, dec!(0));
        assert_eq!(balance.pending, dec!(100));
    }

    #[tokio::test]
    async fn test_reserve_and_insert_is_atomic() {
        let ledger = MemoryLedger::new();
        let user = Uuid::new_v4();
        ledger.credit(user, AssetCode::Btc, dec!(1)).await.unwrap();

        let op = withdrawal(user, dec!(5));
        assert!(ledger.reserve_and_insert(&op).await.is_err());

        // No orphaned operation record after the failed reservation
        assert!(ledger.get_operation(op.id).await.unwrap().is_none());

        let op = withdrawal(user, dec!(1));
        ledger.reserve_and_insert(&op).await.unwrap();
        let stored = ledger.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SettlementState::Reserved);
    }

    #[tokio::test]
    async fn test_settle_operation_is_write_once() {
        let ledger = MemoryLedger::new();
        let user = Uuid::new_v4();
        ledger.credit(user, AssetCode::Btc, dec!(10)).await.unwrap();

        let op = withdrawal(user, dec!(10));
        ledger.reserve_and_insert(&op).await.unwrap();
        ledger.mark_submitted(op.id).await.unwrap();

        assert!(ledger.settle_operation(&op, "prov-1").await.unwrap());
        // Late duplicate is a no-op
        assert!(!ledger.settle_operation(&op, "prov-2").await.unwrap());

        let stored = ledger.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(stored.external_reference.as_deref(), Some("prov-1"));
    }

    #[tokio::test]
    async fn test_fail_and_compensate_exactly_once() {
        let ledger = Arc::new(MemoryLedger::new());
        let user = Uuid::new_v4();
        ledger.credit(user, AssetCode::Btc, dec!(100)).await.unwrap();

        let op = withdrawal(user, dec!(60));
        ledger.reserve_and_insert(&op).await.unwrap();
        ledger.mark_submitted(op.id).await.unwrap();

        // Two concurrent decline callbacks for the same operation
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let ledger = ledger.clone();
                let op = op.clone();
                tokio::spawn(async move {
                    ledger.fail_and_compensate(&op, "declined").await.unwrap()
                })
            })
            .collect();

        let refunds = join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(refunds, 1, "exactly one compensating credit");

        let balance = ledger.get_balance(user, AssetCode::Btc).await.unwrap().unwrap();
        assert_eq!(balance.available, dec!(100));
        assert_eq!(balance.pending, dec!(0));
    }

    #[tokio::test]
    async fn test_settle_swap_credits_target_leg() {
        let ledger = MemoryLedger::new();
        let user = Uuid::new_v4();
        ledger.credit(user, AssetCode::Btc, dec!(2)).await.unwrap();

        let op = SettlementOperation::new_swap(
            user,
            AssetCode::Btc,
            dec!(1),
            dec!(0.01),
            AssetCode::Usdt,
            dec!(64000),
            "key_0123456789abcdef".to_string(),
        );
        ledger.reserve_and_insert(&op).await.unwrap();
        ledger.mark_submitted(op.id).await.unwrap();
        assert!(ledger.settle_swap(&op, "prov-swap").await.unwrap());

        let btc = ledger.get_balance(user, AssetCode::Btc).await.unwrap().unwrap();
        assert_eq!(btc.available, dec!(0.99));
        assert_eq!(btc.pending, dec!(0));

        let usdt = ledger.get_balance(user, AssetCode::Usdt).await.unwrap().unwrap();
        assert_eq!(usdt.available, dec!(64000));
    }

    #[tokio::test]
    async fn test_list_stuck_submitted_filters_by_age() {
        let ledger = MemoryLedger::new();
        let user = Uuid::new_v4();
        ledger.credit(user, AssetCode::Btc, dec!(50)).await.unwrap();

        let op = withdrawal(user, dec!(20));
        ledger.reserve_and_insert(&op).await.unwrap();
        ledger.mark_submitted(op.id).await.unwrap();

        // Reserved-only operations never show up
        let fresh = withdrawal(user, dec!(20));
        ledger.reserve_and_insert(&fresh).await.unwrap();

        let future = Utc::now() + chrono::Duration::seconds(5);
        let stuck = ledger.list_stuck_submitted(future).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, op.id);

        let past = Utc::now() - chrono::Duration::seconds(60);
        assert!(ledger.list_stuck_submitted(past).await.unwrap().is_empty());
    }
}
