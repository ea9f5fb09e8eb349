use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::spawn;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEventType, AuditLog};
use crate::error::{AppResult, GuardError, IdempotencyError, RailError, SettlementError};
use crate::idempotency::{validate_key, BeginOutcome, IdempotencyStore, StoredResult};
use crate::ledger::models::{AccountBalance, AssetCode};
use crate::ledger::LedgerStore;
use crate::locks::{DistributedMutex, Lease};
use crate::notify::{NotificationDispatcher, SettlementNotice};
use crate::oracle::PriceOracle;
use crate::rail::{RailAdapter, RailPayout, RailProviderState, RailStatus};
use crate::risk::{AuthValidator, LimitChecker};

use super::models::{
    OperationKind, OperationSnapshot, SettlementOperation, SettlementState,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fee taken on every operation, in basis points of the amount
    pub fee_bps: u32,
    /// Fee floor, expressed in USD and converted at the oracle rate
    pub min_fee_usd: Decimal,
    /// How often a caller racing an in-flight twin re-checks for its result
    pub in_progress_polls: u32,
    pub in_progress_poll_delay: Duration,
    /// Lease TTL for multi-leg flows; must stay under the operation's
    /// maximum expected duration so a dead holder cannot park the key
    pub lease_ttl: Duration,
    pub lease_max_wait: Duration,
    /// Operations sitting in Submitted longer than this get reconciled
    pub reconcile_after_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fee_bps: 25,
            min_fee_usd: Decimal::new(50, 2),
            in_progress_polls: 3,
            in_progress_poll_delay: Duration::from_millis(150),
            lease_ttl: Duration::from_secs(10),
            lease_max_wait: Duration::from_secs(5),
            reconcile_after_secs: 120,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WithdrawalCommand {
    pub user_id: Uuid,
    pub asset: AssetCode,
    pub amount: Decimal,
    pub destination: String,
    pub second_factor: String,
    pub transaction_pin: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct SwapCommand {
    pub user_id: Uuid,
    pub from_asset: AssetCode,
    pub to_asset: AssetCode,
    pub amount: Decimal,
    pub second_factor: String,
    pub transaction_pin: String,
    pub idempotency_key: String,
}

/// The balance-reservation + external-settlement orchestrator. Drives one
/// operation from request to terminal state: idempotency gate, guard checks,
/// atomic reservation, rail submission, then settle or compensate.
pub struct SettlementEngine {
    ledger: Arc<dyn LedgerStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    rail: Arc<dyn RailAdapter>,
    mutex: Arc<dyn DistributedMutex>,
    oracle: Arc<dyn PriceOracle>,
    limits: Arc<dyn LimitChecker>,
    auth: Arc<dyn AuthValidator>,
    notifier: Arc<dyn NotificationDispatcher>,
    audit: AuditLog,
    config: EngineConfig,
}

impl SettlementEngine {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        rail: Arc<dyn RailAdapter>,
        mutex: Arc<dyn DistributedMutex>,
        oracle: Arc<dyn PriceOracle>,
        limits: Arc<dyn LimitChecker>,
        auth: Arc<dyn AuthValidator>,
        notifier: Arc<dyn NotificationDispatcher>,
        audit: AuditLog,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            idempotency,
            rail,
            mutex,
            oracle,
            limits,
            auth,
            notifier,
            audit,
            config,
        }
    }

    // ========== PUBLIC SURFACE ==========

    pub async fn submit_withdrawal(
        &self,
        cmd: WithdrawalCommand,
    ) -> AppResult<OperationSnapshot> {
        if let Some(replayed) = self.claim_key(&cmd.idempotency_key, cmd.user_id).await? {
            info!("Replaying cached result for key {}", cmd.idempotency_key);
            return Ok(replayed);
        }

        let op = match self.prepare_withdrawal(&cmd).await {
            Ok(op) => op,
            Err(e) => {
                // Nothing reserved yet; free the key so a legitimate retry
                // can execute
                let _ = self
                    .idempotency
                    .abandon(&cmd.idempotency_key, cmd.user_id)
                    .await;
                return Err(e);
            }
        };

        // From here the operation record owns the key: the reservation is
        // committed and the key must replay or report in-progress, never
        // re-execute
        self.drive_submission(op, None).await
    }

    pub async fn submit_swap(&self, cmd: SwapCommand) -> AppResult<OperationSnapshot> {
        if let Some(replayed) = self.claim_key(&cmd.idempotency_key, cmd.user_id).await? {
            info!("Replaying cached result for key {}", cmd.idempotency_key);
            return Ok(replayed);
        }

        // The swap spans two ledger records, so the whole flow runs under
        // the cross-process mutex
        let lease_key = format!("swap:{}:{}", cmd.user_id, cmd.from_asset.as_str());
        let lease = match self
            .mutex
            .acquire(&lease_key, self.config.lease_ttl, self.config.lease_max_wait)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                let _ = self
                    .idempotency
                    .abandon(&cmd.idempotency_key, cmd.user_id)
                    .await;
                return Err(e);
            }
        };

        let outcome = self.submit_swap_locked(&cmd, &lease).await;
        let _ = self.mutex.release(lease).await;
        outcome
    }

    async fn submit_swap_locked(
        &self,
        cmd: &SwapCommand,
        lease: &Lease,
    ) -> AppResult<OperationSnapshot> {
        let op = match self.prepare_swap(cmd).await {
            Ok(op) => op,
            Err(e) => {
                let _ = self
                    .idempotency
                    .abandon(&cmd.idempotency_key, cmd.user_id)
                    .await;
                return Err(e);
            }
        };

        self.drive_submission(op, Some(lease.clone())).await
    }

    /// State snapshot for the poll endpoint.
    pub async fn operation(&self, operation_id: Uuid) -> AppResult<OperationSnapshot> {
        let op = self
            .ledger
            .get_operation(operation_id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(operation_id.to_string()))?;
        Ok(OperationSnapshot::from(&op))
    }

    pub async fn balance(
        &self,
        user_id: Uuid,
        asset: AssetCode,
    ) -> AppResult<AccountBalance> {
        Ok(self
            .ledger
            .get_balance(user_id, asset)
            .await?
            .unwrap_or_else(|| AccountBalance::new(user_id, asset)))
    }

    /// Apply a provider callback. Duplicate and late events on a terminal
    /// operation are no-ops, recorded in the audit trail.
    pub async fn apply_rail_event(
        &self,
        token: &str,
        status: RailStatus,
    ) -> AppResult<OperationSnapshot> {
        let op = self
            .ledger
            .get_operation_by_token(token)
            .await?
            .ok_or_else(|| SettlementError::NotFound(token.to_string()))?;

        if op.is_terminal() {
            self.audit.record(
                op.id,
                op.correlation_id,
                AuditEventType::DuplicateEvent,
                Some(op.state),
                Some(op.state),
                serde_json::json!({ "source": "callback" }),
            );
            return Ok(OperationSnapshot::from(&op));
        }

        match status {
            RailStatus::Settled { provider_ref } => {
                self.finalize_settled(&op, &provider_ref).await
            }
            RailStatus::Declined { code, reason } => {
                self.finalize_declined(&op, &code, &reason).await
            }
            RailStatus::Pending => Ok(OperationSnapshot::from(&op)),
        }
    }

    // ========== IDEMPOTENCY GATE ==========

    /// Claim the key or surface the cached twin. The loser of a race polls
    /// briefly for the winner's result, then reports in-progress instead of
    /// re-executing.
    async fn claim_key(
        &self,
        key: &str,
        requester_id: Uuid,
    ) -> AppResult<Option<OperationSnapshot>> {
        validate_key(key)?;

        let mut attempt = 0;
        loop {
            match self.idempotency.begin(key, requester_id).await? {
                BeginOutcome::New => return Ok(None),
                BeginOutcome::Replay(stored) => {
                    let snapshot: OperationSnapshot = serde_json::from_value(stored.payload)
                        .map_err(|e| {
                            crate::error::AppError::Internal(format!(
                                "Corrupt cached result for key {}: {}",
                                key, e
                            ))
                        })?;
                    return Ok(Some(snapshot));
                }
                BeginOutcome::InProgress => {
                    if attempt >= self.config.in_progress_polls {
                        return Err(IdempotencyError::InProgress.into());
                    }
                    attempt += 1;
                    tokio::time::sleep(self.config.in_progress_poll_delay).await;
                }
            }
        }
    }

    // ========== REQUEST -> RESERVED ==========

    async fn prepare_withdrawal(
        &self,
        cmd: &WithdrawalCommand,
    ) -> AppResult<SettlementOperation> {
        let mut op = SettlementOperation::new_withdrawal(
            cmd.user_id,
            cmd.asset,
            cmd.asset.quantize(cmd.amount),
            Decimal::ZERO,
            cmd.destination.clone(),
            cmd.idempotency_key.clone(),
        );

        if let Err(e) = self
            .run_guards(
                &mut op,
                &cmd.second_factor,
                &cmd.transaction_pin,
                |_| Ok(()),
            )
            .await
        {
            return Err(e);
        }

        self.reserve(op).await
    }

    async fn prepare_swap(&self, cmd: &SwapCommand) -> AppResult<SettlementOperation> {
        let mut op = SettlementOperation::new_swap(
            cmd.user_id,
            cmd.from_asset,
            cmd.from_asset.quantize(cmd.amount),
            Decimal::ZERO,
            cmd.to_asset,
            Decimal::ZERO,
            cmd.idempotency_key.clone(),
        );

        let to_asset = cmd.to_asset;
        if let Err(e) = self
            .run_guards(&mut op, &cmd.second_factor, &cmd.transaction_pin, |op| {
                if op.asset == to_asset {
                    return Err(GuardError::Validation(
                        "Cannot swap an asset into itself".to_string(),
                    )
                    .into());
                }
                Ok(())
            })
            .await
        {
            return Err(e);
        }

        // The credit leg is fixed at request time from the quoted rate; the
        // provider executes at exactly this figure
        let from_price = self.oracle.usd_price(op.asset).await?;
        let to_price = self.oracle.usd_price(cmd.to_asset).await?;
        op.counter_amount = Some(cmd.to_asset.quantize(op.amount * from_price / to_price));

        self.reserve(op).await
    }

    /// Validation, authentication and limit checks. Any failure rejects with
    /// zero ledger side effects.
    async fn run_guards<F>(
        &self,
        op: &mut SettlementOperation,
        second_factor: &str,
        transaction_pin: &str,
        extra_validation: F,
    ) -> AppResult<()>
    where
        F: FnOnce(&SettlementOperation) -> AppResult<()>,
    {
        let outcome = self
            .guard_checks(op, second_factor, transaction_pin, extra_validation)
            .await;

        if let Err(e) = &outcome {
            self.audit.record(
                op.id,
                op.correlation_id,
                AuditEventType::OperationRejected,
                Some(SettlementState::Requested),
                Some(SettlementState::Rejected),
                serde_json::json!({ "reason": e.to_string() }),
            );
        }
        outcome
    }

    async fn guard_checks<F>(
        &self,
        op: &mut SettlementOperation,
        second_factor: &str,
        transaction_pin: &str,
        extra_validation: F,
    ) -> AppResult<()>
    where
        F: FnOnce(&SettlementOperation) -> AppResult<()>,
    {
        if op.amount <= Decimal::ZERO {
            return Err(GuardError::Validation(
                "Amount must be positive".to_string(),
            )
            .into());
        }
        if op.kind == OperationKind::Withdrawal
            && op.destination.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return Err(GuardError::Validation(
                "Destination must not be empty".to_string(),
            )
            .into());
        }
        extra_validation(op)?;

        self.auth
            .verify(op.user_id, second_factor, transaction_pin)
            .await?;

        let price = self.oracle.usd_price(op.asset).await?;
        op.fee = self.compute_fee(op.asset, op.amount, price);

        self.limits
            .check(op.user_id, op.asset, op.amount, op.amount * price)
            .await?;

        Ok(())
    }

    /// Percentage fee with a USD floor, truncated to the asset's precision.
    fn compute_fee(&self, asset: AssetCode, amount: Decimal, usd_price: Decimal) -> Decimal {
        let bps_fee = amount * Decimal::from(self.config.fee_bps) / Decimal::from(10_000);
        let floor = if self.config.min_fee_usd.is_zero() {
            Decimal::ZERO
        } else {
            self.config.min_fee_usd / usd_price
        };
        asset.quantize(bps_fee.max(floor))
    }

    async fn reserve(&self, mut op: SettlementOperation) -> AppResult<SettlementOperation> {
        if let Err(e) = self.ledger.reserve_and_insert(&op).await {
            // Insufficient funds (or an aborted transaction): rejected with
            // zero ledger side effects
            self.audit.record(
                op.id,
                op.correlation_id,
                AuditEventType::OperationRejected,
                Some(SettlementState::Requested),
                Some(SettlementState::Rejected),
                serde_json::json!({ "reason": e.to_string() }),
            );
            return Err(e);
        }
        op.state = SettlementState::Reserved;

        self.audit.record(
            op.id,
            op.correlation_id,
            AuditEventType::FundsReserved,
            Some(SettlementState::Requested),
            Some(SettlementState::Reserved),
            serde_json::json!({
                "amount": op.amount.to_string(),
                "fee": op.fee.to_string(),
                "asset": op.asset.as_str(),
            }),
        );

        Ok(op)
    }

    // ========== RESERVED -> TERMINAL ==========

    async fn drive_submission(
        &self,
        mut op: SettlementOperation,
        lease: Option<Lease>,
    ) -> AppResult<OperationSnapshot> {
        if !self.ledger.mark_submitted(op.id).await? {
            // Another worker is already driving this operation
            return self.operation(op.id).await;
        }
        op.state = SettlementState::Submitted;

        self.audit.record(
            op.id,
            op.correlation_id,
            AuditEventType::RailSubmitted,
            Some(SettlementState::Reserved),
            Some(SettlementState::Submitted),
            serde_json::json!({ "provider_token": op.provider_token }),
        );

        // The rail call can outlive the remaining lease; renew first. Losing
        // the lease is not fatal: the conditional transitions keep any
        // concurrent resolver correct.
        if let Some(mut lease) = lease {
            if let Err(e) = self.mutex.renew(&mut lease, self.config.lease_ttl).await {
                warn!("Lease renewal failed before rail call: {:?}", e);
            }
        }

        let payout = RailPayout::from(&op);
        match self.rail.submit(&payout).await {
            Ok(receipt) => match receipt.provider_state {
                RailProviderState::Completed => {
                    self.finalize_settled(&op, &receipt.provider_ref).await
                }
                // Accepted but completing asynchronously; the callback or
                // the reconciliation pass carries the terminal outcome
                RailProviderState::Processing => self.operation(op.id).await,
            },
            Err(RailError::Declined { code, reason }) => {
                self.finalize_declined(&op, &code, &reason).await
            }
            Err(ambiguous) => {
                // Timeout or unknown outcome: the provider may have executed
                // the debit, so the operation stays Submitted and is never
                // auto-compensated. Reconciliation resolves it.
                warn!(
                    "Rail outcome ambiguous for operation {}: {:?}",
                    op.id, ambiguous
                );
                self.audit.record(
                    op.id,
                    op.correlation_id,
                    AuditEventType::RailOutcomeUnknown,
                    Some(SettlementState::Submitted),
                    Some(SettlementState::Submitted),
                    serde_json::json!({ "error": ambiguous.to_string() }),
                );
                self.operation(op.id).await
            }
        }
    }

    async fn finalize_settled(
        &self,
        op: &SettlementOperation,
        provider_ref: &str,
    ) -> AppResult<OperationSnapshot> {
        let applied = match op.kind {
            OperationKind::Withdrawal => {
                self.ledger.settle_operation(op, provider_ref).await?
            }
            OperationKind::Swap => self.ledger.settle_swap(op, provider_ref).await?,
        };

        if !applied {
            self.audit.record(
                op.id,
                op.correlation_id,
                AuditEventType::DuplicateEvent,
                None,
                None,
                serde_json::json!({ "event": "settled", "provider_ref": provider_ref }),
            );
            return self.operation(op.id).await;
        }

        self.audit.record(
            op.id,
            op.correlation_id,
            AuditEventType::OperationSettled,
            Some(SettlementState::Submitted),
            Some(SettlementState::Settled),
            serde_json::json!({ "provider_ref": provider_ref }),
        );

        self.complete_and_notify(op.id, &op.idempotency_key, op.user_id).await
    }

    async fn finalize_declined(
        &self,
        op: &SettlementOperation,
        code: &str,
        reason: &str,
    ) -> AppResult<OperationSnapshot> {
        let reason_line = format!("[{}] {}", code, reason);
        let applied = self.ledger.fail_and_compensate(op, &reason_line).await?;

        if !applied {
            self.audit.record(
                op.id,
                op.correlation_id,
                AuditEventType::DuplicateEvent,
                None,
                None,
                serde_json::json!({ "event": "declined", "code": code }),
            );
            return self.operation(op.id).await;
        }

        self.audit.record(
            op.id,
            op.correlation_id,
            AuditEventType::RailDeclined,
            Some(SettlementState::Submitted),
            Some(SettlementState::Failed),
            serde_json::json!({ "code": code, "reason": reason }),
        );
        self.audit.record(
            op.id,
            op.correlation_id,
            AuditEventType::FundsCompensated,
            Some(SettlementState::Failed),
            Some(SettlementState::Compensated),
            serde_json::json!({ "amount": op.total_debit().to_string() }),
        );

        self.complete_and_notify(op.id, &op.idempotency_key, op.user_id).await
    }

    /// Cache the terminal result for replays and fan out the notification.
    /// Both happen strictly after the transition committed and neither can
    /// roll it back.
    async fn complete_and_notify(
        &self,
        operation_id: Uuid,
        idempotency_key: &str,
        requester_id: Uuid,
    ) -> AppResult<OperationSnapshot> {
        let snapshot = self.operation(operation_id).await?;

        let payload = serde_json::to_value(&snapshot).map_err(|e| {
            crate::error::AppError::Internal(format!("Snapshot serialization: {}", e))
        })?;
        if let Err(e) = self
            .idempotency
            .complete(
                idempotency_key,
                requester_id,
                StoredResult {
                    payload,
                    status: snapshot.state.to_string(),
                },
            )
            .await
        {
            warn!(
                "Failed to cache result for operation {}: {:?}",
                operation_id, e
            );
        }

        let notice = SettlementNotice {
            user_id: requester_id,
            operation_id: snapshot.operation_id,
            kind: snapshot.kind,
            state: snapshot.state,
            asset: snapshot.asset.as_str().to_string(),
            amount: snapshot.amount.clone(),
            failure_reason: snapshot.failure_reason.clone(),
        };
        let notifier = self.notifier.clone();
        spawn(async move {
            if let Err(e) = notifier.dispatch(&notice).await {
                warn!(
                    "Notification dispatch failed for operation {}: {:?}",
                    notice.operation_id, e
                );
            }
        });

        Ok(snapshot)
    }

    // ========== RECONCILIATION ==========

    /// Resolve operations stuck in Submitted by asking the provider. Each
    /// operation resolves to exactly one of Settled or Compensated, and
    /// never reverts once resolved.
    pub async fn reconcile_once(&self) -> AppResult<usize> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::seconds(self.config.reconcile_after_secs as i64);
        let stuck = self.ledger.list_stuck_submitted(cutoff).await?;

        if stuck.is_empty() {
            return Ok(0);
        }
        info!("🔎 Reconciling {} stuck operation(s)", stuck.len());

        let mut resolved = 0;
        for op in stuck {
            let lease_key = format!("reconcile:{}", op.id);
            // Per-operation serialization across reconciler instances; a
            // busy key means someone else is on it
            let lease = match self
                .mutex
                .acquire(&lease_key, self.config.lease_ttl, Duration::from_millis(200))
                .await
            {
                Ok(lease) => lease,
                Err(_) => continue,
            };

            match self.reconcile_operation(&op).await {
                Ok(true) => resolved += 1,
                Ok(false) => {}
                Err(e) => warn!("Reconciliation failed for {}: {:?}", op.id, e),
            }

            let _ = self.mutex.release(lease).await;
        }

        Ok(resolved)
    }

    async fn reconcile_operation(&self, op: &SettlementOperation) -> AppResult<bool> {
        // Re-read under the lease; a callback may have resolved it while we
        // waited
        let current = match self.ledger.get_operation(op.id).await? {
            Some(current) if current.state == SettlementState::Submitted => current,
            _ => return Ok(false),
        };

        let status = match self.rail.status(&current.provider_token).await {
            Ok(status) => status,
            Err(e) => {
                // Still ambiguous; the next pass tries again
                warn!("Status query failed for operation {}: {:?}", op.id, e);
                return Ok(false);
            }
        };

        let resolved_to = match status {
            RailStatus::Settled { provider_ref } => {
                self.finalize_settled(&current, &provider_ref).await?;
                "settled"
            }
            RailStatus::Declined { code, reason } => {
                self.finalize_declined(&current, &code, &reason).await?;
                "compensated"
            }
            RailStatus::Pending => return Ok(false),
        };

        self.audit.record(
            current.id,
            current.correlation_id,
            AuditEventType::ReconciliationResolved,
            Some(SettlementState::Submitted),
            None,
            serde_json::json!({ "resolved_to": resolved_to }),
        );

        Ok(true)
    }
}
