use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, AppResult, SettlementError};
use crate::ledger::models::AssetCode;

/// Settlement operation state machine.
///
/// Happy path: Requested → Reserved → Submitted → Settled.
/// Decline path: Submitted → Failed → Compensated.
/// Guard failures reject before any funds move: Requested → Rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementState {
    Requested,
    Reserved,
    Submitted,
    Settled,
    Failed,
    Compensated,
    Rejected,
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl SettlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementState::Requested => "requested",
            SettlementState::Reserved => "reserved",
            SettlementState::Submitted => "submitted",
            SettlementState::Settled => "settled",
            SettlementState::Failed => "failed",
            SettlementState::Compensated => "compensated",
            SettlementState::Rejected => "rejected",
        }
    }

    /// Write-once states. Failed is not terminal: it still owes its
    /// compensating credit.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SettlementState::Settled
                | SettlementState::Compensated
                | SettlementState::Rejected
        )
    }

    /// Validate a state machine transition. Exhaustive over the source state
    /// so a new state cannot be added without deciding its edges.
    pub fn ensure_transition(from: SettlementState, to: SettlementState) -> AppResult<()> {
        let allowed = match from {
            SettlementState::Requested => matches!(
                to,
                SettlementState::Reserved | SettlementState::Rejected
            ),
            SettlementState::Reserved => matches!(to, SettlementState::Submitted),
            SettlementState::Submitted => {
                matches!(to, SettlementState::Settled | SettlementState::Failed)
            }
            SettlementState::Failed => matches!(to, SettlementState::Compensated),
            // Terminal states accept no transitions
            SettlementState::Settled
            | SettlementState::Compensated
            | SettlementState::Rejected => false,
        };

        if !allowed {
            return Err(SettlementError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        Ok(())
    }
}

impl FromStr for SettlementState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(SettlementState::Requested),
            "reserved" => Ok(SettlementState::Reserved),
            "submitted" => Ok(SettlementState::Submitted),
            "settled" => Ok(SettlementState::Settled),
            "failed" => Ok(SettlementState::Failed),
            "compensated" => Ok(SettlementState::Compensated),
            "rejected" => Ok(SettlementState::Rejected),
            other => Err(AppError::InvalidInput(format!(
                "Unknown settlement state: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Withdrawal,
    Swap,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Withdrawal => "withdrawal",
            OperationKind::Swap => "swap",
        }
    }
}

impl FromStr for OperationKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "withdrawal" => Ok(OperationKind::Withdrawal),
            "swap" => Ok(OperationKind::Swap),
            other => Err(AppError::InvalidInput(format!(
                "Unknown operation kind: {}",
                other
            ))),
        }
    }
}

/// Settlement operation entity.
///
/// Created together with its reservation in one atomic unit; after that the
/// state column is its only mutable field (plus the stamps the transition
/// writes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementOperation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: OperationKind,
    pub asset: AssetCode,

    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee: Decimal,

    /// Withdrawal destination on the rail (address / account reference)
    pub destination: Option<String>,
    /// Swap target asset
    pub target_asset: Option<AssetCode>,
    /// Swap credit leg, fixed at request time from the quoted rate
    #[serde(with = "rust_decimal::serde::float_option")]
    pub counter_amount: Option<Decimal>,

    pub state: SettlementState,
    /// Token we present to the provider; stable across retries of this
    /// operation so the provider never double-executes
    pub provider_token: String,
    /// Provider's reference for the executed payout, set on settlement
    pub external_reference: Option<String>,
    pub failure_reason: Option<String>,

    pub correlation_id: Uuid,
    pub idempotency_key: String,

    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementOperation {
    pub fn new_withdrawal(
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
        fee: Decimal,
        destination: String,
        idempotency_key: String,
    ) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            user_id,
            kind: OperationKind::Withdrawal,
            asset,
            amount,
            fee,
            destination: Some(destination),
            target_asset: None,
            counter_amount: None,
            state: SettlementState::Requested,
            provider_token: derive_provider_token(id),
            external_reference: None,
            failure_reason: None,
            correlation_id: Uuid::new_v4(),
            idempotency_key,
            created_at: now,
            submitted_at: None,
            updated_at: now,
        }
    }

    pub fn new_swap(
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
        fee: Decimal,
        target_asset: AssetCode,
        counter_amount: Decimal,
        idempotency_key: String,
    ) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            user_id,
            kind: OperationKind::Swap,
            asset,
            amount,
            fee,
            destination: None,
            target_asset: Some(target_asset),
            counter_amount: Some(counter_amount),
            state: SettlementState::Requested,
            provider_token: derive_provider_token(id),
            external_reference: None,
            failure_reason: None,
            correlation_id: Uuid::new_v4(),
            idempotency_key,
            created_at: now,
            submitted_at: None,
            updated_at: now,
        }
    }

    /// Amount held back from available while the rail call is in flight
    pub fn total_debit(&self) -> Decimal {
        self.amount + self.fee
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Provider-facing idempotency token, deterministically derived from the
/// operation id. Resubmitting the same operation always carries the same
/// token.
pub fn derive_provider_token(operation_id: Uuid) -> String {
    let digest = Sha256::digest(operation_id.as_bytes());
    hex::encode(digest)
}

/// Caller-facing view of one operation; also the payload cached for
/// idempotent replays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub state: SettlementState,
    pub asset: AssetCode,
    pub amount: String,
    pub fee: String,
    pub target_asset: Option<AssetCode>,
    pub counter_amount: Option<String>,
    pub external_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&SettlementOperation> for OperationSnapshot {
    fn from(op: &SettlementOperation) -> Self {
        Self {
            operation_id: op.id,
            kind: op.kind,
            state: op.state,
            asset: op.asset,
            amount: op.amount.to_string(),
            fee: op.fee.to_string(),
            target_asset: op.target_asset,
            counter_amount: op.counter_amount.map(|a| a.to_string()),
            external_reference: op.external_reference.clone(),
            failure_reason: op.failure_reason.clone(),
            created_at: op.created_at,
            updated_at: op.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn op() -> SettlementOperation {
        SettlementOperation::new_withdrawal(
            Uuid::new_v4(),
            AssetCode::Btc,
            dec!(1.5),
            dec!(0.001),
            "bc1q-destination".to_string(),
            "key_0123456789abcdef".to_string(),
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        use SettlementState::*;
        assert!(SettlementState::ensure_transition(Requested, Reserved).is_ok());
        assert!(SettlementState::ensure_transition(Reserved, Submitted).is_ok());
        assert!(SettlementState::ensure_transition(Submitted, Settled).is_ok());
    }

    #[test]
    fn test_failure_path_transitions() {
        use SettlementState::*;
        assert!(SettlementState::ensure_transition(Submitted, Failed).is_ok());
        assert!(SettlementState::ensure_transition(Failed, Compensated).is_ok());
        assert!(SettlementState::ensure_transition(Requested, Rejected).is_ok());
    }

    #[test]
    fn test_terminal_states_accept_no_transitions() {
        use SettlementState::*;
        for terminal in [Settled, Compensated, Rejected] {
            for target in [
                Requested, Reserved, Submitted, Settled, Failed, Compensated, Rejected,
            ] {
                assert!(
                    SettlementState::ensure_transition(terminal, target).is_err(),
                    "{:?} -> {:?} must be rejected",
                    terminal,
                    target
                );
            }
        }
    }

    #[test]
    fn test_illegal_shortcuts_rejected() {
        use SettlementState::*;
        // Funds may not settle without passing through the rail
        assert!(SettlementState::ensure_transition(Reserved, Settled).is_err());
        // Compensation without a recorded failure would break the audit pairing
        assert!(SettlementState::ensure_transition(Submitted, Compensated).is_err());
        // A reserved operation has already touched the ledger
        assert!(SettlementState::ensure_transition(Reserved, Rejected).is_err());
    }

    #[test]
    fn test_provider_token_is_deterministic() {
        let operation = op();
        assert_eq!(
            operation.provider_token,
            derive_provider_token(operation.id)
        );
        assert_eq!(operation.provider_token.len(), 64);

        let other = op();
        assert_ne!(operation.provider_token, other.provider_token);
    }

    #[test]
    fn test_total_debit_includes_fee() {
        assert_eq!(op().total_debit(), dec!(1.501));
    }
}
