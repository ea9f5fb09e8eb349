pub mod http;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RailError;
use crate::ledger::models::AssetCode;
use crate::settlement::models::{OperationKind, SettlementOperation};

pub use http::HttpRailAdapter;

/// Provider-facing payout instruction. Built once per operation; the token
/// stays the same across every retry so the provider never double-executes.
#[derive(Debug, Clone, Serialize)]
pub struct RailPayout {
    pub token: String,
    pub operation_id: Uuid,
    pub user_id: Uuid,
    pub kind: OperationKind,
    pub asset: AssetCode,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub destination: Option<String>,
    pub target_asset: Option<AssetCode>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub counter_amount: Option<Decimal>,
}

impl From<&SettlementOperation> for RailPayout {
    fn from(op: &SettlementOperation) -> Self {
        Self {
            token: op.provider_token.clone(),
            operation_id: op.id,
            user_id: op.user_id,
            kind: op.kind,
            asset: op.asset,
            amount: op.amount,
            destination: op.destination.clone(),
            target_asset: op.target_asset,
            counter_amount: op.counter_amount,
        }
    }
}

/// Provider acknowledgement of an accepted submission.
#[derive(Debug, Clone)]
pub struct RailReceipt {
    pub provider_ref: String,
    pub provider_state: RailProviderState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RailProviderState {
    /// Executed synchronously
    Completed,
    /// Accepted, completing asynchronously; the callback or the status query
    /// carries the terminal outcome
    Processing,
}

/// Terminal-or-not status of a submitted payout, as reported by the
/// provider's status endpoint. Used by the reconciliation pass.
#[derive(Debug, Clone)]
pub enum RailStatus {
    Settled { provider_ref: String },
    Declined { code: String, reason: String },
    Pending,
}

/// Narrow interface to the payout/swap provider. Owns all provider-payload
/// translation; callers never see raw provider shapes, and every error comes
/// back as a typed `RailError`.
#[async_trait]
pub trait RailAdapter: Send + Sync {
    /// Submit a payout. `Declined` is the only error that licenses
    /// compensation; `Transient` and `Unknown` mean the debit may already
    /// have happened on the provider side.
    async fn submit(&self, payout: &RailPayout) -> Result<RailReceipt, RailError>;

    /// Query the provider's view of a previously submitted token.
    async fn status(&self, token: &str) -> Result<RailStatus, RailError>;
}
