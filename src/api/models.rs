use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::rail::RailStatus;
use crate::settlement::models::OperationSnapshot;

// ========== REQUEST MODELS ==========

/// Request to settle funds out to the rail
#[derive(Debug, Deserialize, Validate)]
pub struct SettlementRequest {
    pub user_id: Uuid,
    pub asset: String,

    #[validate(length(min = 1, message = "amount is required"))]
    pub amount: String,

    #[validate(length(min = 1, message = "destination is required"))]
    pub destination: String,

    #[validate(length(min = 1, message = "second factor is required"))]
    pub second_factor: String,

    #[validate(length(min = 4, message = "transaction PIN is required"))]
    pub transaction_pin: String,

    /// Absent and malformed keys are both rejected before any ledger access
    pub idempotency_key: Option<String>,
}

/// Request to swap one asset into another
#[derive(Debug, Deserialize, Validate)]
pub struct SwapRequest {
    pub user_id: Uuid,
    pub from_asset: String,
    pub to_asset: String,

    #[validate(length(min = 1, message = "amount is required"))]
    pub amount: String,

    #[validate(length(min = 1, message = "second factor is required"))]
    pub second_factor: String,

    #[validate(length(min = 4, message = "transaction PIN is required"))]
    pub transaction_pin: String,

    pub idempotency_key: Option<String>,
}

/// Provider callback payload
#[derive(Debug, Deserialize)]
pub struct RailWebhookPayload {
    /// The idempotency token we attached at submission
    pub token: String,
    pub state: String,
    pub reference: Option<String>,
    pub code: Option<String>,
    pub reason: Option<String>,
}

impl RailWebhookPayload {
    pub fn to_status(&self) -> Option<RailStatus> {
        match self.state.as_str() {
            "settled" | "completed" => Some(RailStatus::Settled {
                provider_ref: self
                    .reference
                    .clone()
                    .unwrap_or_else(|| self.token.clone()),
            }),
            "declined" | "failed" => Some(RailStatus::Declined {
                code: self.code.clone().unwrap_or_else(|| "UNSPECIFIED".to_string()),
                reason: self
                    .reason
                    .clone()
                    .unwrap_or_else(|| "Declined by provider".to_string()),
            }),
            "processing" | "pending" => Some(RailStatus::Pending),
            _ => None,
        }
    }
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct OperationResponse {
    pub operation_id: Uuid,
    pub kind: String,
    pub state: String,
    pub asset: String,
    pub amount: String,
    pub fee: String,
    pub target_asset: Option<String>,
    pub counter_amount: Option<String>,
    pub external_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<OperationSnapshot> for OperationResponse {
    fn from(snapshot: OperationSnapshot) -> Self {
        Self {
            operation_id: snapshot.operation_id,
            kind: snapshot.kind.as_str().to_string(),
            state: snapshot.state.as_str().to_string(),
            asset: snapshot.asset.as_str().to_string(),
            amount: snapshot.amount,
            fee: snapshot.fee,
            target_asset: snapshot.target_asset.map(|a| a.as_str().to_string()),
            counter_amount: snapshot.counter_amount,
            external_reference: snapshot.external_reference,
            failure_reason: snapshot.failure_reason,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub user_id: Uuid,
    pub asset: String,
    pub available: String,
    pub pending: String,
    pub updated_at: DateTime<Utc>,
}

/// Webhook processing response
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub accepted: bool,
    pub operation_id: Option<Uuid>,
    pub state: Option<String>,
    pub message: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(state: &str) -> RailWebhookPayload {
        RailWebhookPayload {
            token: "tok".to_string(),
            state: state.to_string(),
            reference: Some("prov-1".to_string()),
            code: None,
            reason: None,
        }
    }

    #[test]
    fn test_webhook_state_mapping() {
        assert!(matches!(
            payload("settled").to_status(),
            Some(RailStatus::Settled { .. })
        ));
        assert!(matches!(
            payload("declined").to_status(),
            Some(RailStatus::Declined { .. })
        ));
        assert!(matches!(
            payload("pending").to_status(),
            Some(RailStatus::Pending)
        ));
        assert!(payload("garbage").to_status().is_none());
    }

    #[test]
    fn test_declined_mapping_defaults() {
        let mut p = payload("declined");
        p.code = None;
        p.reason = None;
        match p.to_status() {
            Some(RailStatus::Declined { code, .. }) => assert_eq!(code, "UNSPECIFIED"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
