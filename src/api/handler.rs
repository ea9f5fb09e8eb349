use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::models::*;
use crate::{
    error::{AppError, AppResult, GuardError},
    ledger::models::AssetCode,
    settlement::engine::{SettlementEngine, SwapCommand, WithdrawalCommand},
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SettlementEngine>,
}

fn parse_amount(raw: &str) -> AppResult<Decimal> {
    Decimal::from_str(raw)
        .map_err(|_| GuardError::Validation(format!("Invalid amount: {}", raw)).into())
}

fn validated<T: validator::Validate>(request: &T) -> AppResult<()> {
    request
        .validate()
        .map_err(|e| AppError::Guard(GuardError::Validation(e.to_string())))
}

/// Settle funds out to the rail
/// POST /api/v1/settlement
pub async fn create_settlement(
    State(state): State<AppState>,
    Json(request): Json<SettlementRequest>,
) -> AppResult<Json<OperationResponse>> {
    validated(&request)?;

    let asset: AssetCode = request.asset.parse()?;
    let amount = parse_amount(&request.amount)?;
    info!(
        "Settlement request: {} {} for user {}",
        amount, asset, request.user_id
    );

    let snapshot = state
        .engine
        .submit_withdrawal(WithdrawalCommand {
            user_id: request.user_id,
            asset,
            amount,
            destination: request.destination,
            second_factor: request.second_factor,
            transaction_pin: request.transaction_pin,
            idempotency_key: request.idempotency_key.unwrap_or_default(),
        })
        .await?;

    Ok(Json(snapshot.into()))
}

/// Swap one asset into another
/// POST /api/v1/swap
pub async fn create_swap(
    State(state): State<AppState>,
    Json(request): Json<SwapRequest>,
) -> AppResult<Json<OperationResponse>> {
    validated(&request)?;

    let from_asset: AssetCode = request.from_asset.parse()?;
    let to_asset: AssetCode = request.to_asset.parse()?;
    let amount = parse_amount(&request.amount)?;
    info!(
        "Swap request: {} {} -> {} for user {}",
        amount, from_asset, to_asset, request.user_id
    );

    let snapshot = state
        .engine
        .submit_swap(SwapCommand {
            user_id: request.user_id,
            from_asset,
            to_asset,
            amount,
            second_factor: request.second_factor,
            transaction_pin: request.transaction_pin,
            idempotency_key: request.idempotency_key.unwrap_or_default(),
        })
        .await?;

    Ok(Json(snapshot.into()))
}

/// Operation state snapshot
/// GET /api/v1/settlement/:operation_id
pub async fn get_settlement(
    State(state): State<AppState>,
    Path(operation_id): Path<Uuid>,
) -> AppResult<Json<OperationResponse>> {
    let snapshot = state.engine.operation(operation_id).await?;
    Ok(Json(snapshot.into()))
}

/// Balance snapshot
/// GET /api/v1/balance/:user_id/:asset
pub async fn get_balance(
    State(state): State<AppState>,
    Path((user_id, asset)): Path<(Uuid, String)>,
) -> AppResult<Json<BalanceResponse>> {
    let asset: AssetCode = asset.parse()?;
    let balance = state.engine.balance(user_id, asset).await?;

    Ok(Json(BalanceResponse {
        user_id: balance.user_id,
        asset: balance.asset.as_str().to_string(),
        available: balance.available.to_string(),
        pending: balance.pending.to_string(),
        updated_at: balance.updated_at,
    }))
}

/// Provider callback for asynchronously completing payouts
/// POST /api/v1/webhook/rail
///
/// Idempotent and duplicate-safe: a late or repeated callback on a terminal
/// operation is acknowledged without touching the ledger.
pub async fn rail_webhook(
    State(state): State<AppState>,
    Json(payload): Json<RailWebhookPayload>,
) -> AppResult<Json<WebhookResponse>> {
    info!("🔔 Rail webhook: token {} state {}", payload.token, payload.state);

    let status = match payload.to_status() {
        Some(status) => status,
        None => {
            return Ok(Json(WebhookResponse {
                accepted: false,
                operation_id: None,
                state: None,
                message: format!("Unrecognized provider state: {}", payload.state),
            }));
        }
    };

    match state.engine.apply_rail_event(&payload.token, status).await {
        Ok(snapshot) => Ok(Json(WebhookResponse {
            accepted: true,
            operation_id: Some(snapshot.operation_id),
            state: Some(snapshot.state.as_str().to_string()),
            message: "Processed".to_string(),
        })),
        // Unknown tokens are acknowledged, not errored: the provider retries
        // delivery on non-2xx and the token will never start matching
        Err(AppError::Settlement(crate::error::SettlementError::NotFound(_))) => {
            Ok(Json(WebhookResponse {
                accepted: false,
                operation_id: None,
                state: None,
                message: "Unknown token".to_string(),
            }))
        }
        Err(e) => Err(e),
    }
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
    })
}
