use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{AppResult, GuardError};
use crate::ledger::models::AssetCode;

/// Limit/KYC service contract. Denial rejects the operation before any
/// ledger access.
#[async_trait]
pub trait LimitChecker: Send + Sync {
    async fn check(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
        usd_value: Decimal,
    ) -> AppResult<()>;
}

/// Authentication factor validator (second factor + transaction PIN).
#[async_trait]
pub trait AuthValidator: Send + Sync {
    async fn verify(
        &self,
        user_id: Uuid,
        second_factor: &str,
        transaction_pin: &str,
    ) -> AppResult<()>;
}

// ============ HTTP COLLABORATORS ============

pub struct HttpLimitChecker {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct LimitCheckRequest<'a> {
    user_id: Uuid,
    asset: &'a str,
    amount: String,
    usd_value: String,
}

#[derive(Debug, Deserialize)]
struct LimitCheckResponse {
    allowed: bool,
    reason: Option<String>,
}

impl HttpLimitChecker {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LimitChecker for HttpLimitChecker {
    async fn check(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
        usd_value: Decimal,
    ) -> AppResult<()> {
        let request = LimitCheckRequest {
            user_id,
            asset: asset.as_str(),
            amount: amount.to_string(),
            usd_value: usd_value.to_string(),
        };

        let response = self
            .client
            .post(format!("{}/v1/limits/check", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            // A broken limit service must not let funds move
            return Err(GuardError::LimitExceeded(
                "Limit service unavailable".to_string(),
            )
            .into());
        }

        let body: LimitCheckResponse = response.json().await?;
        if !body.allowed {
            return Err(GuardError::LimitExceeded(
                body.reason.unwrap_or_else(|| "Limit denied".to_string()),
            )
            .into());
        }

        Ok(())
    }
}

pub struct HttpAuthValidator {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    user_id: Uuid,
    second_factor: &'a str,
    transaction_pin: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    ok: bool,
}

impl HttpAuthValidator {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AuthValidator for HttpAuthValidator {
    async fn verify(
        &self,
        user_id: Uuid,
        second_factor: &str,
        transaction_pin: &str,
    ) -> AppResult<()> {
        let request = VerifyRequest {
            user_id,
            second_factor,
            transaction_pin,
        };

        let response = self
            .client
            .post(format!("{}/v1/auth/verify", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GuardError::AuthenticationDenied.into());
        }

        let body: VerifyResponse = response.json().await?;
        if !body.ok {
            return Err(GuardError::AuthenticationDenied.into());
        }

        Ok(())
    }
}

// ============ DEVELOPMENT STUBS ============

/// Allows everything. Wired only when no limit service endpoint is
/// configured; bootstrap logs the substitution loudly.
pub struct PermissiveLimits;

#[async_trait]
impl LimitChecker for PermissiveLimits {
    async fn check(
        &self,
        user_id: Uuid,
        asset: AssetCode,
        amount: Decimal,
        _usd_value: Decimal,
    ) -> AppResult<()> {
        warn!(
            "Permissive limit check: {} {} for user {}",
            amount, asset, user_id
        );
        Ok(())
    }
}

/// Accepts any non-empty factor pair.
pub struct PermissiveAuth;

#[async_trait]
impl AuthValidator for PermissiveAuth {
    async fn verify(
        &self,
        _user_id: Uuid,
        second_factor: &str,
        transaction_pin: &str,
    ) -> AppResult<()> {
        if second_factor.is_empty() || transaction_pin.is_empty() {
            return Err(GuardError::AuthenticationDenied.into());
        }
        Ok(())
    }
}
