use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::RailError;

use super::{RailAdapter, RailPayout, RailProviderState, RailReceipt, RailStatus};

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP client for the payout provider's JSON API (bearer-auth).
pub struct HttpRailAdapter {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ProviderSubmitRequest<'a> {
    idempotency_token: &'a str,
    kind: &'a str,
    asset: &'a str,
    amount: String,
    destination: Option<&'a str>,
    target_asset: Option<&'a str>,
    target_amount: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderSubmitResponse {
    reference: String,
    state: RailProviderState,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorResponse {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ProviderStatusResponse {
    state: String,
    reference: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

impl HttpRailAdapter {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SUBMIT_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            base_url,
            api_key,
            client,
        }
    }

    /// Map a transport failure onto the taxonomy. A timeout is Unknown, not
    /// a decline: the provider may have executed the debit before we gave up
    /// waiting.
    fn classify_transport_error(error: reqwest::Error) -> RailError {
        if error.is_timeout() {
            RailError::Unknown("Provider call timed out".to_string())
        } else if error.is_connect() {
            RailError::Transient(format!("Provider unreachable: {}", error))
        } else {
            RailError::Unknown(format!("Provider transport error: {}", error))
        }
    }
}

#[async_trait]
impl RailAdapter for HttpRailAdapter {
    async fn submit(&self, payout: &RailPayout) -> Result<RailReceipt, RailError> {
        let request = ProviderSubmitRequest {
            idempotency_token: &payout.token,
            kind: payout.kind.as_str(),
            asset: payout.asset.as_str(),
            amount: payout.amount.to_string(),
            destination: payout.destination.as_deref(),
            target_asset: payout.target_asset.map(|a| a.as_str()),
            target_amount: payout.counter_amount.map(|a| a.to_string()),
        };

        debug!("Submitting payout {} to rail", payout.operation_id);

        let response = self
            .client
            .post(format!("{}/v1/payouts", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(Self::classify_transport_error)?;

        let status = response.status();

        if status.is_success() {
            let body: ProviderSubmitResponse = response
                .json()
                .await
                .map_err(|e| RailError::Unknown(format!("Unreadable provider response: {}", e)))?;
            return Ok(RailReceipt {
                provider_ref: body.reference,
                provider_state: body.state,
            });
        }

        // 4xx carries a definitive decline; everything else is retryable or
        // ambiguous
        if status.is_client_error() {
            let body: ProviderErrorResponse = response.json().await.map_err(|e| {
                RailError::Unknown(format!("Undecodable decline payload: {}", e))
            })?;
            warn!(
                "Rail declined payout {}: [{}] {}",
                payout.operation_id, body.code, body.message
            );
            return Err(RailError::Declined {
                code: body.code,
                reason: body.message,
            });
        }

        if status.as_u16() == 503 || status.as_u16() == 502 {
            return Err(RailError::Transient(format!(
                "Provider unavailable: HTTP {}",
                status
            )));
        }

        Err(RailError::Unknown(format!(
            "Unexpected provider status: HTTP {}",
            status
        )))
    }

    async fn status(&self, token: &str) -> Result<RailStatus, RailError> {
        let response = self
            .client
            .get(format!("{}/v1/payouts/{}", self.base_url, token))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(Self::classify_transport_error)?;

        if !response.status().is_success() {
            return Err(RailError::Transient(format!(
                "Status query failed: HTTP {}",
                response.status()
            )));
        }

        let body: ProviderStatusResponse = response
            .json()
            .await
            .map_err(|e| RailError::Unknown(format!("Unreadable status payload: {}", e)))?;

        match body.state.as_str() {
            "settled" | "completed" => Ok(RailStatus::Settled {
                provider_ref: body.reference.unwrap_or_else(|| token.to_string()),
            }),
            "declined" | "failed" => Ok(RailStatus::Declined {
                code: body.code.unwrap_or_else(|| "UNSPECIFIED".to_string()),
                reason: body.message.unwrap_or_else(|| "Declined by provider".to_string()),
            }),
            "processing" | "pending" => Ok(RailStatus::Pending),
            other => Err(RailError::Unknown(format!(
                "Unrecognized provider state: {}",
                other
            ))),
        }
    }
}
