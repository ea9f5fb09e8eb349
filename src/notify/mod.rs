// Notification fan-out on terminal settlement outcomes.
//
// Dispatched strictly after the state transition commits, from a spawned
// task; a delivery failure is logged and goes no further.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::settlement::models::{OperationKind, SettlementState};

#[derive(Debug, Clone)]
pub struct SettlementNotice {
    pub user_id: Uuid,
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub state: SettlementState,
    pub asset: String,
    pub amount: String,
    pub failure_reason: Option<String>,
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notice: &SettlementNotice) -> AppResult<()>;
}

/// Resend-style email dispatch.
pub struct EmailNotifier {
    api_key: String,
    from_email: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct EmailRequest {
    to: String,
    from: String,
    subject: String,
    html: String,
}

#[derive(Debug, Deserialize)]
struct EmailResponse {
    id: String,
}

impl EmailNotifier {
    pub fn new(api_key: String, from_email: String) -> Self {
        Self {
            api_key,
            from_email,
            client: reqwest::Client::new(),
        }
    }

    // Mailboxes are keyed by user id; the mail gateway resolves the real
    // address
    fn recipient(user_id: Uuid) -> String {
        format!("{}@users.payrail.example", user_id)
    }

    fn render(notice: &SettlementNotice) -> (String, String) {
        match notice.state {
            SettlementState::Settled => (
                format!("Your {} of {} {} is complete", notice.kind.as_str(), notice.amount, notice.asset),
                format!(
                    "<p>Your {} of {} {} settled successfully. Reference: {}</p>",
                    notice.kind.as_str(),
                    notice.amount,
                    notice.asset,
                    notice.operation_id
                ),
            ),
            _ => (
                format!("Your {} of {} {} could not be completed", notice.kind.as_str(), notice.amount, notice.asset),
                format!(
                    "<p>Your {} of {} {} failed{} and the funds were returned to your balance.</p>",
                    notice.kind.as_str(),
                    notice.amount,
                    notice.asset,
                    notice
                        .failure_reason
                        .as_deref()
                        .map(|r| format!(" ({})", r))
                        .unwrap_or_default()
                ),
            ),
        }
    }
}

#[async_trait]
impl NotificationDispatcher for EmailNotifier {
    async fn dispatch(&self, notice: &SettlementNotice) -> AppResult<()> {
        let (subject, html) = Self::render(notice);
        let request = EmailRequest {
            to: Self::recipient(notice.user_id),
            from: self.from_email.clone(),
            subject,
            html,
        };

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalError(format!(
                "Email API error: {}",
                error_text
            )));
        }

        let result: EmailResponse = response.json().await?;
        info!("📧 Settlement email sent: {}", result.id);
        Ok(())
    }
}

/// Logs instead of delivering. Wired when no email credentials are
/// configured.
pub struct NoopNotifier;

#[async_trait]
impl NotificationDispatcher for NoopNotifier {
    async fn dispatch(&self, notice: &SettlementNotice) -> AppResult<()> {
        warn!(
            "Notification suppressed (no dispatcher configured): operation {} -> {}",
            notice.operation_id, notice.state
        );
        Ok(())
    }
}
