use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::error::AppResult;
use crate::settlement::models::SettlementState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    OperationRejected,
    FundsReserved,
    RailSubmitted,
    OperationSettled,
    RailDeclined,
    FundsCompensated,
    RailOutcomeUnknown,
    DuplicateEvent,
    ReconciliationResolved,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::OperationRejected => "operation_rejected",
            AuditEventType::FundsReserved => "funds_reserved",
            AuditEventType::RailSubmitted => "rail_submitted",
            AuditEventType::OperationSettled => "operation_settled",
            AuditEventType::RailDeclined => "rail_declined",
            AuditEventType::FundsCompensated => "funds_compensated",
            AuditEventType::RailOutcomeUnknown => "rail_outcome_unknown",
            AuditEventType::DuplicateEvent => "duplicate_event",
            AuditEventType::ReconciliationResolved => "reconciliation_resolved",
        }
    }
}

/// Append-only audit entry. Mutated by nothing; removed only by retention
/// purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub correlation_id: Uuid,
    pub event_type: AuditEventType,
    pub before_state: Option<SettlementState>,
    pub after_state: Option<SettlementState>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> AppResult<()>;
}

/// Fire-and-forget audit log. Events flow through an unbounded channel into
/// a background writer; `record` never blocks a settlement transition and a
/// sink failure never propagates back.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl AuditLog {
    pub fn spawn(sink: std::sync::Arc<dyn AuditSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.append(event).await {
                    warn!("Audit sink write failed (event dropped): {:?}", e);
                }
            }
        });

        Self { tx }
    }

    pub fn record(
        &self,
        operation_id: Uuid,
        correlation_id: Uuid,
        event_type: AuditEventType,
        before_state: Option<SettlementState>,
        after_state: Option<SettlementState>,
        details: serde_json::Value,
    ) {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            operation_id,
            correlation_id,
            event_type,
            before_state,
            after_state,
            details,
            created_at: Utc::now(),
        };

        // Send only fails when the writer is gone at shutdown
        let _ = self.tx.send(event);
    }
}

/// Queryable in-memory sink, used in development mode and tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events for one correlation id, in append (temporal) order.
    pub async fn events_for(&self, correlation_id: Uuid) -> Vec<AuditEvent> {
        let events = self.events.read().await;
        events
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    pub async fn events_for_operation(&self, operation_id: Uuid) -> Vec<AuditEvent> {
        let events = self.events.read().await;
        events
            .iter()
            .filter(|e| e.operation_id == operation_id)
            .cloned()
            .collect()
    }

    pub async fn count_of(&self, event_type: AuditEventType) -> usize {
        let events = self.events.read().await;
        events.iter().filter(|e| e.event_type == event_type).count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> AppResult<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}

/// Append-only Postgres sink.
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn append(&self, event: AuditEvent) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (
                id, operation_id, correlation_id, event_type,
                before_state, after_state, details, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(event.operation_id)
        .bind(event.correlation_id)
        .bind(event.event_type.as_str())
        .bind(event.before_state.map(|s| s.as_str()))
        .bind(event.after_state.map(|s| s.as_str()))
        .bind(&event.details)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_events_retrievable_in_temporal_order() {
        let sink = Arc::new(MemoryAuditSink::new());
        let log = AuditLog::spawn(sink.clone());

        let operation_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();

        log.record(
            operation_id,
            correlation_id,
            AuditEventType::FundsReserved,
            Some(SettlementState::Requested),
            Some(SettlementState::Reserved),
            serde_json::json!({}),
        );
        log.record(
            operation_id,
            correlation_id,
            AuditEventType::RailSubmitted,
            Some(SettlementState::Reserved),
            Some(SettlementState::Submitted),
            serde_json::json!({}),
        );
        // Unrelated correlation stays out of the trail
        log.record(
            Uuid::new_v4(),
            Uuid::new_v4(),
            AuditEventType::FundsReserved,
            None,
            None,
            serde_json::json!({}),
        );

        // Let the background writer drain the channel
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let trail = sink.events_for(correlation_id).await;
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].event_type, AuditEventType::FundsReserved);
        assert_eq!(trail[1].event_type, AuditEventType::RailSubmitted);
        assert!(trail[0].created_at <= trail[1].created_at);
    }
}
