use std::collections::BTreeMap;

use sqlx::{sqlite::SqliteRow, Row};
use tracing::warn;

use expensa_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use expensa_core::domain::expense::ExpenseId;

use super::{decode_error, format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

/// Persists audit events into `audit_event`.
///
/// `emit` is fire-and-forget: the insert runs on the current tokio runtime and
/// failures are logged, never surfaced to the caller.
#[derive(Clone)]
pub struct SqlAuditSink {
    pool: DbPool,
}

impl SqlAuditSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, event: &AuditEvent) -> Result<(), RepositoryError> {
        let metadata_json = serde_json::to_string(&event.metadata).map_err(decode_error)?;
        sqlx::query(
            "INSERT INTO audit_event (
                id, expense_id, correlation_id, event_type, event_category,
                actor, outcome, metadata_json, occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(event.expense_id.as_ref().map(|id| id.0.as_str()))
        .bind(&event.correlation_id)
        .bind(&event.event_type)
        .bind(event.category.as_str())
        .bind(&event.actor)
        .bind(event.outcome.as_str())
        .bind(metadata_json)
        .bind(format_timestamp(&event.occurred_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_for_expense(
        &self,
        expense_id: &ExpenseId,
    ) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, expense_id, correlation_id, event_type, event_category,
                    actor, outcome, metadata_json, occurred_at
             FROM audit_event
             WHERE expense_id = ?
             ORDER BY occurred_at ASC",
        )
        .bind(&expense_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }
}

fn parse_category(value: &str) -> Result<AuditCategory, RepositoryError> {
    match value {
        "approval" => Ok(AuditCategory::Approval),
        "configuration" => Ok(AuditCategory::Configuration),
        "persistence" => Ok(AuditCategory::Persistence),
        "system" => Ok(AuditCategory::System),
        other => Err(RepositoryError::Decode(format!("unknown audit category `{other}`"))),
    }
}

fn parse_outcome(value: &str) -> Result<AuditOutcome, RepositoryError> {
    match value {
        "success" => Ok(AuditOutcome::Success),
        "rejected" => Ok(AuditOutcome::Rejected),
        "failed" => Ok(AuditOutcome::Failed),
        other => Err(RepositoryError::Decode(format!("unknown audit outcome `{other}`"))),
    }
}

fn event_from_row(row: SqliteRow) -> Result<AuditEvent, RepositoryError> {
    let expense_id: Option<String> = row.try_get("expense_id").map_err(decode_error)?;
    let category: String = row.try_get("event_category").map_err(decode_error)?;
    let outcome: String = row.try_get("outcome").map_err(decode_error)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(decode_error)?;
    let occurred_at: String = row.try_get("occurred_at").map_err(decode_error)?;
    let metadata: BTreeMap<String, String> =
        serde_json::from_str(&metadata_json).map_err(decode_error)?;

    Ok(AuditEvent {
        event_id: row.try_get("id").map_err(decode_error)?,
        expense_id: expense_id.map(ExpenseId),
        correlation_id: row.try_get("correlation_id").map_err(decode_error)?,
        event_type: row.try_get("event_type").map_err(decode_error)?,
        category: parse_category(&category)?,
        actor: row.try_get("actor").map_err(decode_error)?,
        outcome: parse_outcome(&outcome)?,
        metadata,
        occurred_at: parse_timestamp(&occurred_at)?,
    })
}

impl AuditSink for SqlAuditSink {
    fn emit(&self, event: AuditEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                event_name = "audit.write_skipped",
                event_type = %event.event_type,
                correlation_id = %event.correlation_id,
                "no async runtime available for audit write"
            );
            return;
        };

        let sink = self.clone();
        runtime.spawn(async move {
            if let Err(error) = sink.record(&event).await {
                warn!(
                    event_name = "audit.write_failed",
                    event_type = %event.event_type,
                    correlation_id = %event.correlation_id,
                    error = %error,
                    "audit_event write failed"
                );
            }
        });
    }
}
