use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use expensa_core::domain::flow::{ApprovalFlow, ApprovalStep, FlowId};
use expensa_core::domain::user::CompanyId;

use super::{decode_error, FlowRepository, RepositoryError};
use crate::DbPool;

pub struct SqlFlowRepository {
    pool: DbPool,
}

impl SqlFlowRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn flow_from_row(row: SqliteRow) -> Result<ApprovalFlow, RepositoryError> {
    let steps_json: String = row.try_get("steps_json").map_err(decode_error)?;
    let steps: Vec<ApprovalStep> = serde_json::from_str(&steps_json).map_err(decode_error)?;

    Ok(ApprovalFlow {
        id: FlowId(row.try_get("id").map_err(decode_error)?),
        company_id: CompanyId(row.try_get("company_id").map_err(decode_error)?),
        name: row.try_get("name").map_err(decode_error)?,
        steps,
        is_active: row.try_get("is_active").map_err(decode_error)?,
    })
}

#[async_trait::async_trait]
impl FlowRepository for SqlFlowRepository {
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<ApprovalFlow>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, company_id, name, steps_json, is_active FROM approval_flow WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(flow_from_row).transpose()
    }

    async fn list_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalFlow>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, company_id, name, steps_json, is_active
             FROM approval_flow
             WHERE company_id = ?
             ORDER BY id ASC",
        )
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(flow_from_row).collect()
    }

    async fn save(&self, flow: ApprovalFlow) -> Result<(), RepositoryError> {
        let mut steps = flow.steps.clone();
        steps.sort_by_key(|step| step.order);
        let steps_json = serde_json::to_string(&steps).map_err(decode_error)?;

        sqlx::query(
            "INSERT INTO approval_flow (id, company_id, name, steps_json, is_active, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                company_id = excluded.company_id,
                name = excluded.name,
                steps_json = excluded.steps_json,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
        )
        .bind(&flow.id.0)
        .bind(&flow.company_id.0)
        .bind(&flow.name)
        .bind(steps_json)
        .bind(flow.is_active)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
