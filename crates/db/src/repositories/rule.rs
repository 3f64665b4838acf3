use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use expensa_core::domain::rule::{ApprovalRule, RuleId, RuleKind};
use expensa_core::domain::user::CompanyId;

use super::{decode_error, RepositoryError, RuleRepository};
use crate::DbPool;

pub struct SqlRuleRepository {
    pool: DbPool,
}

impl SqlRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn rule_from_row(row: SqliteRow) -> Result<ApprovalRule, RepositoryError> {
    let kind_json: String = row.try_get("kind_json").map_err(decode_error)?;
    let kind: RuleKind = serde_json::from_str(&kind_json).map_err(decode_error)?;

    Ok(ApprovalRule {
        id: RuleId(row.try_get("id").map_err(decode_error)?),
        company_id: CompanyId(row.try_get("company_id").map_err(decode_error)?),
        name: row.try_get("name").map_err(decode_error)?,
        kind,
        is_active: row.try_get("is_active").map_err(decode_error)?,
    })
}

#[async_trait::async_trait]
impl RuleRepository for SqlRuleRepository {
    async fn find_by_id(&self, id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, company_id, name, kind_json, is_active FROM approval_rule WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(rule_from_row).transpose()
    }

    async fn list_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, company_id, name, kind_json, is_active
             FROM approval_rule
             WHERE company_id = ?
             ORDER BY id ASC",
        )
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(rule_from_row).collect()
    }

    async fn save(&self, rule: ApprovalRule) -> Result<(), RepositoryError> {
        let kind_json = serde_json::to_string(&rule.kind).map_err(decode_error)?;

        sqlx::query(
            "INSERT INTO approval_rule (id, company_id, name, rule_type, kind_json, is_active, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                company_id = excluded.company_id,
                name = excluded.name,
                rule_type = excluded.rule_type,
                kind_json = excluded.kind_json,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
        )
        .bind(&rule.id.0)
        .bind(&rule.company_id.0)
        .bind(&rule.name)
        .bind(rule.kind.as_str())
        .bind(kind_json)
        .bind(rule.is_active)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
