use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use expensa_core::domain::user::{Company, CompanyId};

use super::{decode_error, CompanyRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCompanyRepository {
    pool: DbPool,
}

impl SqlCompanyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn company_from_row(row: SqliteRow) -> Result<Company, RepositoryError> {
    Ok(Company {
        id: CompanyId(row.try_get("id").map_err(decode_error)?),
        name: row.try_get("name").map_err(decode_error)?,
        country: row.try_get("country").map_err(decode_error)?,
        currency: row.try_get("currency").map_err(decode_error)?,
    })
}

#[async_trait::async_trait]
impl CompanyRepository for SqlCompanyRepository {
    async fn find_by_id(&self, id: &CompanyId) -> Result<Option<Company>, RepositoryError> {
        let row = sqlx::query("SELECT id, name, country, currency FROM company WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(company_from_row).transpose()
    }

    async fn save(&self, company: Company) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO company (id, name, country, currency, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                country = excluded.country,
                currency = excluded.currency",
        )
        .bind(&company.id.0)
        .bind(&company.name)
        .bind(&company.country)
        .bind(company.currency.to_ascii_uppercase())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
