use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use expensa_core::domain::user::{CompanyId, User, UserId, UserRole};

use super::{decode_error, RepositoryError, UserRepository};
use crate::DbPool;

pub struct SqlUserRepository {
    pool: DbPool,
}

impl SqlUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn user_from_row(row: SqliteRow) -> Result<User, RepositoryError> {
    let role: String = row.try_get("role").map_err(decode_error)?;
    let manager_id: Option<String> = row.try_get("manager_id").map_err(decode_error)?;

    Ok(User {
        id: UserId(row.try_get("id").map_err(decode_error)?),
        company_id: CompanyId(row.try_get("company_id").map_err(decode_error)?),
        email: row.try_get("email").map_err(decode_error)?,
        name: row.try_get("name").map_err(decode_error)?,
        role: UserRole::parse(&role)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown user role `{role}`")))?,
        manager_id: manager_id.map(UserId),
        is_manager_approver: row.try_get("is_manager_approver").map_err(decode_error)?,
    })
}

#[async_trait::async_trait]
impl UserRepository for SqlUserRepository {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, company_id, email, name, role, manager_id, is_manager_approver
             FROM app_user
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(user_from_row).transpose()
    }

    async fn list_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<User>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, company_id, email, name, role, manager_id, is_manager_approver
             FROM app_user
             WHERE company_id = ?
             ORDER BY id ASC",
        )
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(user_from_row).collect()
    }

    async fn save(&self, user: User) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO app_user (
                id, company_id, email, name, role, manager_id, is_manager_approver, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                company_id = excluded.company_id,
                email = excluded.email,
                name = excluded.name,
                role = excluded.role,
                manager_id = excluded.manager_id,
                is_manager_approver = excluded.is_manager_approver",
        )
        .bind(&user.id.0)
        .bind(&user.company_id.0)
        .bind(&user.email)
        .bind(&user.name)
        .bind(user.role.as_str())
        .bind(user.manager_id.as_ref().map(|id| id.0.as_str()))
        .bind(user.is_manager_approver)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use expensa_core::domain::user::{CompanyId, User, UserId, UserRole};

    use super::SqlUserRepository;
    use crate::repositories::UserRepository;
    use crate::test_support::{migrated_pool, seed_company};

    fn user(id: &str, role: UserRole, manager: Option<&str>) -> User {
        User {
            id: UserId(id.to_string()),
            company_id: CompanyId("acme".to_string()),
            email: format!("{id}@acme.test"),
            name: id.to_string(),
            role,
            manager_id: manager.map(|value| UserId(value.to_string())),
            is_manager_approver: role == UserRole::Manager,
        }
    }

    #[tokio::test]
    async fn users_round_trip_with_manager_link() {
        let pool = migrated_pool().await;
        seed_company(&pool, "acme").await;
        let repo = SqlUserRepository::new(pool);

        let manager = user("mgr-1", UserRole::Manager, None);
        let employee = user("emp-1", UserRole::Employee, Some("mgr-1"));
        repo.save(manager.clone()).await.expect("save manager");
        repo.save(employee.clone()).await.expect("save employee");

        let found = repo.find_by_id(&employee.id).await.expect("find").expect("employee exists");
        assert_eq!(found, employee);

        let listed = repo.list_for_company(&CompanyId("acme".to_string())).await.expect("list");
        assert_eq!(listed, vec![employee, manager]);
    }

    #[tokio::test]
    async fn unknown_manager_is_rejected_by_foreign_key() {
        let pool = migrated_pool().await;
        seed_company(&pool, "acme").await;
        let repo = SqlUserRepository::new(pool);

        let orphan = user("emp-2", UserRole::Employee, Some("ghost"));
        assert!(repo.save(orphan).await.is_err());
    }
}
