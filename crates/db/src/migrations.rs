use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::run_pending;
    use crate::{connect_with_settings, migrations::MIGRATOR};

    const MANAGED_TABLES: &[&str] = &[
        "company",
        "app_user",
        "approval_rule",
        "approval_flow",
        "expense",
        "ledger_entry",
        "audit_event",
    ];

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "company",
        "app_user",
        "approval_rule",
        "approval_flow",
        "expense",
        "ledger_entry",
        "audit_event",
        "idx_app_user_company_id",
        "idx_app_user_manager_id",
        "idx_approval_rule_company_id",
        "idx_approval_flow_company_id",
        "idx_expense_company_status",
        "idx_expense_employee_id",
        "idx_ledger_entry_expense_id",
        "idx_audit_event_expense_id",
        "idx_audit_event_type",
    ];

    async fn table_count(pool: &sqlx::SqlitePool, table: &str) -> i64 {
        sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(pool)
        .await
        .expect("query sqlite_master")
        .get::<i64, _>("count")
    }

    #[tokio::test]
    async fn migrations_create_baseline_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        for table in MANAGED_TABLES {
            assert_eq!(table_count(&pool, table).await, 1, "table `{table}` should exist");
        }
    }

    #[tokio::test]
    async fn migrations_are_reversible() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        for table in MANAGED_TABLES {
            assert_eq!(table_count(&pool, table).await, 0, "table `{table}` should be dropped");
        }
    }

    #[tokio::test]
    async fn ledger_sequence_is_unique_per_expense() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        sqlx::query(
            "INSERT INTO company (id, name, country, currency, created_at)
             VALUES ('acme', 'Acme', 'US', 'USD', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("insert company");
        sqlx::query(
            "INSERT INTO expense (
                id, company_id, employee_id, amount, currency, category, description,
                expense_date, status, assignment_json, plan_json, next_approvers_json,
                current_step, version, overridden, created_at, updated_at
             ) VALUES (
                'EXP-1', 'acme', 'emp-1', '10.00', 'USD', 'travel', 'Taxi',
                '2026-01-01', 'pending', '{}', '{\"steps\":[]}', '[]',
                NULL, 1, 0, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z'
             )",
        )
        .execute(&pool)
        .await
        .expect("insert expense");

        let insert_entry = |id: &'static str| {
            sqlx::query(
                "INSERT INTO ledger_entry (
                    id, expense_id, sequence, record_type, actor_id, record_json,
                    content_hash, prev_hash, entry_hash, signature, recorded_at
                 ) VALUES (?, 'EXP-1', 1, 'decision', 'mgr-1', '{}', 'c', NULL, 'e', 's',
                           '2026-01-01T00:00:00Z')",
            )
            .bind(id)
        };

        insert_entry("entry-1").execute(&pool).await.expect("first entry");
        assert!(insert_entry("entry-2").execute(&pool).await.is_err());
    }

    #[tokio::test]
    async fn migrations_up_down_up_preserves_schema_signature() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let initial_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            initial_signature.len(),
            MANAGED_SCHEMA_OBJECTS.len(),
            "initial migration pass should create all managed schema objects",
        );

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        let after_down_signature = managed_schema_signature(&pool).await;
        assert!(
            after_down_signature.is_empty(),
            "managed schema objects should be removed after full undo",
        );

        run_pending(&pool).await.expect("re-run migrations");

        let after_second_up_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            after_second_up_signature, initial_signature,
            "up/down/up should preserve migration-managed schema signature",
        );
    }

    async fn managed_schema_signature(pool: &sqlx::SqlitePool) -> Vec<(String, String, String)> {
        let mut signature: Vec<(String, String, String)> = sqlx::query(
            "SELECT type, name, IFNULL(sql, '') AS sql
             FROM sqlite_master
             WHERE type IN ('table', 'index')",
        )
        .fetch_all(pool)
        .await
        .expect("load schema objects")
        .into_iter()
        .filter_map(|row| {
            let name = row.get::<String, _>("name");
            if MANAGED_SCHEMA_OBJECTS.contains(&name.as_str()) {
                Some((row.get::<String, _>("type"), name, row.get::<String, _>("sql")))
            } else {
                None
            }
        })
        .collect();
        signature.sort();
        signature
    }
}
