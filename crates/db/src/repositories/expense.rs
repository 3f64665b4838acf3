use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use expensa_core::domain::expense::{Expense, ExpenseCategory, ExpenseId, ExpenseStatus};
use expensa_core::domain::flow::Assignment;
use expensa_core::domain::user::{CompanyId, UserId};
use expensa_core::ledger::{ApprovalStore, LedgerEntry, LedgerRecord, LedgerSnapshot, StoreError};
use expensa_core::workflow::ApprovalPlan;

use super::{format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

const DATE_FORMAT: &str = "%Y-%m-%d";

const EXPENSE_COLUMNS: &str = "id, company_id, employee_id, amount, currency, category,
    description, expense_date, status, assignment_json, plan_json, next_approvers_json,
    current_step, version, overridden, created_at, updated_at";

/// SQLite-backed ledger store. Entry append and status update share one transaction.
pub struct SqlApprovalStore {
    pool: DbPool,
}

impl SqlApprovalStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn backend(error: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(error.to_string())
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn field<T>(row: &SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(|error| RepositoryError::Decode(format!("{column}: {error}")))
}

fn json_field<T: serde::de::DeserializeOwned>(
    row: &SqliteRow,
    column: &str,
) -> Result<T, RepositoryError> {
    let raw: String = field(row, column)?;
    serde_json::from_str(&raw).map_err(|error| RepositoryError::Decode(format!("{column}: {error}")))
}

fn expense_from_row(row: &SqliteRow) -> Result<Expense, RepositoryError> {
    let amount: String = field(row, "amount")?;
    let category: String = field(row, "category")?;
    let status: String = field(row, "status")?;
    let date: String = field(row, "expense_date")?;
    let current_step: Option<i64> = field(row, "current_step")?;
    let version: i64 = field(row, "version")?;
    let created_at: String = field(row, "created_at")?;
    let updated_at: String = field(row, "updated_at")?;

    let assignment: Assignment = json_field(row, "assignment_json")?;
    let plan: ApprovalPlan = json_field(row, "plan_json")?;
    let next_approvers: Vec<UserId> = json_field(row, "next_approvers_json")?;

    Ok(Expense {
        id: ExpenseId(field(row, "id")?),
        company_id: CompanyId(field(row, "company_id")?),
        employee_id: UserId(field(row, "employee_id")?),
        amount: Decimal::from_str(&amount)
            .map_err(|error| RepositoryError::Decode(format!("amount: {error}")))?,
        currency: field(row, "currency")?,
        category: ExpenseCategory::parse(&category)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown category `{category}`")))?,
        description: field(row, "description")?,
        date: NaiveDate::parse_from_str(&date, DATE_FORMAT)
            .map_err(|error| RepositoryError::Decode(format!("expense_date: {error}")))?,
        status: ExpenseStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown status `{status}`")))?,
        assignment,
        plan,
        next_approvers,
        current_step: current_step
            .map(|step| {
                u32::try_from(step).map_err(|_| {
                    RepositoryError::Decode(format!("current_step out of range: {step}"))
                })
            })
            .transpose()?,
        version: u64::try_from(version)
            .map_err(|_| RepositoryError::Decode(format!("version out of range: {version}")))?,
        overridden: field(row, "overridden")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry, RepositoryError> {
    let sequence: i64 = field(row, "sequence")?;
    let record: LedgerRecord = json_field(row, "record_json")?;

    Ok(LedgerEntry {
        entry_id: field(row, "id")?,
        expense_id: ExpenseId(field(row, "expense_id")?),
        sequence: u64::try_from(sequence)
            .map_err(|_| RepositoryError::Decode(format!("sequence out of range: {sequence}")))?,
        record,
        content_hash: field(row, "content_hash")?,
        prev_hash: field(row, "prev_hash")?,
        entry_hash: field(row, "entry_hash")?,
        signature: field(row, "signature")?,
    })
}

fn record_type(record: &LedgerRecord) -> &'static str {
    match record {
        LedgerRecord::Decision(_) => "decision",
        LedgerRecord::Override(_) => "override",
    }
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| backend(format!("value {value} exceeds sqlite integer range")))
}

struct ExpenseColumns {
    assignment_json: String,
    plan_json: String,
    next_approvers_json: String,
    version: i64,
}

impl ExpenseColumns {
    fn encode(expense: &Expense) -> Result<Self, StoreError> {
        Ok(Self {
            assignment_json: serde_json::to_string(&expense.assignment).map_err(backend)?,
            plan_json: serde_json::to_string(&expense.plan).map_err(backend)?,
            next_approvers_json: serde_json::to_string(&expense.next_approvers)
                .map_err(backend)?,
            version: to_i64(expense.version)?,
        })
    }
}

async fn update_if_version(
    conn: &mut SqliteConnection,
    expense: &Expense,
    expected_version: u64,
) -> Result<(), StoreError> {
    let columns = ExpenseColumns::encode(expense)?;
    let result = sqlx::query(
        "UPDATE expense SET
            status = ?,
            next_approvers_json = ?,
            current_step = ?,
            plan_json = ?,
            version = ?,
            overridden = ?,
            updated_at = ?
         WHERE id = ? AND version = ?",
    )
    .bind(expense.status.as_str())
    .bind(&columns.next_approvers_json)
    .bind(expense.current_step.map(i64::from))
    .bind(&columns.plan_json)
    .bind(columns.version)
    .bind(expense.overridden)
    .bind(format_timestamp(&expense.updated_at))
    .bind(&expense.id.0)
    .bind(to_i64(expected_version)?)
    .execute(&mut *conn)
    .await
    .map_err(backend)?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let found: Option<i64> = sqlx::query_scalar("SELECT version FROM expense WHERE id = ?")
        .bind(&expense.id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?;
    match found {
        None => Err(StoreError::NotFound(expense.id.clone())),
        Some(found) => Err(StoreError::VersionConflict {
            expense_id: expense.id.clone(),
            expected: expected_version,
            found: u64::try_from(found).unwrap_or_default(),
        }),
    }
}

async fn insert_entry(conn: &mut SqliteConnection, entry: &LedgerEntry) -> Result<(), StoreError> {
    let exists: i64 = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM expense WHERE id = ?)")
        .bind(&entry.expense_id.0)
        .fetch_one(&mut *conn)
        .await
        .map_err(backend)?;
    if exists == 0 {
        return Err(StoreError::NotFound(entry.expense_id.clone()));
    }

    let last: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0) FROM ledger_entry WHERE expense_id = ?")
            .bind(&entry.expense_id.0)
            .fetch_one(&mut *conn)
            .await
            .map_err(backend)?;
    let duplicate =
        || StoreError::DuplicateEntry { expense_id: entry.expense_id.clone(), sequence: entry.sequence };
    if to_i64(entry.sequence)? != last.saturating_add(1) {
        return Err(duplicate());
    }

    let record_json = serde_json::to_string(&entry.record).map_err(backend)?;
    sqlx::query(
        "INSERT INTO ledger_entry (
            id, expense_id, sequence, record_type, actor_id, record_json,
            content_hash, prev_hash, entry_hash, signature, recorded_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.entry_id)
    .bind(&entry.expense_id.0)
    .bind(to_i64(entry.sequence)?)
    .bind(record_type(&entry.record))
    .bind(entry.record.actor_id().as_str())
    .bind(record_json)
    .bind(&entry.content_hash)
    .bind(entry.prev_hash.as_deref())
    .bind(&entry.entry_hash)
    .bind(&entry.signature)
    .bind(format_timestamp(&entry.timestamp()))
    .execute(&mut *conn)
    .await
    .map_err(|error| if is_unique_violation(&error) { duplicate() } else { backend(error) })?;

    Ok(())
}

#[async_trait]
impl ApprovalStore for SqlApprovalStore {
    async fn insert_expense(&self, expense: &Expense) -> Result<(), StoreError> {
        let columns = ExpenseColumns::encode(expense)?;
        sqlx::query(
            "INSERT INTO expense (
                id, company_id, employee_id, amount, currency, category,
                description, expense_date, status, assignment_json, plan_json, next_approvers_json,
                current_step, version, overridden, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&expense.id.0)
        .bind(&expense.company_id.0)
        .bind(&expense.employee_id.0)
        .bind(expense.amount.to_string())
        .bind(&expense.currency)
        .bind(expense.category.as_str())
        .bind(&expense.description)
        .bind(expense.date.format(DATE_FORMAT).to_string())
        .bind(expense.status.as_str())
        .bind(&columns.assignment_json)
        .bind(&columns.plan_json)
        .bind(&columns.next_approvers_json)
        .bind(expense.current_step.map(i64::from))
        .bind(columns.version)
        .bind(expense.overridden)
        .bind(format_timestamp(&expense.created_at))
        .bind(format_timestamp(&expense.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                StoreError::AlreadyExists(expense.id.clone())
            } else {
                backend(error)
            }
        })?;

        Ok(())
    }

    async fn load_ledger(&self, expense_id: &ExpenseId) -> Result<LedgerSnapshot, StoreError> {
        let row = sqlx::query(&format!("SELECT {EXPENSE_COLUMNS} FROM expense WHERE id = ?"))
            .bind(&expense_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(expense_id.clone()))?;
        let expense = expense_from_row(&row).map_err(backend)?;

        let rows = sqlx::query(
            "SELECT id, expense_id, sequence, record_json, content_hash, prev_hash, entry_hash, signature
             FROM ledger_entry
             WHERE expense_id = ?
             ORDER BY sequence ASC",
        )
        .bind(&expense_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        let entries =
            rows.iter().map(entry_from_row).collect::<Result<Vec<_>, _>>().map_err(backend)?;

        Ok(LedgerSnapshot { expense, entries })
    }

    async fn append_decision(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        insert_entry(&mut *tx, entry).await?;
        tx.commit().await.map_err(backend)
    }

    async fn cas_update_status(
        &self,
        expense: &Expense,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        update_if_version(&mut *conn, expense, expected_version).await
    }

    async fn commit(
        &self,
        entry: &LedgerEntry,
        expense: &Expense,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        update_if_version(&mut *tx, expense, expected_version).await?;
        insert_entry(&mut *tx, entry).await?;
        tx.commit().await.map_err(backend)
    }

    async fn pending_for_approver(
        &self,
        company_id: &CompanyId,
        approver_id: &UserId,
    ) -> Result<Vec<Expense>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXPENSE_COLUMNS}
             FROM expense
             WHERE company_id = ?
               AND status = 'pending'
               AND EXISTS (SELECT 1 FROM json_each(expense.next_approvers_json) WHERE value = ?)
             ORDER BY created_at ASC"
        ))
        .bind(&company_id.0)
        .bind(approver_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(expense_from_row).collect::<Result<Vec<_>, _>>().map_err(backend)
    }

    async fn list_for_employee(
        &self,
        company_id: &CompanyId,
        employee_id: &UserId,
    ) -> Result<Vec<Expense>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXPENSE_COLUMNS}
             FROM expense
             WHERE company_id = ? AND employee_id = ?
             ORDER BY created_at DESC"
        ))
        .bind(&company_id.0)
        .bind(employee_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(expense_from_row).collect::<Result<Vec<_>, _>>().map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use secrecy::SecretString;

    use expensa_core::context::RequestContext;
    use expensa_core::domain::decision::Decision;
    use expensa_core::domain::expense::{ExpenseCategory, ExpenseDraft, ExpenseStatus};
    use expensa_core::domain::flow::{Assignment, FlowId};
    use expensa_core::domain::user::{CompanyId, UserId, UserRole};
    use expensa_core::ledger::{ApprovalLedger, ApprovalStore, ChainSigner, LedgerError, StoreError};
    use expensa_core::workflow::{ApprovalPlan, PlanStep};

    use super::SqlApprovalStore;
    use crate::test_support::{migrated_pool, seed_company};

    fn ctx(user: &str, role: UserRole) -> RequestContext {
        RequestContext::new(UserId(user.to_string()), role, CompanyId("acme".to_string()))
    }

    fn draft() -> ExpenseDraft {
        ExpenseDraft {
            amount: Decimal::new(12_550, 2),
            currency: "usd".to_string(),
            category: ExpenseCategory::Travel,
            description: "Taxi to client site".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 3, 14).expect("valid date"),
            assignment: Assignment::Flow(FlowId("flow-standard".to_string())),
        }
    }

    fn two_step_plan() -> ApprovalPlan {
        ApprovalPlan::new(vec![
            PlanStep {
                order: 1,
                approvers: vec![UserId("mgr-1".to_string())],
                is_required: true,
                rule: None,
            },
            PlanStep {
                order: 2,
                approvers: vec![UserId("cfo-1".to_string())],
                is_required: true,
                rule: None,
            },
        ])
    }

    async fn ledger() -> (ApprovalLedger, Arc<SqlApprovalStore>) {
        let pool = migrated_pool().await;
        seed_company(&pool, "acme").await;
        let store = Arc::new(SqlApprovalStore::new(pool));
        let signer = ChainSigner::new(SecretString::from("sqlite-store-test-key"));
        (ApprovalLedger::new(store.clone(), signer), store)
    }

    #[tokio::test]
    async fn expense_round_trips_through_sqlite() {
        let (ledger, store) = ledger().await;
        let expense = ledger
            .submit_expense(&ctx("emp-1", UserRole::Employee), draft(), two_step_plan())
            .await
            .expect("submit");

        let snapshot = store.load_ledger(&expense.id).await.expect("load");
        assert_eq!(snapshot.expense, expense);
        assert!(snapshot.entries.is_empty());
        assert_eq!(
            store.insert_expense(&expense).await,
            Err(StoreError::AlreadyExists(expense.id.clone()))
        );
    }

    #[tokio::test]
    async fn decisions_advance_and_verify_from_storage() {
        let (ledger, store) = ledger().await;
        let expense = ledger
            .submit_expense(&ctx("emp-1", UserRole::Employee), draft(), two_step_plan())
            .await
            .expect("submit");

        let pending = store
            .pending_for_approver(&CompanyId("acme".to_string()), &UserId("mgr-1".to_string()))
            .await
            .expect("pending for manager");
        assert_eq!(pending.len(), 1);

        ledger
            .submit_decision(&ctx("mgr-1", UserRole::Manager), &expense.id, 1, Decision::Approved, None)
            .await
            .expect("manager approves");
        let receipt = ledger
            .submit_decision(&ctx("cfo-1", UserRole::Manager), &expense.id, 2, Decision::Approved, None)
            .await
            .expect("cfo approves");
        assert_eq!(receipt.expense.status, ExpenseStatus::Approved);

        let snapshot = store.load_ledger(&expense.id).await.expect("load");
        assert_eq!(snapshot.expense.status, ExpenseStatus::Approved);
        assert_eq!(snapshot.expense.version, 3);
        assert_eq!(snapshot.entries.len(), 2);

        let verification = ledger.verify(&expense.id).await.expect("verify");
        assert!(verification.valid, "{:?}", verification.failure_reason);

        let late = ledger
            .submit_decision(&ctx("mgr-1", UserRole::Manager), &expense.id, 1, Decision::Rejected, Some("late".into()))
            .await
            .expect_err("terminal expense refuses votes");
        assert!(matches!(late, LedgerError::AlreadyFinalized { .. }));
    }

    #[tokio::test]
    async fn stale_version_is_refused_without_writing_entry() {
        let (ledger, store) = ledger().await;
        let expense = ledger
            .submit_expense(&ctx("emp-1", UserRole::Employee), draft(), two_step_plan())
            .await
            .expect("submit");
        ledger
            .submit_decision(&ctx("mgr-1", UserRole::Manager), &expense.id, 1, Decision::Approved, None)
            .await
            .expect("manager approves");

        let snapshot = store.load_ledger(&expense.id).await.expect("load");
        let mut stale = snapshot.expense.clone();
        stale.version += 1;
        let entry = snapshot.entries[0].clone();
        let mut replay = entry.clone();
        replay.entry_id = "replayed".to_string();
        replay.sequence = 2;

        let error = store.commit(&replay, &stale, 1).await.expect_err("stale commit");
        assert_eq!(
            error,
            StoreError::VersionConflict { expense_id: expense.id.clone(), expected: 1, found: 2 }
        );
        assert_eq!(store.load_ledger(&expense.id).await.expect("reload").entries.len(), 1);

        let duplicate = store.append_decision(&entry).await.expect_err("duplicate sequence");
        assert!(matches!(duplicate, StoreError::DuplicateEntry { sequence: 1, .. }));
    }

    #[tokio::test]
    async fn employee_listing_is_newest_first() {
        let (ledger, store) = ledger().await;
        let employee = ctx("emp-1", UserRole::Employee);
        let first = ledger.submit_expense(&employee, draft(), two_step_plan()).await.expect("first");
        let second = ledger.submit_expense(&employee, draft(), two_step_plan()).await.expect("second");

        let listed = store
            .list_for_employee(&CompanyId("acme".to_string()), &UserId("emp-1".to_string()))
            .await
            .expect("list");
        let ids: Vec<_> = listed.iter().map(|expense| expense.id.clone()).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }
}
