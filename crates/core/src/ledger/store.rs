use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::expense::{Expense, ExpenseId, ExpenseStatus};
use crate::domain::user::{CompanyId, UserId};
use crate::ledger::chain::LedgerEntry;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("expense `{0}` was not found")]
    NotFound(ExpenseId),
    #[error("expense `{0}` already exists")]
    AlreadyExists(ExpenseId),
    #[error("expense `{expense_id}` version conflict: expected {expected}, found {found}")]
    VersionConflict { expense_id: ExpenseId, expected: u64, found: u64 },
    #[error("ledger entry {sequence} already exists for expense `{expense_id}`")]
    DuplicateEntry { expense_id: ExpenseId, sequence: u64 },
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// The expense row together with its ledger chain in sequence order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub expense: Expense,
    pub entries: Vec<LedgerEntry>,
}

impl LedgerSnapshot {
    pub fn last_entry(&self) -> Option<&LedgerEntry> {
        self.entries.last()
    }
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn insert_expense(&self, expense: &Expense) -> Result<(), StoreError>;

    async fn load_ledger(&self, expense_id: &ExpenseId) -> Result<LedgerSnapshot, StoreError>;

    async fn append_decision(&self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// Replace the stored expense only if its version still equals `expected_version`.
    async fn cas_update_status(
        &self,
        expense: &Expense,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// Append an entry and move the expense forward as one unit.
    ///
    /// The default runs the two steps back to back; stores with transactions
    /// override it.
    async fn commit(
        &self,
        entry: &LedgerEntry,
        expense: &Expense,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        self.cas_update_status(expense, expected_version).await?;
        self.append_decision(entry).await
    }

    async fn pending_for_approver(
        &self,
        company_id: &CompanyId,
        approver_id: &UserId,
    ) -> Result<Vec<Expense>, StoreError>;

    async fn list_for_employee(
        &self,
        company_id: &CompanyId,
        employee_id: &UserId,
    ) -> Result<Vec<Expense>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryApprovalStore {
    records: RwLock<HashMap<ExpenseId, LedgerSnapshot>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_version(expense_id: &ExpenseId, stored: &Expense, expected: u64) -> Result<(), StoreError> {
    if stored.version != expected {
        return Err(StoreError::VersionConflict {
            expense_id: expense_id.clone(),
            expected,
            found: stored.version,
        });
    }
    Ok(())
}

fn check_next_sequence(snapshot: &LedgerSnapshot, entry: &LedgerEntry) -> Result<(), StoreError> {
    let next = snapshot.last_entry().map_or(1, |last| last.sequence.saturating_add(1));
    if entry.sequence != next {
        return Err(StoreError::DuplicateEntry {
            expense_id: entry.expense_id.clone(),
            sequence: entry.sequence,
        });
    }
    Ok(())
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn insert_expense(&self, expense: &Expense) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&expense.id) {
            return Err(StoreError::AlreadyExists(expense.id.clone()));
        }
        records.insert(
            expense.id.clone(),
            LedgerSnapshot { expense: expense.clone(), entries: Vec::new() },
        );
        Ok(())
    }

    async fn load_ledger(&self, expense_id: &ExpenseId) -> Result<LedgerSnapshot, StoreError> {
        self.records
            .read()
            .await
            .get(expense_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(expense_id.clone()))
    }

    async fn append_decision(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let snapshot = records
            .get_mut(&entry.expense_id)
            .ok_or_else(|| StoreError::NotFound(entry.expense_id.clone()))?;
        check_next_sequence(snapshot, entry)?;
        snapshot.entries.push(entry.clone());
        Ok(())
    }

    async fn cas_update_status(
        &self,
        expense: &Expense,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let snapshot = records
            .get_mut(&expense.id)
            .ok_or_else(|| StoreError::NotFound(expense.id.clone()))?;
        check_version(&expense.id, &snapshot.expense, expected_version)?;
        snapshot.expense = expense.clone();
        Ok(())
    }

    async fn commit(
        &self,
        entry: &LedgerEntry,
        expense: &Expense,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let snapshot = records
            .get_mut(&expense.id)
            .ok_or_else(|| StoreError::NotFound(expense.id.clone()))?;
        check_version(&expense.id, &snapshot.expense, expected_version)?;
        check_next_sequence(snapshot, entry)?;
        snapshot.expense = expense.clone();
        snapshot.entries.push(entry.clone());
        Ok(())
    }

    async fn pending_for_approver(
        &self,
        company_id: &CompanyId,
        approver_id: &UserId,
    ) -> Result<Vec<Expense>, StoreError> {
        let records = self.records.read().await;
        let mut pending: Vec<Expense> = records
            .values()
            .map(|snapshot| &snapshot.expense)
            .filter(|expense| &expense.company_id == company_id)
            .filter(|expense| expense.status == ExpenseStatus::Pending)
            .filter(|expense| expense.next_approvers.contains(approver_id))
            .cloned()
            .collect();
        pending.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        Ok(pending)
    }

    async fn list_for_employee(
        &self,
        company_id: &CompanyId,
        employee_id: &UserId,
    ) -> Result<Vec<Expense>, StoreError> {
        let records = self.records.read().await;
        let mut expenses: Vec<Expense> = records
            .values()
            .map(|snapshot| &snapshot.expense)
            .filter(|expense| &expense.company_id == company_id)
            .filter(|expense| &expense.employee_id == employee_id)
            .cloned()
            .collect();
        expenses.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(expenses)
    }
}
