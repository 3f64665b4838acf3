pub mod chain;
pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink};
use crate::context::RequestContext;
use crate::domain::decision::{ApprovalDecision, Decision, DecisionId, StatusOverride};
use crate::domain::expense::{Expense, ExpenseDraft, ExpenseId, ExpenseStatus};
use crate::domain::user::UserId;
use crate::errors::{ApplicationError, DomainError};
use crate::workflow::{evaluate_flow, excluding_submitter, ApprovalPlan, FlowEvaluation};

pub use chain::{ChainSigner, LedgerEntry, LedgerRecord, VerificationResult};
pub use store::{ApprovalStore, InMemoryApprovalStore, LedgerSnapshot, StoreError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("expense `{expense_id}` is already {} and accepts no further decisions", .status.as_str())]
    AlreadyFinalized { expense_id: ExpenseId, status: ExpenseStatus },
    #[error("`{approver_id}` is not eligible to decide step {step_order}: {reason}")]
    NotEligible { approver_id: UserId, step_order: u32, reason: String },
    #[error("step {step_order} is not open for decisions (current step: {current_step:?})")]
    StepNotOpen { step_order: u32, current_step: Option<u32> },
    #[error("a rejection requires a comment")]
    MissingComment,
    #[error("`{actor_id}` may not {action}")]
    Forbidden { actor_id: UserId, action: String },
    #[error("expense `{0}` does not exist")]
    UnknownExpense(ExpenseId),
    #[error("expense `{0}` changed concurrently; reload and retry")]
    ConcurrentModification(ExpenseId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("approval store failure: {0}")]
    Store(String),
}

impl LedgerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyFinalized { .. } => "already_finalized",
            Self::NotEligible { .. } => "not_eligible",
            Self::StepNotOpen { .. } => "step_not_open",
            Self::MissingComment => "missing_comment",
            Self::Forbidden { .. } => "forbidden",
            Self::UnknownExpense(_) => "unknown_expense",
            Self::ConcurrentModification(_) => "concurrent_modification",
            Self::Domain(_) => "domain",
            Self::Store(_) => "store",
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(expense_id) => Self::UnknownExpense(expense_id),
            StoreError::VersionConflict { expense_id, .. }
            | StoreError::DuplicateEntry { expense_id, .. }
            | StoreError::AlreadyExists(expense_id) => Self::ConcurrentModification(expense_id),
            StoreError::Backend(message) => Self::Store(message),
        }
    }
}

impl From<LedgerError> for ApplicationError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::Domain(domain) => Self::Domain(domain),
            LedgerError::MissingComment => {
                Self::Domain(DomainError::InvariantViolation(error.to_string()))
            }
            LedgerError::NotEligible { .. } | LedgerError::Forbidden { .. } => {
                Self::Forbidden(error.to_string())
            }
            LedgerError::AlreadyFinalized { .. }
            | LedgerError::StepNotOpen { .. }
            | LedgerError::ConcurrentModification(_) => Self::Conflict(error.to_string()),
            LedgerError::UnknownExpense(_) => Self::NotFound(error.to_string()),
            LedgerError::Store(message) => Self::Persistence(message),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LedgerPolicy {
    pub require_rejection_comment: bool,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self { require_rejection_comment: true }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionReceipt {
    pub entry: LedgerEntry,
    pub expense: Expense,
}

/// Records approval decisions and keeps each expense's status in step with them.
pub struct ApprovalLedger {
    store: Arc<dyn ApprovalStore>,
    signer: ChainSigner,
    audit: Arc<dyn AuditSink>,
    policy: LedgerPolicy,
    locks: Mutex<HashMap<ExpenseId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ApprovalLedger {
    pub fn new(store: Arc<dyn ApprovalStore>, signer: ChainSigner) -> Self {
        Self {
            store,
            signer,
            audit: Arc::new(NoopAuditSink),
            policy: LedgerPolicy::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_policy(mut self, policy: LedgerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn ApprovalStore> {
        &self.store
    }

    /// Create a pending expense for the caller with its plan snapshot.
    pub async fn submit_expense(
        &self,
        ctx: &RequestContext,
        draft: ExpenseDraft,
        plan: ApprovalPlan,
    ) -> Result<Expense, LedgerError> {
        validate_draft(&draft)?;

        let plan = excluding_submitter(plan, &ctx.actor_id);
        let evaluation = evaluate_flow(&plan, &[]);
        let now = Utc::now();
        let mut expense = Expense {
            id: ExpenseId(Uuid::new_v4().to_string()),
            company_id: ctx.company_id.clone(),
            employee_id: ctx.actor_id.clone(),
            amount: draft.amount,
            currency: draft.currency.trim().to_ascii_uppercase(),
            category: draft.category,
            description: draft.description.trim().to_string(),
            date: draft.date,
            status: ExpenseStatus::Pending,
            assignment: draft.assignment,
            plan,
            next_approvers: Vec::new(),
            current_step: None,
            version: 1,
            overridden: false,
            created_at: now,
            updated_at: now,
        };
        expense.apply_evaluation(&evaluation)?;
        self.store.insert_expense(&expense).await?;

        info!(
            event_name = "ledger.expense_submitted",
            correlation_id = %ctx.correlation_id,
            expense_id = %expense.id,
            employee_id = %expense.employee_id,
            status = expense.status.as_str(),
            steps = expense.plan.steps.len(),
            "expense submitted"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(expense.id.clone()),
                &ctx.correlation_id,
                "ledger.expense_submitted",
                AuditCategory::Approval,
                ctx.actor_id.as_str(),
                AuditOutcome::Success,
            )
            .with_metadata("status", expense.status.as_str())
            .with_metadata("amount", expense.amount.to_string())
            .with_metadata("currency", expense.currency.clone()),
        );

        Ok(expense)
    }

    /// Record the caller's vote on one step and re-evaluate the expense.
    pub async fn submit_decision(
        &self,
        ctx: &RequestContext,
        expense_id: &ExpenseId,
        step_order: u32,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<DecisionReceipt, LedgerError> {
        let lock = self.lock_for(expense_id);
        let result = {
            let _guard = lock.lock().await;
            self.record_decision(ctx, expense_id, step_order, decision, comment).await
        };
        self.release_lock(expense_id, lock);

        match &result {
            Ok(receipt) => {
                info!(
                    event_name = "ledger.decision_recorded",
                    correlation_id = %ctx.correlation_id,
                    expense_id = %expense_id,
                    approver_id = %ctx.actor_id,
                    step_order,
                    decision = decision.as_str(),
                    status = receipt.expense.status.as_str(),
                    sequence = receipt.entry.sequence,
                    "approval decision recorded"
                );
                self.audit.emit(
                    AuditEvent::new(
                        Some(expense_id.clone()),
                        &ctx.correlation_id,
                        "ledger.decision_recorded",
                        AuditCategory::Approval,
                        ctx.actor_id.as_str(),
                        AuditOutcome::Success,
                    )
                    .with_metadata("step", step_order.to_string())
                    .with_metadata("decision", decision.as_str())
                    .with_metadata("status", receipt.expense.status.as_str()),
                );
            }
            Err(error) => {
                warn!(
                    event_name = "ledger.decision_refused",
                    correlation_id = %ctx.correlation_id,
                    expense_id = %expense_id,
                    approver_id = %ctx.actor_id,
                    step_order,
                    decision = decision.as_str(),
                    error_kind = error.kind(),
                    error = %error,
                    "approval decision refused"
                );
                self.audit.emit(
                    AuditEvent::new(
                        Some(expense_id.clone()),
                        &ctx.correlation_id,
                        "ledger.decision_refused",
                        AuditCategory::Approval,
                        ctx.actor_id.as_str(),
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("step", step_order.to_string())
                    .with_metadata("reason", error.kind()),
                );
            }
        }

        result
    }

    /// Ledger entries of an expense ordered by timestamp, then sequence.
    pub async fn get_history(
        &self,
        ctx: &RequestContext,
        expense_id: &ExpenseId,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let snapshot = self.load_visible(ctx, expense_id).await?;
        let mut entries = snapshot.entries;
        entries.sort_by(|left, right| {
            left.timestamp().cmp(&right.timestamp()).then(left.sequence.cmp(&right.sequence))
        });
        Ok(entries)
    }

    pub async fn get_expense(
        &self,
        ctx: &RequestContext,
        expense_id: &ExpenseId,
    ) -> Result<Expense, LedgerError> {
        Ok(self.load_visible(ctx, expense_id).await?.expense)
    }

    pub async fn pending_for(&self, ctx: &RequestContext) -> Result<Vec<Expense>, LedgerError> {
        Ok(self.store.pending_for_approver(&ctx.company_id, &ctx.actor_id).await?)
    }

    pub async fn submitted_by(&self, ctx: &RequestContext) -> Result<Vec<Expense>, LedgerError> {
        Ok(self.store.list_for_employee(&ctx.company_id, &ctx.actor_id).await?)
    }

    /// Claims submitted by the caller's reports, newest first. Only approvers
    /// have a team.
    pub async fn team_claims(
        &self,
        ctx: &RequestContext,
        reports: &[UserId],
    ) -> Result<Vec<Expense>, LedgerError> {
        if !ctx.role.can_approve() {
            return Err(LedgerError::Forbidden {
                actor_id: ctx.actor_id.clone(),
                action: "view team expenses".to_string(),
            });
        }

        let mut claims = Vec::new();
        for report in reports.iter().filter(|report| **report != ctx.actor_id) {
            claims.extend(self.store.list_for_employee(&ctx.company_id, report).await?);
        }
        claims.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(claims)
    }

    /// Administrative escape hatch: force an expense into a terminal status.
    pub async fn override_status(
        &self,
        ctx: &RequestContext,
        expense_id: &ExpenseId,
        status: ExpenseStatus,
        reason: impl Into<String>,
    ) -> Result<Expense, LedgerError> {
        let reason = reason.into();
        let lock = self.lock_for(expense_id);
        let result = {
            let _guard = lock.lock().await;
            self.record_override(ctx, expense_id, status, reason.trim()).await
        };
        self.release_lock(expense_id, lock);

        match &result {
            Ok(expense) => {
                warn!(
                    event_name = "ledger.status_overridden",
                    correlation_id = %ctx.correlation_id,
                    expense_id = %expense_id,
                    admin_id = %ctx.actor_id,
                    status = expense.status.as_str(),
                    "expense status overridden"
                );
                self.audit.emit(
                    AuditEvent::new(
                        Some(expense_id.clone()),
                        &ctx.correlation_id,
                        "ledger.status_overridden",
                        AuditCategory::Approval,
                        ctx.actor_id.as_str(),
                        AuditOutcome::Success,
                    )
                    .with_metadata("status", status.as_str())
                    .with_metadata("reason", reason.trim()),
                );
            }
            Err(error) => {
                warn!(
                    event_name = "ledger.override_refused",
                    correlation_id = %ctx.correlation_id,
                    expense_id = %expense_id,
                    admin_id = %ctx.actor_id,
                    error_kind = error.kind(),
                    error = %error,
                    "status override refused"
                );
                self.audit.emit(
                    AuditEvent::new(
                        Some(expense_id.clone()),
                        &ctx.correlation_id,
                        "ledger.override_refused",
                        AuditCategory::Approval,
                        ctx.actor_id.as_str(),
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("reason", error.kind()),
                );
            }
        }

        result
    }

    pub async fn verify(&self, expense_id: &ExpenseId) -> Result<VerificationResult, LedgerError> {
        let snapshot = self.store.load_ledger(expense_id).await?;
        Ok(self.signer.verify(expense_id, &snapshot.entries))
    }

    async fn record_decision(
        &self,
        ctx: &RequestContext,
        expense_id: &ExpenseId,
        step_order: u32,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<DecisionReceipt, LedgerError> {
        let snapshot = self.store.load_ledger(expense_id).await?;
        let expense = &snapshot.expense;

        let not_eligible = |reason: &str| LedgerError::NotEligible {
            approver_id: ctx.actor_id.clone(),
            step_order,
            reason: reason.to_string(),
        };
        if !ctx.belongs_to(&expense.company_id) {
            return Err(not_eligible("expense belongs to another company"));
        }
        if expense.is_terminal() {
            return Err(LedgerError::AlreadyFinalized {
                expense_id: expense_id.clone(),
                status: expense.status,
            });
        }
        let Some(step) = expense.plan.step(step_order) else {
            return Err(not_eligible("the expense has no such step"));
        };
        if ctx.actor_id == expense.employee_id {
            return Err(not_eligible("employees cannot decide their own expenses"));
        }
        if !step.is_eligible(&ctx.actor_id) {
            return Err(not_eligible("not a listed approver for this step"));
        }

        let current = FlowEvaluation {
            status: expense.status,
            next_approvers: expense.next_approvers.clone(),
            current_step: expense.current_step,
        };
        if !current.accepts_votes_for(step_order) {
            return Err(LedgerError::StepNotOpen { step_order, current_step: current.current_step });
        }

        let comment = comment.map(|text| text.trim().to_string()).filter(|text| !text.is_empty());
        if decision == Decision::Rejected
            && self.policy.require_rejection_comment
            && comment.is_none()
        {
            return Err(LedgerError::MissingComment);
        }

        let record = ApprovalDecision {
            id: DecisionId(Uuid::new_v4().to_string()),
            expense_id: expense_id.clone(),
            approver_id: ctx.actor_id.clone(),
            step_order,
            decision,
            comment,
            timestamp: next_timestamp(&snapshot),
        };

        let mut decisions: Vec<ApprovalDecision> = snapshot
            .entries
            .iter()
            .filter_map(|entry| entry.record.as_decision())
            .cloned()
            .collect();
        decisions.push(record.clone());
        let evaluation = evaluate_flow(&expense.plan, &decisions);

        let mut updated = expense.clone();
        updated.apply_evaluation(&evaluation)?;
        updated.version = expense.version.saturating_add(1);
        updated.updated_at = record.timestamp;

        let entry = self.signer.seal(snapshot.last_entry(), LedgerRecord::Decision(record));
        self.store.commit(&entry, &updated, expense.version).await?;

        Ok(DecisionReceipt { entry, expense: updated })
    }

    async fn record_override(
        &self,
        ctx: &RequestContext,
        expense_id: &ExpenseId,
        status: ExpenseStatus,
        reason: &str,
    ) -> Result<Expense, LedgerError> {
        if !ctx.is_admin() {
            return Err(LedgerError::Forbidden {
                actor_id: ctx.actor_id.clone(),
                action: "override expense status".to_string(),
            });
        }

        let snapshot = self.store.load_ledger(expense_id).await?;
        let expense = &snapshot.expense;
        if !ctx.belongs_to(&expense.company_id) {
            return Err(LedgerError::Forbidden {
                actor_id: ctx.actor_id.clone(),
                action: "override expenses of another company".to_string(),
            });
        }
        if !status.is_terminal() {
            return Err(DomainError::InvalidExpenseTransition { from: expense.status, to: status }
                .into());
        }
        if reason.is_empty() {
            return Err(LedgerError::MissingComment);
        }

        let record = StatusOverride {
            expense_id: expense_id.clone(),
            admin_id: ctx.actor_id.clone(),
            status,
            reason: reason.to_string(),
            timestamp: next_timestamp(&snapshot),
        };

        let mut updated = expense.clone();
        updated.force_status(status);
        updated.version = expense.version.saturating_add(1);
        updated.updated_at = record.timestamp;

        let entry = self.signer.seal(snapshot.last_entry(), LedgerRecord::Override(record));
        self.store.commit(&entry, &updated, expense.version).await?;

        Ok(updated)
    }

    async fn load_visible(
        &self,
        ctx: &RequestContext,
        expense_id: &ExpenseId,
    ) -> Result<LedgerSnapshot, LedgerError> {
        let snapshot = self.store.load_ledger(expense_id).await?;
        if !ctx.belongs_to(&snapshot.expense.company_id) {
            return Err(LedgerError::UnknownExpense(expense_id.clone()));
        }
        Ok(snapshot)
    }

    fn lock_for(&self, expense_id: &ExpenseId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(expense_id.clone()).or_default().clone()
    }

    fn release_lock(&self, expense_id: &ExpenseId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        // The map and `lock` are the only holders when nobody else is waiting.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(expense_id);
        }
    }
}

fn validate_draft(draft: &ExpenseDraft) -> Result<(), DomainError> {
    if draft.amount <= rust_decimal::Decimal::ZERO {
        return Err(DomainError::InvariantViolation("expense amount must be positive".to_string()));
    }
    let currency = draft.currency.trim();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(DomainError::InvariantViolation(format!(
            "currency `{currency}` must be a three-letter ISO code"
        )));
    }
    if draft.description.trim().is_empty() {
        return Err(DomainError::InvariantViolation(
            "expense description must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Wall-clock time, never earlier than the last entry so history order matches append order.
fn next_timestamp(snapshot: &LedgerSnapshot) -> DateTime<Utc> {
    let now = Utc::now();
    match snapshot.last_entry() {
        Some(last) if last.timestamp() > now => last.timestamp(),
        _ => now,
    }
}
