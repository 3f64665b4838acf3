pub mod approvals;
pub mod audit;
pub mod config;
pub mod context;
pub mod currency;
pub mod domain;
pub mod errors;
pub mod ledger;
pub mod workflow;

pub use approvals::{RuleValidationFailure, RuleValidationResult, RuleValidator};
pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use context::RequestContext;
pub use currency::{CurrencyError, RateTable};
pub use domain::decision::{ApprovalDecision, Decision, DecisionId, StatusOverride};
pub use domain::expense::{Expense, ExpenseCategory, ExpenseDraft, ExpenseId, ExpenseStatus};
pub use domain::flow::{ApprovalFlow, ApprovalStep, Assignment, FlowId};
pub use domain::rule::{ApprovalRule, RuleId, RuleKind};
pub use domain::user::{Company, CompanyId, User, UserId, UserRole};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use ledger::{
    ApprovalLedger, ApprovalStore, ChainSigner, DecisionReceipt, InMemoryApprovalStore,
    LedgerEntry, LedgerError, LedgerPolicy, LedgerRecord, LedgerSnapshot, StoreError,
    VerificationResult,
};
pub use workflow::{
    evaluate_flow, evaluate_step, ApprovalPlan, EvaluationRequest, FlowEvaluation, PlanError,
    PlanStep, StepOutcome,
};
