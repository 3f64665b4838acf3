use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::expense::{ExpenseId, ExpenseStatus};
use crate::domain::user::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved" | "approve" => Some(Self::Approved),
            "rejected" | "reject" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// One approver's vote on one step of one expense.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub id: DecisionId,
    pub expense_id: ExpenseId,
    pub approver_id: UserId,
    pub step_order: u32,
    pub decision: Decision,
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Administrative escape hatch recorded alongside regular decisions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusOverride {
    pub expense_id: ExpenseId,
    pub admin_id: UserId,
    pub status: ExpenseStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Reduce a decision history to the latest vote per `(approver, step)`.
///
/// Input order is the ledger order; later entries supersede earlier ones.
pub fn effective_decisions<'a, I>(decisions: I) -> Vec<ApprovalDecision>
where
    I: IntoIterator<Item = &'a ApprovalDecision>,
{
    let mut effective: Vec<ApprovalDecision> = Vec::new();
    for decision in decisions {
        match effective.iter_mut().find(|existing| {
            existing.approver_id == decision.approver_id
                && existing.step_order == decision.step_order
        }) {
            Some(existing) => *existing = decision.clone(),
            None => effective.push(decision.clone()),
        }
    }
    effective
}
