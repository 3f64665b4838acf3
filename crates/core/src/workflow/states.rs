use serde::{Deserialize, Serialize};

use crate::domain::expense::ExpenseStatus;
use crate::domain::rule::RuleKind;
use crate::domain::user::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Satisfied,
    Rejected,
    Pending,
}

/// A resolved approval step as snapshotted onto an expense.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub order: u32,
    pub approvers: Vec<UserId>,
    pub is_required: bool,
    #[serde(default)]
    pub rule: Option<RuleKind>,
}

impl PlanStep {
    /// Listed approvers plus the rule's named approver when it is not listed.
    pub fn eligible_approvers(&self) -> Vec<&UserId> {
        let mut eligible: Vec<&UserId> = Vec::with_capacity(self.approvers.len() + 1);
        for approver in &self.approvers {
            if !eligible.contains(&approver) {
                eligible.push(approver);
            }
        }
        if let Some(named) = self.rule.as_ref().and_then(RuleKind::specific_approver) {
            if !eligible.contains(&named) {
                eligible.push(named);
            }
        }
        eligible
    }

    pub fn is_eligible(&self, user_id: &UserId) -> bool {
        self.eligible_approvers().contains(&user_id)
    }

    pub fn rejection_is_binding(&self) -> bool {
        self.is_required || self.rule.as_ref().is_some_and(RuleKind::names_approver)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPlan {
    pub steps: Vec<PlanStep>,
}

impl ApprovalPlan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    pub fn step(&self, order: u32) -> Option<&PlanStep> {
        self.steps.iter().find(|step| step.order == order)
    }

    pub fn ordered_steps(&self) -> Vec<&PlanStep> {
        let mut steps: Vec<&PlanStep> = self.steps.iter().collect();
        steps.sort_by_key(|step| step.order);
        steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEvaluation {
    pub status: ExpenseStatus,
    pub next_approvers: Vec<UserId>,
    pub current_step: Option<u32>,
}

impl FlowEvaluation {
    pub fn approved(current_step: Option<u32>) -> Self {
        Self { status: ExpenseStatus::Approved, next_approvers: Vec::new(), current_step }
    }

    pub fn rejected(current_step: u32) -> Self {
        Self {
            status: ExpenseStatus::Rejected,
            next_approvers: Vec::new(),
            current_step: Some(current_step),
        }
    }

    pub fn pending(current_step: u32, next_approvers: Vec<UserId>) -> Self {
        Self { status: ExpenseStatus::Pending, next_approvers, current_step: Some(current_step) }
    }

    /// Steps at or before the blocking step accept votes while the expense is pending.
    pub fn accepts_votes_for(&self, step_order: u32) -> bool {
        match (self.status, self.current_step) {
            (ExpenseStatus::Pending, Some(current)) => step_order <= current,
            _ => false,
        }
    }
}
