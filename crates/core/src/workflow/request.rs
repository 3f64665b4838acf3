use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::decision::{ApprovalDecision, Decision, DecisionId};
use crate::domain::expense::ExpenseId;
use crate::domain::user::UserId;
use crate::workflow::evaluator::evaluate_flow;
use crate::workflow::states::{ApprovalPlan, FlowEvaluation};

/// A standalone evaluation: a plan snapshot plus the votes cast against it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub plan: ApprovalPlan,
    #[serde(default)]
    pub decisions: Vec<VoteInput>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteInput {
    pub approver_id: UserId,
    pub step_order: u32,
    pub decision: Decision,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EvaluationRequest {
    /// Votes in chronological order. Untimed votes sort first and keep their input order.
    pub fn decisions(&self) -> Vec<ApprovalDecision> {
        let mut votes: Vec<(usize, &VoteInput)> = self.decisions.iter().enumerate().collect();
        votes.sort_by_key(|(_, vote)| vote.timestamp);

        let expense_id = ExpenseId("evaluation".to_string());
        votes
            .into_iter()
            .map(|(index, vote)| ApprovalDecision {
                id: DecisionId(format!("vote-{}", index + 1)),
                expense_id: expense_id.clone(),
                approver_id: vote.approver_id.clone(),
                step_order: vote.step_order,
                decision: vote.decision,
                comment: None,
                timestamp: vote.timestamp.unwrap_or(DateTime::<Utc>::MIN_UTC),
            })
            .collect()
    }

    pub fn evaluate(&self) -> FlowEvaluation {
        evaluate_flow(&self.plan, &self.decisions())
    }
}
