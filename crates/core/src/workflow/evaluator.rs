use crate::domain::decision::{effective_decisions, ApprovalDecision, Decision};
use crate::domain::rule::RuleKind;
use crate::domain::user::UserId;
use crate::workflow::states::{ApprovalPlan, FlowEvaluation, PlanStep, StepOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Threshold {
    Reached,
    Open,
    Unreachable,
}

/// Votes cast on one step by its eligible approvers, latest vote per approver.
struct StepTally<'a> {
    step: &'a PlanStep,
    votes: Vec<(&'a UserId, Decision)>,
}

impl<'a> StepTally<'a> {
    fn collect(step: &'a PlanStep, decisions: &'a [ApprovalDecision]) -> Self {
        let eligible = step.eligible_approvers();
        let mut votes: Vec<(&UserId, Decision)> = Vec::new();
        for decision in decisions.iter().filter(|decision| decision.step_order == step.order) {
            let Some(approver) = eligible.iter().copied().find(|id| **id == decision.approver_id)
            else {
                continue;
            };
            match votes.iter_mut().find(|(voter, _)| *voter == approver) {
                Some(vote) => vote.1 = decision.decision,
                None => votes.push((approver, decision.decision)),
            }
        }
        Self { step, votes }
    }

    fn vote_of(&self, approver: &UserId) -> Option<Decision> {
        self.votes.iter().find(|(voter, _)| *voter == approver).map(|(_, decision)| *decision)
    }

    /// Listed approvers, each counted once.
    fn pool(&self) -> Vec<&'a UserId> {
        let mut pool: Vec<&UserId> = Vec::with_capacity(self.step.approvers.len());
        for approver in &self.step.approvers {
            if !pool.contains(&approver) {
                pool.push(approver);
            }
        }
        pool
    }

    fn percentage(&self, percentage: u8) -> Threshold {
        let pool = self.pool();
        let eligible = pool.len() as u64;
        // An empty pool can neither pass nor fail; it waits for an override.
        if eligible == 0 {
            return Threshold::Open;
        }

        let approved = pool
            .iter()
            .filter(|approver| self.vote_of(approver) == Some(Decision::Approved))
            .count() as u64;
        let remaining =
            pool.iter().filter(|approver| self.vote_of(approver).is_none()).count() as u64;
        let required = u64::from(percentage) * eligible;

        if approved * 100 >= required {
            Threshold::Reached
        } else if (approved + remaining) * 100 < required {
            Threshold::Unreachable
        } else {
            Threshold::Open
        }
    }

    fn plain(&self) -> StepOutcome {
        let pool = self.pool();
        if pool.is_empty() {
            return StepOutcome::Pending;
        }
        if pool.iter().any(|approver| self.vote_of(approver) == Some(Decision::Rejected)) {
            return StepOutcome::Rejected;
        }
        if pool.iter().all(|approver| self.vote_of(approver) == Some(Decision::Approved)) {
            return StepOutcome::Satisfied;
        }
        StepOutcome::Pending
    }
}

/// Outcome of a single step given the decisions recorded so far.
///
/// Decisions for other steps and from approvers not eligible for this step are
/// ignored. When an approver voted more than once, the last vote counts.
pub fn evaluate_step(step: &PlanStep, decisions: &[ApprovalDecision]) -> StepOutcome {
    let tally = StepTally::collect(step, decisions);

    match &step.rule {
        None => tally.plain(),
        Some(RuleKind::Percentage { percentage }) => match tally.percentage(*percentage) {
            Threshold::Reached => StepOutcome::Satisfied,
            Threshold::Unreachable => StepOutcome::Rejected,
            Threshold::Open => StepOutcome::Pending,
        },
        Some(RuleKind::Specific { specific_approver_id }) => {
            match tally.vote_of(specific_approver_id) {
                Some(Decision::Approved) => StepOutcome::Satisfied,
                Some(Decision::Rejected) => StepOutcome::Rejected,
                None => StepOutcome::Pending,
            }
        }
        Some(RuleKind::Hybrid { percentage, specific_approver_id }) => {
            let threshold = tally.percentage(*percentage);
            let named_vote = tally.vote_of(specific_approver_id);
            let percentage_lost = threshold == Threshold::Unreachable || tally.pool().is_empty();
            if threshold == Threshold::Reached || named_vote == Some(Decision::Approved) {
                StepOutcome::Satisfied
            } else if named_vote == Some(Decision::Rejected) && percentage_lost {
                StepOutcome::Rejected
            } else {
                StepOutcome::Pending
            }
        }
    }
}

/// Walk the plan in step order and derive the expense status.
///
/// Optional steps never block: a pending or rejected optional step is skipped,
/// unless its rule names an approver, in which case a rejection is binding.
pub fn evaluate_flow(plan: &ApprovalPlan, decisions: &[ApprovalDecision]) -> FlowEvaluation {
    let effective = effective_decisions(decisions);
    let steps = plan.ordered_steps();
    let mut last_order = None;

    for step in steps {
        last_order = Some(step.order);
        match evaluate_step(step, &effective) {
            StepOutcome::Satisfied => continue,
            StepOutcome::Rejected if step.rejection_is_binding() => {
                return FlowEvaluation::rejected(step.order);
            }
            StepOutcome::Rejected => continue,
            StepOutcome::Pending if step.is_required => {
                return FlowEvaluation::pending(step.order, awaiting(step, &effective));
            }
            StepOutcome::Pending => continue,
        }
    }

    FlowEvaluation::approved(last_order)
}

/// Eligible approvers of `step` that have not voted on it yet.
pub fn awaiting(step: &PlanStep, decisions: &[ApprovalDecision]) -> Vec<UserId> {
    step.eligible_approvers()
        .into_iter()
        .filter(|approver| {
            !decisions.iter().any(|decision| {
                decision.step_order == step.order && decision.approver_id == **approver
            })
        })
        .cloned()
        .collect()
}
