use std::collections::HashMap;

use thiserror::Error;

use crate::domain::flow::{ApprovalFlow, FlowId};
use crate::domain::rule::{ApprovalRule, RuleId};
use crate::domain::user::{CompanyId, User, UserId};
use crate::workflow::states::{ApprovalPlan, PlanStep};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("approval flow `{0:?}` is inactive")]
    InactiveFlow(FlowId),
    #[error("approval rule `{0:?}` is inactive")]
    InactiveRule(RuleId),
    #[error("approval rule `{0:?}` is not configured")]
    UnknownRule(RuleId),
    #[error("configuration belongs to company `{found:?}`, expected `{expected:?}`")]
    CompanyMismatch { expected: CompanyId, found: CompanyId },
    #[error("no approver is available for rule `{0:?}`")]
    NoApprovers(RuleId),
}

/// Resolve a flow and the rules its steps reference into a plan snapshot.
pub fn plan_for_flow(
    flow: &ApprovalFlow,
    rules: &[ApprovalRule],
) -> Result<ApprovalPlan, PlanError> {
    if !flow.is_active {
        return Err(PlanError::InactiveFlow(flow.id.clone()));
    }

    let rules_by_id: HashMap<&RuleId, &ApprovalRule> =
        rules.iter().map(|rule| (&rule.id, rule)).collect();

    let mut steps = Vec::with_capacity(flow.steps.len());
    for step in flow.ordered_steps() {
        let rule = match &step.rule_id {
            Some(rule_id) => {
                let rule = rules_by_id
                    .get(rule_id)
                    .ok_or_else(|| PlanError::UnknownRule(rule_id.clone()))?;
                ensure_usable_rule(rule, &flow.company_id)?;
                Some(rule.kind.clone())
            }
            None => None,
        };

        steps.push(PlanStep {
            order: step.order,
            approvers: step.approver_ids.clone(),
            is_required: step.is_required,
            rule,
        });
    }

    Ok(ApprovalPlan::new(steps))
}

/// A standalone rule becomes one required step voted on by every approver of
/// the company except the submitter.
pub fn plan_for_rule(
    rule: &ApprovalRule,
    company_users: &[User],
    submitter_id: &UserId,
) -> Result<ApprovalPlan, PlanError> {
    ensure_usable_rule(rule, &rule.company_id)?;

    let approvers: Vec<UserId> = company_users
        .iter()
        .filter(|user| user.company_id == rule.company_id)
        .filter(|user| user.can_approve())
        .filter(|user| &user.id != submitter_id)
        .map(|user| user.id.clone())
        .collect();

    let named_available = rule.kind.specific_approver().is_some_and(|id| id != submitter_id);
    if approvers.is_empty() && !named_available {
        return Err(PlanError::NoApprovers(rule.id.clone()));
    }

    Ok(ApprovalPlan::new(vec![PlanStep {
        order: 1,
        approvers,
        is_required: true,
        rule: Some(rule.kind.clone()),
    }]))
}

/// Put the submitter's manager in front of the plan when that manager is
/// flagged as a manager-approver. Later steps are renumbered from 2.
pub fn with_manager_first(
    plan: ApprovalPlan,
    submitter: &User,
    manager: Option<&User>,
) -> ApprovalPlan {
    let Some(manager) = manager else {
        return plan;
    };
    let is_submitters_manager = submitter.manager_id.as_ref() == Some(&manager.id);
    if !is_submitters_manager || !manager.is_manager_approver || !manager.can_approve() {
        return plan;
    }

    let mut steps = vec![PlanStep {
        order: 1,
        approvers: vec![manager.id.clone()],
        is_required: true,
        rule: None,
    }];
    for (order, step) in (2u32..).zip(plan.ordered_steps()) {
        steps.push(PlanStep { order, ..step.clone() });
    }

    ApprovalPlan::new(steps)
}

/// Remove the submitter from every step's listed approvers so nobody votes on
/// their own claim. Steps keep their order even when no approver is left: a
/// required step then waits for an administrator override.
pub fn excluding_submitter(plan: ApprovalPlan, submitter_id: &UserId) -> ApprovalPlan {
    let steps = plan
        .steps
        .into_iter()
        .map(|mut step| {
            step.approvers.retain(|approver| approver != submitter_id);
            step
        })
        .collect();
    ApprovalPlan::new(steps)
}

fn ensure_usable_rule(rule: &ApprovalRule, company_id: &CompanyId) -> Result<(), PlanError> {
    if &rule.company_id != company_id {
        return Err(PlanError::CompanyMismatch {
            expected: company_id.clone(),
            found: rule.company_id.clone(),
        });
    }
    if !rule.is_active {
        return Err(PlanError::InactiveRule(rule.id.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{excluding_submitter, plan_for_flow, plan_for_rule, with_manager_first, PlanError};
    use crate::domain::decision::{ApprovalDecision, Decision, DecisionId};
    use crate::domain::expense::{ExpenseId, ExpenseStatus};
    use crate::domain::flow::{ApprovalFlow, ApprovalStep, FlowId};
    use crate::domain::rule::{ApprovalRule, RuleId, RuleKind};
    use crate::domain::user::{CompanyId, User, UserId, UserRole};
    use crate::workflow::evaluate_flow;
    use crate::workflow::states::ApprovalPlan;

    fn decision(approver: &str, step_order: u32) -> ApprovalDecision {
        ApprovalDecision {
            id: DecisionId(format!("D-{approver}-{step_order}")),
            expense_id: ExpenseId("EXP-1".to_string()),
            approver_id: UserId(approver.to_string()),
            step_order,
            decision: Decision::Approved,
            comment: None,
            timestamp: Utc::now(),
        }
    }

    fn acme() -> CompanyId {
        CompanyId("acme".to_string())
    }

    fn user(id: &str, role: UserRole, manager_id: Option<&str>, is_manager_approver: bool) -> User {
        User {
            id: UserId(id.to_string()),
            company_id: acme(),
            email: format!("{id}@acme.test"),
            name: id.to_string(),
            role,
            manager_id: manager_id.map(|id| UserId(id.to_string())),
            is_manager_approver,
        }
    }

    fn finance_rule(is_active: bool) -> ApprovalRule {
        ApprovalRule {
            id: RuleId("rule-60".to_string()),
            company_id: acme(),
            name: "Finance majority".to_string(),
            kind: RuleKind::Percentage { percentage: 60 },
            is_active,
        }
    }

    fn flow() -> ApprovalFlow {
        ApprovalFlow {
            id: FlowId("flow-standard".to_string()),
            company_id: acme(),
            name: "Standard".to_string(),
            steps: vec![
                ApprovalStep {
                    order: 2,
                    approver_ids: vec![UserId("fin-1".into()), UserId("fin-2".into())],
                    is_required: true,
                    rule_id: Some(RuleId("rule-60".to_string())),
                },
                ApprovalStep {
                    order: 1,
                    approver_ids: vec![UserId("mgr-1".into())],
                    is_required: true,
                    rule_id: None,
                },
            ],
            is_active: true,
        }
    }

    #[test]
    fn flow_plan_resolves_rules_in_step_order() {
        let plan = plan_for_flow(&flow(), &[finance_rule(true)]).expect("plan");

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].order, 1);
        assert!(plan.steps[0].rule.is_none());
        assert_eq!(plan.steps[1].rule, Some(RuleKind::Percentage { percentage: 60 }));
    }

    #[test]
    fn flow_plan_refuses_unknown_and_inactive_rules() {
        assert_eq!(
            plan_for_flow(&flow(), &[]).expect_err("unknown rule"),
            PlanError::UnknownRule(RuleId("rule-60".to_string()))
        );
        assert_eq!(
            plan_for_flow(&flow(), &[finance_rule(false)]).expect_err("inactive rule"),
            PlanError::InactiveRule(RuleId("rule-60".to_string()))
        );
    }

    #[test]
    fn inactive_flow_cannot_be_planned() {
        let mut flow = flow();
        flow.is_active = false;

        assert!(matches!(
            plan_for_flow(&flow, &[finance_rule(true)]),
            Err(PlanError::InactiveFlow(_))
        ));
    }

    #[test]
    fn rule_plan_uses_company_approvers_except_submitter() {
        let users = vec![
            user("admin-1", UserRole::Admin, None, true),
            user("mgr-1", UserRole::Manager, Some("admin-1"), true),
            user("emp-1", UserRole::Employee, Some("mgr-1"), false),
        ];

        let plan = plan_for_rule(&finance_rule(true), &users, &UserId("mgr-1".to_string()))
            .expect("plan");

        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].approvers, vec![UserId("admin-1".to_string())]);
        assert!(plan.steps[0].is_required);
    }

    #[test]
    fn rule_plan_without_any_approver_fails() {
        let users = vec![user("emp-1", UserRole::Employee, None, false)];

        assert_eq!(
            plan_for_rule(&finance_rule(true), &users, &UserId("emp-1".to_string()))
                .expect_err("no approvers"),
            PlanError::NoApprovers(RuleId("rule-60".to_string()))
        );
    }

    #[test]
    fn manager_approver_is_prepended_and_steps_renumbered() {
        let plan = plan_for_flow(&flow(), &[finance_rule(true)]).expect("plan");
        let manager = user("mgr-9", UserRole::Manager, None, true);
        let employee = user("emp-1", UserRole::Employee, Some("mgr-9"), false);

        let plan = with_manager_first(plan, &employee, Some(&manager));

        let orders: Vec<u32> = plan.steps.iter().map(|step| step.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert_eq!(plan.steps[0].approvers, vec![UserId("mgr-9".to_string())]);
        assert_eq!(plan.steps[1].approvers, vec![UserId("mgr-1".to_string())]);
    }

    #[test]
    fn manager_without_approver_flag_is_not_prepended() {
        let manager = user("mgr-9", UserRole::Manager, None, false);
        let employee = user("emp-1", UserRole::Employee, Some("mgr-9"), false);

        let plan = with_manager_first(ApprovalPlan::default(), &employee, Some(&manager));
        assert!(plan.is_empty());
    }

    fn named_step_flow(kind: RuleKind) -> (ApprovalFlow, ApprovalRule) {
        let rule = ApprovalRule {
            id: RuleId("rule-named".to_string()),
            company_id: acme(),
            name: "Named approver".to_string(),
            kind,
            is_active: true,
        };
        let mut flow = flow();
        flow.steps[0] = ApprovalStep {
            order: 2,
            approver_ids: vec![UserId("fin-1".into()), UserId("fin-2".into())],
            is_required: true,
            rule_id: Some(rule.id.clone()),
        };
        (flow, rule)
    }

    #[test]
    fn submitter_as_sole_approver_keeps_required_step_waiting() {
        let plan = plan_for_flow(&flow(), &[finance_rule(true)]).expect("plan");

        let plan = excluding_submitter(plan, &UserId("mgr-1".to_string()));

        let orders: Vec<u32> = plan.steps.iter().map(|step| step.order).collect();
        assert_eq!(orders, vec![1, 2]);
        let first = plan.step(1).expect("step 1 kept");
        assert!(first.is_required);
        assert!(first.approvers.is_empty());

        let evaluation = evaluate_flow(&plan, &[]);
        assert_eq!(evaluation.status, ExpenseStatus::Pending);
        assert_eq!(evaluation.current_step, Some(1));
        assert!(evaluation.next_approvers.is_empty());
    }

    #[test]
    fn specific_rule_naming_submitter_cannot_be_satisfied() {
        let named = UserId("fin-1".to_string());
        let (flow, rule) = named_step_flow(RuleKind::Specific { specific_approver_id: named.clone() });
        let plan = excluding_submitter(plan_for_flow(&flow, &[rule]).expect("plan"), &named);

        let step = plan.step(2).expect("step 2 kept");
        assert_eq!(step.approvers, vec![UserId("fin-2".to_string())]);
        assert_eq!(step.rule, Some(RuleKind::Specific { specific_approver_id: named }));

        let decisions = vec![decision("mgr-1", 1), decision("fin-2", 2)];
        let evaluation = evaluate_flow(&plan, &decisions);
        assert_eq!(evaluation.status, ExpenseStatus::Pending);
        assert_eq!(evaluation.current_step, Some(2));
    }

    #[test]
    fn hybrid_rule_naming_submitter_still_passes_on_percentage() {
        let named = UserId("fin-1".to_string());
        let (flow, rule) = named_step_flow(RuleKind::Hybrid {
            percentage: 100,
            specific_approver_id: named.clone(),
        });
        let plan = excluding_submitter(plan_for_flow(&flow, &[rule]).expect("plan"), &named);

        let decisions = vec![decision("mgr-1", 1), decision("fin-2", 2)];
        let evaluation = evaluate_flow(&plan, &decisions);
        assert_eq!(evaluation.status, ExpenseStatus::Approved);
    }
}
