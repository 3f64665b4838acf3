use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::flow::ApprovalFlow;
use crate::domain::rule::{ApprovalRule, RuleId, RuleKind};
use crate::domain::user::{CompanyId, User, UserId, UserRole};

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleValidationFailure {
    #[error("percentage {percentage} must be within 1..=100")]
    PercentageOutOfRange { percentage: u8 },
    #[error("approver `{approver_id}` does not exist")]
    UnknownApprover { approver_id: UserId },
    #[error("approver `{approver_id}` belongs to company `{}`", .company_id.0)]
    ApproverInOtherCompany { approver_id: UserId, company_id: CompanyId },
    #[error("user `{approver_id}` has role `{}` and cannot approve expenses", .role.as_str())]
    ApproverLacksCapability { approver_id: UserId, role: UserRole },
    #[error("approval flow must contain at least one step")]
    EmptyFlow,
    #[error("step order {order} is used twice")]
    DuplicateStepOrder { order: u32 },
    #[error("step orders must be contiguous from 1: expected {expected}, found {found}")]
    NonContiguousStepOrder { expected: u32, found: u32 },
    #[error("step {order} must list at least one approver")]
    StepWithoutApprovers { order: u32 },
    #[error("step {order} references unknown rule `{}`", .rule_id.0)]
    UnknownStepRule { order: u32, rule_id: RuleId },
    #[error("step {order} references inactive rule `{}`", .rule_id.0)]
    InactiveStepRule { order: u32, rule_id: RuleId },
    #[error("rule `{}` belongs to company `{}`", .rule_id.0, .company_id.0)]
    RuleInOtherCompany { rule_id: RuleId, company_id: CompanyId },
    #[error("user name must not be empty")]
    EmptyUserName,
    #[error("email `{email}` is not a valid address")]
    InvalidEmail { email: String },
    #[error("user `{user_id}` cannot be their own manager")]
    SelfManaged { user_id: UserId },
    #[error("manager `{manager_id}` does not exist")]
    UnknownManager { manager_id: UserId },
    #[error("manager `{manager_id}` belongs to company `{}`", .company_id.0)]
    ManagerInOtherCompany { manager_id: UserId, company_id: CompanyId },
    #[error("manager `{manager_id}` has role `{}` and cannot approve expenses", .role.as_str())]
    ManagerLacksCapability { manager_id: UserId, role: UserRole },
    #[error("reporting line of `{user_id}` loops back to them")]
    ManagerCycle { user_id: UserId },
}

impl RuleValidationFailure {
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleValidationResult {
    pub allowed: bool,
    pub reason: String,
    pub failure: Option<RuleValidationFailure>,
}

impl RuleValidationResult {
    fn allow(reason: impl Into<String>) -> Self {
        Self { allowed: true, reason: reason.into(), failure: None }
    }

    fn deny(failure: RuleValidationFailure) -> Self {
        Self { allowed: false, reason: failure.reason(), failure: Some(failure) }
    }

    pub fn into_result(self) -> Result<(), RuleValidationFailure> {
        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// Configuration-time checks for approval rules and flows of one company.
#[derive(Clone, Debug, Default)]
pub struct RuleValidator {
    users: HashMap<UserId, User>,
    rules: HashMap<RuleId, ApprovalRule>,
}

impl RuleValidator {
    pub fn new(users: Vec<User>) -> Self {
        let users = users.into_iter().map(|user| (user.id.clone(), user)).collect();
        Self { users, rules: HashMap::new() }
    }

    pub fn with_rules(mut self, rules: Vec<ApprovalRule>) -> Self {
        self.rules = rules.into_iter().map(|rule| (rule.id.clone(), rule)).collect();
        self
    }

    pub fn validate_rule(&self, rule: &ApprovalRule) -> RuleValidationResult {
        if let Some(failure) = self.check_rule_kind(&rule.kind, &rule.company_id) {
            return RuleValidationResult::deny(failure);
        }

        RuleValidationResult::allow(format!(
            "{} rule `{}` is valid for company `{}`",
            rule.kind.as_str(),
            rule.id.0,
            rule.company_id.0
        ))
    }

    pub fn validate_flow(&self, flow: &ApprovalFlow) -> RuleValidationResult {
        if flow.steps.is_empty() {
            return RuleValidationResult::deny(RuleValidationFailure::EmptyFlow);
        }

        let mut orders: Vec<u32> = flow.steps.iter().map(|step| step.order).collect();
        orders.sort_unstable();
        for pair in orders.windows(2) {
            if pair[0] == pair[1] {
                return RuleValidationResult::deny(RuleValidationFailure::DuplicateStepOrder {
                    order: pair[0],
                });
            }
        }
        for (expected, order) in (1u32..).zip(&orders) {
            if *order != expected {
                return RuleValidationResult::deny(RuleValidationFailure::NonContiguousStepOrder {
                    expected,
                    found: *order,
                });
            }
        }

        for step in flow.ordered_steps() {
            if step.approver_ids.is_empty() {
                return RuleValidationResult::deny(RuleValidationFailure::StepWithoutApprovers {
                    order: step.order,
                });
            }

            if let Some(failure) = step
                .approver_ids
                .iter()
                .find_map(|approver_id| self.check_approver(approver_id, &flow.company_id))
            {
                return RuleValidationResult::deny(failure);
            }

            let Some(rule_id) = &step.rule_id else {
                continue;
            };
            let Some(rule) = self.rules.get(rule_id) else {
                return RuleValidationResult::deny(RuleValidationFailure::UnknownStepRule {
                    order: step.order,
                    rule_id: rule_id.clone(),
                });
            };
            if rule.company_id != flow.company_id {
                return RuleValidationResult::deny(RuleValidationFailure::RuleInOtherCompany {
                    rule_id: rule_id.clone(),
                    company_id: rule.company_id.clone(),
                });
            }
            if !rule.is_active {
                return RuleValidationResult::deny(RuleValidationFailure::InactiveStepRule {
                    order: step.order,
                    rule_id: rule_id.clone(),
                });
            }
            if let Some(failure) = self.check_rule_kind(&rule.kind, &flow.company_id) {
                return RuleValidationResult::deny(failure);
            }
        }

        RuleValidationResult::allow(format!(
            "flow `{}` with {} step(s) is valid",
            flow.id.0,
            flow.steps.len()
        ))
    }

    /// Directory checks for a user about to be saved. The manager link must
    /// point at an approver of the same company and must not form a loop.
    pub fn validate_user(&self, user: &User) -> RuleValidationResult {
        if user.name.trim().is_empty() {
            return RuleValidationResult::deny(RuleValidationFailure::EmptyUserName);
        }
        let email = user.email.trim();
        let well_formed = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !well_formed {
            return RuleValidationResult::deny(RuleValidationFailure::InvalidEmail {
                email: user.email.clone(),
            });
        }

        let Some(manager_id) = &user.manager_id else {
            return RuleValidationResult::allow(format!("user `{}` has no manager", user.id));
        };
        if manager_id == &user.id {
            return RuleValidationResult::deny(RuleValidationFailure::SelfManaged {
                user_id: user.id.clone(),
            });
        }
        let Some(manager) = self.users.get(manager_id) else {
            return RuleValidationResult::deny(RuleValidationFailure::UnknownManager {
                manager_id: manager_id.clone(),
            });
        };
        if manager.company_id != user.company_id {
            return RuleValidationResult::deny(RuleValidationFailure::ManagerInOtherCompany {
                manager_id: manager_id.clone(),
                company_id: manager.company_id.clone(),
            });
        }
        if !manager.can_approve() {
            return RuleValidationResult::deny(RuleValidationFailure::ManagerLacksCapability {
                manager_id: manager_id.clone(),
                role: manager.role,
            });
        }

        let mut cursor = manager.manager_id.as_ref();
        let mut hops = 0;
        while let Some(next) = cursor {
            if next == &user.id || hops > self.users.len() {
                return RuleValidationResult::deny(RuleValidationFailure::ManagerCycle {
                    user_id: user.id.clone(),
                });
            }
            cursor = self.users.get(next).and_then(|above| above.manager_id.as_ref());
            hops += 1;
        }

        RuleValidationResult::allow(format!("user `{}` reports to `{manager_id}`", user.id))
    }

    fn check_rule_kind(
        &self,
        kind: &RuleKind,
        company_id: &CompanyId,
    ) -> Option<RuleValidationFailure> {
        if let Some(percentage) = kind.percentage() {
            if !(1..=100).contains(&percentage) {
                return Some(RuleValidationFailure::PercentageOutOfRange { percentage });
            }
        }

        kind.specific_approver().and_then(|approver_id| self.check_approver(approver_id, company_id))
    }

    fn check_approver(
        &self,
        approver_id: &UserId,
        company_id: &CompanyId,
    ) -> Option<RuleValidationFailure> {
        let Some(user) = self.users.get(approver_id) else {
            return Some(RuleValidationFailure::UnknownApprover { approver_id: approver_id.clone() });
        };

        if &user.company_id != company_id {
            return Some(RuleValidationFailure::ApproverInOtherCompany {
                approver_id: approver_id.clone(),
                company_id: user.company_id.clone(),
            });
        }

        if !user.can_approve() {
            return Some(RuleValidationFailure::ApproverLacksCapability {
                approver_id: approver_id.clone(),
                role: user.role,
            });
        }

        None
    }
}
