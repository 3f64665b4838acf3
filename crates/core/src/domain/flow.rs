use serde::{Deserialize, Serialize};

use crate::domain::rule::RuleId;
use crate::domain::user::{CompanyId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub order: u32,
    pub approver_ids: Vec<UserId>,
    pub is_required: bool,
    #[serde(default)]
    pub rule_id: Option<RuleId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalFlow {
    pub id: FlowId,
    pub company_id: CompanyId,
    pub name: String,
    pub steps: Vec<ApprovalStep>,
    pub is_active: bool,
}

impl ApprovalFlow {
    pub fn ordered_steps(&self) -> Vec<&ApprovalStep> {
        let mut steps: Vec<&ApprovalStep> = self.steps.iter().collect();
        steps.sort_by_key(|step| step.order);
        steps
    }
}

/// What an expense is routed through when it is submitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Assignment {
    Flow(FlowId),
    Rule(RuleId),
}
