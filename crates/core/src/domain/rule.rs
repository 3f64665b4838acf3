use serde::{Deserialize, Serialize};

use crate::domain::user::{CompanyId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub String);

/// Satisfaction condition for a single approval step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    Percentage { percentage: u8 },
    Specific { specific_approver_id: UserId },
    Hybrid { percentage: u8, specific_approver_id: UserId },
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Percentage { .. } => "percentage",
            Self::Specific { .. } => "specific",
            Self::Hybrid { .. } => "hybrid",
        }
    }

    pub fn percentage(&self) -> Option<u8> {
        match self {
            Self::Percentage { percentage } | Self::Hybrid { percentage, .. } => Some(*percentage),
            Self::Specific { .. } => None,
        }
    }

    pub fn specific_approver(&self) -> Option<&UserId> {
        match self {
            Self::Specific { specific_approver_id }
            | Self::Hybrid { specific_approver_id, .. } => Some(specific_approver_id),
            Self::Percentage { .. } => None,
        }
    }

    /// A rejection under a rule naming a person is binding even on optional steps.
    pub fn names_approver(&self) -> bool {
        self.specific_approver().is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: RuleId,
    pub company_id: CompanyId,
    pub name: String,
    pub kind: RuleKind,
    pub is_active: bool,
}
