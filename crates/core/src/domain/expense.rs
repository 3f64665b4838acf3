use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::flow::Assignment;
use crate::domain::user::{CompanyId, UserId};
use crate::errors::DomainError;
use crate::workflow::{ApprovalPlan, FlowEvaluation};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExpenseId(pub String);

impl std::fmt::Display for ExpenseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseStatus {
    Pending,
    Approved,
    Rejected,
}

impl ExpenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseCategory {
    MealsAndEntertainment,
    Travel,
    Transportation,
    OfficeSupplies,
    Accommodation,
    Communication,
    TrainingAndDevelopment,
    Other,
}

impl ExpenseCategory {
    pub const ALL: [Self; 8] = [
        Self::MealsAndEntertainment,
        Self::Travel,
        Self::Transportation,
        Self::OfficeSupplies,
        Self::Accommodation,
        Self::Communication,
        Self::TrainingAndDevelopment,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MealsAndEntertainment => "meals_and_entertainment",
            Self::Travel => "travel",
            Self::Transportation => "transportation",
            Self::OfficeSupplies => "office_supplies",
            Self::Accommodation => "accommodation",
            Self::Communication => "communication",
            Self::TrainingAndDevelopment => "training_and_development",
            Self::Other => "other",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::MealsAndEntertainment => "Meals & Entertainment",
            Self::Travel => "Travel",
            Self::Transportation => "Transportation",
            Self::OfficeSupplies => "Office Supplies",
            Self::Accommodation => "Accommodation",
            Self::Communication => "Communication",
            Self::TrainingAndDevelopment => "Training & Development",
            Self::Other => "Other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let key = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == key || category.label().to_ascii_lowercase() == key)
    }
}

/// Employee input for a new claim; identity and tenant come from the request context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseDraft {
    pub amount: Decimal,
    pub currency: String,
    pub category: ExpenseCategory,
    pub description: String,
    pub date: NaiveDate,
    pub assignment: Assignment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expense {
    pub id: ExpenseId,
    pub company_id: CompanyId,
    pub employee_id: UserId,
    pub amount: Decimal,
    pub currency: String,
    pub category: ExpenseCategory,
    pub description: String,
    pub date: NaiveDate,
    pub status: ExpenseStatus,
    pub assignment: Assignment,
    pub plan: ApprovalPlan,
    pub next_approvers: Vec<UserId>,
    pub current_step: Option<u32>,
    pub version: u64,
    pub overridden: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Expense {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_transition_to(&self, next: ExpenseStatus) -> bool {
        matches!(
            (self.status, next),
            (ExpenseStatus::Pending, ExpenseStatus::Pending)
                | (ExpenseStatus::Pending, ExpenseStatus::Approved)
                | (ExpenseStatus::Pending, ExpenseStatus::Rejected)
        )
    }

    /// Apply an evaluator result. Terminal expenses only change through overrides.
    pub fn apply_evaluation(&mut self, evaluation: &FlowEvaluation) -> Result<(), DomainError> {
        if !self.can_transition_to(evaluation.status) {
            return Err(DomainError::InvalidExpenseTransition {
                from: self.status,
                to: evaluation.status,
            });
        }

        self.status = evaluation.status;
        // The claimant never waits on themselves, even when a rule names them.
        self.next_approvers = evaluation
            .next_approvers
            .iter()
            .filter(|approver| **approver != self.employee_id)
            .cloned()
            .collect();
        self.current_step = evaluation.current_step;
        Ok(())
    }

    pub fn force_status(&mut self, status: ExpenseStatus) {
        self.status = status;
        self.next_approvers.clear();
        self.overridden = true;
    }
}
