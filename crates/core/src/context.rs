use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::user::{CompanyId, UserId, UserRole};

/// Caller identity for one request. Every ledger operation receives it explicitly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub actor_id: UserId,
    pub role: UserRole,
    pub company_id: CompanyId,
    pub correlation_id: String,
}

impl RequestContext {
    pub fn new(actor_id: UserId, role: UserRole, company_id: CompanyId) -> Self {
        Self { actor_id, role, company_id, correlation_id: Uuid::new_v4().to_string() }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    pub fn belongs_to(&self, company_id: &CompanyId) -> bool {
        &self.company_id == company_id
    }
}
