use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use expensa_core::domain::flow::{ApprovalFlow, FlowId};
use expensa_core::domain::rule::{ApprovalRule, RuleId};
use expensa_core::domain::user::{Company, CompanyId, User, UserId};

pub mod audit;
pub mod company;
pub mod expense;
pub mod flow;
pub mod memory;
pub mod rule;
pub mod user;

pub use audit::SqlAuditSink;
pub use company::SqlCompanyRepository;
pub use expense::SqlApprovalStore;
pub use flow::SqlFlowRepository;
pub use memory::{
    InMemoryCompanyRepository, InMemoryFlowRepository, InMemoryRuleRepository,
    InMemoryUserRepository,
};
pub use rule::SqlRuleRepository;
pub use user::SqlUserRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait CompanyRepository: Send + Sync {
    async fn find_by_id(&self, id: &CompanyId) -> Result<Option<Company>, RepositoryError>;
    async fn save(&self, company: Company) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError>;
    async fn list_for_company(&self, company_id: &CompanyId)
        -> Result<Vec<User>, RepositoryError>;
    async fn save(&self, user: User) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn find_by_id(&self, id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError>;
    async fn list_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError>;
    async fn save(&self, rule: ApprovalRule) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<ApprovalFlow>, RepositoryError>;
    async fn list_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalFlow>, RepositoryError>;
    async fn save(&self, flow: ApprovalFlow) -> Result<(), RepositoryError>;
}

pub(crate) fn decode_error(error: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically and round-trip exactly.
pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc)).map_err(decode_error)
}
