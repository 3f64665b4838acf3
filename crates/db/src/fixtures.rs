use thiserror::Error;

use expensa_core::approvals::RuleValidator;
use expensa_core::domain::flow::{ApprovalFlow, ApprovalStep, FlowId};
use expensa_core::domain::rule::{ApprovalRule, RuleId, RuleKind};
use expensa_core::domain::user::{Company, CompanyId, User, UserId, UserRole};

use crate::connection::DbPool;
use crate::repositories::{
    CompanyRepository, FlowRepository, RepositoryError, RuleRepository, SqlCompanyRepository,
    SqlFlowRepository, SqlRuleRepository, SqlUserRepository, UserRepository,
};

pub const DEMO_COMPANY_ID: &str = "acme";

struct SeedUser {
    id: &'static str,
    name: &'static str,
    email: &'static str,
    role: UserRole,
    manager_id: Option<&'static str>,
    is_manager_approver: bool,
}

/// Managers are listed before their reports so the `manager_id` foreign key holds.
const SEED_USERS: &[SeedUser] = &[
    SeedUser {
        id: "admin-1",
        name: "John Admin",
        email: "admin@company.com",
        role: UserRole::Admin,
        manager_id: None,
        is_manager_approver: true,
    },
    SeedUser {
        id: "mgr-jane",
        name: "Jane Manager",
        email: "jane@company.com",
        role: UserRole::Manager,
        manager_id: Some("admin-1"),
        is_manager_approver: true,
    },
    SeedUser {
        id: "mgr-bob",
        name: "Bob Manager",
        email: "bob@company.com",
        role: UserRole::Manager,
        manager_id: Some("admin-1"),
        is_manager_approver: true,
    },
    SeedUser {
        id: "cfo-1",
        name: "John CFO",
        email: "cfo@company.com",
        role: UserRole::Manager,
        manager_id: Some("admin-1"),
        is_manager_approver: false,
    },
    SeedUser {
        id: "director-1",
        name: "Jane Director",
        email: "director@company.com",
        role: UserRole::Manager,
        manager_id: Some("admin-1"),
        is_manager_approver: false,
    },
    SeedUser {
        id: "emp-mike",
        name: "Mike Employee",
        email: "mike@company.com",
        role: UserRole::Employee,
        manager_id: Some("mgr-jane"),
        is_manager_approver: false,
    },
    SeedUser {
        id: "emp-sarah",
        name: "Sarah Employee",
        email: "sarah@company.com",
        role: UserRole::Employee,
        manager_id: Some("mgr-jane"),
        is_manager_approver: false,
    },
];

#[derive(Debug, Error)]
pub enum SeedError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("fixture `{id}` is invalid: {reason}")]
    InvalidFixture { id: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedResult {
    pub companies: usize,
    pub users: usize,
    pub rules: usize,
    pub flows: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedVerification {
    pub all_present: bool,
    pub checks: Vec<(String, bool)>,
}

/// Deterministic demo tenant: one company, its approvers and employees, and the
/// rules and flows an administrator would configure first.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub fn company() -> Company {
        Company {
            id: CompanyId(DEMO_COMPANY_ID.to_string()),
            name: "Acme Corp".to_string(),
            country: "United States".to_string(),
            currency: "USD".to_string(),
        }
    }

    pub fn users() -> Vec<User> {
        SEED_USERS
            .iter()
            .map(|seed| User {
                id: UserId(seed.id.to_string()),
                company_id: CompanyId(DEMO_COMPANY_ID.to_string()),
                email: seed.email.to_string(),
                name: seed.name.to_string(),
                role: seed.role,
                manager_id: seed.manager_id.map(|id| UserId(id.to_string())),
                is_manager_approver: seed.is_manager_approver,
            })
            .collect()
    }

    pub fn rules() -> Vec<ApprovalRule> {
        let rule = |id: &str, name: &str, kind: RuleKind, is_active: bool| ApprovalRule {
            id: RuleId(id.to_string()),
            company_id: CompanyId(DEMO_COMPANY_ID.to_string()),
            name: name.to_string(),
            kind,
            is_active,
        };

        vec![
            rule(
                "rule-standard",
                "Standard Approval Flow",
                RuleKind::Percentage { percentage: 60 },
                true,
            ),
            rule(
                "rule-cfo",
                "CFO Approval Required",
                RuleKind::Specific { specific_approver_id: UserId("cfo-1".to_string()) },
                true,
            ),
            rule(
                "rule-hybrid",
                "Hybrid Approval Rule",
                RuleKind::Hybrid {
                    percentage: 50,
                    specific_approver_id: UserId("director-1".to_string()),
                },
                false,
            ),
        ]
    }

    pub fn flows() -> Vec<ApprovalFlow> {
        let step = |order: u32, approvers: &[&str], is_required: bool, rule: Option<&str>| {
            ApprovalStep {
                order,
                approver_ids: approvers.iter().map(|id| UserId((*id).to_string())).collect(),
                is_required,
                rule_id: rule.map(|id| RuleId(id.to_string())),
            }
        };

        vec![
            ApprovalFlow {
                id: FlowId("flow-standard".to_string()),
                company_id: CompanyId(DEMO_COMPANY_ID.to_string()),
                name: "Standard Multi-Level Approval".to_string(),
                steps: vec![
                    step(1, &["mgr-jane"], true, None),
                    step(2, &["cfo-1", "mgr-bob"], true, Some("rule-standard")),
                    step(3, &["director-1"], false, None),
                ],
                is_active: true,
            },
            ApprovalFlow {
                id: FlowId("flow-high-value".to_string()),
                company_id: CompanyId(DEMO_COMPANY_ID.to_string()),
                name: "High Value Approval".to_string(),
                steps: vec![
                    step(1, &["mgr-jane"], true, None),
                    step(2, &["cfo-1"], true, Some("rule-cfo")),
                    step(3, &["admin-1"], true, None),
                ],
                is_active: true,
            },
        ]
    }

    /// Upsert the demo tenant. Rules and flows go through the same validation
    /// as administrator writes.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, SeedError> {
        let users = Self::users();
        let rules = Self::rules();
        let flows = Self::flows();
        let validator = RuleValidator::new(users.clone()).with_rules(rules.clone());

        for rule in &rules {
            validator.validate_rule(rule).into_result().map_err(|failure| {
                SeedError::InvalidFixture { id: rule.id.0.clone(), reason: failure.reason() }
            })?;
        }
        for flow in &flows {
            validator.validate_flow(flow).into_result().map_err(|failure| {
                SeedError::InvalidFixture { id: flow.id.0.clone(), reason: failure.reason() }
            })?;
        }

        SqlCompanyRepository::new(pool.clone()).save(Self::company()).await?;

        let user_repo = SqlUserRepository::new(pool.clone());
        for user in &users {
            user_repo.save(user.clone()).await?;
        }
        let rule_repo = SqlRuleRepository::new(pool.clone());
        for rule in &rules {
            rule_repo.save(rule.clone()).await?;
        }
        let flow_repo = SqlFlowRepository::new(pool.clone());
        for flow in &flows {
            flow_repo.save(flow.clone()).await?;
        }

        Ok(SeedResult { companies: 1, users: users.len(), rules: rules.len(), flows: flows.len() })
    }

    /// Check that every seeded record is present and unchanged.
    pub async fn verify(pool: &DbPool) -> Result<SeedVerification, SeedError> {
        let mut checks = Vec::new();
        let company_id = CompanyId(DEMO_COMPANY_ID.to_string());

        let company = SqlCompanyRepository::new(pool.clone()).find_by_id(&company_id).await?;
        checks.push(("company".to_string(), company == Some(Self::company())));

        let user_repo = SqlUserRepository::new(pool.clone());
        for user in Self::users() {
            let stored = user_repo.find_by_id(&user.id).await?;
            checks.push((format!("user:{}", user.id.0), stored == Some(user)));
        }

        let rule_repo = SqlRuleRepository::new(pool.clone());
        for rule in Self::rules() {
            let stored = rule_repo.find_by_id(&rule.id).await?;
            checks.push((format!("rule:{}", rule.id.0), stored == Some(rule)));
        }

        let flow_repo = SqlFlowRepository::new(pool.clone());
        for flow in Self::flows() {
            let stored = flow_repo.find_by_id(&flow.id).await?;
            checks.push((format!("flow:{}", flow.id.0), stored == Some(flow)));
        }

        let all_present = checks.iter().all(|(_, present)| *present);
        Ok(SeedVerification { all_present, checks })
    }
}
