use std::collections::HashMap;

use tokio::sync::RwLock;

use expensa_core::domain::flow::{ApprovalFlow, FlowId};
use expensa_core::domain::rule::{ApprovalRule, RuleId};
use expensa_core::domain::user::{Company, CompanyId, User, UserId};

use super::{CompanyRepository, FlowRepository, RepositoryError, RuleRepository, UserRepository};

#[derive(Default)]
pub struct InMemoryCompanyRepository {
    companies: RwLock<HashMap<String, Company>>,
}

#[async_trait::async_trait]
impl CompanyRepository for InMemoryCompanyRepository {
    async fn find_by_id(&self, id: &CompanyId) -> Result<Option<Company>, RepositoryError> {
        let companies = self.companies.read().await;
        Ok(companies.get(&id.0).cloned())
    }

    async fn save(&self, company: Company) -> Result<(), RepositoryError> {
        let mut companies = self.companies.write().await;
        companies.insert(company.id.0.clone(), company);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<String, User>>,
}

#[async_trait::async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let users = self.users.read().await;
        Ok(users.get(&id.0).cloned())
    }

    async fn list_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<User>, RepositoryError> {
        let users = self.users.read().await;
        let mut listed: Vec<User> =
            users.values().filter(|user| &user.company_id == company_id).cloned().collect();
        listed.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(listed)
    }

    async fn save(&self, user: User) -> Result<(), RepositoryError> {
        let mut users = self.users.write().await;
        users.insert(user.id.0.clone(), user);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<HashMap<String, ApprovalRule>>,
}

#[async_trait::async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn find_by_id(&self, id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules.get(&id.0).cloned())
    }

    async fn list_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rules = self.rules.read().await;
        let mut listed: Vec<ApprovalRule> =
            rules.values().filter(|rule| &rule.company_id == company_id).cloned().collect();
        listed.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(listed)
    }

    async fn save(&self, rule: ApprovalRule) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        rules.insert(rule.id.0.clone(), rule);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryFlowRepository {
    flows: RwLock<HashMap<String, ApprovalFlow>>,
}

#[async_trait::async_trait]
impl FlowRepository for InMemoryFlowRepository {
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<ApprovalFlow>, RepositoryError> {
        let flows = self.flows.read().await;
        Ok(flows.get(&id.0).cloned())
    }

    async fn list_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalFlow>, RepositoryError> {
        let flows = self.flows.read().await;
        let mut listed: Vec<ApprovalFlow> =
            flows.values().filter(|flow| &flow.company_id == company_id).cloned().collect();
        listed.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(listed)
    }

    async fn save(&self, mut flow: ApprovalFlow) -> Result<(), RepositoryError> {
        flow.steps.sort_by_key(|step| step.order);
        let mut flows = self.flows.write().await;
        flows.insert(flow.id.0.clone(), flow);
        Ok(())
    }
}
