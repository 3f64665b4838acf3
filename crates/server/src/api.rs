use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use expensa_core::approvals::RuleValidator;
use expensa_core::context::RequestContext;
use expensa_core::currency::RateTable;
use expensa_core::domain::decision::Decision;
use expensa_core::domain::expense::{Expense, ExpenseDraft, ExpenseId, ExpenseStatus};
use expensa_core::domain::flow::{ApprovalFlow, ApprovalStep, Assignment, FlowId};
use expensa_core::domain::rule::{ApprovalRule, RuleId, RuleKind};
use expensa_core::domain::user::{Company, CompanyId, User, UserId, UserRole};
use expensa_core::errors::{ApplicationError, DomainError, InterfaceError};
use expensa_core::ledger::{ApprovalLedger, DecisionReceipt, LedgerEntry};
use expensa_core::workflow::{
    plan_for_flow, plan_for_rule, with_manager_first, ApprovalPlan, EvaluationRequest,
    FlowEvaluation,
};
use expensa_db::repositories::{
    CompanyRepository, FlowRepository, RepositoryError, RuleRepository, UserRepository,
};

pub const USER_HEADER: &str = "x-expensa-user";
pub const ROLE_HEADER: &str = "x-expensa-role";
pub const COMPANY_HEADER: &str = "x-expensa-company";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    pub ledger: Arc<ApprovalLedger>,
    pub companies: Arc<dyn CompanyRepository>,
    pub users: Arc<dyn UserRepository>,
    pub rules: Arc<dyn RuleRepository>,
    pub flows: Arc<dyn FlowRepository>,
    pub rates: RateTable,
    pub manager_approval_first: bool,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/users", get(list_users).post(save_user))
        .route("/rules", get(list_rules).post(create_rule))
        .route("/flows", get(list_flows).post(create_flow))
        .route("/expenses", get(own_expenses).post(submit_expense))
        .route("/expenses/team", get(team_expenses))
        .route("/expenses/{id}", get(get_expense))
        .route("/expenses/{id}/history", get(get_history))
        .route("/expenses/{id}/decisions", post(submit_decision))
        .route("/expenses/{id}/override", post(override_status))
        .route("/approvals/pending", get(pending_approvals))
        .route("/evaluate", post(evaluate))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Caller identity and errors
// ---------------------------------------------------------------------------

/// Request context built from the identity headers.
pub struct Caller(pub RequestContext);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let correlation_id = header(parts, CORRELATION_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let bad_request = |message: String| {
            ApiError(InterfaceError::BadRequest { message, correlation_id: correlation_id.clone() })
        };

        let user = header(parts, USER_HEADER)
            .ok_or_else(|| bad_request(format!("missing `{USER_HEADER}` header")))?;
        let raw_role = header(parts, ROLE_HEADER)
            .ok_or_else(|| bad_request(format!("missing `{ROLE_HEADER}` header")))?;
        let role = UserRole::parse(raw_role)
            .ok_or_else(|| bad_request(format!("unknown role `{raw_role}`")))?;
        let company = header(parts, COMPANY_HEADER)
            .ok_or_else(|| bad_request(format!("missing `{COMPANY_HEADER}` header")))?;

        let context =
            RequestContext::new(UserId(user.to_string()), role, CompanyId(company.to_string()))
                .with_correlation_id(correlation_id);
        Ok(Self(context))
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

#[derive(Serialize)]
struct ErrorBody<'a> {
    error_class: &'a str,
    message: &'a str,
    user_message: &'a str,
    correlation_id: &'a str,
}

impl ApiError {
    fn from_app(error: impl Into<ApplicationError>, ctx: &RequestContext) -> Self {
        Self(error.into().into_interface(ctx.correlation_id.clone()))
    }

    fn bad_request(message: impl Into<String>, ctx: &RequestContext) -> Self {
        Self::from_app(DomainError::InvariantViolation(message.into()), ctx)
    }

    fn not_found(message: impl Into<String>, ctx: &RequestContext) -> Self {
        Self::from_app(ApplicationError::NotFound(message.into()), ctx)
    }

    fn conflict(message: impl Into<String>, ctx: &RequestContext) -> Self {
        Self::from_app(ApplicationError::Conflict(message.into()), ctx)
    }

    fn forbidden(message: impl Into<String>, ctx: &RequestContext) -> Self {
        Self::from_app(ApplicationError::Forbidden(message.into()), ctx)
    }

    fn persistence(error: RepositoryError, ctx: &RequestContext) -> Self {
        Self::from_app(ApplicationError::Persistence(error.to_string()), ctx)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::Forbidden { .. } => StatusCode::FORBIDDEN,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(
                event_name = "api.request_failed",
                correlation_id = %self.0.correlation_id(),
                error_class = self.0.error_class(),
                error = %self.0,
                "request failed"
            );
        }

        let body = ErrorBody {
            error_class: self.0.error_class(),
            message: self.0.message(),
            user_message: self.0.user_message(),
            correlation_id: self.0.correlation_id(),
        };
        (status, Json(body)).into_response()
    }
}

/// The caller must exist in the directory with the role and company they claim.
async fn known_caller(state: &ApiState, ctx: &RequestContext) -> Result<User, ApiError> {
    let user =
        state.users.find_by_id(&ctx.actor_id).await.map_err(|e| ApiError::persistence(e, ctx))?;
    match user {
        Some(user) if user.company_id == ctx.company_id && user.role == ctx.role => Ok(user),
        _ => Err(ApiError::forbidden(
            format!(
                "`{}` is not a {} of company `{}`",
                ctx.actor_id,
                ctx.role.as_str(),
                ctx.company_id.0
            ),
            ctx,
        )),
    }
}

async fn require_admin(state: &ApiState, ctx: &RequestContext) -> Result<User, ApiError> {
    let user = known_caller(state, ctx).await?;
    if !ctx.is_admin() {
        return Err(ApiError::forbidden("only admins may manage users and approval configuration", ctx));
    }
    Ok(user)
}

async fn caller_company(state: &ApiState, ctx: &RequestContext) -> Result<Company, ApiError> {
    state
        .companies
        .find_by_id(&ctx.company_id)
        .await
        .map_err(|e| ApiError::persistence(e, ctx))?
        .ok_or_else(|| ApiError::not_found(format!("company `{}` does not exist", ctx.company_id.0), ctx))
}

// ---------------------------------------------------------------------------
// User directory
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UserInput {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub email: String,
    pub role: UserRole,
    #[serde(default)]
    pub manager_id: Option<UserId>,
    #[serde(default)]
    pub is_manager_approver: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserFilter {
    #[serde(default)]
    pub role: Option<UserRole>,
}

async fn list_users(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
    Query(filter): Query<UserFilter>,
) -> Result<Json<Vec<User>>, ApiError> {
    require_admin(&state, &ctx).await?;
    let mut users =
        state.users.list_for_company(&ctx.company_id).await.map_err(|e| ApiError::persistence(e, &ctx))?;
    if let Some(role) = filter.role {
        users.retain(|user| user.role == role);
    }
    users.sort_by(|left, right| left.id.cmp(&right.id));
    Ok(Json(users))
}

/// Create or update a user of the caller's company.
async fn save_user(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
    Json(input): Json<UserInput>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    require_admin(&state, &ctx).await?;

    let user = User {
        id: UserId(input.id.unwrap_or_else(|| format!("user-{}", Uuid::new_v4()))),
        company_id: ctx.company_id.clone(),
        email: input.email.trim().to_ascii_lowercase(),
        name: input.name.trim().to_string(),
        role: input.role,
        manager_id: input.manager_id,
        is_manager_approver: input.is_manager_approver,
    };

    let existing = state.users.find_by_id(&user.id).await.map_err(|e| ApiError::persistence(e, &ctx))?;
    if existing.is_some_and(|stored| stored.company_id != ctx.company_id) {
        return Err(ApiError::conflict(format!("user id `{}` is taken", user.id), &ctx));
    }

    let directory =
        state.users.list_for_company(&ctx.company_id).await.map_err(|e| ApiError::persistence(e, &ctx))?;
    if directory.iter().any(|other| other.id != user.id && other.email == user.email) {
        return Err(ApiError::conflict(format!("email `{}` is already registered", user.email), &ctx));
    }
    let reports = directory.iter().filter(|other| other.manager_id.as_ref() == Some(&user.id)).count();
    if reports > 0 && !user.can_approve() {
        return Err(ApiError::conflict(
            format!("`{}` still manages {reports} user(s) and must keep an approver role", user.id),
            &ctx,
        ));
    }

    RuleValidator::new(directory)
        .validate_user(&user)
        .into_result()
        .map_err(|failure| ApiError::from_app(DomainError::InvalidRuleConfig(failure), &ctx))?;

    state.users.save(user.clone()).await.map_err(|e| ApiError::persistence(e, &ctx))?;
    info!(
        event_name = "config.user_saved",
        correlation_id = %ctx.correlation_id,
        user_id = %user.id,
        role = user.role.as_str(),
        "user saved"
    );
    Ok((StatusCode::CREATED, Json(user)))
}

// ---------------------------------------------------------------------------
// Approval configuration
// ---------------------------------------------------------------------------

fn active_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct RuleInput {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(flatten)]
    pub kind: RuleKind,
    #[serde(default = "active_by_default")]
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
pub struct FlowInput {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub steps: Vec<ApprovalStep>,
    #[serde(default = "active_by_default")]
    pub is_active: bool,
}

async fn list_rules(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
) -> Result<Json<Vec<ApprovalRule>>, ApiError> {
    known_caller(&state, &ctx).await?;
    let mut rules =
        state.rules.list_for_company(&ctx.company_id).await.map_err(|e| ApiError::persistence(e, &ctx))?;
    rules.sort_by(|left, right| left.id.0.cmp(&right.id.0));
    Ok(Json(rules))
}

async fn list_flows(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
) -> Result<Json<Vec<ApprovalFlow>>, ApiError> {
    known_caller(&state, &ctx).await?;
    let mut flows =
        state.flows.list_for_company(&ctx.company_id).await.map_err(|e| ApiError::persistence(e, &ctx))?;
    flows.sort_by(|left, right| left.id.0.cmp(&right.id.0));
    Ok(Json(flows))
}

async fn create_rule(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
    Json(input): Json<RuleInput>,
) -> Result<(StatusCode, Json<ApprovalRule>), ApiError> {
    require_admin(&state, &ctx).await?;

    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::bad_request("rule name must not be empty", &ctx));
    }
    let rule = ApprovalRule {
        id: RuleId(input.id.unwrap_or_else(|| format!("rule-{}", Uuid::new_v4()))),
        company_id: ctx.company_id.clone(),
        name,
        kind: input.kind,
        is_active: input.is_active,
    };

    let existing = state.rules.find_by_id(&rule.id).await.map_err(|e| ApiError::persistence(e, &ctx))?;
    if existing.is_some_and(|stored| stored.company_id != ctx.company_id) {
        return Err(ApiError::conflict(format!("rule id `{}` is taken", rule.id.0), &ctx));
    }

    let users =
        state.users.list_for_company(&ctx.company_id).await.map_err(|e| ApiError::persistence(e, &ctx))?;
    RuleValidator::new(users)
        .validate_rule(&rule)
        .into_result()
        .map_err(|failure| ApiError::from_app(DomainError::InvalidRuleConfig(failure), &ctx))?;

    state.rules.save(rule.clone()).await.map_err(|e| ApiError::persistence(e, &ctx))?;
    info!(
        event_name = "config.rule_saved",
        correlation_id = %ctx.correlation_id,
        rule_id = %rule.id.0,
        rule_type = rule.kind.as_str(),
        "approval rule saved"
    );
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn create_flow(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
    Json(input): Json<FlowInput>,
) -> Result<(StatusCode, Json<ApprovalFlow>), ApiError> {
    require_admin(&state, &ctx).await?;

    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::bad_request("flow name must not be empty", &ctx));
    }
    let mut flow = ApprovalFlow {
        id: FlowId(input.id.unwrap_or_else(|| format!("flow-{}", Uuid::new_v4()))),
        company_id: ctx.company_id.clone(),
        name,
        steps: input.steps,
        is_active: input.is_active,
    };
    flow.steps.sort_by_key(|step| step.order);

    let existing = state.flows.find_by_id(&flow.id).await.map_err(|e| ApiError::persistence(e, &ctx))?;
    if existing.is_some_and(|stored| stored.company_id != ctx.company_id) {
        return Err(ApiError::conflict(format!("flow id `{}` is taken", flow.id.0), &ctx));
    }

    let users =
        state.users.list_for_company(&ctx.company_id).await.map_err(|e| ApiError::persistence(e, &ctx))?;
    let rules =
        state.rules.list_for_company(&ctx.company_id).await.map_err(|e| ApiError::persistence(e, &ctx))?;
    RuleValidator::new(users)
        .with_rules(rules)
        .validate_flow(&flow)
        .into_result()
        .map_err(|failure| ApiError::from_app(DomainError::InvalidRuleConfig(failure), &ctx))?;

    state.flows.save(flow.clone()).await.map_err(|e| ApiError::persistence(e, &ctx))?;
    info!(
        event_name = "config.flow_saved",
        correlation_id = %ctx.correlation_id,
        flow_id = %flow.id.0,
        steps = flow.steps.len(),
        "approval flow saved"
    );
    Ok((StatusCode::CREATED, Json(flow)))
}

// ---------------------------------------------------------------------------
// Expenses
// ---------------------------------------------------------------------------

/// An expense together with its amount in the company's currency.
///
/// `company_amount` is absent when the rate table cannot convert the claim.
#[derive(Debug, Serialize)]
pub struct ExpenseView {
    #[serde(flatten)]
    pub expense: Expense,
    pub company_currency: String,
    pub company_amount: Option<Decimal>,
}

impl ExpenseView {
    fn new(expense: Expense, company: &Company, rates: &RateTable) -> Self {
        let company_amount = rates.convert(expense.amount, &expense.currency, &company.currency).ok();
        Self { expense, company_currency: company.currency.clone(), company_amount }
    }
}

#[derive(Debug, Deserialize)]
pub struct DecisionInput {
    pub step_order: u32,
    pub decision: Decision,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OverrideInput {
    pub status: ExpenseStatus,
    pub reason: String,
}

async fn resolve_plan(
    state: &ApiState,
    ctx: &RequestContext,
    submitter: &User,
    assignment: &Assignment,
) -> Result<ApprovalPlan, ApiError> {
    let plan = match assignment {
        Assignment::Flow(flow_id) => {
            let flow = state
                .flows
                .find_by_id(flow_id)
                .await
                .map_err(|e| ApiError::persistence(e, ctx))?
                .filter(|flow| flow.company_id == ctx.company_id)
                .ok_or_else(|| {
                    ApiError::not_found(format!("approval flow `{}` does not exist", flow_id.0), ctx)
                })?;
            let rules = state
                .rules
                .list_for_company(&ctx.company_id)
                .await
                .map_err(|e| ApiError::persistence(e, ctx))?;
            plan_for_flow(&flow, &rules)
        }
        Assignment::Rule(rule_id) => {
            let rule = state
                .rules
                .find_by_id(rule_id)
                .await
                .map_err(|e| ApiError::persistence(e, ctx))?
                .filter(|rule| rule.company_id == ctx.company_id)
                .ok_or_else(|| {
                    ApiError::not_found(format!("approval rule `{}` does not exist", rule_id.0), ctx)
                })?;
            let users = state
                .users
                .list_for_company(&ctx.company_id)
                .await
                .map_err(|e| ApiError::persistence(e, ctx))?;
            plan_for_rule(&rule, &users, &submitter.id)
        }
    }
    .map_err(|error| ApiError::from_app(DomainError::from(error), ctx))?;

    if !state.manager_approval_first {
        return Ok(plan);
    }
    let manager = match &submitter.manager_id {
        Some(manager_id) => {
            state.users.find_by_id(manager_id).await.map_err(|e| ApiError::persistence(e, ctx))?
        }
        None => None,
    };
    Ok(with_manager_first(plan, submitter, manager.as_ref()))
}

async fn submit_expense(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
    Json(draft): Json<ExpenseDraft>,
) -> Result<(StatusCode, Json<ExpenseView>), ApiError> {
    let submitter = known_caller(&state, &ctx).await?;
    let company = caller_company(&state, &ctx).await?;
    state
        .rates
        .convert(draft.amount, &draft.currency, &company.currency)
        .map_err(|error| ApiError::bad_request(error.to_string(), &ctx))?;

    let plan = resolve_plan(&state, &ctx, &submitter, &draft.assignment).await?;
    let expense = state
        .ledger
        .submit_expense(&ctx, draft, plan)
        .await
        .map_err(|error| ApiError::from_app(error, &ctx))?;

    Ok((StatusCode::CREATED, Json(ExpenseView::new(expense, &company, &state.rates))))
}

/// The caller's own claims, newest first.
async fn own_expenses(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
) -> Result<Json<Vec<ExpenseView>>, ApiError> {
    known_caller(&state, &ctx).await?;
    let company = caller_company(&state, &ctx).await?;
    let expenses =
        state.ledger.submitted_by(&ctx).await.map_err(|error| ApiError::from_app(error, &ctx))?;
    Ok(Json(views(expenses, &company, &state.rates)))
}

/// Claims of the users reporting directly to the caller.
async fn team_expenses(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
) -> Result<Json<Vec<ExpenseView>>, ApiError> {
    known_caller(&state, &ctx).await?;
    let company = caller_company(&state, &ctx).await?;
    let reports: Vec<UserId> = state
        .users
        .list_for_company(&ctx.company_id)
        .await
        .map_err(|e| ApiError::persistence(e, &ctx))?
        .into_iter()
        .filter(|user| user.manager_id.as_ref() == Some(&ctx.actor_id))
        .map(|user| user.id)
        .collect();
    let expenses = state
        .ledger
        .team_claims(&ctx, &reports)
        .await
        .map_err(|error| ApiError::from_app(error, &ctx))?;
    Ok(Json(views(expenses, &company, &state.rates)))
}

async fn get_expense(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Json<ExpenseView>, ApiError> {
    known_caller(&state, &ctx).await?;
    let company = caller_company(&state, &ctx).await?;
    let expense = state
        .ledger
        .get_expense(&ctx, &ExpenseId(id))
        .await
        .map_err(|error| ApiError::from_app(error, &ctx))?;
    Ok(Json(ExpenseView::new(expense, &company, &state.rates)))
}

async fn get_history(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Json<Vec<LedgerEntry>>, ApiError> {
    known_caller(&state, &ctx).await?;
    let history = state
        .ledger
        .get_history(&ctx, &ExpenseId(id))
        .await
        .map_err(|error| ApiError::from_app(error, &ctx))?;
    Ok(Json(history))
}

async fn submit_decision(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Json(input): Json<DecisionInput>,
) -> Result<Json<DecisionReceipt>, ApiError> {
    known_caller(&state, &ctx).await?;
    let receipt = state
        .ledger
        .submit_decision(&ctx, &ExpenseId(id), input.step_order, input.decision, input.comment)
        .await
        .map_err(|error| ApiError::from_app(error, &ctx))?;
    Ok(Json(receipt))
}

async fn override_status(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Json(input): Json<OverrideInput>,
) -> Result<Json<ExpenseView>, ApiError> {
    known_caller(&state, &ctx).await?;
    let company = caller_company(&state, &ctx).await?;
    let expense = state
        .ledger
        .override_status(&ctx, &ExpenseId(id), input.status, input.reason)
        .await
        .map_err(|error| ApiError::from_app(error, &ctx))?;
    Ok(Json(ExpenseView::new(expense, &company, &state.rates)))
}

async fn pending_approvals(
    State(state): State<ApiState>,
    Caller(ctx): Caller,
) -> Result<Json<Vec<ExpenseView>>, ApiError> {
    known_caller(&state, &ctx).await?;
    let company = caller_company(&state, &ctx).await?;
    let pending =
        state.ledger.pending_for(&ctx).await.map_err(|error| ApiError::from_app(error, &ctx))?;
    Ok(Json(views(pending, &company, &state.rates)))
}

fn views(expenses: Vec<Expense>, company: &Company, rates: &RateTable) -> Vec<ExpenseView> {
    expenses.into_iter().map(|expense| ExpenseView::new(expense, company, rates)).collect()
}

async fn evaluate(Json(request): Json<EvaluationRequest>) -> Json<FlowEvaluation> {
    Json(request.evaluate())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use rust_decimal::Decimal;
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use expensa_core::currency::RateTable;
    use expensa_core::ledger::{ApprovalLedger, ChainSigner, InMemoryApprovalStore};
    use expensa_db::repositories::{
        CompanyRepository, FlowRepository, InMemoryCompanyRepository, InMemoryFlowRepository,
        InMemoryRuleRepository, InMemoryUserRepository, RuleRepository, UserRepository,
    };
    use expensa_db::DemoSeedDataset;

    use super::{router, ApiState, COMPANY_HEADER, ROLE_HEADER, USER_HEADER};

    async fn app(manager_approval_first: bool) -> Router {
        let companies = InMemoryCompanyRepository::default();
        companies.save(DemoSeedDataset::company()).await.expect("save company");
        let users = InMemoryUserRepository::default();
        for user in DemoSeedDataset::users() {
            users.save(user).await.expect("save user");
        }
        let rules = InMemoryRuleRepository::default();
        for rule in DemoSeedDataset::rules() {
            rules.save(rule).await.expect("save rule");
        }
        let flows = InMemoryFlowRepository::default();
        for flow in DemoSeedDataset::flows() {
            flows.save(flow).await.expect("save flow");
        }

        let ledger = ApprovalLedger::new(
            Arc::new(InMemoryApprovalStore::new()),
            ChainSigner::new(SecretString::from("api-test-signing-key")),
        );
        router(ApiState {
            ledger: Arc::new(ledger),
            companies: Arc::new(companies),
            users: Arc::new(users),
            rules: Arc::new(rules),
            flows: Arc::new(flows),
            rates: RateTable::new("USD").with_rate("EUR", Decimal::new(9, 1)),
            manager_approval_first,
        })
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        caller: Option<(&str, &str)>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some((user, role)) = caller {
            request = request
                .header(USER_HEADER, user)
                .header(ROLE_HEADER, role)
                .header(COMPANY_HEADER, "acme");
        }
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        let response =
            app.clone().oneshot(request.body(body).expect("request")).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn expense_body(flow_id: &str, amount: &str, currency: &str) -> Value {
        json!({
            "amount": amount,
            "currency": currency,
            "category": "travel",
            "description": "Flight to customer site",
            "date": "2026-05-04",
            "assignment": {"kind": "flow", "id": flow_id}
        })
    }

    async fn submit(app: &Router, flow_id: &str) -> String {
        let (status, body) = send(
            app,
            "POST",
            "/expenses",
            Some(("emp-mike", "employee")),
            Some(expense_body(flow_id, "420.00", "USD")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "submit failed: {body}");
        body["id"].as_str().expect("expense id").to_string()
    }

    async fn decide(app: &Router, id: &str, approver: (&str, &str), step: u32) -> (StatusCode, Value) {
        send(
            app,
            "POST",
            &format!("/expenses/{id}/decisions"),
            Some(approver),
            Some(json!({"step_order": step, "decision": "approved"})),
        )
        .await
    }

    #[tokio::test]
    async fn high_value_flow_runs_to_approval_over_http() {
        let app = app(false).await;
        let id = submit(&app, "flow-high-value").await;

        for (approver, step) in
            [(("mgr-jane", "manager"), 1), (("cfo-1", "manager"), 2), (("admin-1", "admin"), 3)]
        {
            let (status, body) = decide(&app, &id, approver, step).await;
            assert_eq!(status, StatusCode::OK, "decision failed: {body}");
        }

        let (status, body) =
            send(&app, "GET", &format!("/expenses/{id}"), Some(("emp-mike", "employee")), None)
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "approved");
        assert_eq!(body["company_amount"], "420.00");

        let (status, history) = send(
            &app,
            "GET",
            &format!("/expenses/{id}/history"),
            Some(("emp-mike", "employee")),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn manager_first_puts_reporting_manager_in_front() {
        let app = app(true).await;
        let id = submit(&app, "flow-high-value").await;

        let (_, body) =
            send(&app, "GET", &format!("/expenses/{id}"), Some(("emp-mike", "employee")), None)
                .await;
        assert_eq!(body["plan"]["steps"].as_array().map(Vec::len), Some(4));
        assert_eq!(body["next_approvers"], json!(["mgr-jane"]));

        let (status, pending) =
            send(&app, "GET", "/approvals/pending", Some(("mgr-jane", "manager")), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pending[0]["id"], id.as_str());
    }

    #[tokio::test]
    async fn foreign_currency_is_converted_for_the_company() {
        let app = app(false).await;
        let (status, body) = send(
            &app,
            "POST",
            "/expenses",
            Some(("emp-mike", "employee")),
            Some(expense_body("flow-standard", "100.00", "EUR")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["company_currency"], "USD");
        assert_eq!(body["company_amount"], "111.11");

        let (status, body) = send(
            &app,
            "POST",
            "/expenses",
            Some(("emp-mike", "employee")),
            Some(expense_body("flow-standard", "100.00", "GBP")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_class"], "bad_request");
    }

    #[tokio::test]
    async fn identity_headers_are_required_and_checked() {
        let app = app(false).await;

        let (status, _) = send(&app, "GET", "/approvals/pending", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) =
            send(&app, "GET", "/approvals/pending", Some(("emp-mike", "admin")), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error_class"], "forbidden");
    }

    #[tokio::test]
    async fn ineligible_and_late_decisions_are_refused() {
        let app = app(false).await;
        let id = submit(&app, "flow-high-value").await;

        let (status, _) = decide(&app, &id, ("mgr-bob", "manager"), 1).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/expenses/{id}/decisions"),
            Some(("mgr-jane", "manager")),
            Some(json!({"step_order": 1, "decision": "rejected", "comment": "Not in budget"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["expense"]["status"], "rejected");

        let (status, body) = decide(&app, &id, ("mgr-jane", "manager"), 1).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error_class"], "conflict");
    }

    #[tokio::test]
    async fn only_admins_override_status() {
        let app = app(false).await;
        let id = submit(&app, "flow-standard").await;
        let request = json!({"status": "approved", "reason": "CEO sign-off by email"});

        let (status, _) = send(
            &app,
            "POST",
            &format!("/expenses/{id}/override"),
            Some(("mgr-jane", "manager")),
            Some(request.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/expenses/{id}/override"),
            Some(("admin-1", "admin")),
            Some(request),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "override failed: {body}");
        assert_eq!(body["status"], "approved");
        assert_eq!(body["overridden"], true);
    }

    #[tokio::test]
    async fn rule_and_flow_writes_are_validated() {
        let app = app(false).await;

        let (status, _) = send(
            &app,
            "POST",
            "/rules",
            Some(("mgr-jane", "manager")),
            Some(json!({"name": "Majority", "type": "percentage", "percentage": 50})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            &app,
            "POST",
            "/rules",
            Some(("admin-1", "admin")),
            Some(json!({"name": "Nobody", "type": "percentage", "percentage": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "unexpected body {body}");

        let (status, body) = send(
            &app,
            "POST",
            "/rules",
            Some(("admin-1", "admin")),
            Some(json!({"id": "rule-majority", "name": "Majority", "type": "percentage", "percentage": 50})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["kind"]["type"], "percentage");

        let (status, _) = send(
            &app,
            "POST",
            "/flows",
            Some(("admin-1", "admin")),
            Some(json!({
                "name": "Peer review",
                "steps": [{"order": 1, "approver_ids": ["emp-sarah"], "is_required": true}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            "POST",
            "/flows",
            Some(("admin-1", "admin")),
            Some(json!({
                "id": "flow-majority",
                "name": "Majority of managers",
                "steps": [{
                    "order": 1,
                    "approver_ids": ["mgr-jane", "mgr-bob", "cfo-1"],
                    "is_required": true,
                    "rule_id": "rule-majority"
                }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "flow rejected: {body}");

        let id = submit(&app, "flow-majority").await;
        let (_, body) = decide(&app, &id, ("mgr-bob", "manager"), 1).await;
        assert_eq!(body["expense"]["status"], "pending");
        let (_, body) = decide(&app, &id, ("cfo-1", "manager"), 1).await;
        assert_eq!(body["expense"]["status"], "approved");
    }

    #[tokio::test]
    async fn evaluate_endpoint_needs_no_identity() {
        let app = app(false).await;
        let (status, body) = send(
            &app,
            "POST",
            "/evaluate",
            None,
            Some(json!({
                "plan": {"steps": [{"order": 1, "approvers": ["a", "b"], "is_required": true}]},
                "decisions": [{"approver_id": "a", "step_order": 1, "decision": "approved"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["next_approvers"], json!(["b"]));
        assert_eq!(body["current_step"], 1);
    }

    #[tokio::test]
    async fn own_and_team_expense_lists_follow_the_reporting_line() {
        let app = app(false).await;
        let id = submit(&app, "flow-standard").await;

        let (status, own) = send(&app, "GET", "/expenses", Some(("emp-mike", "employee")), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(own[0]["id"], id.as_str());
        assert_eq!(own[0]["company_amount"], "420.00");

        let (_, own) = send(&app, "GET", "/expenses", Some(("emp-sarah", "employee")), None).await;
        assert_eq!(own, json!([]));

        let (status, team) =
            send(&app, "GET", "/expenses/team", Some(("mgr-jane", "manager")), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(team.as_array().map(Vec::len), Some(1));
        assert_eq!(team[0]["employee_id"], "emp-mike");

        let (_, team) = send(&app, "GET", "/expenses/team", Some(("mgr-bob", "manager")), None).await;
        assert_eq!(team, json!([]));

        let (status, _) =
            send(&app, "GET", "/expenses/team", Some(("emp-sarah", "employee")), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admins_manage_the_user_directory() {
        let app = app(false).await;
        let lee = json!({
            "id": "emp-lee",
            "name": "Lee Chen",
            "email": "Lee@Company.com",
            "role": "employee",
            "manager_id": "mgr-bob"
        });

        let (status, _) =
            send(&app, "POST", "/users", Some(("mgr-jane", "manager")), Some(lee.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(&app, "POST", "/users", Some(("admin-1", "admin")), Some(lee)).await;
        assert_eq!(status, StatusCode::CREATED, "user rejected: {body}");
        assert_eq!(body["email"], "lee@company.com");
        assert_eq!(body["is_manager_approver"], false);

        let (status, employees) =
            send(&app, "GET", "/users?role=employee", Some(("admin-1", "admin")), None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> =
            employees.as_array().into_iter().flatten().filter_map(|user| user["id"].as_str()).collect();
        assert_eq!(ids, vec!["emp-lee", "emp-mike", "emp-sarah"]);

        let (status, body) = send(
            &app,
            "POST",
            "/users",
            Some(("admin-1", "admin")),
            Some(json!({"name": "Ann", "email": "ann@company.com", "role": "employee", "manager_id": "emp-mike"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().is_some_and(|message| message.contains("emp-mike")));

        let (status, _) = send(
            &app,
            "POST",
            "/users",
            Some(("admin-1", "admin")),
            Some(json!({"name": "Copy", "email": "mike@company.com", "role": "employee"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &app,
            "POST",
            "/users",
            Some(("admin-1", "admin")),
            Some(json!({
                "id": "mgr-jane",
                "name": "Jane Smith",
                "email": "jane@company.com",
                "role": "employee",
                "manager_id": "admin-1"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(
            &app,
            "POST",
            "/expenses",
            Some(("emp-lee", "employee")),
            Some(expense_body("flow-standard", "80.00", "USD")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "new user cannot submit: {body}");
    }

    #[tokio::test]
    async fn configuration_is_listed_for_any_company_member() {
        let app = app(false).await;

        let (status, rules) = send(&app, "GET", "/rules", Some(("emp-mike", "employee")), None).await;
        assert_eq!(status, StatusCode::OK);
        let rule_ids: Vec<&str> =
            rules.as_array().into_iter().flatten().filter_map(|rule| rule["id"].as_str()).collect();
        assert_eq!(rule_ids, vec!["rule-cfo", "rule-hybrid", "rule-standard"]);

        let (status, flows) = send(&app, "GET", "/flows", Some(("emp-mike", "employee")), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(flows
            .as_array()
            .is_some_and(|flows| flows.iter().any(|flow| flow["id"] == "flow-standard")));

        let (status, _) = send(&app, "GET", "/users", Some(("emp-mike", "employee")), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
