use std::sync::Arc;

use expensa_core::config::{AppConfig, ConfigError};
use expensa_core::ledger::{ApprovalLedger, ChainSigner};
use expensa_db::repositories::{
    SqlCompanyRepository, SqlFlowRepository, SqlRuleRepository, SqlUserRepository,
};
use expensa_db::{connect_with_settings, migrations, DbPool, SqlApprovalStore, SqlAuditSink};
use thiserror::Error;
use tracing::info;

use crate::api::ApiState;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub api_state: ApiState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let ledger = ApprovalLedger::new(
        Arc::new(SqlApprovalStore::new(db_pool.clone())),
        ChainSigner::new(config.ledger.signing_key.clone()),
    )
    .with_audit_sink(Arc::new(SqlAuditSink::new(db_pool.clone())))
    .with_policy(config.workflow.ledger_policy());

    let api_state = ApiState {
        ledger: Arc::new(ledger),
        companies: Arc::new(SqlCompanyRepository::new(db_pool.clone())),
        users: Arc::new(SqlUserRepository::new(db_pool.clone())),
        rules: Arc::new(SqlRuleRepository::new(db_pool.clone())),
        flows: Arc::new(SqlFlowRepository::new(db_pool.clone())),
        rates: config.currency.clone(),
        manager_approval_first: config.workflow.manager_approval_first,
    };

    Ok(Application { config, db_pool, api_state })
}
