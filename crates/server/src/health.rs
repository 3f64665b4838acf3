use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use expensa_db::{migrations::MIGRATOR, DbPool};
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: Readiness,
    pub detail: String,
}

impl HealthCheck {
    fn ready(detail: impl Into<String>) -> Self {
        Self { status: Readiness::Ready, detail: detail.into() }
    }

    fn degraded(detail: impl Into<String>) -> Self {
        Self { status: Readiness::Degraded, detail: detail.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: Readiness,
    pub database: HealthCheck,
    pub schema: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool })
}

/// Ready only when the database answers and every embedded migration is applied.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let schema = if database.status == Readiness::Ready {
        schema_check(&state.db_pool).await
    } else {
        HealthCheck::degraded("skipped: database unreachable")
    };

    let ready = database.status == Readiness::Ready && schema.status == Readiness::Ready;
    let payload = HealthResponse {
        status: if ready { Readiness::Ready } else { Readiness::Degraded },
        database,
        schema,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck::ready("database query succeeded"),
        Err(error) => HealthCheck::degraded(format!("database query failed: {error}")),
    }
}

async fn schema_check(pool: &DbPool) -> HealthCheck {
    let expected = MIGRATOR.iter().filter(|migration| migration.migration_type.is_up_migration()).count();
    let applied = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1",
    )
    .fetch_one(pool)
    .await;

    match applied {
        Ok(applied) if usize::try_from(applied).is_ok_and(|applied| applied >= expected) => {
            HealthCheck::ready(format!("{applied} migration(s) applied"))
        }
        Ok(applied) => HealthCheck::degraded(format!(
            "{applied} of {expected} migration(s) applied; run `expensa migrate`"
        )),
        Err(error) => HealthCheck::degraded(format!("migration table unreadable: {error}")),
    }
}
