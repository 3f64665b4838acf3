use expensa_core::config::AppConfig;
use expensa_db::connect_with_settings;
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::commands::{load_config, runtime, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str) -> Self {
        Self {
            name,
            status: CheckStatus::Skipped,
            details: "skipped because configuration did not load".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let passed = report.overall_status == CheckStatus::Pass;

    let (message, data) = if json_output {
        (report.summary.clone(), serde_json::to_value(&report).ok())
    } else {
        (render_human(&report), None)
    };

    if passed {
        CommandResult::success_with_data("doctor", message, data)
    } else {
        CommandResult::failure_with_data("doctor", "readiness", message, 1, data)
    }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match load_config("doctor") {
        Ok(config) => {
            checks.push(DoctorCheck::pass(
                "config_validation",
                "configuration loaded and validated",
            ));
            checks.push(check_signing_key(&config));
            checks.push(check_currency_rates(&config));
            checks.push(check_database(&config));
        }
        Err(failure) => {
            checks.push(DoctorCheck::fail("config_validation", failure_message(&failure)));
            checks.push(DoctorCheck::skipped("ledger_signing_key"));
            checks.push(DoctorCheck::skipped("currency_rates"));
            checks.push(DoctorCheck::skipped("database_connectivity"));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn failure_message(failure: &CommandResult) -> String {
    serde_json::from_str::<serde_json::Value>(&failure.output)
        .ok()
        .and_then(|payload| payload["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| failure.output.clone())
}

fn check_signing_key(config: &AppConfig) -> DoctorCheck {
    let length = config.ledger.signing_key.expose_secret().chars().count();
    DoctorCheck::pass("ledger_signing_key", format!("signing key configured ({length} characters)"))
}

fn check_currency_rates(config: &AppConfig) -> DoctorCheck {
    match config.currency.validate() {
        Ok(()) => DoctorCheck::pass(
            "currency_rates",
            format!(
                "base `{}` with {} configured rate(s)",
                config.currency.base,
                config.currency.rates.len()
            ),
        ),
        Err(error) => DoctorCheck::fail("currency_rates", error.to_string()),
    }
}

fn check_database(config: &AppConfig) -> DoctorCheck {
    let runtime = match runtime("doctor") {
        Ok(runtime) => runtime,
        Err(failure) => return DoctorCheck::fail("database_connectivity", failure_message(&failure)),
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;

        let schema: Result<Option<String>, sqlx::Error> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'expense'",
        )
        .fetch_optional(&pool)
        .await;
        pool.close().await;

        match schema {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err("connected, but schema is missing; run `expensa migrate`".to_string()),
            Err(error) => Err(format!("schema probe failed: {error}")),
        }
    });

    match result {
        Ok(()) => DoctorCheck::pass(
            "database_connectivity",
            format!("connected using `{}`", config.database.url),
        ),
        Err(error) => DoctorCheck::fail("database_connectivity", error),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
