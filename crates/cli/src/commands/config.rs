use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use expensa_core::config::{AppConfig, LogFormat};
use secrecy::ExposeSecret;
use serde_json::{json, Map};
use toml::Value;

use crate::commands::{load_config, CommandResult};

struct ConfigRow {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

pub fn run() -> CommandResult {
    let config = match load_config("config") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    let mut data = Map::new();
    for row in rows(&config) {
        let source = field_source(
            row.key,
            row.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(row.key, &row.value, &source));
        data.insert(row.key.to_string(), json!({ "value": row.value, "source": source }));
    }

    CommandResult::success_with_data("config", lines.join("\n"), Some(data.into()))
}

fn rows(config: &AppConfig) -> Vec<ConfigRow> {
    let row = |key, value: String, env_keys| ConfigRow { key, value, env_keys };
    let rates = if config.currency.rates.is_empty() {
        "<none>".to_string()
    } else {
        config
            .currency
            .rates
            .iter()
            .map(|(code, rate)| format!("{code}={rate}"))
            .collect::<Vec<_>>()
            .join(",")
    };

    vec![
        row("database.url", config.database.url.clone(), &["EXPENSA_DATABASE_URL"]),
        row(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["EXPENSA_DATABASE_MAX_CONNECTIONS"],
        ),
        row(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["EXPENSA_DATABASE_TIMEOUT_SECS"],
        ),
        row(
            "server.bind_address",
            config.server.bind_address.clone(),
            &["EXPENSA_SERVER_BIND_ADDRESS"],
        ),
        row("server.port", config.server.port.to_string(), &["EXPENSA_SERVER_PORT"]),
        row(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            &["EXPENSA_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        row(
            "ledger.signing_key",
            redact_secret(config.ledger.signing_key.expose_secret()),
            &["EXPENSA_LEDGER_SIGNING_KEY"],
        ),
        row(
            "workflow.require_rejection_comment",
            config.workflow.require_rejection_comment.to_string(),
            &["EXPENSA_WORKFLOW_REQUIRE_REJECTION_COMMENT"],
        ),
        row(
            "workflow.manager_approval_first",
            config.workflow.manager_approval_first.to_string(),
            &["EXPENSA_WORKFLOW_MANAGER_APPROVAL_FIRST"],
        ),
        row("currency.base", config.currency.base.clone(), &[]),
        row("currency.rates", rates, &[]),
        row(
            "logging.level",
            config.logging.level.clone(),
            &["EXPENSA_LOGGING_LEVEL", "EXPENSA_LOG_LEVEL"],
        ),
        row(
            "logging.format",
            log_format_name(config.logging.format).to_string(),
            &["EXPENSA_LOGGING_FORMAT", "EXPENSA_LOG_FORMAT"],
        ),
    ]
}

fn log_format_name(format: LogFormat) -> &'static str {
    match format {
        LogFormat::Compact => "compact",
        LogFormat::Pretty => "pretty",
        LogFormat::Json => "json",
    }
}

fn detect_config_path() -> Option<PathBuf> {
    ["expensa.toml", "config/expensa.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: &str) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_secret(secret: &str) -> String {
    if secret.trim().is_empty() {
        "<unset>".to_string()
    } else {
        "<redacted>".to_string()
    }
}
