use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use routewise_core::config::{AppConfig, LoadOptions};
use toml::Value;

struct Field {
    key: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let database = &config.database;
    let server = &config.server;
    let workflow = &config.workflow;
    let escalation = &config.escalation;

    vec![
        Field {
            key: "database.url",
            env_keys: &["ROUTEWISE_DATABASE_URL"],
            value: database.url.clone(),
        },
        Field {
            key: "database.max_connections",
            env_keys: &["ROUTEWISE_DATABASE_MAX_CONNECTIONS"],
            value: database.max_connections.to_string(),
        },
        Field {
            key: "database.timeout_secs",
            env_keys: &["ROUTEWISE_DATABASE_TIMEOUT_SECS"],
            value: database.timeout_secs.to_string(),
        },
        Field {
            key: "server.bind_address",
            env_keys: &["ROUTEWISE_SERVER_BIND_ADDRESS"],
            value: server.bind_address.clone(),
        },
        Field {
            key: "server.port",
            env_keys: &["ROUTEWISE_SERVER_PORT"],
            value: server.port.to_string(),
        },
        Field {
            key: "server.graceful_shutdown_secs",
            env_keys: &["ROUTEWISE_SERVER_GRACEFUL_SHUTDOWN_SECS"],
            value: server.graceful_shutdown_secs.to_string(),
        },
        Field {
            key: "workflow.default_sla_days",
            env_keys: &["ROUTEWISE_WORKFLOW_DEFAULT_SLA_DAYS"],
            value: workflow.default_sla_days.to_string(),
        },
        Field {
            key: "workflow.parallel_policy",
            env_keys: &["ROUTEWISE_WORKFLOW_PARALLEL_POLICY"],
            value: workflow.parallel_policy.as_str().to_string(),
        },
        Field {
            key: "workflow.privileged_roles",
            env_keys: &["ROUTEWISE_WORKFLOW_PRIVILEGED_ROLES"],
            value: workflow.privileged_roles.join(","),
        },
        Field {
            key: "escalation.enabled",
            env_keys: &["ROUTEWISE_ESCALATION_ENABLED"],
            value: escalation.enabled.to_string(),
        },
        Field {
            key: "escalation.poll_interval_secs",
            env_keys: &["ROUTEWISE_ESCALATION_POLL_INTERVAL_SECS"],
            value: escalation.poll_interval_secs.to_string(),
        },
        Field {
            key: "escalation.throttle_secs",
            env_keys: &["ROUTEWISE_ESCALATION_THROTTLE_SECS"],
            value: escalation.throttle_secs.to_string(),
        },
        Field {
            key: "escalation.sla_days",
            env_keys: &["ROUTEWISE_ESCALATION_SLA_DAYS"],
            value: escalation.sla_days.to_string(),
        },
        Field {
            key: "escalation.grace_days",
            env_keys: &["ROUTEWISE_ESCALATION_GRACE_DAYS"],
            value: escalation.grace_days.to_string(),
        },
        Field {
            key: "escalation.age_basis",
            env_keys: &["ROUTEWISE_ESCALATION_AGE_BASIS"],
            value: escalation.age_basis.as_str().to_string(),
        },
        Field {
            key: "escalation.fallback_role",
            env_keys: &["ROUTEWISE_ESCALATION_FALLBACK_ROLE"],
            value: escalation.fallback_role.clone(),
        },
        Field {
            key: "logging.level",
            env_keys: &["ROUTEWISE_LOGGING_LEVEL", "ROUTEWISE_LOG_LEVEL"],
            value: config.logging.level.clone(),
        },
        Field {
            key: "logging.format",
            env_keys: &["ROUTEWISE_LOGGING_FORMAT", "ROUTEWISE_LOG_FORMAT"],
            value: format!("{:?}", config.logging.format).to_lowercase(),
        },
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("routewise.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/routewise.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
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

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
