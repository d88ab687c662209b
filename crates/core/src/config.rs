use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::delegation::DelegationResolver;
use crate::domain::template::MAX_SLA_DAYS;
use crate::escalation::{AgeBasis, EscalationRoleMap, MIN_POLL_INTERVAL_SECS};
use crate::workflow::{InstanceEngine, ParallelDecisionPolicy};

#[derive(Clone, Debug, Default, Serialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub workflow: WorkflowConfig,
    pub escalation: EscalationConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkflowConfig {
    pub default_sla_days: u32,
    pub parallel_policy: ParallelDecisionPolicy,
    pub privileged_roles: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EscalationConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub throttle_secs: u64,
    pub sla_days: u32,
    pub grace_days: u32,
    pub age_basis: AgeBasis,
    pub fallback_role: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub port: Option<u16>,
    pub escalation_enabled: Option<bool>,
    pub parallel_policy: Option<ParallelDecisionPolicy>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://routewise.db?mode=rwc".to_string(), max_connections: 5, timeout_secs: 30 }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: "127.0.0.1".to_string(), port: 8080, graceful_shutdown_secs: 15 }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_sla_days: 3,
            parallel_policy: ParallelDecisionPolicy::AnyRejectWins,
            privileged_roles: vec!["ADMIN".to_string(), "SUPER_ADMIN".to_string()],
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 300,
            throttle_secs: 3600,
            sla_days: 3,
            grace_days: 2,
            age_basis: AgeBasis::CreatedAt,
            fallback_role: EscalationRoleMap::DEFAULT_FALLBACK.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Compact }
    }
}

impl WorkflowConfig {
    pub fn engine(&self) -> InstanceEngine {
        InstanceEngine::new(self.parallel_policy, self.default_sla_days)
    }

    pub fn delegation_resolver(&self) -> DelegationResolver {
        DelegationResolver::new(&self.privileged_roles)
    }
}

impl EscalationConfig {
    /// Default routing table with the configured fallback role.
    pub fn role_map(&self) -> EscalationRoleMap {
        EscalationRoleMap::new(self.fallback_role.clone())
            .with_route("dept_head", EscalationRoleMap::DEFAULT_FALLBACK)
            .with_route("finance", EscalationRoleMap::DEFAULT_FALLBACK)
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("routewise.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(workflow) = patch.workflow {
            if let Some(default_sla_days) = workflow.default_sla_days {
                self.workflow.default_sla_days = default_sla_days;
            }
            if let Some(policy) = workflow.parallel_policy {
                self.workflow.parallel_policy = parse_policy("workflow.parallel_policy", &policy)?;
            }
            if let Some(privileged_roles) = workflow.privileged_roles {
                self.workflow.privileged_roles = privileged_roles;
            }
        }

        if let Some(escalation) = patch.escalation {
            if let Some(enabled) = escalation.enabled {
                self.escalation.enabled = enabled;
            }
            if let Some(poll_interval_secs) = escalation.poll_interval_secs {
                self.escalation.poll_interval_secs = poll_interval_secs;
            }
            if let Some(throttle_secs) = escalation.throttle_secs {
                self.escalation.throttle_secs = throttle_secs;
            }
            if let Some(sla_days) = escalation.sla_days {
                self.escalation.sla_days = sla_days;
            }
            if let Some(grace_days) = escalation.grace_days {
                self.escalation.grace_days = grace_days;
            }
            if let Some(age_basis) = escalation.age_basis {
                self.escalation.age_basis = parse_age_basis("escalation.age_basis", &age_basis)?;
            }
            if let Some(fallback_role) = escalation.fallback_role {
                self.escalation.fallback_role = fallback_role;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("ROUTEWISE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("ROUTEWISE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("ROUTEWISE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("ROUTEWISE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("ROUTEWISE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("ROUTEWISE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("ROUTEWISE_SERVER_PORT") {
            self.server.port = parse_u16("ROUTEWISE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("ROUTEWISE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("ROUTEWISE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("ROUTEWISE_WORKFLOW_DEFAULT_SLA_DAYS") {
            self.workflow.default_sla_days =
                parse_u32("ROUTEWISE_WORKFLOW_DEFAULT_SLA_DAYS", &value)?;
        }
        if let Some(value) = read_env("ROUTEWISE_WORKFLOW_PARALLEL_POLICY") {
            self.workflow.parallel_policy =
                parse_policy("ROUTEWISE_WORKFLOW_PARALLEL_POLICY", &value)?;
        }
        if let Some(value) = read_env("ROUTEWISE_WORKFLOW_PRIVILEGED_ROLES") {
            self.workflow.privileged_roles = value
                .split(',')
                .map(str::trim)
                .filter(|role| !role.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(value) = read_env("ROUTEWISE_ESCALATION_ENABLED") {
            self.escalation.enabled = parse_bool("ROUTEWISE_ESCALATION_ENABLED", &value)?;
        }
        if let Some(value) = read_env("ROUTEWISE_ESCALATION_POLL_INTERVAL_SECS") {
            self.escalation.poll_interval_secs =
                parse_u64("ROUTEWISE_ESCALATION_POLL_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("ROUTEWISE_ESCALATION_THROTTLE_SECS") {
            self.escalation.throttle_secs =
                parse_u64("ROUTEWISE_ESCALATION_THROTTLE_SECS", &value)?;
        }
        if let Some(value) = read_env("ROUTEWISE_ESCALATION_SLA_DAYS") {
            self.escalation.sla_days = parse_u32("ROUTEWISE_ESCALATION_SLA_DAYS", &value)?;
        }
        if let Some(value) = read_env("ROUTEWISE_ESCALATION_GRACE_DAYS") {
            self.escalation.grace_days = parse_u32("ROUTEWISE_ESCALATION_GRACE_DAYS", &value)?;
        }
        if let Some(value) = read_env("ROUTEWISE_ESCALATION_AGE_BASIS") {
            self.escalation.age_basis =
                parse_age_basis("ROUTEWISE_ESCALATION_AGE_BASIS", &value)?;
        }
        if let Some(value) = read_env("ROUTEWISE_ESCALATION_FALLBACK_ROLE") {
            self.escalation.fallback_role = value;
        }

        let log_level =
            read_env("ROUTEWISE_LOGGING_LEVEL").or_else(|| read_env("ROUTEWISE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("ROUTEWISE_LOGGING_FORMAT").or_else(|| read_env("ROUTEWISE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(enabled) = overrides.escalation_enabled {
            self.escalation.enabled = enabled;
        }
        if let Some(policy) = overrides.parallel_policy {
            self.workflow.parallel_policy = policy;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_workflow(&self.workflow)?;
        validate_escalation(&self.escalation)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("routewise.toml"), PathBuf::from("config/routewise.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.bind_address.trim().is_empty() {
        return Err(ConfigError::Validation("server.bind_address must not be empty".to_string()));
    }

    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_workflow(workflow: &WorkflowConfig) -> Result<(), ConfigError> {
    if workflow.default_sla_days == 0 || workflow.default_sla_days > MAX_SLA_DAYS {
        return Err(ConfigError::Validation(format!(
            "workflow.default_sla_days must be between 1 and {MAX_SLA_DAYS}"
        )));
    }

    if workflow.privileged_roles.iter().all(|role| role.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "workflow.privileged_roles must name at least one role (e.g. `ADMIN`)".to_string(),
        ));
    }

    Ok(())
}

fn validate_escalation(escalation: &EscalationConfig) -> Result<(), ConfigError> {
    if escalation.poll_interval_secs < MIN_POLL_INTERVAL_SECS {
        return Err(ConfigError::Validation(format!(
            "escalation.poll_interval_secs must be at least {MIN_POLL_INTERVAL_SECS}"
        )));
    }

    if escalation.sla_days == 0 || escalation.sla_days > MAX_SLA_DAYS {
        return Err(ConfigError::Validation(format!(
            "escalation.sla_days must be between 1 and {MAX_SLA_DAYS}"
        )));
    }

    if escalation.grace_days > MAX_SLA_DAYS {
        return Err(ConfigError::Validation(format!(
            "escalation.grace_days must be at most {MAX_SLA_DAYS}"
        )));
    }

    if escalation.fallback_role.trim().is_empty() {
        return Err(ConfigError::Validation(
            "escalation.fallback_role must not be empty (e.g. `secretary_general`)".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| invalid(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| invalid(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.trim().parse::<bool>().map_err(|_| invalid(key, value))
}

fn parse_policy(key: &str, value: &str) -> Result<ParallelDecisionPolicy, ConfigError> {
    ParallelDecisionPolicy::parse(value).ok_or_else(|| invalid(key, value))
}

fn parse_age_basis(key: &str, value: &str) -> Result<AgeBasis, ConfigError> {
    AgeBasis::parse(value).ok_or_else(|| invalid(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    workflow: Option<WorkflowPatch>,
    escalation: Option<EscalationPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowPatch {
    default_sla_days: Option<u32>,
    parallel_policy: Option<String>,
    privileged_roles: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct EscalationPatch {
    enabled: Option<bool>,
    poll_interval_secs: Option<u64>,
    throttle_secs: Option<u64>,
    sla_days: Option<u32>,
    grace_days: Option<u32>,
    age_basis: Option<String>,
    fallback_role: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
