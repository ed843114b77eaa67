use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::workflow::Priority;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub sla: SlaConfig,
    pub routing: RoutingConfig,
    pub escalation: EscalationConfig,
    pub notifier: NotifierConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
}

/// How long a step may sit pending before the sweeper escalates it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlaConfig {
    pub high_hours: i64,
    pub normal_hours: i64,
    pub low_hours: i64,
}

impl SlaConfig {
    pub fn deadline_for(&self, priority: Priority, from: DateTime<Utc>) -> DateTime<Utc> {
        let hours = match priority {
            Priority::High => self.high_hours,
            Priority::Normal => self.normal_hours,
            Priority::Low => self.low_hours,
        };
        from + Duration::hours(hours)
    }
}

#[derive(Clone, Debug)]
pub struct RoutingConfig {
    /// Role that reviews amount-less workflow types (risk alerts, status
    /// changes without a mandate).
    pub review_role: String,
    /// Bounded internal retries when an optimistic write loses a race.
    pub conflict_retry_limit: u32,
}

#[derive(Clone, Debug)]
pub struct EscalationConfig {
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierMode {
    Tracing,
    Webhook,
}

#[derive(Clone, Debug)]
pub struct NotifierConfig {
    pub mode: NotifierMode,
    pub webhook_url: Option<String>,
    pub auth_token: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
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

impl std::str::FromStr for NotifierMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tracing" => Ok(Self::Tracing),
            "webhook" => Ok(Self::Webhook),
            other => Err(ConfigError::Validation(format!(
                "unsupported notifier mode `{other}` (expected tracing|webhook)"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://countersign.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig { bind_address: "127.0.0.1".to_string(), health_check_port: 8080 },
            sla: SlaConfig { high_hours: 4, normal_hours: 24, low_hours: 72 },
            routing: RoutingConfig {
                review_role: "branch_manager".to_string(),
                conflict_retry_limit: 3,
            },
            escalation: EscalationConfig { sweep_interval_secs: 60 },
            notifier: NotifierConfig {
                mode: NotifierMode::Tracing,
                webhook_url: None,
                auth_token: None,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    sla: Option<SlaPatch>,
    routing: Option<RoutingPatch>,
    escalation: Option<EscalationPatch>,
    notifier: Option<NotifierPatch>,
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
    health_check_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct SlaPatch {
    high_hours: Option<i64>,
    normal_hours: Option<i64>,
    low_hours: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RoutingPatch {
    review_role: Option<String>,
    conflict_retry_limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct EscalationPatch {
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct NotifierPatch {
    mode: Option<NotifierMode>,
    webhook_url: Option<String>,
    auth_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("countersign.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
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
            if let Some(port) = server.health_check_port {
                self.server.health_check_port = port;
            }
        }

        if let Some(sla) = patch.sla {
            if let Some(hours) = sla.high_hours {
                self.sla.high_hours = hours;
            }
            if let Some(hours) = sla.normal_hours {
                self.sla.normal_hours = hours;
            }
            if let Some(hours) = sla.low_hours {
                self.sla.low_hours = hours;
            }
        }

        if let Some(routing) = patch.routing {
            if let Some(review_role) = routing.review_role {
                self.routing.review_role = review_role;
            }
            if let Some(limit) = routing.conflict_retry_limit {
                self.routing.conflict_retry_limit = limit;
            }
        }

        if let Some(escalation) = patch.escalation {
            if let Some(secs) = escalation.sweep_interval_secs {
                self.escalation.sweep_interval_secs = secs;
            }
        }

        if let Some(notifier) = patch.notifier {
            if let Some(mode) = notifier.mode {
                self.notifier.mode = mode;
            }
            if let Some(url) = notifier.webhook_url {
                self.notifier.webhook_url = Some(url);
            }
            if let Some(token) = notifier.auth_token {
                self.notifier.auth_token = Some(token.into());
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
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("COUNTERSIGN_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(level) = env::var("COUNTERSIGN_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("COUNTERSIGN_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Ok(role) = env::var("COUNTERSIGN_REVIEW_ROLE") {
            self.routing.review_role = role;
        }
        if let Ok(value) = env::var("COUNTERSIGN_SWEEP_INTERVAL_SECS") {
            self.escalation.sweep_interval_secs = value.parse().map_err(|_| {
                ConfigError::InvalidEnvOverride {
                    key: "COUNTERSIGN_SWEEP_INTERVAL_SECS".to_string(),
                    value,
                }
            })?;
        }
        if let Ok(mode) = env::var("COUNTERSIGN_NOTIFIER_MODE") {
            self.notifier.mode = mode.parse()?;
        }
        if let Ok(url) = env::var("COUNTERSIGN_NOTIFIER_WEBHOOK_URL") {
            self.notifier.webhook_url = Some(url);
        }
        if let Ok(token) = env::var("COUNTERSIGN_NOTIFIER_AUTH_TOKEN") {
            self.notifier.auth_token = Some(token.into());
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Validation("database.url must not be empty".to_string()));
        }
        if self.sla.high_hours <= 0 || self.sla.normal_hours <= 0 || self.sla.low_hours <= 0 {
            return Err(ConfigError::Validation("sla hours must be positive".to_string()));
        }
        if self.routing.review_role.trim().is_empty() {
            return Err(ConfigError::Validation("routing.review_role must not be empty".to_string()));
        }
        if self.routing.conflict_retry_limit == 0 {
            return Err(ConfigError::Validation(
                "routing.conflict_retry_limit must be at least 1".to_string(),
            ));
        }
        if self.escalation.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "escalation.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.notifier.mode == NotifierMode::Webhook && self.notifier.webhook_url.is_none() {
            return Err(ConfigError::Validation(
                "notifier.webhook_url is required in webhook mode".to_string(),
            ));
        }
        Ok(())
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    let default = PathBuf::from("countersign.toml");
    default.exists().then_some(default)
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    toml::from_str(&raw)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}
