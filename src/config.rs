//! Layered settings: built-in defaults, `config/default.toml`,
//! `config/{RUN_ENV}.toml`, then `APP__*` environment variables.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use validator::{Validate, ValidationError, ValidationErrors};

const SETTINGS_DIR: &str = "config";
const DEVELOPMENT: &str = "development";
const IN_MEMORY_BACKEND: &str = "in-memory";
const REDIS_BACKEND: &str = "redis";
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

const PORT: u16 = 8080;
const LOG_LEVEL: &str = "info";
const SESSION_TTL_SECS: u64 = 14 * 24 * 3600;
const PAYSTACK_BASE_URL: &str = "https://api.paystack.co";
const PAYSTACK_SIGNATURE_HEADER: &str = "x-paystack-signature";
const PAYMENT_TIMEOUT_SECS: u64 = 15;
const NOTIFICATION_POLL_MS: u64 = 500;
const NOTIFICATION_SWEEP_SECS: u64 = 60;
const MESSAGE_QUEUE_NAMESPACE: &str = "clothing_store";

const DB_MAX_CONNECTIONS: u32 = 16;
const DB_MIN_CONNECTIONS: u32 = 2;
const DB_CONNECT_TIMEOUT_SECS: u64 = 30;
const DB_IDLE_TIMEOUT_SECS: u64 = 600;
const DB_ACQUIRE_TIMEOUT_SECS: u64 = 8;

/// Storefront settings
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    pub database_url: String,

    /// Backs carts, sessions and co-purchase scores when `cache_backend` is redis
    pub redis_url: String,

    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// `development`, `test`, `production`, ...
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub auto_migrate: bool,

    /// `redis` or `in-memory`
    #[serde(default = "default_cache_backend")]
    #[validate(custom = "validate_backend_kind")]
    pub cache_backend: String,

    /// `redis` or `in-memory`; carries order-paid notifications
    #[serde(default = "default_message_queue_backend")]
    #[validate(custom = "validate_backend_kind")]
    pub message_queue_backend: String,

    /// Prefix of the queue's redis keys
    #[serde(default = "default_message_queue_namespace")]
    #[validate(length(min = 1))]
    pub message_queue_namespace: String,

    /// Idle lifetime of a shopper session and of a guest cart
    #[serde(default = "default_session_ttl_secs")]
    #[validate(range(min = 60))]
    pub session_ttl_secs: u64,

    /// Send the session cookie over HTTPS only
    #[serde(default = "default_true")]
    pub session_cookie_secure: bool,

    /// Comma-separated storefront origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Opt into permissive CORS outside development
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Bearer key for the provider API; also keys the webhook HMAC
    #[validate(length(min = 1))]
    pub paystack_secret_key: String,

    #[serde(default = "default_paystack_base_url")]
    #[validate(url)]
    pub paystack_base_url: String,

    #[serde(default = "default_payment_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub payment_timeout_secs: u64,

    /// Root the provider redirects shoppers back to
    #[serde(default = "default_public_base_url")]
    #[validate(url)]
    pub public_base_url: String,

    #[serde(default = "default_signature_header")]
    pub webhook_signature_header: String,

    #[serde(default = "default_notification_poll_interval_ms")]
    #[validate(range(min = 10))]
    pub notification_poll_interval_ms: u64,

    /// How often paid orders without a notification are swept from the database
    #[serde(default = "default_notification_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub notification_sweep_interval_secs: u64,
}

impl AppConfig {
    /// Settings with every optional value at its default
    pub fn new(
        database_url: String,
        redis_url: String,
        paystack_secret_key: String,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            redis_url,
            host: "0.0.0.0".to_string(),
            port: PORT,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cache_backend: default_cache_backend(),
            message_queue_backend: default_message_queue_backend(),
            message_queue_namespace: default_message_queue_namespace(),
            session_ttl_secs: SESSION_TTL_SECS,
            session_cookie_secure: true,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: DB_MAX_CONNECTIONS,
            db_min_connections: DB_MIN_CONNECTIONS,
            db_connect_timeout_secs: DB_CONNECT_TIMEOUT_SECS,
            db_idle_timeout_secs: DB_IDLE_TIMEOUT_SECS,
            db_acquire_timeout_secs: DB_ACQUIRE_TIMEOUT_SECS,
            paystack_secret_key,
            paystack_base_url: default_paystack_base_url(),
            payment_timeout_secs: PAYMENT_TIMEOUT_SECS,
            public_base_url: default_public_base_url(),
            webhook_signature_header: default_signature_header(),
            notification_poll_interval_ms: NOTIFICATION_POLL_MS,
            notification_sweep_interval_secs: NOTIFICATION_SWEEP_SECS,
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case(DEVELOPMENT)
    }

    /// At least one non-blank origin is listed
    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_deref()
            .is_some_and(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
    }

    pub fn should_allow_permissive_cors(&self) -> bool {
        self.cors_allow_any_origin || self.is_development()
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn notification_poll_interval(&self) -> Duration {
        Duration::from_millis(self.notification_poll_interval_ms)
    }

    pub fn notification_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.notification_sweep_interval_secs)
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_secs)
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Cross-field rules that only apply outside development
    fn check_deployment_rules(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            errors.add(
                "cors_allowed_origins",
                rule_error(
                    "cors_origins_missing",
                    "list the storefront origins in APP__CORS_ALLOWED_ORIGINS or set APP__CORS_ALLOW_ANY_ORIGIN=true",
                ),
            );
        }

        if !self.is_development() && self.cache_backend.eq_ignore_ascii_case(IN_MEMORY_BACKEND) {
            errors.add(
                "cache_backend",
                rule_error(
                    "cache_not_shared",
                    "carts and sessions would be lost on restart; use redis outside development",
                ),
            );
        }

        if !self.is_development()
            && self.message_queue_backend.eq_ignore_ascii_case(IN_MEMORY_BACKEND)
        {
            errors.add(
                "message_queue_backend",
                rule_error(
                    "queue_not_durable",
                    "queued notifications would be lost on restart; use redis outside development",
                ),
            );
        }

        match errors.errors().is_empty() {
            true => Ok(()),
            false => Err(errors),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("could not read settings: {0}")]
    Load(#[from] ConfigError),

    #[error("invalid settings: {0}")]
    Validation(#[from] ValidationErrors),
}

fn rule_error(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

fn default_port() -> u16 {
    PORT
}
fn default_log_level() -> String {
    LOG_LEVEL.to_string()
}
fn default_cache_backend() -> String {
    REDIS_BACKEND.to_string()
}
fn default_message_queue_backend() -> String {
    REDIS_BACKEND.to_string()
}
fn default_message_queue_namespace() -> String {
    MESSAGE_QUEUE_NAMESPACE.to_string()
}
fn default_true() -> bool {
    true
}
fn default_session_ttl_secs() -> u64 {
    SESSION_TTL_SECS
}
fn default_db_max_connections() -> u32 {
    DB_MAX_CONNECTIONS
}
fn default_db_min_connections() -> u32 {
    DB_MIN_CONNECTIONS
}
fn default_db_connect_timeout_secs() -> u64 {
    DB_CONNECT_TIMEOUT_SECS
}
fn default_db_idle_timeout_secs() -> u64 {
    DB_IDLE_TIMEOUT_SECS
}
fn default_db_acquire_timeout_secs() -> u64 {
    DB_ACQUIRE_TIMEOUT_SECS
}
fn default_paystack_base_url() -> String {
    PAYSTACK_BASE_URL.to_string()
}
fn default_payment_timeout_secs() -> u64 {
    PAYMENT_TIMEOUT_SECS
}
fn default_public_base_url() -> String {
    format!("http://localhost:{}", PORT)
}
fn default_signature_header() -> String {
    PAYSTACK_SIGNATURE_HEADER.to_string()
}
fn default_notification_poll_interval_ms() -> u64 {
    NOTIFICATION_POLL_MS
}
fn default_notification_sweep_interval_secs() -> u64 {
    NOTIFICATION_SWEEP_SECS
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    if LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
        Ok(())
    } else {
        Err(rule_error("log_level", "expected trace, debug, info, warn or error"))
    }
}

fn validate_backend_kind(value: &str) -> Result<(), ValidationError> {
    let value = value.to_ascii_lowercase();
    if value == REDIS_BACKEND || value == IN_MEMORY_BACKEND {
        Ok(())
    } else {
        Err(rule_error("backend_kind", "expected redis or in-memory"))
    }
}

/// Installs the global subscriber. `RUST_LOG`, when set, replaces the default filter.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match env::var("RUST_LOG") {
        Ok(directive) if !directive.trim().is_empty() => directive,
        _ => format!("clothing_store_api={},tower_http=debug,sea_orm=warn", level),
    };

    let builder = fmt().with_env_filter(EnvFilter::new(filter));
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed");
    }
}

/// Reads and validates the settings for `RUN_ENV` (default `development`).
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV").unwrap_or_else(|_| DEVELOPMENT.to_string());
    info!(environment = %run_env, "loading settings");

    if !Path::new(SETTINGS_DIR).is_dir() {
        info!(dir = SETTINGS_DIR, "no settings directory; using defaults and APP__* variables");
    }

    // the provider secret has no default and must be supplied
    let settings = Config::builder()
        .set_default("database_url", "sqlite://clothing_store.db?mode=rwc")?
        .set_default("redis_url", "redis://127.0.0.1:6379")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(PORT))?
        .set_default("environment", run_env.as_str())?
        .add_source(File::with_name(&format!("{}/default", SETTINGS_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", SETTINGS_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if settings.get_string("paystack_secret_key").is_err() {
        error!("APP__PAYSTACK_SECRET_KEY is not set");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "paystack_secret_key".into(),
        )));
    }

    let cfg: AppConfig = settings.try_deserialize()?;
    if let Err(e) = cfg.validate().and_then(|_| cfg.check_deployment_rules()) {
        error!(error = %e, "settings rejected");
        return Err(AppConfigError::Validation(e));
    }

    info!(
        environment = %cfg.environment,
        cache = %cfg.cache_backend,
        queue = %cfg.message_queue_backend,
        "settings loaded"
    );
    Ok(cfg)
}
