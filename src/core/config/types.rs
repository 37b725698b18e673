use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::backoff::BackoffPolicy;

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(super) server: ServerSettings,
    pub(super) runtime: RuntimeSettings,
    pub(super) cors: CorsSettings,
    pub(super) authority: AuthoritySettings,
    pub(super) channel: ChannelSettings,
    pub(super) engine: EngineSettings,
    pub(super) cache: CacheSettings,
    pub(super) redis: RedisSettings,
    pub(super) telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerSettings {
    pub(super) host: ServerHost,
    pub(super) port: ServerPort,
}

#[derive(Debug, Clone)]
pub(crate) struct CorsSettings {
    pub(crate) origins: Vec<String>,
}

/// Where the exam authority lives and how long to wait for it over HTTP.
#[derive(Debug, Clone)]
pub(crate) struct AuthoritySettings {
    pub(crate) http_url: String,
    pub(crate) ws_url: String,
    pub(crate) token: String,
    pub(crate) request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct ChannelSettings {
    pub(crate) heartbeat_interval: Duration,
    pub(crate) liveness_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) reconnect: BackoffPolicy,
}

/// Tunables consumed by the session state machine.
#[derive(Debug, Clone)]
pub(crate) struct EngineSettings {
    pub(crate) autosave_debounce: Duration,
    pub(crate) flush_timeout: Duration,
    pub(crate) flush_backoff: BackoffPolicy,
    pub(crate) drain_max_attempts: u32,
    pub(crate) submit_timeout: Duration,
    pub(crate) submit_backoff: BackoffPolicy,
    pub(crate) anchor_max_age: Duration,
    pub(crate) revalidate_interval: Duration,
    pub(crate) tick_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheBackend {
    File,
    Redis,
}

impl CacheBackend {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            CacheBackend::File => "file",
            CacheBackend::Redis => "redis",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CacheSettings {
    pub(crate) backend: CacheBackend,
    pub(crate) dir: PathBuf,
    pub(crate) abandon_grace: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct RedisSettings {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) db: u16,
    pub(crate) password: String,
}

#[derive(Debug, Clone)]
pub(crate) struct TelemetrySettings {
    pub(crate) log_level: String,
    pub(crate) json: bool,
    pub(crate) prometheus_enabled: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeSettings {
    pub(crate) environment: Environment,
    pub(crate) strict_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Test => "test",
        }
    }

    pub(super) fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServerHost(pub(super) String);

#[derive(Debug, Clone, Copy)]
pub(crate) struct ServerPort(pub(super) u16);

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("invalid server host: {0}")]
    InvalidHost(String),
    #[error("invalid server port: {0}")]
    InvalidPort(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("invalid url for {field}: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("invalid cors origins: {0}")]
    InvalidCors(String),
    #[error("missing required secret for {0}")]
    MissingSecret(&'static str),
}
