use std::path::PathBuf;
use std::time::Duration;

use super::parsing::{
    env_millis, env_optional, env_or_default, env_seconds, parse_bool, parse_cache_backend,
    parse_cors_origins, parse_environment, parse_u16, parse_u32, parse_url,
};
use super::types::{
    AuthoritySettings, CacheSettings, ChannelSettings, ConfigError, CorsSettings, EngineSettings,
    RedisSettings, RuntimeSettings, ServerHost, ServerPort, ServerSettings, Settings,
    TelemetrySettings,
};
use crate::core::backoff::BackoffPolicy;

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("CBT_HOST", "127.0.0.1");
        let port = env_or_default("CBT_PORT", "8700");

        let environment = parse_environment(env_optional("CBT_ENV"));
        let strict_config =
            env_optional("CBT_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let cors_origins = parse_cors_origins(env_optional("CBT_CORS_ORIGINS"))?;

        let http_url = parse_url(
            "AUTHORITY_HTTP_URL",
            env_or_default("AUTHORITY_HTTP_URL", "http://localhost:8000/api/v1"),
            &["http", "https"],
        )?;
        let ws_url = parse_url(
            "AUTHORITY_WS_URL",
            env_or_default("AUTHORITY_WS_URL", "ws://localhost:8000/ws/sessions"),
            &["ws", "wss"],
        )?;
        let token = env_or_default("AUTHORITY_TOKEN", "");
        let request_timeout = env_millis("AUTHORITY_REQUEST_TIMEOUT_MS", "10000")?;

        let heartbeat_interval = env_millis("HEARTBEAT_INTERVAL_MS", "15000")?;
        let liveness_timeout = env_millis("LIVENESS_TIMEOUT_MS", "45000")?;
        let connect_timeout = env_millis("CONNECT_TIMEOUT_MS", "10000")?;
        let reconnect_base = env_millis("RECONNECT_BASE_MS", "500")?;
        let reconnect_cap = env_millis("RECONNECT_CAP_MS", "30000")?;
        ensure_cap("RECONNECT_CAP_MS", reconnect_base, reconnect_cap)?;

        let autosave_debounce = env_millis("AUTOSAVE_DEBOUNCE_MS", "1500")?;
        let flush_timeout = env_millis("FLUSH_TIMEOUT_MS", "10000")?;
        let flush_base = env_millis("FLUSH_BACKOFF_BASE_MS", "1000")?;
        let flush_cap = env_millis("FLUSH_BACKOFF_CAP_MS", "30000")?;
        ensure_cap("FLUSH_BACKOFF_CAP_MS", flush_base, flush_cap)?;
        let drain_max_attempts =
            parse_u32("DRAIN_MAX_ATTEMPTS", env_or_default("DRAIN_MAX_ATTEMPTS", "8"))?;
        let submit_timeout = env_millis("SUBMIT_TIMEOUT_MS", "15000")?;
        let submit_max_attempts =
            parse_u32("SUBMIT_MAX_ATTEMPTS", env_or_default("SUBMIT_MAX_ATTEMPTS", "5"))?;
        let submit_base = env_millis("SUBMIT_BACKOFF_BASE_MS", "1000")?;
        let submit_cap = env_millis("SUBMIT_BACKOFF_CAP_MS", "20000")?;
        ensure_cap("SUBMIT_BACKOFF_CAP_MS", submit_base, submit_cap)?;
        let anchor_max_age = env_millis("ANCHOR_MAX_AGE_MS", "45000")?;
        let tick_interval = env_millis("TICK_INTERVAL_MS", "250")?;

        let backend = parse_cache_backend(env_or_default("SESSION_CACHE_BACKEND", "file"))?;
        let dir = PathBuf::from(env_or_default("SESSION_CACHE_DIR", ".cbt-session-cache"));
        let abandon_grace = env_seconds("ABANDON_GRACE_SECONDS", "86400")?;

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let log_level = env_or_default("CBT_LOG_LEVEL", "info");
        let json = env_optional("CBT_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            cors: CorsSettings { origins: cors_origins },
            authority: AuthoritySettings { http_url, ws_url, token, request_timeout },
            channel: ChannelSettings {
                heartbeat_interval,
                liveness_timeout,
                connect_timeout,
                reconnect: BackoffPolicy::new(reconnect_base, reconnect_cap),
            },
            engine: EngineSettings {
                autosave_debounce,
                flush_timeout,
                flush_backoff: BackoffPolicy::new(flush_base, flush_cap),
                drain_max_attempts: drain_max_attempts.max(1),
                submit_timeout,
                submit_backoff: BackoffPolicy::new(submit_base, submit_cap)
                    .with_max_attempts(submit_max_attempts),
                anchor_max_age,
                revalidate_interval: heartbeat_interval.min(Duration::from_secs(5)),
                tick_interval,
            },
            cache: CacheSettings { backend, dir, abandon_grace },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;

        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn authority(&self) -> &AuthoritySettings {
        &self.authority
    }

    pub(crate) fn channel(&self) -> &ChannelSettings {
        &self.channel
    }

    pub(crate) fn engine(&self) -> &EngineSettings {
        &self.engine
    }

    pub(crate) fn cache(&self) -> &CacheSettings {
        &self.cache
    }

    pub(crate) fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.liveness_timeout <= self.channel.heartbeat_interval {
            return Err(ConfigError::InvalidValue {
                field: "LIVENESS_TIMEOUT_MS",
                value: self.channel.liveness_timeout.as_millis().to_string(),
            });
        }

        // A slow HTTP submit must time out before the machine gives up on it.
        if self.authority.request_timeout >= self.engine.submit_timeout {
            return Err(ConfigError::InvalidValue {
                field: "AUTHORITY_REQUEST_TIMEOUT_MS",
                value: self.authority.request_timeout.as_millis().to_string(),
            });
        }

        if self.engine.anchor_max_age < self.channel.heartbeat_interval {
            return Err(ConfigError::InvalidValue {
                field: "ANCHOR_MAX_AGE_MS",
                value: self.engine.anchor_max_age.as_millis().to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.authority.token.is_empty() {
            return Err(ConfigError::MissingSecret("AUTHORITY_TOKEN"));
        }

        Ok(())
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            autosave_debounce: Duration::from_millis(1500),
            flush_timeout: Duration::from_secs(10),
            flush_backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
            drain_max_attempts: 8,
            submit_timeout: Duration::from_secs(15),
            submit_backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(20))
                .with_max_attempts(5),
            anchor_max_age: Duration::from_secs(45),
            revalidate_interval: Duration::from_secs(5),
            tick_interval: Duration::from_millis(250),
        }
    }
}

impl RedisSettings {
    pub(crate) fn redis_url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

impl ServerHost {
    fn parse(value: String) -> Result<Self, ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::InvalidHost(value));
        }
        Ok(Self(value))
    }
}

impl ServerPort {
    fn parse(value: String) -> Result<Self, ConfigError> {
        let parsed: u16 = value.parse().map_err(|_| ConfigError::InvalidPort(value.clone()))?;
        if parsed == 0 {
            return Err(ConfigError::InvalidPort(value));
        }
        Ok(Self(parsed))
    }
}

fn ensure_cap(field: &'static str, base: Duration, cap: Duration) -> Result<(), ConfigError> {
    if cap < base {
        return Err(ConfigError::InvalidValue { field, value: cap.as_millis().to_string() });
    }
    Ok(())
}
