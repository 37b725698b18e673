use std::env;
use std::time::Duration;

use super::types::{CacheBackend, ConfigError, Environment};

const DEFAULT_CORS_ORIGINS: &[&str] =
    &["http://localhost:3000", "http://localhost:5173", "http://127.0.0.1:3000"];

pub(super) fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

pub(super) fn env_or_default(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

pub(super) fn parse_u16(field: &'static str, value: String) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_u32(field: &'static str, value: String) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_u64(field: &'static str, value: String) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue { field, value })
}

/// Reads `key` as a positive number of milliseconds.
pub(super) fn env_millis(key: &'static str, default: &str) -> Result<Duration, ConfigError> {
    let raw = env_or_default(key, default);
    match parse_u64(key, raw.clone())? {
        0 => Err(ConfigError::InvalidValue { field: key, value: raw }),
        value => Ok(Duration::from_millis(value)),
    }
}

pub(super) fn env_seconds(key: &'static str, default: &str) -> Result<Duration, ConfigError> {
    let raw = env_or_default(key, default);
    parse_u64(key, raw).map(Duration::from_secs)
}

pub(super) fn parse_url(
    field: &'static str,
    value: String,
    schemes: &[&str],
) -> Result<String, ConfigError> {
    let trimmed = value.trim_end_matches('/');
    let valid = schemes.iter().any(|scheme| {
        trimmed
            .strip_prefix(scheme)
            .and_then(|rest| rest.strip_prefix("://"))
            .is_some_and(|rest| !rest.is_empty())
    });
    if valid {
        Ok(trimmed.to_string())
    } else {
        Err(ConfigError::InvalidUrl { field, value })
    }
}

pub(super) fn parse_cors_origins(value: Option<String>) -> Result<Vec<String>, ConfigError> {
    let Some(raw) = value else {
        return Ok(default_cors_origins());
    };

    if raw.trim_start().starts_with('[') {
        let parsed: Vec<String> =
            serde_json::from_str(&raw).map_err(|_| ConfigError::InvalidCors(raw.clone()))?;
        if parsed.is_empty() {
            return Ok(default_cors_origins());
        }
        return Ok(parsed);
    }

    let items: Vec<String> = raw
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();

    if items.is_empty() {
        return Ok(default_cors_origins());
    }

    Ok(items)
}

pub(super) fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}

pub(super) fn parse_environment(value: Option<String>) -> Environment {
    match value.as_deref().map(|item| item.to_lowercase()) {
        Some(ref val) if val == "production" || val == "prod" => Environment::Production,
        Some(ref val) if val == "staging" => Environment::Staging,
        Some(ref val) if val == "test" || val == "testing" => Environment::Test,
        _ => Environment::Development,
    }
}

pub(super) fn parse_cache_backend(value: String) -> Result<CacheBackend, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "file" => Ok(CacheBackend::File),
        "redis" => Ok(CacheBackend::Redis),
        _ => Err(ConfigError::InvalidValue { field: "SESSION_CACHE_BACKEND", value }),
    }
}

fn default_cors_origins() -> Vec<String> {
    DEFAULT_CORS_ORIGINS.iter().map(|item| item.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cors_origins_json() {
        let raw = "[\"http://a\",\"http://b\"]".to_string();
        let parsed = parse_cors_origins(Some(raw)).expect("cors json");
        assert_eq!(parsed, vec!["http://a".to_string(), "http://b".to_string()]);
    }

    #[test]
    fn parse_cors_origins_csv() {
        let raw = "http://a, http://b".to_string();
        let parsed = parse_cors_origins(Some(raw)).expect("cors csv");
        assert_eq!(parsed, vec!["http://a".to_string(), "http://b".to_string()]);
    }

    #[test]
    fn parse_cors_origins_defaults_on_empty() {
        let parsed = parse_cors_origins(Some(" , ".to_string())).expect("cors empty");
        assert_eq!(parsed, default_cors_origins());
    }

    #[test]
    fn parse_bool_variants() {
        assert!(parse_bool("1"));
        assert!(parse_bool("yes"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
    }

    #[test]
    fn parse_environment_variants() {
        assert_eq!(parse_environment(Some("prod".to_string())), Environment::Production);
        assert_eq!(parse_environment(Some("staging".to_string())), Environment::Staging);
        assert_eq!(parse_environment(Some("testing".to_string())), Environment::Test);
        assert_eq!(parse_environment(None), Environment::Development);
    }

    #[test]
    fn parse_url_checks_scheme_and_trims_slash() {
        assert_eq!(
            parse_url("X", "ws://host:8000/ws/".to_string(), &["ws", "wss"]).expect("ws url"),
            "ws://host:8000/ws"
        );
        assert!(parse_url("X", "http://host".to_string(), &["ws", "wss"]).is_err());
        assert!(parse_url("X", "wss://".to_string(), &["ws", "wss"]).is_err());
    }

    #[test]
    fn parse_cache_backend_variants() {
        assert_eq!(parse_cache_backend("Redis".to_string()).expect("redis"), CacheBackend::Redis);
        assert_eq!(parse_cache_backend("file".to_string()).expect("file"), CacheBackend::File);
        assert!(parse_cache_backend("sqlite".to_string()).is_err());
    }
}
