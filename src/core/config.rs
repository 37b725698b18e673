mod parsing;
mod settings;
mod types;

pub(crate) use types::{
    AuthoritySettings, CacheBackend, ChannelSettings, ConfigError, EngineSettings, Settings,
};

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn load_applies_defaults() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();

        let settings = Settings::load().expect("settings");
        assert_eq!(settings.server_addr(), "127.0.0.1:8700");
        assert_eq!(settings.channel().heartbeat_interval, Duration::from_secs(15));
        assert_eq!(settings.engine().submit_backoff.max_attempts(), Some(5));
        assert_eq!(settings.cache().backend, CacheBackend::File);
        assert_eq!(settings.authority().ws_url, "ws://localhost:8000/ws/sessions");
        assert_eq!(settings.redis().redis_url(), "redis://127.0.0.1:6379/1");
    }

    #[tokio::test]
    async fn load_rejects_zero_interval() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("FLUSH_TIMEOUT_MS", "0");

        let err = Settings::load().expect_err("zero timeout");
        std::env::remove_var("FLUSH_TIMEOUT_MS");
        assert!(matches!(err, ConfigError::InvalidValue { field: "FLUSH_TIMEOUT_MS", .. }));
    }

    #[tokio::test]
    async fn load_rejects_liveness_shorter_than_heartbeat() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("LIVENESS_TIMEOUT_MS", "1000");

        let err = Settings::load().expect_err("liveness too short");
        std::env::remove_var("LIVENESS_TIMEOUT_MS");
        assert!(matches!(err, ConfigError::InvalidValue { field: "LIVENESS_TIMEOUT_MS", .. }));
    }

    #[tokio::test]
    async fn load_rejects_request_timeout_not_below_submit_timeout() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("AUTHORITY_REQUEST_TIMEOUT_MS", "15000");

        let err = Settings::load().expect_err("request outlives submit attempt");
        std::env::remove_var("AUTHORITY_REQUEST_TIMEOUT_MS");
        assert!(matches!(
            err,
            ConfigError::InvalidValue { field: "AUTHORITY_REQUEST_TIMEOUT_MS", .. }
        ));
    }

    #[tokio::test]
    async fn strict_config_requires_token() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("CBT_STRICT_CONFIG", "1");

        let err = Settings::load().expect_err("missing token");
        std::env::remove_var("CBT_STRICT_CONFIG");
        assert!(matches!(err, ConfigError::MissingSecret("AUTHORITY_TOKEN")));
    }
}
