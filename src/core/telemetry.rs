use tracing_subscriber::{fmt, EnvFilter};

use crate::core::config::Settings;

/// `RUST_LOG` wins over `CBT_LOG_LEVEL` when both are set.
pub(crate) fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    let telemetry = settings.telemetry();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(telemetry.log_level.clone()));

    let builder = fmt().with_env_filter(filter).with_target(false);

    if telemetry.json {
        builder
            .json()
            .with_current_span(true)
            .with_span_events(fmt::format::FmtSpan::CLOSE)
            .try_init()
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    } else {
        builder
            .with_span_events(fmt::format::FmtSpan::CLOSE)
            .try_init()
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    }

    tracing::debug!(level = %telemetry.log_level, json = telemetry.json, "Tracing initialized");
    Ok(())
}
