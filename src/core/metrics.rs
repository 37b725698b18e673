use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    describe();
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

fn describe() {
    metrics::describe_counter!("exam_phase_transitions_total", "Session phase changes by target phase");
    metrics::describe_counter!("exam_flush_batches_total", "Autosave batches by outcome");
    metrics::describe_counter!("exam_answers_acked_total", "Answer versions confirmed by the authority");
    metrics::describe_counter!("exam_submit_requests_total", "Submit attempts over either transport");
    metrics::describe_counter!("exam_finalize_duplicates_total", "Finalizations dropped as duplicates");
    metrics::describe_counter!("exam_channel_reconnects_total", "Duplex channel reconnections");
    metrics::describe_counter!("exam_cache_purged_total", "Abandoned session records purged");
    metrics::describe_gauge!("exam_sessions_live", "Sessions with a running driver");
}
