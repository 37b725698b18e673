use std::time::Duration;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::repositories::session_cache::SessionCache;
use crate::tasks::registry::SessionRegistry;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

pub(crate) async fn purge_abandoned_sessions(cache: &SessionCache, grace: Duration) -> Result<usize> {
    let purged = cache
        .purge_abandoned(OffsetDateTime::now_utc(), grace)
        .await
        .context("Failed to purge abandoned session records")?;

    if purged > 0 {
        tracing::info!(purged, backend = cache.backend(), "Purged abandoned session records");
        metrics::counter!("exam_cache_purged_total").increment(purged as u64);
    }

    Ok(purged)
}

/// Drops registry entries and results of sessions that finished more than
/// `retention` ago.
pub(crate) async fn release_finished_sessions(registry: &SessionRegistry, retention: Duration) -> usize {
    let handles = registry.prune_stopped(retention).await;
    let results = registry.context().materializer.evict_older_than(retention).await;

    if handles + results > 0 {
        tracing::info!(handles, results, "Released finished sessions");
    }

    handles + results
}

/// Runs once at startup and then hourly until shutdown.
pub(crate) async fn purge_loop(
    registry: SessionRegistry,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Err(err) = purge_abandoned_sessions(&registry.context().cache, grace).await {
            tracing::error!(error = %err, "Abandoned session purge failed");
        }
        release_finished_sessions(&registry, grace).await;

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(PURGE_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::repositories::session_cache::SessionStore;
    use crate::session::record::{SessionRecord, RECORD_FORMAT};
    use crate::session::types::{ExamSession, Phase};
    use crate::core::config::EngineSettings;
    use crate::schemas::wire::FinalizeMessage;
    use crate::test_support::{engine_context, FakeAuthority, MemoryConnector, MemoryStore};

    fn record(session_id: &str, started_at: OffsetDateTime) -> SessionRecord {
        SessionRecord {
            format: RECORD_FORMAT,
            session: ExamSession {
                session_id: session_id.to_string(),
                test_id: "t-1".to_string(),
                student_id: "u-1".to_string(),
                server_started_at: started_at,
                server_duration_seconds: 1800,
            },
            phase: Phase::Active,
            anchor: None,
            answers: Vec::new(),
            pending_submit: None,
            failure: None,
            written_at: started_at,
        }
    }

    #[tokio::test]
    async fn purge_loop_runs_immediately_and_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::default());
        let cache = SessionCache::new(store.clone());
        let now = OffsetDateTime::now_utc();
        cache.store(&record("stale", now - Duration::from_secs(3 * 86_400))).await.expect("stale");
        cache.store(&record("live", now)).await.expect("live");

        let (connector, _accepted) = MemoryConnector::new();
        let context = engine_context(cache.clone(), Arc::new(FakeAuthority::default()), connector);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let registry = SessionRegistry::new(context, EngineSettings::default(), shutdown_rx.clone());
        let task = tokio::spawn(purge_loop(registry, Duration::from_secs(86_400), shutdown_rx));

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.read("stale").await.expect("read").is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("stale record purged");

        shutdown.send_replace(true);
        task.await.expect("join");
        assert_eq!(cache.session_ids().await.expect("ids"), vec!["live".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn release_drops_results_past_retention() {
        let (connector, _accepted) = MemoryConnector::new();
        let cache = SessionCache::new(Arc::new(MemoryStore::default()));
        let context = engine_context(cache, Arc::new(FakeAuthority::default()), connector);
        let (_shutdown, shutdown_rx) = watch::channel(false);
        let registry = SessionRegistry::new(context, EngineSettings::default(), shutdown_rx);
        let finalize =
            FinalizeMessage { score: 9.0, total: 10.0, status: "graded".to_string(), released: true };
        registry.context().materializer.materialize("s-1", &finalize).await.expect("materialize");

        let retention = Duration::from_secs(3600);
        assert_eq!(release_finished_sessions(&registry, retention).await, 0);
        tokio::time::advance(retention).await;
        assert_eq!(release_finished_sessions(&registry, retention).await, 1);
        assert_eq!(registry.context().materializer.get("s-1").await, None);
    }
}
