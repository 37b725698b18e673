use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::core::config::EngineSettings;
use crate::core::time::Moment;
use crate::schemas::authority::RemoteStatus;
use crate::services::authority_client::AuthorityError;
use crate::session::machine::{SessionError, SessionStateMachine};
use crate::session::record::SessionRecord;
use crate::session::types::Phase;
use crate::tasks::driver::{self, EngineContext, SessionHandle};

#[derive(Debug, Error)]
pub(crate) enum LaunchError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    #[error("session {0} has already finished")]
    Finished(String),
}

/// Live sessions of this process, keyed by session id. At most one driver
/// runs per id.
#[derive(Clone)]
pub(crate) struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    context: EngineContext,
    engine: EngineSettings,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    // Each task yields its session id once the driver it supervises stopped.
    drivers: Mutex<JoinSet<String>>,
    shutdown: watch::Receiver<bool>,
}

struct SessionEntry {
    handle: SessionHandle,
    stopped_at: Option<Instant>,
}

impl SessionRegistry {
    pub(crate) fn new(
        context: EngineContext,
        engine: EngineSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                context,
                engine,
                sessions: Mutex::new(HashMap::new()),
                drivers: Mutex::new(JoinSet::new()),
                shutdown,
            }),
        }
    }

    pub(crate) fn context(&self) -> &EngineContext {
        &self.inner.context
    }

    pub(crate) async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner.sessions.lock().await.get(session_id).map(|entry| entry.handle.clone())
    }

    pub(crate) async fn live_count(&self) -> usize {
        let sessions = self.inner.sessions.lock().await;
        sessions
            .values()
            .filter(|entry| entry.handle.ended_phase().is_none() && !entry.handle.is_stopped())
            .count()
    }

    /// Opens a fresh attempt with the authority and starts driving it.
    pub(crate) async fn start(&self, test_id: &str) -> Result<SessionHandle, LaunchError> {
        let session = self.inner.context.authority.start_session(test_id).await?;
        let mut machine = SessionStateMachine::new(session, self.inner.engine.clone());
        machine.start(Moment::now())?;
        self.launch(machine).await
    }

    /// Restores a session after a reload. The local cache wins when it holds a
    /// usable record; otherwise the authority's copy is fetched.
    pub(crate) async fn resume(&self, session_id: &str) -> Result<SessionHandle, LaunchError> {
        if let Some(handle) = self.get(session_id).await {
            return Ok(handle);
        }

        let now = Moment::now();
        let cache = &self.inner.context.cache;
        match cache.load(session_id).await {
            Ok(Some(record)) if resumable(&record) => {
                let machine = SessionStateMachine::resume(record, self.inner.engine.clone(), now);
                return self.launch_or_join(machine).await;
            }
            Ok(Some(record)) => {
                tracing::info!(
                    session_id,
                    phase = record.phase.as_str(),
                    "Cached session cannot be resumed; asking the authority"
                );
                if let Err(err) = cache.clear(session_id).await {
                    tracing::warn!(session_id, error = %err, "Failed to clear stale session record");
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(session_id, error = %err, "Session cache unavailable; asking the authority");
            }
        }

        let remote = self.inner.context.authority.fetch_session(session_id).await?;
        if remote.status != RemoteStatus::Active {
            tracing::info!(session_id, status = ?remote.status, "Authority reports session finished");
            return Err(LaunchError::Finished(session_id.to_string()));
        }

        let record = SessionRecord::from_remote(remote, now.wall);
        let machine = SessionStateMachine::resume(record, self.inner.engine.clone(), now);
        self.launch_or_join(machine).await
    }

    /// Forgets sessions whose driver stopped at least `retention` ago.
    /// Until then their snapshot and ended signal stay readable.
    pub(crate) async fn prune_stopped(&self, retention: Duration) -> usize {
        self.reap().await;

        let now = Instant::now();
        let mut sessions = self.inner.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|session_id, entry| match entry.stopped_at {
            Some(stopped_at) if now.duration_since(stopped_at) >= retention => {
                tracing::debug!(session_id = %session_id, "Releasing finished session");
                false
            }
            _ => true,
        });
        before - sessions.len()
    }

    /// Waits for every driver to stop. Call after the shutdown signal fired.
    pub(crate) async fn join_all(&self) {
        let mut drivers = std::mem::take(&mut *self.inner.drivers.lock().await);
        while let Some(joined) = drivers.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "Session supervisor join failed");
            }
        }
    }

    /// Collects drivers that stopped since the last call and stamps their entries.
    async fn reap(&self) {
        let mut stopped = Vec::new();
        {
            let mut drivers = self.inner.drivers.lock().await;
            while let Some(joined) = drivers.try_join_next() {
                match joined {
                    Ok(session_id) => stopped.push(session_id),
                    Err(err) => tracing::error!(error = %err, "Session supervisor join failed"),
                }
            }
        }
        if stopped.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut sessions = self.inner.sessions.lock().await;
        for session_id in stopped {
            // A newer driver may have taken the id over since.
            if let Some(entry) = sessions.get_mut(&session_id) {
                if entry.handle.is_stopped() && entry.stopped_at.is_none() {
                    entry.stopped_at = Some(now);
                }
            }
        }
    }

    async fn launch_or_join(&self, machine: SessionStateMachine) -> Result<SessionHandle, LaunchError> {
        let session_id = machine.session_id().to_string();
        match self.launch(machine).await {
            Err(LaunchError::Session(SessionError::AlreadyRunning(_))) => {
                self.get(&session_id).await.ok_or(LaunchError::Session(SessionError::Stopped))
            }
            other => other,
        }
    }

    async fn launch(&self, machine: SessionStateMachine) -> Result<SessionHandle, LaunchError> {
        let session_id = machine.session_id().to_string();
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(existing) = sessions.get(&session_id) {
            if existing.handle.ended_phase().is_none() && !existing.handle.is_stopped() {
                tracing::warn!(session_id = %session_id, "Refusing a second driver for a live session");
                return Err(SessionError::AlreadyRunning(session_id).into());
            }
        }

        let (handle, task) =
            driver::spawn(machine, self.inner.context.clone(), self.inner.shutdown.clone());
        sessions.insert(session_id.clone(), SessionEntry { handle: handle.clone(), stopped_at: None });
        drop(sessions);

        metrics::gauge!("exam_sessions_live").increment(1.0);
        self.inner.drivers.lock().await.spawn(supervise(session_id, task));
        self.reap().await;
        Ok(handle)
    }
}

async fn supervise(session_id: String, driver: JoinHandle<()>) -> String {
    if let Err(err) = driver.await {
        tracing::error!(session_id = %session_id, error = %err, "Session driver join failed");
    }
    metrics::gauge!("exam_sessions_live").decrement(1.0);
    session_id
}

fn resumable(record: &SessionRecord) -> bool {
    match record.phase {
        Phase::Submitted | Phase::Expired => false,
        Phase::Errored => record.failure.as_ref().is_some_and(|failure| failure.retriable),
        _ => true,
    }
}
