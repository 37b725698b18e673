use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::session::record::SessionRecord;

pub(crate) mod file;
pub(crate) mod redis;

pub(crate) use file::FileStore;
pub(crate) use self::redis::RedisStore;

#[derive(Debug, Error)]
pub(crate) enum CacheError {
    #[error("cache io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache redis command failed: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("failed to encode session record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CacheHealth {
    Healthy,
    Unavailable(String),
}

impl CacheHealth {
    pub(crate) fn as_status(&self) -> String {
        match self {
            CacheHealth::Healthy => "healthy".to_string(),
            CacheHealth::Unavailable(reason) => format!("unavailable: {reason}"),
        }
    }
}

/// Raw per-session payload storage. Implementations know nothing about the
/// record format.
#[async_trait]
pub(crate) trait SessionStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn read(&self, session_id: &str) -> Result<Option<String>, CacheError>;

    async fn write(&self, session_id: &str, payload: &str) -> Result<(), CacheError>;

    async fn remove(&self, session_id: &str) -> Result<(), CacheError>;

    async fn list(&self) -> Result<Vec<String>, CacheError>;

    async fn health(&self) -> CacheHealth;
}

/// Typed access to cached session records.
#[derive(Clone)]
pub(crate) struct SessionCache {
    store: Arc<dyn SessionStore>,
}

impl SessionCache {
    pub(crate) fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub(crate) fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub(crate) async fn health(&self) -> CacheHealth {
        self.store.health().await
    }

    /// A record that cannot be decoded or fails validation is dropped and
    /// reported as a miss.
    pub(crate) async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, CacheError> {
        let Some(payload) = self.store.read(session_id).await? else {
            return Ok(None);
        };

        let problem = match serde_json::from_str::<SessionRecord>(&payload) {
            Ok(record) => match record.validate(session_id) {
                Ok(()) => return Ok(Some(record)),
                Err(err) => err.to_string(),
            },
            Err(err) => err.to_string(),
        };

        tracing::warn!(
            session_id,
            backend = self.backend(),
            error = %problem,
            "Discarding corrupt session record"
        );
        self.store.remove(session_id).await?;
        Ok(None)
    }

    pub(crate) async fn store(&self, record: &SessionRecord) -> Result<(), CacheError> {
        let payload = serde_json::to_string(record)?;
        self.store.write(&record.session.session_id, &payload).await
    }

    pub(crate) async fn clear(&self, session_id: &str) -> Result<(), CacheError> {
        self.store.remove(session_id).await
    }

    pub(crate) async fn session_ids(&self) -> Result<Vec<String>, CacheError> {
        self.store.list().await
    }

    /// Drops records whose server deadline passed more than `grace` ago, plus
    /// any that no longer decode. Returns how many were removed.
    pub(crate) async fn purge_abandoned(
        &self,
        now: OffsetDateTime,
        grace: Duration,
    ) -> Result<usize, CacheError> {
        let mut purged = 0;
        for session_id in self.store.list().await? {
            let Some(record) = self.load(&session_id).await? else {
                purged += 1;
                continue;
            };

            let abandoned_after = record.session.server_deadline() + grace;
            if abandoned_after < now {
                tracing::info!(
                    session_id = %session_id,
                    phase = record.phase.as_str(),
                    dirty_answers = record.dirty_count(),
                    "Purging abandoned session record"
                );
                self.store.remove(&session_id).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::record::RECORD_FORMAT;
    use crate::session::types::{ExamSession, Phase};
    use crate::test_support::MemoryStore;
    use time::macros::datetime;

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
    async fn stores_and_loads_records() {
        let cache = SessionCache::new(Arc::new(MemoryStore::default()));
        let stored = record("s-1", datetime!(2025-03-01 09:00 UTC));

        cache.store(&stored).await.expect("store");
        assert_eq!(cache.load("s-1").await.expect("load"), Some(stored));
        assert_eq!(cache.session_ids().await.expect("ids"), vec!["s-1".to_string()]);

        cache.clear("s-1").await.expect("clear");
        assert_eq!(cache.load("s-1").await.expect("load"), None);
    }

    #[tokio::test]
    async fn corrupt_record_is_a_miss_and_is_removed() {
        let store = Arc::new(MemoryStore::default());
        store.write("s-1", "{not json").await.expect("write");
        let cache = SessionCache::new(store.clone());

        assert_eq!(cache.load("s-1").await.expect("load"), None);
        assert_eq!(store.read("s-1").await.expect("read"), None);
    }

    #[tokio::test]
    async fn record_under_wrong_key_is_a_miss() {
        let store = Arc::new(MemoryStore::default());
        let foreign = record("s-2", datetime!(2025-03-01 09:00 UTC));
        store
            .write("s-1", &serde_json::to_string(&foreign).expect("encode"))
            .await
            .expect("write");

        let cache = SessionCache::new(store);
        assert_eq!(cache.load("s-1").await.expect("load"), None);
    }

    #[tokio::test]
    async fn purges_sessions_past_grace_window() {
        let store = Arc::new(MemoryStore::default());
        let cache = SessionCache::new(store.clone());
        cache.store(&record("old", datetime!(2025-02-01 09:00 UTC))).await.expect("old");
        cache.store(&record("fresh", datetime!(2025-03-01 09:00 UTC))).await.expect("fresh");
        store.write("broken", "[]").await.expect("broken");

        let purged = cache
            .purge_abandoned(datetime!(2025-03-01 12:00 UTC), Duration::from_secs(86_400))
            .await
            .expect("purge");

        assert_eq!(purged, 2);
        assert_eq!(cache.session_ids().await.expect("ids"), vec!["fresh".to_string()]);
    }
}
