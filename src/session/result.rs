use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::schemas::wire::FinalizeMessage;
use crate::session::types::ExamResult;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum MaterializeError {
    #[error("result for session {0} already materialized")]
    AlreadyMaterialized(String),
}

/// Holds each session's finalized outcome. The first finalization for a
/// session wins; later ones are dropped. Results are kept until
/// [`ResultMaterializer::evict_older_than`] releases them.
#[derive(Clone, Default)]
pub(crate) struct ResultMaterializer {
    results: Arc<RwLock<HashMap<String, Materialized>>>,
}

struct Materialized {
    result: ExamResult,
    at: Instant,
}

impl ResultMaterializer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn materialize(
        &self,
        session_id: &str,
        message: &FinalizeMessage,
    ) -> Result<ExamResult, MaterializeError> {
        let mut guard = self.results.write().await;
        if guard.contains_key(session_id) {
            metrics::counter!("exam_finalize_duplicates_total").increment(1);
            tracing::warn!(session_id, status = %message.status, "Dropping duplicate finalization");
            return Err(MaterializeError::AlreadyMaterialized(session_id.to_string()));
        }

        let result = ExamResult {
            session_id: session_id.to_string(),
            score: message.score,
            total: message.total,
            status: message.status.clone(),
            released: message.released,
        };
        guard.insert(
            session_id.to_string(),
            Materialized { result: result.clone(), at: Instant::now() },
        );
        tracing::info!(
            session_id,
            score = result.score,
            total = result.total,
            status = %result.status,
            "Exam result materialized"
        );
        Ok(result)
    }

    pub(crate) async fn get(&self, session_id: &str) -> Option<ExamResult> {
        self.results.read().await.get(session_id).map(|stored| stored.result.clone())
    }

    pub(crate) async fn evict_older_than(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut guard = self.results.write().await;
        let before = guard.len();
        guard.retain(|_, stored| now.duration_since(stored.at) < retention);
        before - guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalize(score: f64, status: &str) -> FinalizeMessage {
        FinalizeMessage { score, total: 100.0, status: status.to_string(), released: false }
    }

    #[tokio::test]
    async fn first_finalization_wins() {
        let materializer = ResultMaterializer::new();
        assert_eq!(materializer.get("s-1").await, None);

        let first = materializer.materialize("s-1", &finalize(80.0, "passed")).await.expect("first");
        assert_eq!(first.score, 80.0);

        let second = materializer.materialize("s-1", &finalize(10.0, "failed")).await;
        assert_eq!(second, Err(MaterializeError::AlreadyMaterialized("s-1".to_string())));

        let stored = materializer.get("s-1").await.expect("stored");
        assert_eq!(stored.score, 80.0);
        assert_eq!(stored.status, "passed");
    }

    #[tokio::test(start_paused = true)]
    async fn results_expire_after_retention() {
        let materializer = ResultMaterializer::new();
        materializer.materialize("old", &finalize(80.0, "passed")).await.expect("old");
        tokio::time::advance(Duration::from_secs(90)).await;
        materializer.materialize("new", &finalize(40.0, "failed")).await.expect("new");

        assert_eq!(materializer.evict_older_than(Duration::from_secs(60)).await, 1);
        assert_eq!(materializer.get("old").await, None);
        assert!(materializer.get("new").await.is_some());
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let materializer = ResultMaterializer::new();
        materializer.materialize("s-1", &finalize(80.0, "passed")).await.expect("s-1");
        materializer.materialize("s-2", &finalize(40.0, "failed")).await.expect("s-2");
        assert_eq!(materializer.get("s-2").await.expect("s-2").status, "failed");
    }
}
