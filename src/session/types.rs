use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// Lifecycle of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Phase {
    Idle,
    Connecting,
    Active,
    Submitting,
    Submitted,
    Expired,
    Errored,
}

impl Phase {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Active => "active",
            Phase::Submitting => "submitting",
            Phase::Submitted => "submitted",
            Phase::Expired => "expired",
            Phase::Errored => "errored",
        }
    }

    /// No transition leaves a terminal phase.
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Phase::Submitted | Phase::Expired)
    }
}

/// Identity and server-issued timing of one attempt. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ExamSession {
    #[serde(alias = "sessionId")]
    pub(crate) session_id: String,
    #[serde(alias = "testId")]
    pub(crate) test_id: String,
    #[serde(alias = "studentId")]
    pub(crate) student_id: String,
    #[serde(alias = "serverStartedAt", with = "time::serde::rfc3339")]
    pub(crate) server_started_at: OffsetDateTime,
    #[serde(alias = "serverDurationSeconds")]
    pub(crate) server_duration_seconds: u64,
}

impl ExamSession {
    pub(crate) fn server_deadline(&self) -> OffsetDateTime {
        self.server_started_at + Duration::from_secs(self.server_duration_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SubmitTrigger {
    ManualSubmit,
    AutoDeadline,
}

impl SubmitTrigger {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SubmitTrigger::ManualSubmit => "manual_submit",
            SubmitTrigger::AutoDeadline => "auto_deadline",
        }
    }
}

/// Why a session sits in `Errored`. Retriable failures may re-enter `Submitting`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SessionFailure {
    pub(crate) reason: String,
    pub(crate) retriable: bool,
}

/// Server-finalized outcome of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ExamResult {
    pub(crate) session_id: String,
    pub(crate) score: f64,
    pub(crate) total: f64,
    pub(crate) status: String,
    pub(crate) released: bool,
}

/// The key is derived from the session id alone so that every retry, reload
/// and transport carries the same value.
pub(crate) fn submit_idempotency_key(session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"submit:");
    hasher.update(session_id.as_bytes());
    hex::encode(hasher.finalize())
}
