use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::schemas::authority::RemoteSession;
use crate::session::answers::Answer;
use crate::session::clock::StoredAnchor;
use crate::session::types::{ExamSession, Phase, SessionFailure, SubmitTrigger};

pub(crate) const RECORD_FORMAT: u32 = 1;

/// Reload-safe snapshot of one in-flight session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SessionRecord {
    pub(crate) format: u32,
    pub(crate) session: ExamSession,
    pub(crate) phase: Phase,
    pub(crate) anchor: Option<StoredAnchor>,
    pub(crate) answers: Vec<Answer>,
    #[serde(default)]
    pub(crate) pending_submit: Option<SubmitTrigger>,
    #[serde(default)]
    pub(crate) failure: Option<SessionFailure>,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) written_at: OffsetDateTime,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum RecordError {
    #[error("unsupported record format {0}")]
    Format(u32),
    #[error("record has an empty session id")]
    MissingSessionId,
    #[error("record belongs to session {found}, expected {expected}")]
    WrongSession { expected: String, found: String },
    #[error("duplicate answer for question {0}")]
    DuplicateQuestion(String),
    #[error("question {0} acknowledges a version it never produced")]
    AckAhead(String),
    #[error("terminal phase {0} should never be cached")]
    Terminal(&'static str),
}

impl SessionRecord {
    /// Rejects anything a resume could not trust.
    pub(crate) fn validate(&self, expected_session_id: &str) -> Result<(), RecordError> {
        if self.format != RECORD_FORMAT {
            return Err(RecordError::Format(self.format));
        }
        if self.session.session_id.trim().is_empty() {
            return Err(RecordError::MissingSessionId);
        }
        if self.session.session_id != expected_session_id {
            return Err(RecordError::WrongSession {
                expected: expected_session_id.to_string(),
                found: self.session.session_id.clone(),
            });
        }
        if self.phase.is_terminal() {
            return Err(RecordError::Terminal(self.phase.as_str()));
        }

        let mut seen = HashSet::with_capacity(self.answers.len());
        for answer in &self.answers {
            if !seen.insert(answer.question_id.as_str()) {
                return Err(RecordError::DuplicateQuestion(answer.question_id.clone()));
            }
            if answer.acked_version > answer.local_version {
                return Err(RecordError::AckAhead(answer.question_id.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn dirty_count(&self) -> usize {
        self.answers.iter().filter(|answer| answer.is_dirty()).count()
    }

    /// Builds a clean record from the authority's own view of the attempt.
    /// Every answer it returns is already acknowledged.
    pub(crate) fn from_remote(remote: RemoteSession, now: OffsetDateTime) -> Self {
        let answers = remote
            .answers
            .into_iter()
            .map(|answer| Answer {
                question_id: answer.question_id,
                value: answer.value,
                local_version: answer.version,
                acked_version: answer.version,
            })
            .collect();

        Self {
            format: RECORD_FORMAT,
            session: remote.session,
            phase: Phase::Connecting,
            anchor: Some(StoredAnchor {
                server_timestamp: remote.server_time,
                remaining_seconds: u64::try_from(remote.time_remaining).unwrap_or(0),
                received_wall: now,
            }),
            answers,
            pending_submit: None,
            failure: None,
            written_at: now,
        }
    }
}
