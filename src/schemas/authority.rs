//! REST payloads exchanged with the exam authority.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::session::types::ExamSession;

/// `{success, message, data}` wrapper around every authority response.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub(crate) success: bool,
    #[serde(default)]
    pub(crate) message: String,
    pub(crate) data: Option<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RemoteStatus {
    Active,
    Submitted,
    Expired,
}

/// Server-side view of an attempt, used when no trustworthy local record exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RemoteSession {
    pub(crate) session: ExamSession,
    pub(crate) status: RemoteStatus,
    #[serde(alias = "serverTime", with = "time::serde::rfc3339")]
    pub(crate) server_time: OffsetDateTime,
    #[serde(alias = "timeRemaining")]
    pub(crate) time_remaining: i64,
    #[serde(default)]
    pub(crate) answers: Vec<RemoteAnswer>,
}

/// An answer the authority already holds, with the last version it accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RemoteAnswer {
    #[serde(alias = "questionId")]
    pub(crate) question_id: String,
    pub(crate) value: serde_json::Value,
    pub(crate) version: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct SubmitSessionRequest<'a> {
    pub(crate) idempotency_key: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_remote_session_envelope() {
        let body = json!({
            "success": true,
            "message": "ok",
            "data": {
                "session": {
                    "sessionId": "s-1",
                    "testId": "t-1",
                    "studentId": "u-1",
                    "serverStartedAt": "2025-03-01T09:00:00Z",
                    "serverDurationSeconds": 1800
                },
                "status": "active",
                "serverTime": "2025-03-01T09:10:00Z",
                "timeRemaining": 1200,
                "answers": [{"questionId": "Q1", "value": "A", "version": 4}]
            }
        });

        let envelope: Envelope<RemoteSession> = serde_json::from_value(body).expect("decode");
        assert!(envelope.success);
        let remote = envelope.data.expect("data");
        assert_eq!(remote.status, RemoteStatus::Active);
        assert_eq!(remote.session.server_duration_seconds, 1800);
        assert_eq!(remote.answers[0].version, 4);
    }

    #[test]
    fn failed_envelope_has_no_data() {
        let envelope: Envelope<RemoteSession> =
            serde_json::from_value(json!({"success": false, "message": "test window closed"}))
                .expect("decode");
        assert!(!envelope.success);
        assert!(envelope.data.is_none());
        assert_eq!(envelope.message, "test window closed");
    }
}
