use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::session::machine::{SessionSnapshot, SubmitOutcome};
use crate::session::types::{ExamResult, Phase, SessionFailure};

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct StartSessionRequest {
    #[serde(alias = "testId")]
    #[validate(length(min = 1, max = 128, message = "test_id must be 1..=128 characters"))]
    pub(crate) test_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct RecordAnswerRequest {
    #[validate(length(min = 1, max = 128, message = "question_id must be 1..=128 characters"))]
    pub(crate) question_id: String,
    pub(crate) value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AnswerBody {
    pub(crate) value: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub(crate) struct SessionResponse {
    pub(crate) session_id: String,
    pub(crate) phase: Phase,
    pub(crate) remaining_seconds: Option<u64>,
    pub(crate) connected: bool,
    pub(crate) dirty_answers: usize,
    pub(crate) blocked_on_unsaved: Option<usize>,
    pub(crate) submit_attempts: u32,
    pub(crate) error: Option<SessionFailure>,
}

impl From<SessionSnapshot> for SessionResponse {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            phase: snapshot.phase,
            remaining_seconds: snapshot.remaining_seconds,
            connected: snapshot.connected,
            dirty_answers: snapshot.dirty_answers,
            blocked_on_unsaved: snapshot.blocked_on_unsaved,
            submit_attempts: snapshot.submit_attempts,
            error: snapshot.failure,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct RecordAnswerResponse {
    pub(crate) question_id: String,
    pub(crate) local_version: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct SubmitResponse {
    pub(crate) outcome: SubmitOutcome,
    pub(crate) phase: Phase,
}

#[derive(Debug, Serialize)]
pub(crate) struct ResultResponse {
    pub(crate) session_id: String,
    pub(crate) score: f64,
    pub(crate) total: f64,
    pub(crate) status: String,
    #[serde(rename = "releasedFlag")]
    pub(crate) released: bool,
}

impl From<ExamResult> for ResultResponse {
    fn from(result: ExamResult) -> Self {
        Self {
            session_id: result.session_id,
            score: result.score,
            total: result.total,
            status: result.status,
            released: result.released,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct EndedResponse {
    pub(crate) session_id: String,
    pub(crate) ended: bool,
    pub(crate) phase: Phase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_id_length_is_bounded() {
        let empty = RecordAnswerRequest { question_id: String::new(), value: serde_json::Value::Null };
        assert!(empty.validate().is_err());

        let long = RecordAnswerRequest { question_id: "q".repeat(129), value: serde_json::Value::Null };
        assert!(long.validate().is_err());

        let ok = RecordAnswerRequest { question_id: "q".repeat(128), value: serde_json::json!(1) };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn start_request_accepts_camel_case() {
        let request: StartSessionRequest =
            serde_json::from_str(r#"{"testId":"t-1"}"#).expect("decode");
        assert_eq!(request.test_id, "t-1");
        assert!(request.validate().is_ok());
    }
}
