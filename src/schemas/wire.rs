//! JSON text frames exchanged with the exam authority over the duplex channel.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Frames the authority pushes to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum InboundMessage {
    Anchor(AnchorMessage),
    Ack(AckMessage),
    Finalize(FinalizeMessage),
    Reject(RejectMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AnchorMessage {
    #[serde(alias = "serverTimestamp", with = "time::serde::rfc3339")]
    pub(crate) server_timestamp: OffsetDateTime,
    /// May be negative when the authority reports an overrun deadline.
    #[serde(alias = "remainingSeconds")]
    pub(crate) remaining_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AckMessage {
    #[serde(alias = "questionId")]
    pub(crate) question_id: String,
    pub(crate) version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct FinalizeMessage {
    pub(crate) score: f64,
    pub(crate) total: f64,
    pub(crate) status: String,
    #[serde(default, alias = "releasedFlag")]
    pub(crate) released: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RejectMessage {
    pub(crate) reason: String,
}

/// Frames the client sends to the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum OutboundMessage {
    EditBatch(EditBatch),
    SubmitRequest(SubmitRequest),
    Heartbeat(Heartbeat),
}

impl OutboundMessage {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::EditBatch(_) => "edit_batch",
            OutboundMessage::SubmitRequest(_) => "submit_request",
            OutboundMessage::Heartbeat(_) => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct EditBatch {
    pub(crate) session_id: String,
    pub(crate) answers: Vec<AnswerPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AnswerPayload {
    pub(crate) question_id: String,
    pub(crate) value: serde_json::Value,
    pub(crate) local_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SubmitRequest {
    pub(crate) session_id: String,
    pub(crate) idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Heartbeat {
    pub(crate) session_id: String,
}

pub(crate) fn decode_inbound(frame: &str) -> Result<InboundMessage, serde_json::Error> {
    serde_json::from_str(frame)
}

pub(crate) fn encode_outbound(message: &OutboundMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
