use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::backoff::BackoffPolicy;
use crate::schemas::wire::AnswerPayload;

/// One response to one question. `acked_version <= local_version` always.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Answer {
    pub(crate) question_id: String,
    pub(crate) value: serde_json::Value,
    pub(crate) local_version: u64,
    pub(crate) acked_version: u64,
}

impl Answer {
    pub(crate) fn is_dirty(&self) -> bool {
        self.acked_version < self.local_version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    /// The acknowledged version was newer than anything confirmed before.
    Advanced { batch_complete: bool },
    /// Already covered by an earlier acknowledgment.
    Stale,
    /// Claims a version this buffer never produced.
    Ahead,
    /// Names a version that exists locally but never went out in a batch.
    NeverSent,
    UnknownQuestion,
}

#[derive(Debug, Clone)]
struct InflightBatch {
    versions: BTreeMap<String, u64>,
    deadline: Instant,
}

/// In-memory answer state with dirty tracking and autosave scheduling.
#[derive(Debug, Clone, Default)]
pub(crate) struct AnswerBuffer {
    answers: BTreeMap<String, Answer>,
    // Versions sent per question that no acknowledgment has covered yet.
    sent: BTreeMap<String, BTreeSet<u64>>,
    inflight: Option<InflightBatch>,
    next_flush_at: Option<Instant>,
    failures: u32,
}

impl AnswerBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a buffer from persisted answers; dirty entries flush as soon
    /// as a connection allows.
    pub(crate) fn restore(answers: Vec<Answer>, now: Instant) -> Self {
        let mut buffer = Self::new();
        for answer in answers {
            buffer.answers.insert(answer.question_id.clone(), answer);
        }
        if buffer.is_dirty() {
            buffer.next_flush_at = Some(now);
        }
        buffer
    }

    /// Stores an edit, bumps its version and schedules a debounced flush.
    pub(crate) fn record(
        &mut self,
        question_id: &str,
        value: serde_json::Value,
        now: Instant,
        debounce: Duration,
    ) -> u64 {
        let answer = self.answers.entry(question_id.to_string()).or_insert_with(|| Answer {
            question_id: question_id.to_string(),
            value: serde_json::Value::Null,
            local_version: 0,
            acked_version: 0,
        });
        answer.value = value;
        answer.local_version += 1;
        let version = answer.local_version;

        let due = now + debounce;
        self.next_flush_at = Some(self.next_flush_at.map_or(due, |at| at.min(due)));
        version
    }

    pub(crate) fn get(&self, question_id: &str) -> Option<&Answer> {
        self.answers.get(question_id)
    }

    pub(crate) fn answers(&self) -> impl Iterator<Item = &Answer> {
        self.answers.values()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.answers.values().any(Answer::is_dirty)
    }

    pub(crate) fn dirty_count(&self) -> usize {
        self.answers.values().filter(|answer| answer.is_dirty()).count()
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn has_inflight(&self) -> bool {
        self.inflight.is_some()
    }

    /// Pulls the next flush forward to `now`, overriding any backoff.
    pub(crate) fn schedule_now(&mut self, now: Instant) {
        if self.is_dirty() {
            self.next_flush_at = Some(now);
        }
    }

    /// A flush is due when its time has come and some dirty answer is not
    /// already covered by the batch in flight.
    pub(crate) fn flush_due(&self, now: Instant) -> bool {
        let Some(at) = self.next_flush_at else {
            return false;
        };
        now >= at && self.has_unsent_edits()
    }

    fn has_unsent_edits(&self) -> bool {
        self.answers.values().filter(|answer| answer.is_dirty()).any(|answer| {
            self.inflight
                .as_ref()
                .and_then(|batch| batch.versions.get(&answer.question_id))
                .map_or(true, |sent| *sent < answer.local_version)
        })
    }

    /// Collects every dirty answer into one batch. A batch already in flight
    /// is superseded; its late acknowledgments are still version-gated.
    pub(crate) fn begin_flush(&mut self, now: Instant, timeout: Duration) -> Vec<AnswerPayload> {
        let batch: Vec<AnswerPayload> = self
            .answers
            .values()
            .filter(|answer| answer.is_dirty())
            .map(|answer| AnswerPayload {
                question_id: answer.question_id.clone(),
                value: answer.value.clone(),
                local_version: answer.local_version,
            })
            .collect();

        self.next_flush_at = None;
        if batch.is_empty() {
            return batch;
        }

        for payload in &batch {
            self.sent.entry(payload.question_id.clone()).or_default().insert(payload.local_version);
        }
        let versions = batch
            .iter()
            .map(|payload| (payload.question_id.clone(), payload.local_version))
            .collect();
        self.inflight = Some(InflightBatch { versions, deadline: now + timeout });
        batch
    }

    /// Raises `acked_version` when the authority confirms a version that was
    /// sent and is newer than the last confirmed one.
    pub(crate) fn acknowledge(&mut self, question_id: &str, version: u64) -> AckOutcome {
        let Some(answer) = self.answers.get_mut(question_id) else {
            return AckOutcome::UnknownQuestion;
        };
        if version > answer.local_version {
            return AckOutcome::Ahead;
        }
        if version <= answer.acked_version {
            return AckOutcome::Stale;
        }
        let Some(sent) = self.sent.get_mut(question_id).filter(|sent| sent.contains(&version)) else {
            return AckOutcome::NeverSent;
        };
        answer.acked_version = version;
        sent.retain(|sent_version| *sent_version > version);
        if sent.is_empty() {
            self.sent.remove(question_id);
        }

        let batch_complete = match &self.inflight {
            Some(batch) => batch.versions.iter().all(|(id, sent)| {
                self.answers.get(id).is_some_and(|answer| answer.acked_version >= *sent)
            }),
            None => false,
        };
        if batch_complete {
            self.inflight = None;
            self.failures = 0;
        }
        AckOutcome::Advanced { batch_complete }
    }

    pub(crate) fn inflight_expired(&self, now: Instant) -> bool {
        self.inflight.as_ref().is_some_and(|batch| now >= batch.deadline)
    }

    /// Drops the in-flight batch as failed and backs off the next attempt.
    /// Nothing is discarded: every unacknowledged edit stays dirty.
    pub(crate) fn fail_inflight<R: Rng + ?Sized>(
        &mut self,
        now: Instant,
        policy: &BackoffPolicy,
        rng: &mut R,
    ) -> Option<Duration> {
        self.inflight.take()?;
        self.failures = self.failures.saturating_add(1);
        let delay = policy.delay(self.failures, rng);
        if self.is_dirty() {
            self.next_flush_at = Some(now + delay);
        }
        Some(delay)
    }

    pub(crate) fn reset_failures(&mut self) {
        self.failures = 0;
    }
}
