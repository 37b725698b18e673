use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use thiserror::Error;

use crate::core::config::EngineSettings;
use crate::core::time::{millis, Moment};
use crate::schemas::wire::{
    AckMessage, AnchorMessage, EditBatch, FinalizeMessage, Heartbeat, InboundMessage,
    OutboundMessage, SubmitRequest,
};
use crate::session::answers::{AckOutcome, AnswerBuffer};
use crate::session::clock::{ClockAnchor, SessionClock};
use crate::session::record::{SessionRecord, RECORD_FORMAT};
use crate::session::types::{
    submit_idempotency_key, ExamSession, Phase, SessionFailure, SubmitTrigger,
};


/// Side effects requested by the state machine; the driver executes them.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    Send(OutboundMessage),
    SubmitViaHttp { attempt: u64, idempotency_key: String },
    Persist(SessionRecord),
    ClearCache,
    Materialize(FinalizeMessage),
    Ended(Phase),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum SessionError {
    #[error("session is {phase}; cannot {operation}")]
    NotAccepting { phase: &'static str, operation: &'static str },
    #[error("question id must not be empty")]
    EmptyQuestionId,
    #[error("session {0} already has a running driver")]
    AlreadyRunning(String),
    #[error("session driver has stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SubmitOutcome {
    Started,
    AlreadySubmitting,
    AlreadyFinished,
}

/// Result of a submit sent over the HTTP fallback while the channel was down.
/// Delivered back with the `attempt` of the command that produced it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HttpSubmitOutcome {
    Finalized(FinalizeMessage),
    Rejected(String),
    Failed(String),
}

/// What the rest of the application may observe about a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct SessionSnapshot {
    pub(crate) session_id: String,
    pub(crate) phase: Phase,
    pub(crate) remaining_seconds: Option<u64>,
    pub(crate) connected: bool,
    pub(crate) dirty_answers: usize,
    pub(crate) blocked_on_unsaved: Option<usize>,
    pub(crate) submit_attempts: u32,
    pub(crate) failure: Option<SessionFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubmitTransport {
    Channel,
    Http,
}

#[derive(Debug, Clone, Copy)]
struct SubmitInflight {
    until: Instant,
    via: SubmitTransport,
    seq: u64,
}

#[derive(Debug, Clone)]
struct SubmitProgress {
    trigger: SubmitTrigger,
    attempts: u32,
    inflight: Option<SubmitInflight>,
    next_attempt_at: Instant,
}

/// Owns one attempt from start to a server-confirmed end.
///
/// Every input is a method taking the current [`Moment`]; every effect is a
/// [`Command`] collected in an outbox the caller drains with
/// [`SessionStateMachine::take_commands`]. Nothing here performs I/O.
pub(crate) struct SessionStateMachine {
    session: ExamSession,
    settings: EngineSettings,
    idempotency_key: String,
    phase: Phase,
    connected: bool,
    clock: SessionClock,
    answers: AnswerBuffer,
    submit: Option<SubmitProgress>,
    pending_submit: Option<SubmitTrigger>,
    failure: Option<SessionFailure>,
    revalidate_requested_at: Option<Instant>,
    // Numbers every submit attempt across retries so late HTTP results can be matched.
    submit_seq: u64,
    rng: StdRng,
    outbox: Vec<Command>,
}

impl SessionStateMachine {
    pub(crate) fn new(session: ExamSession, settings: EngineSettings) -> Self {
        let idempotency_key = submit_idempotency_key(&session.session_id);
        Self {
            session,
            settings,
            idempotency_key,
            phase: Phase::Idle,
            connected: false,
            clock: SessionClock::new(),
            answers: AnswerBuffer::new(),
            submit: None,
            pending_submit: None,
            failure: None,
            revalidate_requested_at: None,
            submit_seq: 0,
            rng: StdRng::seed_from_u64(rand::random()),
            outbox: Vec::new(),
        }
    }

    /// Rebuilds a session from a validated cache record and enters `Connecting`.
    /// The cached clock is only provisional until the authority re-anchors it.
    pub(crate) fn resume(record: SessionRecord, settings: EngineSettings, now: Moment) -> Self {
        let dirty = record.dirty_count();
        let mut machine = Self::new(record.session, settings);
        machine.answers = AnswerBuffer::restore(record.answers, now.mono);
        if let Some(stored) = record.anchor {
            machine.clock.apply(ClockAnchor::extrapolated(&stored, now));
        }
        machine.pending_submit = match record.phase {
            Phase::Submitting => record.pending_submit.or(Some(SubmitTrigger::ManualSubmit)),
            Phase::Errored if record.failure.as_ref().is_some_and(|failure| failure.retriable) => {
                record.pending_submit.or(Some(SubmitTrigger::ManualSubmit))
            }
            _ => None,
        };

        tracing::info!(
            session_id = %machine.session.session_id,
            cached_phase = record.phase.as_str(),
            dirty_answers = dirty,
            provisional_remaining = ?machine.clock.remaining_seconds(now.mono),
            "Resuming exam session from cache"
        );
        machine.transition(Phase::Connecting, now);
        machine
    }

    pub(crate) fn start(&mut self, now: Moment) -> Result<(), SessionError> {
        if self.phase != Phase::Idle {
            return Err(self.not_accepting("start"));
        }
        self.transition(Phase::Connecting, now);
        Ok(())
    }

    pub(crate) fn session(&self) -> &ExamSession {
        &self.session
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub(crate) fn remaining_seconds(&self, now: Instant) -> Option<u64> {
        self.clock.remaining_seconds(now)
    }

    pub(crate) fn answers(&self) -> &AnswerBuffer {
        &self.answers
    }

    pub(crate) fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn snapshot(&self, now: Instant) -> SessionSnapshot {
        let dirty = self.answers.dirty_count();
        SessionSnapshot {
            session_id: self.session.session_id.clone(),
            phase: self.phase,
            remaining_seconds: self.clock.remaining_seconds(now),
            connected: self.connected,
            dirty_answers: dirty,
            blocked_on_unsaved: (self.phase == Phase::Submitting && dirty > 0).then_some(dirty),
            submit_attempts: self.submit.as_ref().map_or(0, |progress| progress.attempts),
            failure: self.failure.clone(),
        }
    }

    pub(crate) fn to_record(&self, now: Moment) -> SessionRecord {
        SessionRecord {
            format: RECORD_FORMAT,
            session: self.session.clone(),
            phase: self.phase,
            anchor: self.clock.anchor().map(|anchor| anchor.to_stored(now)),
            answers: self.answers.answers().cloned().collect(),
            pending_submit: self.submit.as_ref().map(|progress| progress.trigger).or(self.pending_submit),
            failure: self.failure.clone(),
            written_at: now.wall,
        }
    }

    pub(crate) fn on_channel_up(&mut self, now: Moment) {
        if self.phase.is_terminal() || self.phase == Phase::Idle {
            return;
        }
        self.connected = true;
        self.revalidate_requested_at = None;

        if matches!(self.phase, Phase::Active | Phase::Submitting) {
            self.answers.schedule_now(now.mono);
            if let Some(progress) = self.submit.as_mut() {
                if progress.inflight.is_none() {
                    progress.next_attempt_at = now.mono;
                }
            }
            self.persist(now);
            self.pump(now);
        }
    }

    pub(crate) fn on_channel_down(&mut self, now: Moment) {
        if self.phase.is_terminal() || !self.connected {
            return;
        }
        self.connected = false;
        tracing::warn!(
            session_id = %self.session.session_id,
            phase = self.phase.as_str(),
            dirty_answers = self.answers.dirty_count(),
            "Exam authority channel lost; keeping session alive"
        );

        if let Some(retry_in) =
            self.answers.fail_inflight(now.mono, &self.settings.flush_backoff, &mut self.rng)
        {
            metrics::counter!("exam_flush_batches_total", "outcome" => "disconnected").increment(1);
            tracing::debug!(
                session_id = %self.session.session_id,
                retry_in_ms = millis(retry_in),
                "Autosave batch abandoned with the connection"
            );
        }

        let channel_submit_lost = self
            .submit
            .as_ref()
            .and_then(|progress| progress.inflight)
            .is_some_and(|inflight| inflight.via == SubmitTransport::Channel);
        if channel_submit_lost {
            self.submit_attempt_failed("channel dropped before submit acknowledgment", now);
        }
    }

    pub(crate) fn on_message(&mut self, message: InboundMessage, now: Moment) {
        match message {
            InboundMessage::Anchor(anchor) => self.on_anchor(&anchor, now),
            InboundMessage::Ack(ack) => self.on_ack(&ack, now),
            InboundMessage::Finalize(finalize) => self.on_finalize(finalize, now),
            InboundMessage::Reject(reject) => self.on_reject(reject.reason, now),
        }
    }

    /// A finalization or rejection is authoritative whichever attempt carried
    /// it. A failure only counts against the HTTP attempt still in flight.
    pub(crate) fn on_http_submit(&mut self, attempt: u64, outcome: HttpSubmitOutcome, now: Moment) {
        match outcome {
            HttpSubmitOutcome::Finalized(finalize) => self.on_finalize(finalize, now),
            HttpSubmitOutcome::Rejected(reason) => self.on_reject(reason, now),
            HttpSubmitOutcome::Failed(reason) => {
                let current = self
                    .submit
                    .as_ref()
                    .and_then(|progress| progress.inflight)
                    .is_some_and(|inflight| {
                        inflight.via == SubmitTransport::Http && inflight.seq == attempt
                    });
                if self.phase == Phase::Submitting && current {
                    self.submit_attempt_failed(&reason, now);
                } else {
                    tracing::debug!(
                        session_id = %self.session.session_id,
                        attempt,
                        reason = %reason,
                        "Ignoring failure of a superseded submit attempt"
                    );
                }
            }
        }
    }

    /// Stores an edit. Only an `Active` session accepts answers.
    pub(crate) fn record(
        &mut self,
        question_id: &str,
        value: serde_json::Value,
        now: Moment,
    ) -> Result<u64, SessionError> {
        if question_id.trim().is_empty() {
            return Err(SessionError::EmptyQuestionId);
        }
        if self.phase != Phase::Active {
            return Err(self.not_accepting("record answers"));
        }

        let version =
            self.answers.record(question_id, value, now.mono, self.settings.autosave_debounce);
        self.persist(now);
        self.pump(now);
        Ok(version)
    }

    /// Duplicate triggers collapse: only the first one from `Active` starts a submit.
    pub(crate) fn submit(&mut self, now: Moment) -> Result<SubmitOutcome, SessionError> {
        match self.phase {
            Phase::Active => {
                self.enter_submitting(SubmitTrigger::ManualSubmit, now);
                Ok(SubmitOutcome::Started)
            }
            Phase::Submitting => {
                tracing::debug!(session_id = %self.session.session_id, "Collapsing duplicate submit");
                Ok(SubmitOutcome::AlreadySubmitting)
            }
            Phase::Submitted | Phase::Expired => Ok(SubmitOutcome::AlreadyFinished),
            _ => Err(self.not_accepting("submit")),
        }
    }

    /// Re-enters `Submitting` after retries ran out. Rejections are final.
    pub(crate) fn retry_submit(&mut self, now: Moment) -> Result<(), SessionError> {
        let retriable = self.failure.as_ref().is_some_and(|failure| failure.retriable);
        if self.phase != Phase::Errored || !retriable {
            return Err(self.not_accepting("retry submit"));
        }
        let trigger = self.pending_submit.take().unwrap_or(SubmitTrigger::ManualSubmit);
        self.failure = None;
        self.enter_submitting(trigger, now);
        Ok(())
    }

    pub(crate) fn tick(&mut self, now: Moment) {
        self.pump(now);
    }

    fn on_anchor(&mut self, message: &AnchorMessage, now: Moment) {
        if self.phase.is_terminal() || self.phase == Phase::Idle {
            tracing::debug!(
                session_id = %self.session.session_id,
                phase = self.phase.as_str(),
                "Ignoring clock anchor"
            );
            return;
        }

        let applied = self.clock.apply(ClockAnchor::from_message(message, now));
        if !applied {
            tracing::debug!(session_id = %self.session.session_id, "Ignoring superseded clock anchor");
            return;
        }
        self.revalidate_requested_at = None;

        match self.phase {
            Phase::Connecting => {
                if let Some(trigger) = self.pending_submit.take() {
                    self.enter_submitting(trigger, now);
                    return;
                }
                if self.clock.remaining_millis(now.mono).unwrap_or(0) > 0 {
                    self.transition(Phase::Active, now);
                    self.answers.schedule_now(now.mono);
                } else {
                    tracing::info!(
                        session_id = %self.session.session_id,
                        "Authority reports no time left; session expired"
                    );
                    self.transition(Phase::Expired, now);
                }
            }
            Phase::Active => self.persist(now),
            _ => {}
        }
        self.pump(now);
    }

    fn on_ack(&mut self, ack: &AckMessage, now: Moment) {
        if self.phase.is_terminal() || self.phase == Phase::Idle {
            return;
        }

        match self.answers.acknowledge(&ack.question_id, ack.version) {
            AckOutcome::Advanced { batch_complete } => {
                metrics::counter!("exam_answers_acked_total").increment(1);
                if batch_complete {
                    metrics::counter!("exam_flush_batches_total", "outcome" => "acked").increment(1);
                }
                self.persist(now);
            }
            AckOutcome::Stale => {
                tracing::debug!(
                    session_id = %self.session.session_id,
                    question_id = %ack.question_id,
                    version = ack.version,
                    "Ignoring stale acknowledgment"
                );
            }
            AckOutcome::Ahead | AckOutcome::NeverSent | AckOutcome::UnknownQuestion => {
                tracing::warn!(
                    session_id = %self.session.session_id,
                    question_id = %ack.question_id,
                    version = ack.version,
                    "Acknowledgment does not match any sent edit"
                );
            }
        }
        self.pump(now);
    }

    fn on_finalize(&mut self, finalize: FinalizeMessage, now: Moment) {
        match self.phase {
            Phase::Idle => {
                tracing::warn!(session_id = %self.session.session_id, "Finalization before start");
            }
            Phase::Submitted | Phase::Expired => {
                self.outbox.push(Command::Materialize(finalize));
            }
            phase => {
                if phase != Phase::Submitting {
                    tracing::info!(
                        session_id = %self.session.session_id,
                        phase = phase.as_str(),
                        "Authority finalized the session without a local submit"
                    );
                }
                self.outbox.push(Command::Materialize(finalize));
                self.failure = None;
                self.transition(Phase::Submitted, now);
            }
        }
    }

    fn on_reject(&mut self, reason: String, now: Moment) {
        if self.phase.is_terminal() {
            tracing::warn!(
                session_id = %self.session.session_id,
                reason = %reason,
                "Ignoring rejection for a finished session"
            );
            return;
        }

        tracing::warn!(session_id = %self.session.session_id, reason = %reason, "Authority rejected the session");
        self.submit = None;
        self.pending_submit = None;
        self.failure = Some(SessionFailure { reason, retriable: false });
        if self.phase == Phase::Errored {
            self.persist(now);
        } else {
            self.transition(Phase::Errored, now);
        }
    }

    fn enter_submitting(&mut self, trigger: SubmitTrigger, now: Moment) {
        tracing::info!(
            session_id = %self.session.session_id,
            trigger = trigger.as_str(),
            dirty_answers = self.answers.dirty_count(),
            "Submitting exam session"
        );
        self.submit = Some(SubmitProgress {
            trigger,
            attempts: 0,
            inflight: None,
            next_attempt_at: now.mono,
        });
        self.pending_submit = None;
        self.answers.reset_failures();
        self.answers.schedule_now(now.mono);
        self.transition(Phase::Submitting, now);
        self.pump(now);
    }

    fn pump(&mut self, now: Moment) {
        match self.phase {
            Phase::Active => {
                self.pump_flush(now);
                self.check_deadline(now);
            }
            Phase::Submitting => {
                self.pump_flush(now);
                self.pump_submit(now);
            }
            _ => {}
        }
    }

    fn pump_flush(&mut self, now: Moment) {
        if self.answers.inflight_expired(now.mono) {
            if let Some(retry_in) =
                self.answers.fail_inflight(now.mono, &self.settings.flush_backoff, &mut self.rng)
            {
                metrics::counter!("exam_flush_batches_total", "outcome" => "timeout").increment(1);
                tracing::warn!(
                    session_id = %self.session.session_id,
                    failures = self.answers.failures(),
                    retry_in_ms = millis(retry_in),
                    "Autosave flush timed out"
                );
            }
        }

        if !self.connected || !self.answers.flush_due(now.mono) {
            return;
        }
        let answers = self.answers.begin_flush(now.mono, self.settings.flush_timeout);
        if answers.is_empty() {
            return;
        }
        metrics::counter!("exam_flush_batches_total", "outcome" => "sent").increment(1);
        tracing::debug!(
            session_id = %self.session.session_id,
            answers = answers.len(),
            "Flushing dirty answers"
        );
        self.outbox.push(Command::Send(OutboundMessage::EditBatch(EditBatch {
            session_id: self.session.session_id.clone(),
            answers,
        })));
    }

    /// Sends the submit request once every answer is acknowledged.
    fn pump_submit(&mut self, now: Moment) {
        if self.answers.is_dirty() {
            if self.answers.failures() >= self.settings.drain_max_attempts {
                self.fail_submit("unsaved answers could not be delivered".to_string(), now);
            }
            return;
        }

        let Some(progress) = self.submit.as_mut() else {
            return;
        };
        if let Some(inflight) = progress.inflight {
            if now.mono >= inflight.until {
                self.submit_attempt_failed("submit acknowledgment timed out", now);
            }
            return;
        }
        if now.mono < progress.next_attempt_at {
            return;
        }

        progress.attempts += 1;
        self.submit_seq += 1;
        let seq = self.submit_seq;
        let until = now.after(self.settings.submit_timeout);
        let attempt = progress.attempts;
        if self.connected {
            progress.inflight = Some(SubmitInflight { until, via: SubmitTransport::Channel, seq });
            self.outbox.push(Command::Send(OutboundMessage::SubmitRequest(SubmitRequest {
                session_id: self.session.session_id.clone(),
                idempotency_key: self.idempotency_key.clone(),
            })));
        } else {
            progress.inflight = Some(SubmitInflight { until, via: SubmitTransport::Http, seq });
            self.outbox.push(Command::SubmitViaHttp {
                attempt: seq,
                idempotency_key: self.idempotency_key.clone(),
            });
        }
        metrics::counter!("exam_submit_requests_total").increment(1);
        tracing::info!(
            session_id = %self.session.session_id,
            attempt,
            over_channel = self.connected,
            "Submit request sent"
        );
    }

    fn submit_attempt_failed(&mut self, reason: &str, now: Moment) {
        let Some(attempts) = self.submit.as_mut().map(|progress| {
            progress.inflight = None;
            progress.attempts
        }) else {
            return;
        };

        if self.settings.submit_backoff.exhausted(attempts) {
            self.fail_submit(format!("{reason} after {attempts} attempts"), now);
            return;
        }

        let retry_in = self.settings.submit_backoff.delay(attempts, &mut self.rng);
        if let Some(progress) = self.submit.as_mut() {
            progress.next_attempt_at = now.after(retry_in);
        }
        tracing::warn!(
            session_id = %self.session.session_id,
            attempts,
            retry_in_ms = millis(retry_in),
            reason,
            "Submit attempt failed"
        );
    }

    fn fail_submit(&mut self, reason: String, now: Moment) {
        self.pending_submit = self.submit.take().map(|progress| progress.trigger);
        tracing::warn!(session_id = %self.session.session_id, reason = %reason, "Submit gave up");
        self.failure = Some(SessionFailure { reason, retriable: true });
        self.transition(Phase::Errored, now);
    }

    /// The countdown alone never ends a session; a stale anchor is re-validated first.
    fn check_deadline(&mut self, now: Moment) {
        if self.clock.remaining_millis(now.mono) != Some(0) {
            return;
        }
        if self.clock.poll_zero_crossing(now.mono) {
            tracing::info!(session_id = %self.session.session_id, "Local countdown reached zero");
        }
        if self.clock.corroborates_expiry(now.mono, self.settings.anchor_max_age) {
            self.enter_submitting(SubmitTrigger::AutoDeadline, now);
            return;
        }
        if !self.connected {
            return;
        }

        let due = self.revalidate_requested_at.map_or(true, |at| {
            now.mono.saturating_duration_since(at) >= self.settings.revalidate_interval
        });
        if due {
            self.revalidate_requested_at = Some(now.mono);
            tracing::debug!(
                session_id = %self.session.session_id,
                "Re-validating expired countdown against the authority"
            );
            self.outbox.push(Command::Send(OutboundMessage::Heartbeat(Heartbeat {
                session_id: self.session.session_id.clone(),
            })));
        }
    }

    fn transition(&mut self, to: Phase, now: Moment) {
        let from = self.phase;
        if from == to {
            return;
        }
        if from.is_terminal() {
            tracing::warn!(
                session_id = %self.session.session_id,
                from = from.as_str(),
                to = to.as_str(),
                "Refusing to leave a terminal phase"
            );
            return;
        }

        tracing::info!(
            session_id = %self.session.session_id,
            from = from.as_str(),
            to = to.as_str(),
            "Exam session phase changed"
        );
        metrics::counter!("exam_phase_transitions_total", "to" => to.as_str()).increment(1);
        self.phase = to;

        if to.is_terminal() {
            self.submit = None;
            self.outbox.push(Command::ClearCache);
            self.outbox.push(Command::Ended(to));
        } else {
            self.persist(now);
        }
    }

    fn persist(&mut self, now: Moment) {
        let record = self.to_record(now);
        self.outbox.push(Command::Persist(record));
    }

    fn not_accepting(&self, operation: &'static str) -> SessionError {
        SessionError::NotAccepting { phase: self.phase.as_str(), operation }
    }
}
