use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::Instrument;
use uuid::Uuid;

use crate::core::config::ChannelSettings;
use crate::core::time::Moment;
use crate::repositories::session_cache::SessionCache;
use crate::services::authority_client::{AuthorityError, ExamAuthority};
use crate::services::channel::{self, ChannelEvent, ChannelHandle, Connector};
use crate::session::machine::{
    Command, HttpSubmitOutcome, SessionError, SessionSnapshot, SessionStateMachine, SubmitOutcome,
};
use crate::session::record::SessionRecord;
use crate::session::result::ResultMaterializer;
use crate::session::types::Phase;


const REQUEST_BUFFER: usize = 32;

/// Collaborators shared by every session driver.
#[derive(Clone)]
pub(crate) struct EngineContext {
    pub(crate) cache: SessionCache,
    pub(crate) authority: Arc<dyn ExamAuthority>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) materializer: ResultMaterializer,
    pub(crate) channel: ChannelSettings,
    pub(crate) tick_interval: Duration,
}

enum DriverRequest {
    Record {
        question_id: String,
        value: serde_json::Value,
        reply: oneshot::Sender<Result<u64, SessionError>>,
    },
    Submit {
        reply: oneshot::Sender<Result<SubmitOutcome, SessionError>>,
    },
    RetrySubmit {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// The only way the rest of the process reaches a running session.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    session_id: String,
    requests: mpsc::Sender<DriverRequest>,
    snapshot: watch::Receiver<SessionSnapshot>,
    ended: watch::Receiver<Option<Phase>>,
}

impl SessionHandle {
    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn ended_phase(&self) -> Option<Phase> {
        *self.ended.borrow()
    }

    /// True once the driver task has exited and dropped its request queue.
    pub(crate) fn is_stopped(&self) -> bool {
        self.requests.is_closed()
    }

    pub(crate) async fn record(
        &self,
        question_id: String,
        value: serde_json::Value,
    ) -> Result<u64, SessionError> {
        self.call(|reply| DriverRequest::Record { question_id, value, reply }).await
    }

    pub(crate) async fn submit(&self) -> Result<SubmitOutcome, SessionError> {
        if self.ended_phase().is_some() {
            return Ok(SubmitOutcome::AlreadyFinished);
        }
        self.call(|reply| DriverRequest::Submit { reply }).await
    }

    pub(crate) async fn retry_submit(&self) -> Result<(), SessionError> {
        self.call(|reply| DriverRequest::RetrySubmit { reply }).await
    }

    /// Resolves with the terminal phase once the test ended, or `None` if the
    /// driver stopped first (process shutdown).
    pub(crate) async fn ended(&self) -> Option<Phase> {
        let mut ended = self.ended.clone();
        if let Ok(phase) = ended.wait_for(Option::is_some).await {
            return *phase;
        }
        let phase = *ended.borrow();
        phase
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> DriverRequest,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.requests.send(build(reply)).await.map_err(|_| SessionError::Stopped)?;
        response.await.map_err(|_| SessionError::Stopped)?
    }
}

/// Spawns the task that exclusively owns `machine` for the rest of its life.
pub(crate) fn spawn(
    machine: SessionStateMachine,
    context: EngineContext,
    shutdown: watch::Receiver<bool>,
) -> (SessionHandle, JoinHandle<()>) {
    let session_id = machine.session_id().to_string();
    let (requests_tx, requests) = mpsc::channel(REQUEST_BUFFER);
    let (snapshot_tx, snapshot) = watch::channel(machine.snapshot(Moment::now().mono));
    let (ended_tx, ended) = watch::channel(None);
    let (events_tx, events) = mpsc::channel(REQUEST_BUFFER);
    let (http_tx, http_results) = mpsc::channel(4);
    let (channel_stop, channel_stop_rx) = watch::channel(false);

    let (channel, channel_task) = channel::spawn(
        session_id.clone(),
        context.connector.clone(),
        context.channel.clone(),
        events_tx,
        channel_stop_rx,
    );

    let driver = SessionDriver {
        session_id: session_id.clone(),
        machine,
        context,
        channel,
        channel_task,
        channel_stop,
        events,
        requests,
        http_tx,
        http_results,
        snapshot_tx,
        ended_tx,
        shutdown,
    };
    // New id per spawn, so a resumed session shows up as a separate run.
    let span = tracing::info_span!("session_driver", session_id = %session_id, driver_id = %Uuid::new_v4());
    let handle = SessionHandle { session_id, requests: requests_tx, snapshot, ended };
    (handle, tokio::spawn(driver.run().instrument(span)))
}

struct SessionDriver {
    session_id: String,
    machine: SessionStateMachine,
    context: EngineContext,
    channel: ChannelHandle,
    channel_task: JoinHandle<()>,
    channel_stop: watch::Sender<bool>,
    events: mpsc::Receiver<ChannelEvent>,
    requests: mpsc::Receiver<DriverRequest>,
    http_tx: mpsc::Sender<(u64, HttpSubmitOutcome)>,
    http_results: mpsc::Receiver<(u64, HttpSubmitOutcome)>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    ended_tx: watch::Sender<Option<Phase>>,
    shutdown: watch::Receiver<bool>,
}

impl SessionDriver {
    async fn run(mut self) {
        tracing::info!(session_id = %self.session_id, phase = self.machine.phase().as_str(), "Session driver started");
        let mut tick = interval(self.context.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut channel_open = true;
        let mut requests_open = true;

        let commands = self.machine.take_commands();
        self.execute(commands).await;
        self.publish();

        while !self.machine.phase().is_terminal() {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        self.persist_final().await;
                        break;
                    }
                }
                _ = tick.tick() => self.machine.tick(Moment::now()),
                event = self.events.recv(), if channel_open => match event {
                    Some(ChannelEvent::Connected | ChannelEvent::Reconnected) => {
                        self.machine.on_channel_up(Moment::now());
                    }
                    Some(ChannelEvent::Disconnected) => self.machine.on_channel_down(Moment::now()),
                    Some(ChannelEvent::Message(message)) => self.machine.on_message(message, Moment::now()),
                    None => {
                        tracing::error!(session_id = %self.session_id, "Channel task ended unexpectedly");
                        channel_open = false;
                        self.machine.on_channel_down(Moment::now());
                    }
                },
                request = self.requests.recv(), if requests_open => match request {
                    Some(request) => self.handle_request(request),
                    None => requests_open = false,
                },
                Some((attempt, outcome)) = self.http_results.recv() => {
                    self.machine.on_http_submit(attempt, outcome, Moment::now());
                }
            }

            let commands = self.machine.take_commands();
            self.execute(commands).await;
            self.publish();
        }

        self.channel_stop.send_replace(true);
        if let Err(err) = (&mut self.channel_task).await {
            tracing::error!(session_id = %self.session_id, error = %err, "Channel task join failed");
        }
        tracing::info!(session_id = %self.session_id, phase = self.machine.phase().as_str(), "Session driver stopped");
    }

    fn handle_request(&mut self, request: DriverRequest) {
        let now = Moment::now();
        match request {
            DriverRequest::Record { question_id, value, reply } => {
                let _ = reply.send(self.machine.record(&question_id, value, now));
            }
            DriverRequest::Submit { reply } => {
                let _ = reply.send(self.machine.submit(now));
            }
            DriverRequest::RetrySubmit { reply } => {
                let _ = reply.send(self.machine.retry_submit(now));
            }
        }
    }

    /// Runs the machine's commands in order. Snapshot writes are coalesced
    /// into one cache write per batch.
    async fn execute(&mut self, commands: Vec<Command>) {
        let mut pending: Option<SessionRecord> = None;

        for command in commands {
            match command {
                Command::Send(message) => {
                    let kind = message.kind();
                    if let Err(err) = self.channel.send(message) {
                        tracing::warn!(session_id = %self.session_id, kind, error = %err, "Frame not queued");
                    }
                }
                Command::SubmitViaHttp { attempt, idempotency_key } => {
                    self.submit_over_http(attempt, idempotency_key);
                }
                Command::Persist(record) => pending = Some(record),
                Command::ClearCache => {
                    pending = None;
                    if let Err(err) = self.context.cache.clear(&self.session_id).await {
                        tracing::error!(session_id = %self.session_id, error = %err, "Failed to clear session record");
                    }
                }
                Command::Materialize(finalize) => {
                    // Duplicates are logged and dropped by the materializer.
                    let _ = self.context.materializer.materialize(&self.session_id, &finalize).await;
                }
                Command::Ended(phase) => {
                    tracing::info!(session_id = %self.session_id, phase = phase.as_str(), "Exam session ended");
                    self.ended_tx.send_replace(Some(phase));
                }
            }
        }

        if let Some(record) = pending {
            if let Err(err) = self.context.cache.store(&record).await {
                tracing::warn!(session_id = %self.session_id, error = %err, "Failed to persist session record");
            }
        }
    }

    fn submit_over_http(&self, attempt: u64, idempotency_key: String) {
        let authority = self.context.authority.clone();
        let results = self.http_tx.clone();
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            let outcome = match authority.submit_session(&session_id, &idempotency_key).await {
                Ok(finalize) => HttpSubmitOutcome::Finalized(finalize),
                Err(AuthorityError::Rejected(reason)) => HttpSubmitOutcome::Rejected(reason),
                Err(AuthorityError::Transient(reason)) => HttpSubmitOutcome::Failed(reason),
            };
            let _ = results.send((attempt, outcome)).await;
        });
    }

    async fn persist_final(&mut self) {
        if self.machine.phase().is_terminal() {
            return;
        }
        let record = self.machine.to_record(Moment::now());
        if let Err(err) = self.context.cache.store(&record).await {
            tracing::error!(session_id = %self.session_id, error = %err, "Failed to persist session on shutdown");
        }
    }

    fn publish(&self) {
        let next = self.machine.snapshot(Moment::now().mono);
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
