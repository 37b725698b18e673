//! Live duplex link to the exam authority.
//!
//! A channel task owns the connection for one session. It reconnects with
//! capped, jittered backoff, emits a heartbeat on a fixed cadence, declares
//! the link dead when nothing arrives within the liveness timeout, and turns
//! frames into [`ChannelEvent`]s for the session driver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use reqwest::Url;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use crate::core::config::{AuthoritySettings, ChannelSettings};
use crate::core::time::millis;
use crate::schemas::wire::{decode_inbound, encode_outbound, Heartbeat, InboundMessage, OutboundMessage};

const LINK_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub(crate) enum ChannelError {
    #[error("invalid channel url: {0}")]
    Url(String),
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("outbound queue unavailable")]
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChannelEvent {
    Connected,
    /// The link came back after a drop. The next anchor supersedes any
    /// locally extrapolated time.
    Reconnected,
    Disconnected,
    Message(InboundMessage),
}

/// Text frames in both directions. Dropping `outgoing` closes the link.
pub(crate) struct Link {
    pub(crate) outgoing: mpsc::Sender<String>,
    pub(crate) incoming: mpsc::Receiver<String>,
}

#[async_trait]
pub(crate) trait Connector: Send + Sync {
    async fn connect(&self, session_id: &str) -> Result<Link, ChannelError>;
}

/// Connects to `{AUTHORITY_WS_URL}/{session_id}` over WebSocket.
pub(crate) struct WsConnector {
    base_url: Url,
    token: String,
}

impl WsConnector {
    pub(crate) fn from_settings(settings: &AuthoritySettings) -> Result<Self, ChannelError> {
        let base_url =
            Url::parse(&settings.ws_url).map_err(|err| ChannelError::Url(err.to_string()))?;
        Ok(Self { base_url, token: settings.token.clone() })
    }

    fn session_url(&self, session_id: &str) -> Result<Url, ChannelError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChannelError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .push(session_id);
        Ok(url)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, session_id: &str) -> Result<Link, ChannelError> {
        let url = self.session_url(session_id)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ChannelError::Url(err.to_string()))?;
        if !self.token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(|err| ChannelError::Handshake(err.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|err| ChannelError::Handshake(err.to_string()))?;
        let (mut sink, mut stream) = socket.split();
        let (outgoing, mut to_socket) = mpsc::channel::<String>(LINK_BUFFER);
        let (from_socket, incoming) = mpsc::channel::<String>(LINK_BUFFER);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = to_socket.recv() => match frame {
                        Some(text) => {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if from_socket.send(text).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                }
            }
        });

        Ok(Link { outgoing, incoming })
    }
}

/// Sending half held by the session driver.
#[derive(Clone)]
pub(crate) struct ChannelHandle {
    outbound: mpsc::Sender<OutboundMessage>,
}

impl ChannelHandle {
    /// Never waits: a frame that cannot be queued is dropped and left to the
    /// caller's timeout and retry.
    pub(crate) fn send(&self, message: OutboundMessage) -> Result<(), ChannelError> {
        self.outbound.try_send(message).map_err(|_| ChannelError::Closed)
    }
}

pub(crate) fn spawn(
    session_id: String,
    connector: Arc<dyn Connector>,
    settings: ChannelSettings,
    events: mpsc::Sender<ChannelEvent>,
    shutdown: watch::Receiver<bool>,
) -> (ChannelHandle, JoinHandle<()>) {
    let (outbound, outbound_rx) = mpsc::channel(LINK_BUFFER);
    let task = ConnectionChannel {
        session_id,
        connector,
        settings,
        events,
        outbound: outbound_rx,
        shutdown,
        rng: StdRng::seed_from_u64(rand::random()),
    };
    (ChannelHandle { outbound }, tokio::spawn(task.run()))
}

enum LinkEnd {
    Lost(&'static str),
    Stopped,
}

struct ConnectionChannel {
    session_id: String,
    connector: Arc<dyn Connector>,
    settings: ChannelSettings,
    events: mpsc::Sender<ChannelEvent>,
    outbound: mpsc::Receiver<OutboundMessage>,
    shutdown: watch::Receiver<bool>,
    rng: StdRng,
}

impl ConnectionChannel {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        let mut connected_before = false;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let attempt = timeout(self.settings.connect_timeout, self.connector.connect(&self.session_id)).await;
            match attempt {
                Ok(Ok(link)) => {
                    failures = 0;
                    let event = if connected_before {
                        metrics::counter!("exam_channel_reconnects_total").increment(1);
                        ChannelEvent::Reconnected
                    } else {
                        ChannelEvent::Connected
                    };
                    connected_before = true;
                    tracing::info!(session_id = %self.session_id, "Exam authority channel connected");
                    if self.events.send(event).await.is_err() {
                        break;
                    }

                    match self.serve(link).await {
                        LinkEnd::Stopped => break,
                        LinkEnd::Lost(reason) => {
                            tracing::warn!(session_id = %self.session_id, reason, "Exam authority channel lost");
                            while self.outbound.try_recv().is_ok() {}
                            if self.events.send(ChannelEvent::Disconnected).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(session_id = %self.session_id, error = %err, "Channel connect failed");
                }
                Err(_) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        timeout_ms = millis(self.settings.connect_timeout),
                        "Channel connect timed out"
                    );
                }
            }

            failures = failures.saturating_add(1);
            let delay = self.settings.reconnect.delay(failures, &mut self.rng);
            tracing::debug!(session_id = %self.session_id, attempt = failures, delay_ms = millis(delay), "Reconnecting");
            if !self.pause(delay).await {
                break;
            }
        }

        tracing::debug!(session_id = %self.session_id, "Channel task stopped");
    }

    /// Waits out a backoff delay, discarding frames queued for a link that no
    /// longer exists. Returns false when the task should stop.
    async fn pause(&mut self, delay: Duration) -> bool {
        let wake = sleep(delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                _ = &mut wake => return true,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return false;
                    }
                }
                frame = self.outbound.recv() => match frame {
                    Some(message) => tracing::debug!(
                        session_id = %self.session_id,
                        kind = message.kind(),
                        "Dropping frame while disconnected"
                    ),
                    None => return false,
                },
            }
        }
    }

    async fn serve(&mut self, mut link: Link) -> LinkEnd {
        let mut heartbeat = interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let liveness = sleep(self.settings.liveness_timeout);
        tokio::pin!(liveness);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return LinkEnd::Stopped;
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = OutboundMessage::Heartbeat(Heartbeat { session_id: self.session_id.clone() });
                    if !self.write(&link, &beat).await {
                        return LinkEnd::Lost("heartbeat send failed");
                    }
                }
                frame = self.outbound.recv() => {
                    let Some(message) = frame else {
                        return LinkEnd::Stopped;
                    };
                    if !self.write(&link, &message).await {
                        return LinkEnd::Lost("send failed");
                    }
                }
                frame = link.incoming.recv() => {
                    let Some(text) = frame else {
                        return LinkEnd::Lost("closed by peer");
                    };
                    liveness.as_mut().reset(Instant::now() + self.settings.liveness_timeout);
                    match decode_inbound(&text) {
                        Ok(message) => {
                            if self.events.send(ChannelEvent::Message(message)).await.is_err() {
                                return LinkEnd::Stopped;
                            }
                        }
                        Err(err) => tracing::warn!(
                            session_id = %self.session_id,
                            error = %err,
                            "Dropping undecodable frame"
                        ),
                    }
                }
                _ = &mut liveness => return LinkEnd::Lost("liveness timeout"),
            }
        }
    }

    async fn write(&self, link: &Link, message: &OutboundMessage) -> bool {
        let text = match encode_outbound(message) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(session_id = %self.session_id, error = %err, "Failed to encode frame");
                return true;
            }
        };
        link.outgoing.send(text).await.is_ok()
    }
}
