use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    Router,
};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};

use crate::api;
use crate::core::backoff::BackoffPolicy;
use crate::core::config::{ChannelSettings, Settings};
use crate::core::state::AppState;
use crate::repositories::session_cache::{CacheError, CacheHealth, SessionCache, SessionStore};
use crate::schemas::authority::RemoteSession;
use crate::schemas::wire::{FinalizeMessage, InboundMessage, OutboundMessage};
use crate::services::authority_client::{AuthorityError, ExamAuthority};
use crate::services::channel::{ChannelError, Connector, Link};
use crate::session::result::ResultMaterializer;
use crate::session::types::ExamSession;
use crate::tasks::driver::EngineContext;
use crate::tasks::registry::SessionRegistry;

const TEST_REDIS_DB: &str = "1";
const LINK_BUFFER: usize = 64;

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    std::env::set_var("CBT_ENV", "test");
    std::env::set_var("CBT_STRICT_CONFIG", "0");
    std::env::set_var("REDIS_HOST", "127.0.0.1");
    std::env::set_var("REDIS_PORT", "6379");
    std::env::set_var("REDIS_DB", TEST_REDIS_DB);
    std::env::set_var("PROMETHEUS_ENABLED", "0");
    std::env::remove_var("REDIS_PASSWORD");
    std::env::remove_var("AUTHORITY_TOKEN");
    std::env::remove_var("AUTHORITY_HTTP_URL");
    std::env::remove_var("AUTHORITY_WS_URL");
    std::env::remove_var("SESSION_CACHE_BACKEND");
    std::env::remove_var("CBT_HOST");
    std::env::remove_var("CBT_PORT");
}

pub(crate) fn channel_settings() -> ChannelSettings {
    ChannelSettings {
        heartbeat_interval: Duration::from_secs(15),
        liveness_timeout: Duration::from_secs(45),
        connect_timeout: Duration::from_secs(10),
        reconnect: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30)),
    }
}

pub(crate) fn engine_context(
    cache: SessionCache,
    authority: Arc<FakeAuthority>,
    connector: Arc<MemoryConnector>,
) -> EngineContext {
    EngineContext {
        cache,
        authority,
        connector,
        materializer: ResultMaterializer::new(),
        channel: channel_settings(),
        tick_interval: Duration::from_millis(250),
    }
}

/// Hands every accepted link's far end to the test.
pub(crate) struct MemoryConnector {
    accepted: mpsc::UnboundedSender<RemoteEnd>,
    refusals: AtomicU32,
}

impl MemoryConnector {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (accepted, links) = mpsc::unbounded_channel();
        (Arc::new(Self { accepted, refusals: AtomicU32::new(0) }), links)
    }

    pub(crate) fn refuse_next(&self, attempts: u32) {
        self.refusals.store(attempts, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, session_id: &str) -> Result<Link, ChannelError> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChannelError::Refused("scripted refusal".to_string()));
        }

        let (outgoing, from_client) = mpsc::channel(LINK_BUFFER);
        let (to_client, incoming) = mpsc::channel(LINK_BUFFER);
        self.accepted
            .send(RemoteEnd { session_id: session_id.to_string(), to_client, from_client })
            .map_err(|_| ChannelError::Refused("no listener".to_string()))?;
        Ok(Link { outgoing, incoming })
    }
}

/// The authority's side of an in-memory link. Dropping it closes the link.
pub(crate) struct RemoteEnd {
    pub(crate) session_id: String,
    to_client: mpsc::Sender<String>,
    from_client: mpsc::Receiver<String>,
}

impl RemoteEnd {
    pub(crate) async fn push(&self, message: &InboundMessage) {
        let frame = serde_json::to_string(message).expect("encode inbound");
        self.push_raw(&frame).await;
    }

    pub(crate) async fn push_raw(&self, frame: &str) {
        self.to_client.send(frame.to_string()).await.expect("client link open");
    }

    pub(crate) async fn next_frame(&mut self) -> Option<OutboundMessage> {
        let text = self.from_client.recv().await?;
        Some(serde_json::from_str(&text).expect("decode outbound"))
    }

    pub(crate) async fn next_non_heartbeat(&mut self) -> Option<OutboundMessage> {
        loop {
            match self.next_frame().await? {
                OutboundMessage::Heartbeat(_) => continue,
                message => return Some(message),
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

#[async_trait]
impl SessionStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, session_id: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries.lock().await.get(session_id).cloned())
    }

    async fn write(&self, session_id: &str, payload: &str) -> Result<(), CacheError> {
        self.entries.lock().await.insert(session_id.to_string(), payload.to_string());
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<(), CacheError> {
        self.entries.lock().await.remove(session_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }

    async fn health(&self) -> CacheHealth {
        CacheHealth::Healthy
    }
}

/// Scripted exam authority. Sessions it opens are named `{test_id}-session`.
#[derive(Default)]
pub(crate) struct FakeAuthority {
    remote: Mutex<HashMap<String, RemoteSession>>,
    submit_outcome: Mutex<Option<Result<FinalizeMessage, AuthorityError>>>,
    submits: Mutex<Vec<(String, String)>>,
    fetches: AtomicUsize,
}

impl FakeAuthority {
    pub(crate) async fn insert_remote(&self, remote: RemoteSession) {
        let mut sessions = self.remote.lock().await;
        sessions.insert(remote.session.session_id.clone(), remote);
    }

    pub(crate) async fn script_submit(&self, outcome: Result<FinalizeMessage, AuthorityError>) {
        *self.submit_outcome.lock().await = Some(outcome);
    }

    pub(crate) async fn submit_calls(&self) -> Vec<(String, String)> {
        self.submits.lock().await.clone()
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExamAuthority for FakeAuthority {
    async fn start_session(&self, test_id: &str) -> Result<ExamSession, AuthorityError> {
        Ok(ExamSession {
            session_id: format!("{test_id}-session"),
            test_id: test_id.to_string(),
            student_id: "student-1".to_string(),
            server_started_at: OffsetDateTime::now_utc(),
            server_duration_seconds: 1800,
        })
    }

    async fn fetch_session(&self, session_id: &str) -> Result<RemoteSession, AuthorityError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.remote
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| AuthorityError::Rejected(format!("unknown session {session_id}")))
    }

    async fn submit_session(
        &self,
        session_id: &str,
        idempotency_key: &str,
    ) -> Result<FinalizeMessage, AuthorityError> {
        self.submits.lock().await.push((session_id.to_string(), idempotency_key.to_string()));
        self.submit_outcome
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| Err(AuthorityError::Transient("no scripted outcome".to_string())))
    }
}

pub(crate) struct TestContext {
    pub(crate) state: AppState,
    pub(crate) app: Router,
    pub(crate) authority: Arc<FakeAuthority>,
    pub(crate) accepted: mpsc::UnboundedReceiver<RemoteEnd>,
    pub(crate) shutdown: watch::Sender<bool>,
    _guard: OwnedMutexGuard<()>,
}

pub(crate) async fn setup_test_context() -> TestContext {
    let guard = env_lock().await;
    set_test_env();

    let settings = Settings::load().expect("settings");
    let (connector, accepted) = MemoryConnector::new();
    let authority = Arc::new(FakeAuthority::default());
    let context = engine_context(
        SessionCache::new(Arc::new(MemoryStore::default())),
        authority.clone(),
        connector,
    );
    let (shutdown, shutdown_rx) = watch::channel(false);
    let registry = SessionRegistry::new(context, settings.engine().clone(), shutdown_rx);

    let state = AppState::new(settings, registry);
    let app = api::router::router(state.clone());

    TestContext { state, app, authority, accepted, shutdown, _guard: guard }
}

pub(crate) fn json_request(
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);

    if let Some(body) = body {
        let bytes = serde_json::to_vec(&body).expect("serialize body");
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .expect("request body")
    } else {
        builder.body(Body::empty()).expect("request body")
    }
}

pub(crate) async fn read_json(response: axum::response::Response<Body>) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    serde_json::from_slice(&body).unwrap_or_else(|err| {
        let body_text = String::from_utf8_lossy(&body);
        panic!("json parse: {err}; body: {body_text}");
    })
}
