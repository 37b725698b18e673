use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::core::config::AuthoritySettings;
use crate::schemas::authority::{Envelope, RemoteSession, SubmitSessionRequest};
use crate::schemas::wire::FinalizeMessage;
use crate::session::types::ExamSession;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum AuthorityError {
    /// Final answer from the authority; retrying will not change it.
    #[error("authority rejected the request: {0}")]
    Rejected(String),
    #[error("authority request failed: {0}")]
    Transient(String),
}

/// Request/response operations against the exam authority.
#[async_trait]
pub(crate) trait ExamAuthority: Send + Sync {
    async fn start_session(&self, test_id: &str) -> Result<ExamSession, AuthorityError>;

    async fn fetch_session(&self, session_id: &str) -> Result<RemoteSession, AuthorityError>;

    /// Fallback submit path used while the duplex channel is down.
    async fn submit_session(
        &self,
        session_id: &str,
        idempotency_key: &str,
    ) -> Result<FinalizeMessage, AuthorityError>;
}

#[derive(Debug, Clone)]
pub(crate) struct HttpAuthority {
    client: Client,
    base_url: Url,
    token: String,
}

impl HttpAuthority {
    pub(crate) fn from_settings(settings: &AuthoritySettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5).min(settings.request_timeout))
            .timeout(settings.request_timeout)
            .build()
            .context("Failed to build exam authority HTTP client")?;
        let base_url = Url::parse(&settings.http_url)
            .with_context(|| format!("Invalid authority URL {}", settings.http_url))?;

        Ok(Self { client, base_url, token: settings.token.clone() })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, AuthorityError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AuthorityError::Transient("authority URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<T, AuthorityError> {
        let response = self.authorize(request).send().await.map_err(|err| {
            tracing::warn!(operation, error = %err, "Exam authority unreachable");
            AuthorityError::Transient(err.to_string())
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|err| AuthorityError::Transient(err.to_string()))?;
        let envelope = serde_json::from_str::<Envelope<T>>(&body);

        if !status.is_success() {
            let detail = envelope
                .ok()
                .map(|envelope| envelope.message)
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| status.to_string());
            return Err(classify_status(status, detail));
        }

        let envelope = envelope.map_err(|err| {
            AuthorityError::Transient(format!("{operation} returned an undecodable body: {err}"))
        })?;
        if !envelope.success {
            return Err(AuthorityError::Rejected(envelope.message));
        }
        envelope
            .data
            .ok_or_else(|| AuthorityError::Transient(format!("{operation} response missing data")))
    }
}

fn classify_status(status: StatusCode, detail: String) -> AuthorityError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::GONE => {
            AuthorityError::Rejected(detail)
        }
        _ => AuthorityError::Transient(format!("status {status}: {detail}")),
    }
}

#[async_trait]
impl ExamAuthority for HttpAuthority {
    async fn start_session(&self, test_id: &str) -> Result<ExamSession, AuthorityError> {
        let url = self.endpoint(&["tests", test_id, "sessions"])?;
        let session: ExamSession = self.send(self.client.post(url), "start_session").await?;
        tracing::info!(
            session_id = %session.session_id,
            test_id,
            duration_seconds = session.server_duration_seconds,
            "Exam authority opened a session"
        );
        Ok(session)
    }

    async fn fetch_session(&self, session_id: &str) -> Result<RemoteSession, AuthorityError> {
        let url = self.endpoint(&["sessions", session_id])?;
        self.send(self.client.get(url), "fetch_session").await
    }

    async fn submit_session(
        &self,
        session_id: &str,
        idempotency_key: &str,
    ) -> Result<FinalizeMessage, AuthorityError> {
        let url = self.endpoint(&["sessions", session_id, "submit"])?;
        let request = self
            .client
            .post(url)
            .header("Idempotency-Key", idempotency_key)
            .json(&SubmitSessionRequest { idempotency_key });
        self.send(request, "submit_session").await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}/api/v1")
    }

    fn client(base_url: String) -> HttpAuthority {
        HttpAuthority::from_settings(&AuthoritySettings {
            http_url: base_url,
            ws_url: "ws://127.0.0.1:1/ws".to_string(),
            token: "secret".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .expect("client")
    }

    fn session_json(session_id: &str) -> Value {
        json!({
            "session_id": session_id,
            "test_id": "t-1",
            "student_id": "u-1",
            "server_started_at": "2025-03-01T09:00:00Z",
            "server_duration_seconds": 1800
        })
    }

    #[tokio::test]
    async fn start_session_unwraps_envelope_and_sends_token() {
        let router = Router::new().route(
            "/api/v1/tests/:test_id/sessions",
            post(|Path(test_id): Path<String>, headers: HeaderMap| async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|value| value.to_str().ok())
                    == Some("Bearer secret");
                if !authorized || test_id != "t-1" {
                    return (StatusCode::UNAUTHORIZED, Json(json!({"success": false})));
                }
                (StatusCode::OK, Json(json!({"success": true, "data": session_json("s-9")})))
            }),
        );
        let authority = client(serve(router).await);

        let session = authority.start_session("t-1").await.expect("start");
        assert_eq!(session.session_id, "s-9");
        assert_eq!(session.server_duration_seconds, 1800);
    }

    #[tokio::test]
    async fn classifies_rejections_and_transient_failures() {
        let router = Router::new()
            .route(
                "/api/v1/sessions/gone",
                get(|| async {
                    (StatusCode::GONE, Json(json!({"success": false, "message": "test window closed"})))
                }),
            )
            .route(
                "/api/v1/sessions/flaky",
                get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
            )
            .route(
                "/api/v1/sessions/refused/submit",
                post(|| async { Json(json!({"success": false, "message": "already finalized"})) }),
            );
        let authority = client(serve(router).await);

        assert_eq!(
            authority.fetch_session("gone").await,
            Err(AuthorityError::Rejected("test window closed".to_string()))
        );
        assert!(matches!(
            authority.fetch_session("flaky").await,
            Err(AuthorityError::Transient(_))
        ));
        assert_eq!(
            authority.submit_session("refused", "key").await,
            Err(AuthorityError::Rejected("already finalized".to_string()))
        );
    }

    #[tokio::test]
    async fn submit_forwards_idempotency_key() {
        let router = Router::new().route(
            "/api/v1/sessions/:session_id/submit",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let header = headers.get("idempotency-key").and_then(|value| value.to_str().ok());
                assert_eq!(header, Some("abc"));
                assert_eq!(body["idempotency_key"], "abc");
                Json(json!({
                    "success": true,
                    "data": {"score": 80, "total": 100, "status": "passed"}
                }))
            }),
        );
        let authority = client(serve(router).await);

        let finalize = authority.submit_session("s-1", "abc").await.expect("submit");
        assert_eq!(finalize.score, 80.0);
        assert!(!finalize.released);
    }

    #[tokio::test]
    async fn unreachable_authority_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let authority = client(format!("http://{addr}/api/v1"));
        assert!(matches!(
            authority.fetch_session("s-1").await,
            Err(AuthorityError::Transient(_))
        ));
    }
}
