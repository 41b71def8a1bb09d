//! Reviewer HTTP API over the session store.
//!
//! Approve, reject and the other reviewer decisions act on the same records
//! the CLI and the driver use, so a decision made here is picked up by a
//! polling driver or a later `resume`.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::errors::SessionError;
use crate::session::{HitlDecision, SessionStore};

pub struct AppState {
    pub store: Arc<SessionStore>,
}

pub type SharedState = Arc<AppState>;

pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Allow cross-origin requests, for a reviewer UI served elsewhere.
    pub permissive_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7420,
            host: "127.0.0.1".to_string(),
            permissive_cors: false,
        }
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::NotFound { .. } => ApiError::NotFound(message),
            SessionError::InvalidState { .. } | SessionError::DuplicateTask { .. } => {
                ApiError::Conflict(message)
            }
            SessionError::InvalidTaskId { .. } | SessionError::EmptyReason { .. } => {
                ApiError::BadRequest(message)
            }
            SessionError::LockPoisoned | SessionError::Storage { .. } => {
                ApiError::Internal(message)
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// Run blocking store work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/hitl/pending", get(list_pending))
        .route("/api/hitl/approve", post(approve))
        .route("/api/hitl/reject", post(reject))
        .route("/api/hitl/decision", post(decide))
        .route("/api/hitl/feedback", post(save_feedback))
        .route("/api/sessions/{task_id}", get(get_session))
}

pub fn build_router(state: SharedState, permissive_cors: bool) -> Router {
    let app = api_router().with_state(state);
    if permissive_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

async fn list_pending(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let pending = blocking(move || {
        state
            .store
            .pending_requests()
            .map_err(|e| ApiError::Internal(format!("{:#}", e)))
    })
    .await?;
    Ok(Json(pending))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApproveBody {
    task_id: String,
    #[serde(default)]
    comment: Option<String>,
}

async fn approve(
    State(state): State<SharedState>,
    body: Result<Json<ApproveBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let session = blocking(move || {
        Ok(state
            .store
            .approve(&body.task_id, body.comment.as_deref())?)
    })
    .await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RejectBody {
    task_id: String,
    reason: String,
}

async fn reject(
    State(state): State<SharedState>,
    body: Result<Json<RejectBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let session = blocking(move || Ok(state.store.reject(&body.task_id, &body.reason)?)).await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionBody {
    task_id: String,
    decision: HitlDecision,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    rule_override: Option<serde_json::Value>,
}

async fn decide(
    State(state): State<SharedState>,
    body: Result<Json<DecisionBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let session = blocking(move || {
        Ok(state
            .store
            .decide(&body.task_id, body.decision, &body.comment, body.rule_override)?)
    })
    .await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackBody {
    task_id: String,
    feedback: String,
}

async fn save_feedback(
    State(state): State<SharedState>,
    body: Result<Json<FeedbackBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    if body.feedback.trim().is_empty() {
        return Err(ApiError::BadRequest("Feedback must not be empty".to_string()));
    }
    let record = blocking(move || Ok(state.store.save_feedback(&body.task_id, &body.feedback)?))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "taskId": record.task_id,
            "createdAt": record.created_at,
            "path": record.path.display().to_string(),
        })),
    ))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = blocking(move || Ok(state.store.require(&task_id)?)).await?;
    Ok(Json(session))
}

// ── Server ────────────────────────────────────────────────────────────

pub async fn start_server(store: Arc<SessionStore>, config: ServerConfig) -> Result<()> {
    let app = build_router(Arc::new(AppState { store }), config.permissive_cors);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("HITL review API running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Checkpoint, PauseContext};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Map, Value, json};
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    fn test_app() -> (TempDir, Arc<SessionStore>, Router) {
        let dir = tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path()).unwrap());
        let app = build_router(
            Arc::new(AppState {
                store: store.clone(),
            }),
            false,
        );
        (dir, store, app)
    }

    fn paused(store: &SessionStore, task_id: &str) {
        store.create(task_id, "req.md", Map::new()).unwrap();
        store.update_phase(task_id, "Planning").unwrap();
        store
            .pause_for_hitl(
                task_id,
                Checkpoint::DesignApproval,
                PauseContext::new("Review the design").with_artifacts(vec!["docs/design.md".into()]),
            )
            .unwrap();
    }

    async fn body_json(body: Body) -> Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_dir, _store, app) = test_app();
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_pending_lists_paused_sessions() {
        let (_dir, store, app) = test_app();
        paused(&store, "T1");
        store.create("T2", "req.md", Map::new()).unwrap();

        let response = app.oneshot(get("/api/hitl/pending")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_body()).await;
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["taskId"], "T1");
        assert_eq!(entries[0]["checkpoint"], "DESIGN_APPROVAL");
        assert_eq!(entries[0]["artifacts"], json!(["docs/design.md"]));
    }

    #[tokio::test]
    async fn test_approve_then_conflict_on_second_decision() {
        let (_dir, store, app) = test_app();
        paused(&store, "T1");

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/hitl/approve",
                json!({"taskId": "T1", "comment": "ship it"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_body()).await;
        assert_eq!(body["status"], "APPROVED");
        assert_eq!(body["hitlContext"]["approverComment"], "ship it");

        let response = app
            .oneshot(post_json(
                "/api/hitl/reject",
                json!({"taskId": "T1", "reason": "too late"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("APPROVED"));
    }

    #[tokio::test]
    async fn test_reject_requires_reason() {
        let (_dir, store, app) = test_app();
        paused(&store, "T1");

        let response = app
            .clone()
            .oneshot(post_json("/api/hitl/reject", json!({"taskId": "T1", "reason": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_json("/api/hitl/reject", json!({"taskId": "T1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response.into_body()).await;
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let (_dir, _store, app) = test_app();
        let response = app
            .clone()
            .oneshot(post_json("/api/hitl/approve", json!({"taskId": "nope"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(get("/api/sessions/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_session_returns_record() {
        let (_dir, store, app) = test_app();
        paused(&store, "T1");
        let response = app.oneshot(get("/api/sessions/T1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_body()).await;
        assert_eq!(body["taskId"], "T1");
        assert_eq!(body["status"], "PAUSED_HITL");
        assert_eq!(body["currentCheckpoint"], "DESIGN_APPROVAL");
    }

    #[tokio::test]
    async fn test_decision_exception_approval_and_rule_override() {
        let (_dir, store, app) = test_app();
        paused(&store, "T1");
        paused(&store, "T2");

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/hitl/decision",
                json!({"taskId": "T1", "decision": "EXCEPTION_APPROVAL", "comment": "known gap"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_body()).await;
        assert_eq!(body["status"], "APPROVED");
        assert_eq!(body["hitlContext"]["isException"], true);

        let response = app
            .oneshot(post_json(
                "/api/hitl/decision",
                json!({
                    "taskId": "T2",
                    "decision": "RULE_OVERRIDE",
                    "comment": "allow docs/",
                    "ruleOverride": {"allow": "docs/**"}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_body()).await;
        assert_eq!(body["status"], "USER_INTERVENTION_REQUIRED");
        assert_eq!(
            body["hitlContext"]["ruleOverrideRequest"]["proposedChange"]["allow"],
            "docs/**"
        );
    }

    #[tokio::test]
    async fn test_decision_rejects_unknown_kind_and_empty_reject() {
        let (_dir, store, app) = test_app();
        paused(&store, "T1");

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/hitl/decision",
                json!({"taskId": "T1", "decision": "MAYBE"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_json(
                "/api/hitl/decision",
                json!({"taskId": "T1", "decision": "REJECT"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            store.require("T1").unwrap().status,
            crate::session::SessionStatus::PausedHitl
        );
    }

    #[tokio::test]
    async fn test_feedback_is_saved() {
        let (dir, store, app) = test_app();
        paused(&store, "T1");

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/hitl/feedback",
                json!({"taskId": "T1", "feedback": "prefer smaller phases"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response.into_body()).await;
        let path = std::path::PathBuf::from(body["path"].as_str().unwrap());
        assert!(path.starts_with(dir.path().join("feedback")));
        assert!(path.exists());

        let response = app
            .oneshot(post_json(
                "/api/hitl/feedback",
                json!({"taskId": "nope", "feedback": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
