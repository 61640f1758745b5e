//! HTTP API for the execution daemon.
//!
//! Thin axum layer over the executor, session table, pool, and reaper.
//! The response shapes are a compatibility contract: `/execute` returns a
//! session id without waiting for the run, `/result` answers 202 while the
//! script is still running and 200 with the captured logs once it is done,
//! and errors use the `{"error": ...}` body shape.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::SessionNotFound;
use crate::executor::{Executor, TestFile, TestSummary};
use crate::pool::PrewarmPool;
use crate::reaper::CleanupReaper;
use crate::session::{SessionId, SessionState, SessionTable};

/// Shared handles behind the HTTP surface. No ambient singletons: every
/// component is injected, so tests can wire up fakes.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<Executor>,
    pub sessions: Arc<SessionTable>,
    pub pool: Arc<PrewarmPool>,
    pub reaper: Arc<CleanupReaper>,
}

#[derive(Debug, Serialize)]
struct ExecuteResponse {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    logs: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct TestReportResponse {
    status: &'static str,
    exit_code: i64,
    summary: Option<TestSummary>,
    raw_output: String,
    session_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Errors surfaced directly to the HTTP caller.
#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("Session not found")]
    NotFound,
    #[error("{0}")]
    InvalidPayload(String),
    #[error("{0}")]
    Internal(String),
}

impl From<SessionNotFound> for ApiError {
    fn from(_: SessionNotFound) -> Self {
        Self::NotFound
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/execute_pytest", post(execute_pytest))
        .route("/result/{session_id}", get(result))
        .route("/cleanup/{session_id}", post(cleanup))
        .route("/prewarm", post(prewarm))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until the process receives a shutdown signal.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

/// Accept a script upload and return a session id immediately; execution
/// continues in the background.
async fn execute(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let mut script = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidPayload(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let text = field
            .text()
            .await
            .map_err(|_| ApiError::InvalidPayload("script must be UTF-8 text".to_string()))?;
        script = Some(text);
        break;
    }

    let script = script.ok_or_else(|| {
        ApiError::InvalidPayload("no script file provided".to_string())
    })?;
    if script.trim().is_empty() {
        return Err(ApiError::InvalidPayload("script is empty".to_string()));
    }

    let id = state.executor.submit(script).await;
    Ok(Json(ExecuteResponse {
        session_id: id.to_string(),
    }))
}

/// Upload a test suite and run pytest over it synchronously. 200 when
/// every test passed, 206 when some failed, 400 when the run produced no
/// verdict at all.
async fn execute_pytest(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidPayload(e.to_string()))?
    {
        if field.name() != Some("files") {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(ApiError::InvalidPayload(format!("invalid file name {name:?}")));
        }
        let content = field
            .text()
            .await
            .map_err(|_| ApiError::InvalidPayload("test files must be UTF-8 text".to_string()))?;
        files.push(TestFile { name, content });
    }

    if files.is_empty() {
        return Err(ApiError::InvalidPayload("no files provided".to_string()));
    }
    let targets: Vec<String> = files
        .iter()
        .map(|f| f.name.clone())
        .filter(|name| is_test_file(name))
        .collect();
    if targets.is_empty() {
        return Err(ApiError::InvalidPayload(
            "no test files found (test files start with test_ or end with _test.py)".to_string(),
        ));
    }

    let run = state
        .executor
        .run_tests(&files, &targets)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let (status, code) = match run.exit_code {
        0 => ("success", StatusCode::OK),
        1 => ("partial_success", StatusCode::PARTIAL_CONTENT),
        _ => ("failure", StatusCode::BAD_REQUEST),
    };
    let body = Json(TestReportResponse {
        status,
        exit_code: run.exit_code,
        summary: run.summary,
        raw_output: run.output,
        session_id: run.id.to_string(),
    });
    Ok((code, body).into_response())
}

fn is_test_file(name: &str) -> bool {
    name.starts_with("test_") || name.ends_with("_test.py")
}

/// Poll a session. 202 while pending/running, 200 with logs afterwards.
async fn result(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let id: SessionId = session_id.parse()?;
    let view = state.sessions.get(id).await?;

    let response = match view.state {
        SessionState::Pending | SessionState::Running => (
            StatusCode::ACCEPTED,
            Json(StatusResponse {
                status: "still running",
            }),
        )
            .into_response(),
        SessionState::Completed | SessionState::Failed | SessionState::CleanedUp => {
            Json(LogsResponse { logs: view.output }).into_response()
        }
    };
    Ok(response)
}

/// Explicitly clean up a session, aborting it if still running.
async fn cleanup(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let id: SessionId = session_id.parse()?;
    state.reaper.cleanup(id).await?;
    Ok(Json(StatusResponse {
        status: "cleaned up",
    }))
}

/// Run a replenishment pass right away. A no-op when the pool is already
/// at its target size.
async fn prewarm(State(state): State<AppState>) -> Json<StatusResponse> {
    let spawned = state.pool.replenish().await;
    if spawned == 0 {
        Json(StatusResponse {
            status: "prewarm pool already at target size",
        })
    } else {
        Json(StatusResponse {
            status: "prewarm triggered",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::ResourceLimits;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state(config: &Config) -> (Arc<FakeRuntime>, AppState) {
        let runtime = Arc::new(FakeRuntime::new());
        let pool = PrewarmPool::new(
            runtime.clone(),
            ResourceLimits::from(config),
            config.pool_target_size,
        );
        let sessions = Arc::new(SessionTable::new());
        let executor = Executor::new(runtime.clone(), pool.clone(), sessions.clone(), config);
        let reaper = CleanupReaper::new(runtime.clone(), pool.clone(), sessions.clone(), config);
        (
            runtime,
            AppState {
                executor,
                sessions,
                pool,
                reaper,
            },
        )
    }

    fn multipart_body(field: &str, content: &str) -> Request<Body> {
        let body = format!(
            "--BOUNDARY\r\n\
             Content-Disposition: form-data; name=\"{field}\"; filename=\"main.py\"\r\n\
             Content-Type: text/x-python\r\n\r\n\
             {content}\r\n\
             --BOUNDARY--\r\n"
        );
        Request::post("/execute")
            .header(
                header::CONTENT_TYPE,
                "multipart/form-data; boundary=BOUNDARY",
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn get_result(app: &Router, id: &str) -> Response {
        app.clone()
            .oneshot(
                Request::get(format!("/result/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn execute_then_poll_returns_logs() {
        let (_, state) = test_state(&Config::default());
        let app = router(state);

        // Small delay so the first poll observes the run in flight
        let response = app
            .clone()
            .oneshot(multipart_body("file", "sleep 50\necho hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let id = body["session_id"].as_str().unwrap().to_string();

        let first = get_result(&app, &id).await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(first).await["status"], "still running");

        for _ in 0..100 {
            let response = get_result(&app, &id).await;
            if response.status() == StatusCode::OK {
                assert_eq!(json_body(response).await["logs"], "hello\n");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution never finished");
    }

    #[tokio::test]
    async fn execute_without_file_field_is_rejected() {
        let (_, state) = test_state(&Config::default());
        let app = router(state.clone());

        let response = app
            .oneshot(multipart_body("other", "echo hi"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "no script file provided");
        // Rejected before a session was created
        assert_eq!(state.sessions.len().await, 0);
    }

    fn multipart_files(parts: &[(&str, &str)]) -> Request<Body> {
        let mut body = String::new();
        for (name, content) in parts {
            body.push_str(&format!(
                "--BOUNDARY\r\n\
                 Content-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\n\
                 Content-Type: text/x-python\r\n\r\n\
                 {content}\r\n"
            ));
        }
        body.push_str("--BOUNDARY--\r\n");
        Request::post("/execute_pytest")
            .header(
                header::CONTENT_TYPE,
                "multipart/form-data; boundary=BOUNDARY",
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn pytest_upload_without_test_files_is_rejected() {
        let (runtime, state) = test_state(&Config::default());
        let app = router(state);

        let response = app
            .oneshot(multipart_files(&[("helpers.py", "X = 1")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("no test files found"));
        // Rejected before any sandbox was touched
        assert!(runtime.created_ids().is_empty());
    }

    #[tokio::test]
    async fn pytest_run_reports_a_verdict() {
        let (runtime, state) = test_state(&Config::default());
        let app = router(state);

        let response = app
            .oneshot(multipart_files(&[
                ("helpers.py", "X = 1"),
                ("test_app.py", "def test_ok():\n    assert True"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["exit_code"], 0);
        assert!(body["session_id"].as_str().is_some());

        // The suite ran in a sandbox that was then retired
        let sandbox = runtime.created_ids()[0].clone();
        assert!(runtime.was_removed(&sandbox));
    }

    #[tokio::test]
    async fn result_for_unknown_session_is_404_without_side_effects() {
        let (_, state) = test_state(&Config::default());
        let app = router(state.clone());

        for id in ["malformed-id", "5e0c5b0e-0000-4000-8000-000000000000"] {
            let response = get_result(&app, id).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_eq!(json_body(response).await["error"], "Session not found");
        }
        assert_eq!(state.sessions.len().await, 0);
    }

    #[tokio::test]
    async fn cleanup_endpoint_aborts_and_reports() {
        let (_, state) = test_state(&Config::default());
        let app = router(state.clone());

        let id = state.executor.submit("sleep 5000\necho done".to_string()).await;
        // Let the executor bind a sandbox
        for _ in 0..50 {
            if state.sessions.get(id).await.unwrap().state == SessionState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let response = app
            .clone()
            .oneshot(
                Request::post(format!("/cleanup/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "cleaned up");
        assert_eq!(
            state.sessions.get(id).await.unwrap().state,
            SessionState::CleanedUp
        );

        // Unknown id gets the 404 shape
        let response = app
            .oneshot(
                Request::post("/cleanup/5e0c5b0e-0000-4000-8000-000000000000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn prewarm_is_idempotent_at_target_size() {
        let (runtime, state) = test_state(&Config::default()); // target size 1
        let app = router(state.clone());

        let post = || {
            app.clone().oneshot(
                Request::post("/prewarm")
                    .body(Body::empty())
                    .unwrap(),
            )
        };

        let response = post().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "prewarm triggered");
        assert_eq!(state.pool.warm_count(), 1);

        let response = post().await.unwrap();
        assert_eq!(
            json_body(response).await["status"],
            "prewarm pool already at target size"
        );
        // No second sandbox was created
        assert_eq!(runtime.created_ids().len(), 1);
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (_, state) = test_state(&Config::default());
        let app = router(state);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
