//! HTTP intake
//!
//! `POST /execute` runs one job and answers with its `RunReply`.
//! `GET /languages` and `GET /health` expose the registry and counters.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RunnerError;
use crate::gate::ExecutionService;
use crate::protocol::{RunJob, RunReply};

#[derive(Clone)]
struct AppState {
    service: Arc<ExecutionService>,
    shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct LanguagesResponse {
    pub languages: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub workspaces_created: u64,
    pub workspaces_released: u64,
    pub workspaces_in_flight: usize,
}

pub fn router(service: Arc<ExecutionService>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/execute", post(execute_handler))
        .route("/languages", get(languages_handler))
        .route("/health", get(health_handler))
        .with_state(AppState { service, shutdown })
}

/// Serve the intake until `shutdown` fires
pub async fn serve(
    bind: &str,
    service: Arc<ExecutionService>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind HTTP intake to {}", bind))?;
    info!(
        "HTTP intake listening on {}",
        listener.local_addr().context("Failed to read local address")?
    );

    let app = router(service, shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP intake failed")?;

    info!("HTTP intake stopped");
    Ok(())
}

fn status_for(error: &RunnerError) -> StatusCode {
    match error {
        RunnerError::UnknownLanguage(_) | RunnerError::InvalidRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        RunnerError::Overloaded { .. } => StatusCode::TOO_MANY_REQUESTS,
        RunnerError::ResourceExhausted(_) | RunnerError::Cancelled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn execute_handler(
    State(state): State<AppState>,
    payload: Result<Json<RunJob>, JsonRejection>,
) -> (StatusCode, Json<RunReply>) {
    let mut job = match payload {
        Ok(Json(job)) => job,
        Err(rejection) => {
            debug!("Rejected HTTP job body: {}", rejection.body_text());
            let error = RunnerError::InvalidRequest(rejection.body_text());
            return (rejection.status(), Json(RunReply::failed(Uuid::new_v4(), &error)));
        }
    };
    let request_id = job.request_id();
    let request = match job.into_request() {
        Ok(request) => request,
        Err(e) => return (status_for(&e), Json(RunReply::failed(request_id, &e))),
    };
    debug!(
        "HTTP job {} ({}, {} bytes)",
        request.request_id,
        request.language,
        request.source.len()
    );

    // A client that disconnects drops this future, which cancels the run
    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();

    match state.service.submit(&request, &cancel).await {
        Ok(result) => (
            StatusCode::OK,
            Json(RunReply::new(request.request_id, Ok(result))),
        ),
        Err(e) => (
            status_for(&e),
            Json(RunReply::failed(request.request_id, &e)),
        ),
    }
}

async fn languages_handler(State(state): State<AppState>) -> Json<LanguagesResponse> {
    Json(LanguagesResponse {
        languages: state.service.pipeline().registry().languages(),
    })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let gate = state.service.gate();
    let workspaces = state.service.pipeline().workspaces();
    Json(HealthResponse {
        status: "ok",
        max_concurrent: gate.limit(),
        available_slots: gate.available(),
        workspaces_created: workspaces.created(),
        workspaces_released: workspaces.released(),
        workspaces_in_flight: workspaces.in_flight(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionPolicy;
    use crate::gate::AdmissionGate;
    use crate::languages::ToolchainRegistry;
    use crate::pipeline::{Phase, Pipeline, PipelineConfig};
    use crate::protocol::ReplyStatus;
    use crate::runner::ProcessRunner;
    use crate::workspace::WorkspaceManager;
    use base64::{engine::general_purpose, Engine as _};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn state() -> (tempfile::TempDir, AppState) {
        let root = tempfile::tempdir().unwrap();
        let registry = ToolchainRegistry::from_toml_str(
            r#"
[script]
source_file = "main.sh"
run_command = "sh {source}"
aliases = ["sh"]
"#,
        )
        .unwrap();
        let pipeline = Pipeline::new(
            Arc::new(registry),
            WorkspaceManager::new(root.path()).unwrap(),
            Arc::new(ProcessRunner::default()),
            PipelineConfig::default(),
        );
        let service = ExecutionService::new(AdmissionGate::new(2, AdmissionPolicy::Reject), pipeline);
        (
            root,
            AppState {
                service: Arc::new(service),
                shutdown: CancellationToken::new(),
            },
        )
    }

    fn job(language: &str, source: &str, stdin: Option<&str>) -> RunJob {
        RunJob {
            language: language.to_string(),
            code: Some(source.to_string()),
            stdin: stdin.map(|s| s.as_bytes().to_vec()),
            ..RunJob::default()
        }
    }

    #[tokio::test]
    async fn test_execute_echo() {
        let (_root, state) = state();

        let (status, Json(reply)) =
            execute_handler(State(state), Ok(Json(job("sh", "cat", Some("hello"))))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply.status, ReplyStatus::Completed);
        let result = reply.result.unwrap();
        assert_eq!(result.phase, Phase::Run);
        assert_eq!(result.stdout, b"hello");
    }

    #[tokio::test]
    async fn test_execute_unknown_language() {
        let (_root, state) = state();

        let (status, Json(reply)) =
            execute_handler(State(state.clone()), Ok(Json(job("cobol", "", None)))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.status, ReplyStatus::Failed);
        assert_eq!(reply.error.unwrap().kind, "unknown_language");
        assert_eq!(state.service.pipeline().workspaces().created(), 0);
    }

    #[tokio::test]
    async fn test_execute_missing_source() {
        let (_root, state) = state();
        let mut job = job("sh", "", None);
        job.code = None;

        let (status, Json(reply)) = execute_handler(State(state), Ok(Json(job))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.error.unwrap().kind, "invalid_request");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&RunnerError::Overloaded { limit: 2 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&RunnerError::ResourceExhausted("disk".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&RunnerError::Cancelled),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_languages_and_health() {
        let (_root, state) = state();

        let Json(languages) = languages_handler(State(state.clone())).await;
        assert_eq!(languages.languages, vec!["script"]);

        let Json(health) = health_handler(State(state)).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.max_concurrent, 2);
        assert_eq!(health.available_slots, 2);
        assert_eq!(health.workspaces_in_flight, 0);
    }

    /// POST `body` to a served router and return the raw response
    async fn post_raw(content_type: &str, body: &str) -> String {
        let (_root, state) = state();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = state.shutdown.clone();
        let app = router(Arc::clone(&state.service), shutdown.clone());
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "POST /execute HTTP/1.1\r\nHost: {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            addr,
            content_type,
            body.len(),
            body
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        state.shutdown.cancel();
        server.await.unwrap().unwrap();
        response
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let body = serde_json::json!({
            "language": "script",
            "source": general_purpose::STANDARD.encode("echo hi"),
        })
        .to_string();

        let response = post_raw("application/json", &body).await;

        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.contains(&general_purpose::STANDARD.encode("hi\n")));
    }

    #[tokio::test]
    async fn test_malformed_body_gets_json_reply() {
        let response = post_raw("application/json", "{not json").await;

        assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let reply: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(reply["status"], "failed");
        assert_eq!(reply["error"]["kind"], "invalid_request");

        let response = post_raw("text/plain", r#"{"language":"sh","code":"true"}"#).await;
        assert!(response.starts_with("HTTP/1.1 415"), "{}", response);
        assert!(response.contains("invalid_request"));
    }
}
