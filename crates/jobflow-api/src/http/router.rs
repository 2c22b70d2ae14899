//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`.
//! Middleware: CORS, request tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Trigger boundary
        .route("/triggers", post(handlers::trigger::trigger))
        // Runs
        .route("/runs", get(handlers::run::list_runs))
        .route("/runs/{id}", get(handlers::run::get_run))
        .route("/runs/{id}/logs", get(handlers::run::get_run_logs))
        .route("/runs/{id}/cancel", post(handlers::run::cancel_run))
        // Loaded definitions
        .route("/workflows", get(handlers::workflow::list_workflows))
        .route("/workflows/{name}", get(handlers::workflow::get_workflow))
        // Lifecycle events
        .route("/events", get(handlers::event::stream_events));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Liveness probe with a count of runs executing in this process.
async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_runs": state.orchestrator.active_count(),
        "workflows": state.registry.len(),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use jobflow_core::workflow::definition::parse_workflow_yaml;
    use jobflow_core::workflow::registry::WorkflowRegistry;
    use jobflow_infra::sqlite::pool::DatabasePool;
    use jobflow_types::config::{GlobalConfig, StorageSettings};
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;

    const APPROVE_YAML: &str = r#"
name: approve
start_at: check
steps:
  - name: check
    type: branch
    choices:
      - when: { op: boolean_equals, path: approved, value: true }
        next: done
    default: reject
  - name: done
    type: succeed
    outputs: { approved_by: reviewer }
  - name: reject
    type: fail
    reason: not approved
"#;

    async fn test_state() -> (AppState, TempDir) {
        let tmp = TempDir::new().unwrap();
        let pool = DatabasePool::open(tmp.path(), &StorageSettings::default())
            .await
            .unwrap();
        let registry = Arc::new(WorkflowRegistry::new());
        registry
            .register(parse_workflow_yaml(APPROVE_YAML).unwrap())
            .unwrap();

        let mut config = GlobalConfig::default();
        config.jobs.endpoint = "http://127.0.0.1:1".to_string();
        let state = AppState::build(pool, config, registry).unwrap();
        (state, tmp)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_loaded_workflows() {
        let (state, _tmp) = test_state().await;
        let app = build_router(state);

        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["workflows"], 1);
    }

    #[tokio::test]
    async fn trigger_runs_workflow_to_completion() {
        let (state, _tmp) = test_state().await;
        let orchestrator = state.orchestrator.clone();
        let app = build_router(state);

        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/triggers",
                json!({
                    "workflowName": "approve",
                    "initialRunData": { "approved": true, "reviewer": "ana" },
                    "callbackToken": "tok-1"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id: uuid::Uuid = serde_json::from_value(body["data"]["run_id"].clone()).unwrap();
        assert_eq!(body["_links"]["run"], format!("/api/v1/runs/{run_id}"));

        orchestrator.wait(run_id).await.unwrap();

        let (status, body) = send(&app, get(&format!("/api/v1/runs/{run_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "succeeded");
        assert_eq!(body["data"]["outputs"]["approved_by"], "ana");
        assert_eq!(body["data"]["notified"], true);

        let (status, body) = send(&app, get(&format!("/api/v1/runs/{run_id}/logs"))).await;
        assert_eq!(status, StatusCode::OK);
        let logs = body["data"].as_array().unwrap();
        assert_eq!(logs.last().unwrap()["status"], "succeeded");
    }

    #[tokio::test]
    async fn trigger_for_unknown_workflow_is_404() {
        let (state, _tmp) = test_state().await;
        let app = build_router(state);

        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/triggers",
                json!({ "workflowName": "ghost", "initialRunData": {} }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["code"], "WORKFLOW_NOT_FOUND");
    }

    #[tokio::test]
    async fn trigger_with_non_object_run_data_is_400() {
        let (state, _tmp) = test_state().await;
        let app = build_router(state);

        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/triggers",
                json!({ "workflowName": "approve", "initialRunData": [1, 2, 3] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"][0]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn malformed_trigger_body_is_400() {
        let (state, _tmp) = test_state().await;
        let app = build_router(state);

        let (status, body) = send(&app, post_json("/api/v1/triggers", json!({ "nope": 1 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"][0]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn unknown_and_invalid_run_ids() {
        let (state, _tmp) = test_state().await;
        let app = build_router(state);

        let (status, body) =
            send(&app, get(&format!("/api/v1/runs/{}", uuid::Uuid::now_v7()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["code"], "RUN_NOT_FOUND");

        let (status, _) = send(&app, get("/api/v1/runs/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            post_json(&format!("/api/v1/runs/{}/cancel", uuid::Uuid::now_v7()), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn workflows_are_listed_and_fetched() {
        let (state, _tmp) = test_state().await;
        let app = build_router(state);

        let (status, body) = send(&app, get("/api/v1/workflows")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["name"], "approve");
        assert_eq!(body["data"][0]["steps"], 3);

        let (status, body) = send(&app, get("/api/v1/workflows/approve")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["start_at"], "check");

        let (status, _) = send(&app, get("/api/v1/workflows/ghost")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_runs_filters_by_workflow() {
        let (state, _tmp) = test_state().await;
        let orchestrator = state.orchestrator.clone();
        let app = build_router(state);

        let (_, body) = send(
            &app,
            post_json(
                "/api/v1/triggers",
                json!({ "workflowName": "approve", "initialRunData": { "approved": false } }),
            ),
        )
        .await;
        let run_id: uuid::Uuid = serde_json::from_value(body["data"]["run_id"].clone()).unwrap();
        orchestrator.wait(run_id).await.unwrap();

        let (status, body) = send(&app, get("/api/v1/runs?workflow=approve&limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        let runs = body["data"].as_array().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["status"], "failed");
        assert_eq!(runs[0]["failure"]["reason"], "not approved");

        let (_, body) = send(&app, get("/api/v1/runs?workflow=other")).await;
        assert!(body["data"].as_array().unwrap().is_empty());
    }
}
