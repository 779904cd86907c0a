//! Workflow definition and run handlers for the REST API.
//!
//! Endpoints for registering definitions, starting runs, inspecting or
//! cancelling runs with their step-level records, and deciding approvals.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use stepwise_core::repository::RunFilter;
use stepwise_core::workflow::coordinator::RunRequest;
use stepwise_core::workflow::definition::parse_yaml;
use stepwise_types::workflow::{
    PendingApproval, RunStatus, StepRun, StoredDefinition, TriggerKind, WorkflowRun,
};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Query parameters for listing workflow runs.
#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    /// Only runs in this status.
    pub status: Option<String>,
    /// Maximum number of runs to return (default 50).
    pub limit: Option<u32>,
}

/// Query parameters selecting a definition version.
#[derive(Debug, Default, Deserialize)]
pub struct VersionQuery {
    pub hash: Option<String>,
}

/// Body of `POST /workflows/{id}/runs`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct StartRunBody {
    #[serde(default)]
    pub input: Option<Value>,
    /// Client-chosen run id; repeating a request with the same id returns
    /// the existing run.
    #[serde(default)]
    pub run_id: Option<Uuid>,
    /// Definition version to run instead of the latest.
    #[serde(default)]
    pub hash: Option<String>,
}

/// Body of `POST /runs/{run_id}/approve`.
#[derive(Debug, Default, Deserialize)]
pub struct ApproveBody {
    #[serde(default)]
    pub comment: Option<String>,
}

/// Body of `POST /runs/{run_id}/reject`.
#[derive(Debug, Default, Deserialize)]
pub struct RejectBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// One entry of `GET /approvals`.
#[derive(Debug, Serialize)]
pub struct PendingApprovalView {
    pub run_id: Uuid,
    pub workflow_name: String,
    #[serde(flatten)]
    pub approval: PendingApproval,
}

/// Header naming who decides an approval.
const APPROVER_HEADER: &str = "x-approver-id";

fn approver_from(headers: &HeaderMap) -> String {
    headers
        .get(APPROVER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("api-user")
        .to_string()
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the workflow sub-router.
///
/// Mounted at `/api/v1` by the main router.
pub fn workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/runs", post(start_run).get(list_runs))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/steps", get(list_steps))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/runs/{run_id}/approve", post(approve_run))
        .route("/runs/{run_id}/reject", post(reject_run))
        .route("/approvals", get(list_approvals))
}

// ---------------------------------------------------------------------------
// Definition handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows - Register a definition (YAML or JSON body).
pub async fn create_workflow(
    State(state): State<AppState>,
    body: String,
) -> Result<(StatusCode, Json<ApiResponse<StoredDefinition>>), AppError> {
    let start = Instant::now();

    let def = parse_yaml(&body)?;
    let stored = state.engine.register_definition(def).await?;

    let link = format!("/api/v1/workflows/{}", stored.definition.id);
    let runs = format!("{link}/runs");
    let resp = ApiResponse::timed(stored, start)
        .with_link("self", &link)
        .with_link("runs", &runs);
    Ok((StatusCode::CREATED, Json(resp)))
}

/// GET /api/v1/workflows - Latest version of every definition.
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<StoredDefinition>>>, AppError> {
    let start = Instant::now();
    let defs = state.engine.list_definitions().await?;
    Ok(Json(
        ApiResponse::timed(defs, start).with_link("self", "/api/v1/workflows"),
    ))
}

/// GET /api/v1/workflows/{id} - Latest (or `?hash=`) version of a definition.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<ApiResponse<StoredDefinition>>, AppError> {
    let start = Instant::now();
    let stored = state
        .engine
        .get_definition(&id, query.hash.as_deref())
        .await?;

    let link = format!("/api/v1/workflows/{id}");
    let runs = format!("{link}/runs");
    Ok(Json(
        ApiResponse::timed(stored.as_ref().clone(), start)
            .with_link("self", &link)
            .with_link("runs", &runs),
    ))
}

// ---------------------------------------------------------------------------
// Run handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows/{id}/runs - Start a run.
///
/// Responds 201 for a new run and 200 when `run_id` names an existing one.
pub async fn start_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<StartRunBody>>,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowRun>>), AppError> {
    let start = Instant::now();
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let input = body.input.unwrap_or_else(|| serde_json::json!({}));
    let mut request = RunRequest::new(&id, input, TriggerKind::Api);
    if let Some(run_id) = body.run_id {
        request = request.with_run_id(run_id);
    }
    if let Some(hash) = body.hash {
        request = request.with_hash(hash);
    }
    let (run, created) = state.engine.start_run(request).await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let link = format!("/api/v1/runs/{}", run.id);
    let steps = format!("{link}/steps");
    let workflow = format!("/api/v1/workflows/{id}");
    let resp = ApiResponse::timed(run, start)
        .with_link("self", &link)
        .with_link("steps", &steps)
        .with_link("workflow", &workflow);
    Ok((status, Json(resp)))
}

/// GET /api/v1/workflows/{id}/runs - Runs of one workflow, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowRun>>>, AppError> {
    let start = Instant::now();
    let status = query
        .status
        .as_deref()
        .map(str::parse::<RunStatus>)
        .transpose()
        .map_err(AppError::Validation)?;

    let filter = RunFilter {
        definition_id: Some(id.clone()),
        status,
        limit: query.limit,
    };
    let runs = state.engine.list_runs(&filter).await?;

    let link = format!("/api/v1/workflows/{id}/runs");
    Ok(Json(ApiResponse::timed(runs, start).with_link("self", &link)))
}

/// GET /api/v1/runs/{run_id} - Run status and context.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowRun>>, AppError> {
    let start = Instant::now();
    let run = state.engine.get_run(run_id).await?;

    let link = format!("/api/v1/runs/{run_id}");
    let steps = format!("{link}/steps");
    let workflow = format!("/api/v1/workflows/{}", run.definition_id);
    Ok(Json(
        ApiResponse::timed(run, start)
            .with_link("self", &link)
            .with_link("steps", &steps)
            .with_link("workflow", &workflow),
    ))
}

/// GET /api/v1/runs/{run_id}/steps - Step runs in execution order.
pub async fn list_steps(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<StepRun>>>, AppError> {
    let start = Instant::now();
    state.engine.get_run(run_id).await?;
    let steps = state.engine.list_step_runs(run_id).await?;

    let link = format!("/api/v1/runs/{run_id}/steps");
    let run = format!("/api/v1/runs/{run_id}");
    Ok(Json(
        ApiResponse::timed(steps, start)
            .with_link("self", &link)
            .with_link("run", &run),
    ))
}

/// POST /api/v1/runs/{run_id}/cancel - Cancel a run.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowRun>>, AppError> {
    let start = Instant::now();
    let run = state.engine.cancel_run(run_id).await?;

    let link = format!("/api/v1/runs/{run_id}");
    Ok(Json(ApiResponse::timed(run, start).with_link("self", &link)))
}

// ---------------------------------------------------------------------------
// Approval handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/runs/{run_id}/approve - Approve the run's pending step.
///
/// The approver is read from `X-Approver-ID` (default `api-user`).
pub async fn approve_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    headers: HeaderMap,
    body: Option<Json<ApproveBody>>,
) -> Result<Json<ApiResponse<WorkflowRun>>, AppError> {
    let start = Instant::now();
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let approver = approver_from(&headers);
    let run = state
        .engine
        .approve_step(run_id, &approver, body.comment)
        .await?;

    let link = format!("/api/v1/runs/{run_id}");
    Ok(Json(ApiResponse::timed(run, start).with_link("self", &link)))
}

/// POST /api/v1/runs/{run_id}/reject - Reject the run's pending step.
pub async fn reject_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    headers: HeaderMap,
    body: Option<Json<RejectBody>>,
) -> Result<Json<ApiResponse<WorkflowRun>>, AppError> {
    let start = Instant::now();
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let approver = approver_from(&headers);
    let run = state
        .engine
        .reject_step(run_id, &approver, body.reason)
        .await?;

    let link = format!("/api/v1/runs/{run_id}");
    Ok(Json(ApiResponse::timed(run, start).with_link("self", &link)))
}

/// GET /api/v1/approvals - Approvals waiting for a decision.
pub async fn list_approvals(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<PendingApprovalView>>>, AppError> {
    let start = Instant::now();
    let pending = state
        .engine
        .list_pending_approvals()
        .await?
        .into_iter()
        .filter_map(|run| {
            run.approval.map(|approval| PendingApprovalView {
                run_id: run.id,
                workflow_name: run.workflow_name,
                approval,
            })
        })
        .collect();
    Ok(Json(
        ApiResponse::timed(pending, start).with_link("self", "/api/v1/approvals"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use axum::response::IntoResponse;
    use stepwise_core::workflow::worker::StepWorker;
    use tokio_util::sync::CancellationToken;

    const ALERTS: &str = r#"
id: alerts
name: Alert routing
states:
  - id: alert
    type: inject
    config:
      data: {severity: high}
    result_path: alert
    next: route
  - id: route
    type: switch
    config:
      data_path: alert.severity
    transitions:
      - condition: "_value == 'high'"
        next: notify
    default: ignore
  - id: notify
    type: inject
    config:
      data: {notified: true}
    end: true
  - id: ignore
    type: inject
    config:
      data: {notified: false}
    end: true
"#;

    async fn register(state: &AppState) -> StoredDefinition {
        let (status, Json(resp)) = create_workflow(State(state.clone()), ALERTS.to_string())
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        resp.data.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_workflow() {
        let (_dir, state) = test_state().await;
        let stored = register(&state).await;
        assert_eq!(stored.definition.id, "alerts");

        let Json(resp) = get_workflow(
            State(state.clone()),
            Path("alerts".to_string()),
            Query(VersionQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(resp.data.unwrap().hash, stored.hash);

        let Json(resp) = list_workflows(State(state)).await.unwrap();
        assert_eq!(resp.data.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected() {
        let (_dir, state) = test_state().await;
        let yaml = "id: broken\nstates:\n  - id: a\n    type: inject\n    config: {data: 1}\n    next: nowhere\n";
        let err = create_workflow(State(state), yaml.to_string())
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_run_is_idempotent_on_run_id() {
        let (_dir, state) = test_state().await;
        register(&state).await;
        let run_id = Uuid::now_v7();
        let body = || {
            Some(Json(StartRunBody {
                input: Some(serde_json::json!({"source": "test"})),
                run_id: Some(run_id),
                hash: None,
            }))
        };

        let (status, Json(first)) =
            start_run(State(state.clone()), Path("alerts".to_string()), body())
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        let first = first.data.unwrap();
        assert_eq!(first.id, run_id);
        assert_eq!(first.trigger, TriggerKind::Api);

        let (status, Json(second)) =
            start_run(State(state.clone()), Path("alerts".to_string()), body())
                .await
                .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second.data.unwrap().id, run_id);

        let Json(runs) = list_runs(
            State(state),
            Path("alerts".to_string()),
            Query(ListRunsQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(runs.data.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_404() {
        let (_dir, state) = test_state().await;
        let err = start_run(State(state), Path("missing".to_string()), None)
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_status_filter_is_400() {
        let (_dir, state) = test_state().await;
        let err = list_runs(
            State(state),
            Path("alerts".to_string()),
            Query(ListRunsQuery {
                status: Some("sleeping".into()),
                limit: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_run_is_idempotent() {
        let (_dir, state) = test_state().await;
        register(&state).await;
        let (_, Json(resp)) = start_run(State(state.clone()), Path("alerts".to_string()), None)
            .await
            .unwrap();
        let run_id = resp.data.unwrap().id;

        let Json(cancelled) = cancel_run(State(state.clone()), Path(run_id)).await.unwrap();
        assert_eq!(cancelled.data.unwrap().status, RunStatus::Cancelled);

        // No worker ran, so the run never advanced past its entry step.
        let Json(steps) = list_steps(State(state.clone()), Path(run_id)).await.unwrap();
        assert!(
            steps
                .data
                .unwrap()
                .iter()
                .all(|s| s.step_id == "alert")
        );

        let Json(again) = cancel_run(State(state), Path(run_id)).await.unwrap();
        assert_eq!(again.data.unwrap().status, RunStatus::Cancelled);
    }

    const SIGNOFF: &str = r#"
id: signoff
states:
  - id: ask
    type: approval
    config:
      message: "Proceed?"
      approvers: [ops-lead]
    result_path: decision
    next: done
  - id: done
    type: inject
    config: {data: finished}
    end: true
"#;

    /// Start a run of SIGNOFF and wait until it is parked on its approval.
    async fn parked_run(state: &AppState) -> (CancellationToken, Uuid) {
        create_workflow(State(state.clone()), SIGNOFF.to_string())
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(StepWorker::new(state.engine.clone()).run(shutdown.clone()));

        let (_, Json(resp)) = start_run(State(state.clone()), Path("signoff".to_string()), None)
            .await
            .unwrap();
        let run_id = resp.data.unwrap().id;
        for _ in 0..250 {
            let run = state.engine.get_run(run_id).await.unwrap();
            if run.approval.is_some() && run.timer_message_id.is_some() {
                return (shutdown, run_id);
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("run never waited on its approval");
    }

    fn approver(id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(APPROVER_HEADER, id.parse().unwrap());
        headers
    }

    #[test]
    fn test_approver_defaults_to_api_user() {
        assert_eq!(approver_from(&HeaderMap::new()), "api-user");
        assert_eq!(approver_from(&approver("ops-lead")), "ops-lead");
    }

    #[tokio::test]
    async fn test_approve_resumes_run() {
        let (_dir, state) = test_state().await;
        let (shutdown, run_id) = parked_run(&state).await;

        let Json(listed) = list_approvals(State(state.clone())).await.unwrap();
        let listed = listed.data.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].run_id, run_id);
        assert_eq!(listed[0].approval.message, "Proceed?");

        let err = approve_run(State(state.clone()), Path(run_id), HeaderMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);

        let body = Some(Json(ApproveBody {
            comment: Some("go".into()),
        }));
        let Json(resp) = approve_run(State(state.clone()), Path(run_id), approver("ops-lead"), body)
            .await
            .unwrap();
        assert!(resp.data.unwrap().approval.is_none());

        let run = state
            .engine
            .wait_for_run(run_id, std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.context["decision"]["decided_by"], "ops-lead");
        assert_eq!(run.context["decision"]["decision_reason"], "go");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reject_fails_run_and_second_decision_conflicts() {
        let (_dir, state) = test_state().await;
        let (shutdown, run_id) = parked_run(&state).await;

        let body = Some(Json(RejectBody {
            reason: Some("not today".into()),
        }));
        let Json(resp) = reject_run(State(state.clone()), Path(run_id), approver("ops-lead"), body)
            .await
            .unwrap();
        let run = resp.data.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.unwrap().class, "approval_rejected");

        let err = approve_run(State(state.clone()), Path(run_id), approver("ops-lead"), None)
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
        shutdown.cancel();
    }
}
