//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use stepwise_core::workflow::coordinator::CoordinatorError;
use stepwise_core::workflow::definition::DefinitionError;

use super::response::{ApiErrorDetail, ApiResponse};

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Engine errors (definitions, runs, storage, bus).
    Engine(CoordinatorError),
    /// Malformed request.
    Validation(String),
}

impl From<CoordinatorError> for AppError {
    fn from(e: CoordinatorError) -> Self {
        AppError::Engine(e)
    }
}

impl From<DefinitionError> for AppError {
    fn from(e: DefinitionError) -> Self {
        AppError::Engine(CoordinatorError::Definition(e))
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String, Option<serde_json::Value>) {
        match self {
            AppError::Engine(CoordinatorError::DefinitionNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "WORKFLOW_NOT_FOUND",
                format!("Workflow '{id}' not found"),
                None,
            ),
            AppError::Engine(CoordinatorError::RunNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "RUN_NOT_FOUND",
                format!("Run '{id}' not found"),
                None,
            ),
            AppError::Engine(CoordinatorError::AlreadyTerminal(id, status)) => (
                StatusCode::CONFLICT,
                "RUN_FINISHED",
                format!("Run '{id}' is already {status}"),
                None,
            ),
            AppError::Engine(CoordinatorError::RunBusy(id)) => (
                StatusCode::CONFLICT,
                "RUN_BUSY",
                format!("Run '{id}' is busy, retry shortly"),
                None,
            ),
            AppError::Engine(CoordinatorError::NoPendingApproval(id)) => (
                StatusCode::CONFLICT,
                "NO_PENDING_APPROVAL",
                format!("Run '{id}' is not waiting on an approval"),
                None,
            ),
            AppError::Engine(CoordinatorError::ApprovalExpired(id)) => (
                StatusCode::CONFLICT,
                "APPROVAL_EXPIRED",
                format!("The approval for run '{id}' has expired"),
                None,
            ),
            AppError::Engine(CoordinatorError::ApproverNotAllowed { run_id, approver }) => (
                StatusCode::FORBIDDEN,
                "APPROVER_NOT_ALLOWED",
                format!("'{approver}' may not decide the approval of run '{run_id}'"),
                None,
            ),
            AppError::Engine(CoordinatorError::InvalidInput(issues)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                "Run input does not match the workflow input schema".to_string(),
                Some(json!(issues)),
            ),
            AppError::Engine(CoordinatorError::UnknownState(state)) => (
                StatusCode::BAD_REQUEST,
                "UNKNOWN_STATE",
                format!("State '{state}' not found in definition"),
                None,
            ),
            AppError::Engine(CoordinatorError::Definition(e)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_DEFINITION",
                e.to_string(),
                (!e.issues().is_empty()).then(|| json!(e.issues())),
            ),
            AppError::Engine(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                e.to_string(),
                None,
            ),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone(), None)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, %message, "request failed");
        }

        let body = ApiResponse::error(ApiErrorDetail {
            code,
            message,
            details,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_types::error::RepositoryError;
    use stepwise_types::workflow::RunStatus;
    use uuid::Uuid;

    #[test]
    fn test_not_found_errors_map_to_404() {
        let err = AppError::from(CoordinatorError::RunNotFound(Uuid::now_v7()));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = AppError::from(CoordinatorError::DefinitionNotFound("alerts".into()));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_finished_run_maps_to_conflict() {
        let err = AppError::from(CoordinatorError::AlreadyTerminal(
            Uuid::now_v7(),
            RunStatus::Completed,
        ));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_approval_errors_map_to_conflict_or_forbidden() {
        let run_id = Uuid::now_v7();
        let err = AppError::from(CoordinatorError::NoPendingApproval(run_id));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        let err = AppError::from(CoordinatorError::ApprovalExpired(run_id));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        let err = AppError::from(CoordinatorError::RunBusy(run_id));
        assert_eq!(err.parts().1, "RUN_BUSY");

        let err = AppError::from(CoordinatorError::ApproverNotAllowed {
            run_id,
            approver: "mallory".into(),
        });
        let (status, code, message, _) = err.parts();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(code, "APPROVER_NOT_ALLOWED");
        assert!(message.contains("mallory"));
    }

    #[test]
    fn test_client_errors_map_to_400() {
        let err = AppError::from(CoordinatorError::InvalidInput(vec!["missing severity".into()]));
        let (status, code, _, details) = err.parts();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, "INVALID_INPUT");
        assert_eq!(details, Some(json!(["missing severity"])));

        let err = AppError::from(DefinitionError::Parse("bad yaml".into()));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_storage_errors_map_to_500() {
        let err = AppError::from(CoordinatorError::Repository(RepositoryError::Connection));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
