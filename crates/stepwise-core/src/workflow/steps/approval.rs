//! Approval: park the run until a person approves or rejects it.
//!
//! The executor only builds the request (resolved message, optional summary
//! read from the context, expiry). The coordinator stores it on the run,
//! arms a timer for the expiry and resumes the run when a decision arrives.

use chrono::Utc;
use futures_util::future::BoxFuture;
use stepwise_types::workflow::{PendingApproval, StateConfig, state_types};

use crate::workflow::context::{get_path, resolve_template};
use crate::workflow::executor::{StepError, StepExecutor, StepInvocation, StepOutcome};

pub struct ApprovalExecutor;

impl ApprovalExecutor {
    fn request(invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let state = invocation.state;
        let StateConfig::Approval(config) = &state.config else {
            return Err(StepError::Validation(format!(
                "state '{}' is not an approval state",
                state.id
            )));
        };

        let message = resolve_template(invocation.context, &config.message);
        if message.trim().is_empty() {
            return Err(StepError::Validation(format!(
                "approval '{}' needs a message",
                state.id
            )));
        }
        let summary = match &config.summary_path {
            Some(path) => Some(get_path(invocation.context, path).cloned().ok_or_else(|| {
                StepError::Validation(format!(
                    "approval '{}': summary path '{path}' not found in context",
                    state.id
                ))
            })?),
            None => None,
        };
        let timeout = i64::try_from(config.timeout_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| {
                StepError::Validation(format!("approval '{}': timeout out of range", state.id))
            })?;

        let requested_at = Utc::now();
        Ok(StepOutcome::AwaitingApproval(PendingApproval {
            approval_id: PendingApproval::approval_id(&invocation.run_id, &state.id),
            step_id: state.id.clone(),
            message,
            approvers: config.approvers.clone(),
            summary,
            requested_at,
            expires_at: requested_at + timeout,
        }))
    }
}

impl StepExecutor for ApprovalExecutor {
    fn step_type(&self) -> &str {
        state_types::APPROVAL
    }

    fn execute<'a>(
        &'a self,
        invocation: StepInvocation<'a>,
    ) -> BoxFuture<'a, Result<StepOutcome, StepError>> {
        let result = Self::request(&invocation);
        Box::pin(async move { result })
    }
}
