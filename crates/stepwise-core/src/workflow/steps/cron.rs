//! Cron trigger states declare a schedule for the scheduler. They start new
//! runs and are skipped when a run picks its entry state, so reaching one
//! here means a transition pointed into it.

use futures_util::future::BoxFuture;
use stepwise_types::workflow::state_types;

use crate::workflow::executor::{StepError, StepExecutor, StepInvocation, StepOutcome};

pub struct CronTriggerExecutor;

impl StepExecutor for CronTriggerExecutor {
    fn step_type(&self) -> &str {
        state_types::CRON
    }

    fn execute<'a>(
        &'a self,
        invocation: StepInvocation<'a>,
    ) -> BoxFuture<'a, Result<StepOutcome, StepError>> {
        let id = invocation.state.id.clone();
        Box::pin(async move {
            Err(StepError::Validation(format!(
                "cron trigger state '{id}' is not executable"
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{invoke, state_from};
    use serde_json::json;

    #[tokio::test]
    async fn test_cron_state_is_not_executable() {
        let state = state_from(json!({
            "id": "nightly",
            "type": "cron",
            "config": {"schedule": "0 0 * * *"}
        }));
        let err = invoke(&state, json!({})).await.unwrap_err();
        assert_eq!(err.class(), "validation");
    }
}
