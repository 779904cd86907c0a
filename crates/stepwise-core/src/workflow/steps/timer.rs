//! Timer: suspend the run until a relative delay elapses or an absolute
//! time is reached. The coordinator persists the wake time and schedules a
//! delayed bus message; no task is held in memory while the run waits.

use chrono::Utc;
use futures_util::future::BoxFuture;
use stepwise_types::workflow::{StateConfig, state_types};

use crate::workflow::executor::{StepError, StepExecutor, StepInvocation, StepOutcome};

pub struct TimerExecutor;

impl TimerExecutor {
    fn wake_time(invocation: &StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let state = invocation.state;
        let StateConfig::Timer(config) = &state.config else {
            return Err(StepError::Validation(format!(
                "state '{}' is not a timer state",
                state.id
            )));
        };

        let wake_at = match (config.until, config.delay_secs) {
            (Some(until), _) => until,
            (None, Some(secs)) => {
                let delay = i64::try_from(secs)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .ok_or_else(|| {
                        StepError::Validation(format!("timer '{}': delay out of range", state.id))
                    })?;
                Utc::now() + delay
            }
            (None, None) => {
                return Err(StepError::Validation(format!(
                    "timer '{}' needs delay_secs or until",
                    state.id
                )));
            }
        };
        Ok(StepOutcome::Suspended { wake_at })
    }
}

impl StepExecutor for TimerExecutor {
    fn step_type(&self) -> &str {
        state_types::TIMER
    }

    fn execute<'a>(
        &'a self,
        invocation: StepInvocation<'a>,
    ) -> BoxFuture<'a, Result<StepOutcome, StepError>> {
        let result = Self::wake_time(&invocation);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{invoke, state_from};
    use serde_json::json;

    #[tokio::test]
    async fn test_delay_suspends_until_future() {
        let state = state_from(json!({"id": "wait", "type": "timer", "config": {"delay_secs": 60}}));
        let before = Utc::now();
        match invoke(&state, json!({})).await.unwrap() {
            StepOutcome::Suspended { wake_at } => {
                assert!(wake_at >= before + chrono::Duration::seconds(59));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_until_is_used_verbatim() {
        let state = state_from(json!({
            "id": "wait",
            "type": "timer",
            "config": {"until": "2030-01-01T00:00:00Z"}
        }));
        match invoke(&state, json!({})).await.unwrap() {
            StepOutcome::Suspended { wake_at } => {
                assert_eq!(wake_at.to_rfc3339(), "2030-01-01T00:00:00+00:00");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timer_without_time_is_invalid() {
        let state = state_from(json!({"id": "wait", "type": "timer"}));
        let err = invoke(&state, json!({})).await.unwrap_err();
        assert_eq!(err.class(), "validation");
    }
}
