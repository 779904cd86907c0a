//! Step worker: consumes step-tasks from the bus and drives the engine.
//!
//! Deliveries are processed concurrently up to `worker_concurrency`. While
//! a task runs, the worker heartbeats its delivery every half lease so the
//! bus does not hand the same task to another consumer. A task is
//! acknowledged once handled (including tasks the engine drops as stale);
//! transient storage or bus failures are negatively acknowledged so the bus
//! redelivers them, and a task for a run that is busy with another task is
//! put back with a short delay.

use std::sync::Arc;
use std::time::Duration;

use stepwise_types::message::{STEP_SUBJECT_PREFIX, StepTask};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::coordinator::{CoordinatorError, WorkflowEngine};
use crate::message::{BusError, Delivery, MessageBus};
use crate::repository::workflow::WorkflowRepository;

/// Delay before a transiently failed task is redelivered.
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Delay before a task refused because its run was busy is redelivered.
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(250);

pub struct StepWorker<R, B> {
    engine: Arc<WorkflowEngine<R, B>>,
    concurrency: usize,
}

impl<R, B> StepWorker<R, B>
where
    R: WorkflowRepository + 'static,
    B: MessageBus,
{
    pub fn new(engine: Arc<WorkflowEngine<R, B>>) -> Self {
        let concurrency = engine.config().worker_concurrency.max(1);
        Self {
            engine,
            concurrency,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Process deliveries until `shutdown` is cancelled, then wait for
    /// in-flight tasks to finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BusError> {
        let mut deliveries = self.engine.bus().subscribe(STEP_SUBJECT_PREFIX).await?;
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        tracing::info!(concurrency = self.concurrency, "step worker started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let engine = self.engine.clone();
            tasks.spawn(async move {
                let _permit = permit;
                process_delivery(&engine, delivery).await;
            });
            while tasks.try_join_next().is_some() {}
        }

        tracing::info!(in_flight = tasks.len(), "step worker stopping");
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

async fn process_delivery<R, B>(engine: &WorkflowEngine<R, B>, delivery: Delivery)
where
    R: WorkflowRepository + 'static,
    B: MessageBus,
{
    let span = tracing::info_span!(
        "step_task",
        subject = %delivery.envelope.subject,
        message_id = %delivery.envelope.id,
        delivery_count = delivery.envelope.delivery_count,
    );
    engine
        .propagator()
        .extract(&delivery.envelope.headers, &span);

    async move {
        let task: StepTask = match delivery.envelope.decode() {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable step task");
                if let Err(e) = delivery.ack().await {
                    tracing::warn!(error = %e, "failed to ack step task");
                }
                return;
            }
        };

        let result = with_heartbeat(&delivery, engine.handle_step_task(task)).await;
        let settled = match result {
            Ok(()) => delivery.ack().await,
            Err(CoordinatorError::RunBusy(_)) => {
                tracing::debug!("run is busy, redelivering later");
                delivery.nack(Some(BUSY_RETRY_DELAY)).await
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "step task failed transiently, redelivering");
                delivery.nack(Some(TRANSIENT_RETRY_DELAY)).await
            }
            Err(e) => {
                tracing::error!(error = %e, "step task failed");
                delivery.ack().await
            }
        };
        if let Err(e) = settled {
            tracing::warn!(error = %e, "failed to settle step task");
        }
    }
    .instrument(span)
    .await
}

/// Drive `work` to completion, extending the delivery's lease every half
/// lease period while it runs.
async fn with_heartbeat<F, T>(delivery: &Delivery, work: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::pin!(work);
    let mut heartbeat = tokio::time::interval(delivery.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the lease is fresh.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = heartbeat.tick() => match delivery.in_progress().await {
                Ok(true) => {}
                Ok(false) => tracing::warn!("lost the lease on a running step task"),
                Err(e) => tracing::warn!(error = %e, "failed to extend step task lease"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Headers, InMemoryMessageBus, PublishOptions};
    use crate::repository::memory::InMemoryWorkflowRepository;
    use crate::workflow::executor::StepExecutorRegistry;
    use crate::workflow::testing::ScriptedAgent;
    use serde_json::json;
    use stepwise_types::config::EngineConfig;
    use stepwise_types::workflow::{RunStatus, TriggerKind};

    type Engine = WorkflowEngine<InMemoryWorkflowRepository, InMemoryMessageBus>;

    fn engine_on(bus: InMemoryMessageBus, agent: Arc<ScriptedAgent>) -> Arc<Engine> {
        let registry = Arc::new(StepExecutorRegistry::with_builtins(agent));
        Arc::new(WorkflowEngine::new(
            Arc::new(InMemoryWorkflowRepository::new()),
            Arc::new(bus),
            registry,
            EngineConfig::default(),
        ))
    }

    fn engine() -> Arc<Engine> {
        engine_on(
            InMemoryMessageBus::new(Duration::from_secs(30), 3, Duration::from_millis(10)),
            Arc::new(ScriptedAgent::default()),
        )
    }

    async fn drained(bus: &InMemoryMessageBus) -> bool {
        for _ in 0..100 {
            if bus.pending_count().await == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_undecodable_task_is_acked() {
        let engine = engine();
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(StepWorker::new(engine.clone()).run(shutdown.clone()));

        engine
            .bus()
            .publish(
                "workflow.run.garbage",
                json!({"not": "a task"}),
                Headers::new(),
                PublishOptions::immediate(),
            )
            .await
            .unwrap();
        assert!(drained(engine.bus()).await);

        shutdown.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_task_for_unknown_run_is_acked() {
        let engine = engine();
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(StepWorker::new(engine.clone()).run(shutdown.clone()));

        let task = StepTask::execute(uuid::Uuid::now_v7(), "missing", 1);
        engine
            .bus()
            .publish(
                &task.subject(),
                serde_json::to_value(&task).unwrap(),
                Headers::new(),
                PublishOptions::immediate(),
            )
            .await
            .unwrap();
        assert!(drained(engine.bus()).await);
        assert!(engine.bus().dead_letters().await.is_empty());

        shutdown.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_long_step_outlives_lease_without_blocking_other_runs() {
        // Leases far shorter than the step: only the heartbeat keeps the
        // task from being handed out again.
        let agent = Arc::new(ScriptedAgent::default());
        let engine = engine_on(
            InMemoryMessageBus::new(Duration::from_millis(100), 10, Duration::from_millis(10)),
            agent.clone(),
        );
        engine
            .register_yaml(
                r#"
id: slow
states:
  - id: call
    type: operation
    config: { task: "sleep:1500:done" }
    end: true
"#,
            )
            .await
            .unwrap();
        engine
            .register_yaml(
                r#"
id: quick
states:
  - id: only
    type: inject
    config: { data: 1 }
    end: true
"#,
            )
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(
            StepWorker::new(engine.clone())
                .with_concurrency(2)
                .run(shutdown.clone()),
        );

        let slow = engine
            .create_run("slow", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let started = std::time::Instant::now();
        let quick = engine
            .create_run("quick", json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        let quick = engine
            .wait_for_run(quick.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(quick.status, RunStatus::Completed);
        assert!(
            started.elapsed() < Duration::from_millis(800),
            "quick run waited {:?} behind the slow step",
            started.elapsed()
        );

        let slow = engine
            .wait_for_run(slow.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(slow.status, RunStatus::Completed);
        assert_eq!(agent.call_count(), 1);
        assert!(drained(engine.bus()).await);
        assert!(engine.bus().dead_letters().await.is_empty());

        shutdown.cancel();
        worker.await.unwrap().unwrap();
    }
}
