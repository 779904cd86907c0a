//! Cron triggers driven through the message bus.
//!
//! Provides:
//! - Human-readable schedule normalization ("every 5 minutes" -> cron)
//! - Next-fire and missed-fire computation with `croner`
//! - Recurring ticks: each tick is a delayed bus message; handling it
//!   publishes the following tick, then starts a run
//!
//! The following tick is published before the run is started, so a tick
//! that fails half way and is redelivered can never leave the chain
//! without a successor. Run ids of cron runs are derived from the workflow,
//! definition hash, trigger and fire time. Two ticks for the same fire time
//! (a redelivery, or a restart that re-seeded the chain while the old chain
//! was still queued) resolve to the same run; the one that finds the run
//! already created withdraws the successor it just published, leaving one
//! chain.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use croner::Cron;
use stepwise_types::message::{CRON_SUBJECT_PREFIX, CronTick, cron_subject};
use stepwise_types::workflow::StoredDefinition;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::coordinator::{CoordinatorError, WorkflowEngine};
use crate::message::{BusError, Delivery, Headers, MessageBus, MessageId, PublishOptions};
use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during scheduling operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid cron expression or schedule string.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

impl SchedulerError {
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::InvalidSchedule(_) => false,
            SchedulerError::Bus(_) => true,
            SchedulerError::Coordinator(e) => e.is_transient(),
        }
    }
}

// ---------------------------------------------------------------------------
// Human-readable schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a human-readable schedule string to a 6-field cron expression.
///
/// Supported patterns (case-insensitive):
/// - "every N seconds"     -> "*/N * * * * *"
/// - "every N minutes"     -> "0 */N * * * *"
/// - "every N hours"       -> "0 0 */N * * *"
/// - "every minute"        -> "0 * * * * *"
/// - "every hour"          -> "0 0 * * * *"
/// - "every day"           -> "0 0 0 * * *"
/// - "every day at HH:MM"  -> "0 MM HH * * *"
/// - "hourly"              -> "0 0 * * * *"
/// - "daily"               -> "0 0 0 * * *"
///
/// 5-field cron expressions get a leading seconds field; 6-field ones pass
/// through unchanged.
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();
    let invalid = || SchedulerError::InvalidSchedule(input.to_string());

    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    match parts.len() {
        5 => return Ok(format!("0 {}", parts.join(" "))),
        6 => return Ok(parts.join(" ")),
        _ => {}
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        _ => {}
    }

    let Some(rest) = lower.strip_prefix("every ") else {
        return Err(SchedulerError::InvalidSchedule(format!(
            "unrecognized schedule format: '{trimmed}'"
        )));
    };

    if let Some(at) = rest.strip_prefix("day at ") {
        let (hour, minute) = at.split_once(':').ok_or_else(invalid)?;
        let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
        if hour >= 24 || minute >= 60 {
            return Err(invalid());
        }
        return Ok(format!("0 {minute} {hour} * * *"));
    }

    let words: Vec<&str> = rest.split_whitespace().collect();
    let [count, unit] = words.as_slice() else {
        return Err(invalid());
    };
    let n: u32 = count.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(SchedulerError::InvalidSchedule(
            "interval must be > 0".to_string(),
        ));
    }
    match unit.trim_end_matches('s') {
        "second" => Ok(format!("*/{n} * * * * *")),
        "minute" => Ok(format!("0 */{n} * * * *")),
        "hour" => Ok(format!("0 0 */{n} * * *")),
        _ => Err(invalid()),
    }
}

/// Normalize and parse a schedule.
pub fn parse_schedule(input: &str) -> Result<Cron, SchedulerError> {
    let expr = normalize_schedule(input)?;
    expr.parse::<Cron>()
        .map_err(|e| SchedulerError::InvalidSchedule(format!("'{input}': {e}")))
}

/// First fire time strictly after `after`.
pub fn next_fire(cron: &Cron, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    cron.iter_after(after).next()
}

/// Fire times in the open interval (`since`, `until`).
pub fn missed_fires(cron: &Cron, since: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    cron.iter_after(since).take_while(|t| *t < until).collect()
}

/// Deterministic id of the run started by one firing of a trigger.
pub fn cron_run_id(
    workflow_id: &str,
    definition_hash: &str,
    trigger_id: &str,
    fire_at: DateTime<Utc>,
) -> Uuid {
    let name = format!(
        "{workflow_id}:{definition_hash}:{trigger_id}:{}",
        fire_at.timestamp()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

/// Seeds and consumes cron tick chains.
pub struct CronScheduler<R, B> {
    engine: Arc<WorkflowEngine<R, B>>,
}

impl<R, B> CronScheduler<R, B>
where
    R: WorkflowRepository + 'static,
    B: MessageBus,
{
    pub fn new(engine: Arc<WorkflowEngine<R, B>>) -> Self {
        Self { engine }
    }

    async fn publish_tick(&self, tick: &CronTick) -> Result<MessageId, SchedulerError> {
        let mut headers = Headers::new();
        self.engine.propagator().inject(&mut headers);
        let payload = serde_json::to_value(tick).map_err(BusError::from)?;
        let id = self
            .engine
            .bus()
            .publish(
                &cron_subject(&tick.workflow_id),
                payload,
                headers,
                PublishOptions::at(tick.fire_at),
            )
            .await?;
        tracing::debug!(
            workflow_id = %tick.workflow_id,
            trigger_id = %tick.trigger_id,
            fire_at = %tick.fire_at,
            "scheduled cron tick"
        );
        Ok(id)
    }

    /// Publish the next tick of every cron trigger in `stored`.
    /// Returns the number of ticks published.
    pub async fn schedule_definition(
        &self,
        stored: &StoredDefinition,
    ) -> Result<usize, SchedulerError> {
        let now = Utc::now();
        let mut scheduled = 0;
        for (state, cfg) in stored.definition.cron_triggers() {
            let cron = parse_schedule(&cfg.schedule)?;
            let Some(fire_at) = next_fire(&cron, now) else {
                tracing::warn!(trigger_id = %state.id, "schedule has no future fire time");
                continue;
            };
            self.publish_tick(&CronTick {
                workflow_id: stored.definition.id.clone(),
                definition_hash: stored.hash.clone(),
                trigger_id: state.id.clone(),
                fire_at,
            })
            .await?;
            tracing::info!(
                workflow_id = %stored.definition.id,
                trigger_id = %state.id,
                schedule = %cfg.schedule,
                %fire_at,
                "cron trigger scheduled"
            );
            scheduled += 1;
        }
        Ok(scheduled)
    }

    /// Seed tick chains for the latest version of every stored definition.
    pub async fn schedule_all(&self) -> Result<usize, SchedulerError> {
        let mut scheduled = 0;
        for stored in self.engine.list_definitions().await? {
            scheduled += self.schedule_definition(&stored).await?;
        }
        Ok(scheduled)
    }

    /// Publish the following tick, then start the run for `tick`.
    ///
    /// Returns the id of the run this tick created, or `None` when the tick
    /// was stale or a duplicate.
    #[tracing::instrument(
        skip(self, tick),
        fields(workflow_id = %tick.workflow_id, trigger_id = %tick.trigger_id, fire_at = %tick.fire_at)
    )]
    pub async fn handle_tick(&self, tick: CronTick) -> Result<Option<Uuid>, SchedulerError> {
        let latest = match self.engine.get_definition(&tick.workflow_id, None).await {
            Ok(latest) => latest,
            Err(CoordinatorError::DefinitionNotFound(_)) => {
                tracing::warn!("cron tick for unknown workflow, dropping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if latest.hash != tick.definition_hash {
            tracing::info!(latest = %latest.hash, "definition was replaced, ending tick chain");
            return Ok(None);
        }
        let Some((_, cfg)) = latest
            .definition
            .cron_triggers()
            .find(|(state, _)| state.id == tick.trigger_id)
        else {
            tracing::warn!("cron trigger no longer declared, ending tick chain");
            return Ok(None);
        };
        let cron = parse_schedule(&cfg.schedule)?;

        let now = Utc::now();
        let missed = missed_fires(&cron, tick.fire_at, now);
        if !missed.is_empty() {
            tracing::warn!(count = missed.len(), "skipping missed cron fires");
        }
        let successor = match next_fire(&cron, tick.fire_at.max(now)) {
            Some(fire_at) => Some(
                self.publish_tick(&CronTick {
                    fire_at,
                    ..tick.clone()
                })
                .await?,
            ),
            None => {
                tracing::warn!("schedule has no future fire time, ending tick chain");
                None
            }
        };

        let run_id = cron_run_id(
            &tick.workflow_id,
            &tick.definition_hash,
            &tick.trigger_id,
            tick.fire_at,
        );
        let started = self
            .engine
            .start_triggered_run(
                &tick.workflow_id,
                &tick.definition_hash,
                &tick.trigger_id,
                run_id,
            )
            .await;
        match started {
            Ok((_, true)) => {
                tracing::info!(%run_id, "cron run started");
                Ok(Some(run_id))
            }
            Ok((_, false)) => {
                tracing::debug!(%run_id, "duplicate cron tick, run already exists");
                if let Some(successor) = successor {
                    let withdrawn = self.engine.bus().cancel_scheduled(&successor).await?;
                    tracing::debug!(%successor, withdrawn, "withdrew duplicate successor tick");
                }
                Ok(None)
            }
            // The successor stays queued. If the redelivered tick queues a
            // second one, the two collide on the next fire's run id and the
            // loser withdraws its own successor.
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                tracing::error!(error = %e, "cron trigger could not start a run");
                Ok(None)
            }
        }
    }

    /// Consume cron ticks until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), BusError> {
        let mut deliveries = self.engine.bus().subscribe(CRON_SUBJECT_PREFIX).await?;
        tracing::info!("cron scheduler started");
        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            self.process_delivery(delivery).await;
        }
        tracing::info!("cron scheduler stopped");
        Ok(())
    }

    async fn process_delivery(&self, delivery: Delivery) {
        let span = tracing::info_span!(
            "cron_tick",
            subject = %delivery.envelope.subject,
            message_id = %delivery.envelope.id,
        );
        self.engine
            .propagator()
            .extract(&delivery.envelope.headers, &span);

        async move {
            let tick: CronTick = match delivery.envelope.decode() {
                Ok(tick) => tick,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable cron tick");
                    if let Err(e) = delivery.ack().await {
                        tracing::warn!(error = %e, "failed to ack cron tick");
                    }
                    return;
                }
            };
            let settled = match self.handle_tick(tick).await {
                Ok(_) => delivery.ack().await,
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "cron tick failed transiently, redelivering");
                    delivery.nack(Some(std::time::Duration::from_secs(1))).await
                }
                Err(e) => {
                    tracing::error!(error = %e, "cron tick failed");
                    delivery.ack().await
                }
            };
            if let Err(e) = settled {
                tracing::warn!(error = %e, "failed to settle cron tick");
            }
        }
        .instrument(span)
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
