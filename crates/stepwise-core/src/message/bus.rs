//! `MessageBus` trait: at-least-once, acknowledgement-based delivery with
//! delayed scheduling.
//!
//! A published message is delivered to exactly one subscriber whose subject
//! prefix matches (competing consumers). Until it is acknowledged, the
//! message stays leased; an expired lease or a `nack` makes it deliverable
//! again. A consumer that needs longer than the lease calls `in_progress`
//! periodically to extend it. Messages published with `deliver_at` are held
//! until that time and may be withdrawn with `cancel_scheduled` before
//! delivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use super::envelope::{Envelope, Headers, MessageId};

/// Errors that can occur during message bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus has been shut down.
    #[error("message bus closed")]
    Closed,

    /// The backing store rejected the operation.
    #[error("bus storage error: {0}")]
    Storage(String),

    /// The payload could not be encoded or decoded.
    #[error("bus payload error: {0}")]
    Payload(String),
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Payload(e.to_string())
    }
}

/// Per-publish options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Earliest delivery time. `None` delivers as soon as possible.
    pub deliver_at: Option<DateTime<Utc>>,
}

impl PublishOptions {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn at(deliver_at: DateTime<Utc>) -> Self {
        Self {
            deliver_at: Some(deliver_at),
        }
    }

    pub fn after(delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        Self::at(Utc::now() + delay)
    }
}

/// Settles a single delivery. Implemented by each bus backend.
///
/// Uses boxed futures so deliveries can carry the handle as a trait object.
pub trait AckHandle: Send + Sync {
    /// Remove the message permanently.
    fn ack(&self) -> BoxFuture<'_, Result<(), BusError>>;

    /// Release the lease so the message is redelivered after `delay`.
    fn nack(&self, delay: Option<Duration>) -> BoxFuture<'_, Result<(), BusError>>;

    /// Extend the lease by another full lease period.
    ///
    /// Returns `false` when this delivery no longer holds the lease (it
    /// expired and the message was handed out again, or it was settled).
    fn in_progress(&self) -> BoxFuture<'_, Result<bool, BusError>>;

    /// Length of one lease period.
    fn lease(&self) -> Duration;
}

/// Smallest heartbeat interval handed out by `Delivery::heartbeat_interval`.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// A message handed to a subscriber, plus the means to settle it.
pub struct Delivery {
    pub envelope: Envelope,
    handle: Arc<dyn AckHandle>,
}

impl Delivery {
    pub fn new(envelope: Envelope, handle: Arc<dyn AckHandle>) -> Self {
        Self { envelope, handle }
    }

    pub async fn ack(self) -> Result<(), BusError> {
        self.handle.ack().await
    }

    pub async fn nack(self, delay: Option<Duration>) -> Result<(), BusError> {
        self.handle.nack(delay).await
    }

    /// Extend the lease while the message is still being processed.
    pub async fn in_progress(&self) -> Result<bool, BusError> {
        self.handle.in_progress().await
    }

    /// How often a long-running consumer should call `in_progress`: half
    /// the lease, so one missed beat does not lose it.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.handle.lease() / 2).max(MIN_HEARTBEAT)
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish()
    }
}

/// Durable transport used by the coordinator, workers and scheduler.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait MessageBus: Send + Sync + 'static {
    /// Publish a message. Returns its bus-assigned id.
    fn publish(
        &self,
        subject: &str,
        payload: Value,
        headers: Headers,
        options: PublishOptions,
    ) -> impl std::future::Future<Output = Result<MessageId, BusError>> + Send;

    /// Start receiving messages whose subject starts with `subject_prefix`.
    fn subscribe(
        &self,
        subject_prefix: &str,
    ) -> impl std::future::Future<Output = Result<mpsc::Receiver<Delivery>, BusError>> + Send;

    /// Withdraw a message that has not been delivered yet.
    ///
    /// Returns `false` if the message is unknown, already delivered or acked.
    fn cancel_scheduled(
        &self,
        id: &MessageId,
    ) -> impl std::future::Future<Output = Result<bool, BusError>> + Send;
}
