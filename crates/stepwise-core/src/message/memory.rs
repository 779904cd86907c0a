//! In-process `MessageBus` with delayed delivery, leases and redelivery.
//!
//! A single dispatcher task (spawned on the first `subscribe`) hands due
//! messages to matching subscribers round-robin. Delivered messages stay
//! leased for `ack_wait`; an expired lease or a `nack` makes them due again,
//! and `in_progress` pushes the lease out by another `ack_wait`.
//! Messages that exceed `max_deliveries` are moved to a dead-letter list.
//!
//! Nothing survives a process restart; durable deployments use the SQLite
//! bus from `stepwise-infra`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use stepwise_types::config::EngineConfig;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::bus::{AckHandle, BusError, Delivery, MessageBus, PublishOptions};
use super::envelope::{Envelope, Headers, MessageId};

/// Buffer size for each subscriber's delivery channel.
const SUBSCRIBER_BUFFER: usize = 256;

struct StoredMessage {
    envelope: Envelope,
    deliver_at: DateTime<Utc>,
    lease_until: Option<DateTime<Utc>>,
}

struct Subscriber {
    prefix: String,
    sender: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct BusState {
    /// Keyed by UUIDv7 so iteration order is publish order.
    messages: BTreeMap<MessageId, StoredMessage>,
    subscribers: Vec<Subscriber>,
    next_subscriber: usize,
    dead_letters: Vec<Envelope>,
}

struct Shared {
    state: Mutex<BusState>,
    notify: Arc<Notify>,
    ack_wait: Duration,
    max_deliveries: u32,
    poll_interval: Duration,
    dispatcher_started: AtomicBool,
}

/// In-memory implementation of `MessageBus`.
///
/// Cloning shares the underlying queues.
#[derive(Clone)]
pub struct InMemoryMessageBus {
    shared: Arc<Shared>,
}

impl InMemoryMessageBus {
    pub fn new(ack_wait: Duration, max_deliveries: u32, poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::default()),
                notify: Arc::new(Notify::new()),
                ack_wait,
                max_deliveries: max_deliveries.max(1),
                poll_interval,
                dispatcher_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Duration::from_secs(config.ack_wait_secs),
            config.max_deliveries,
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    /// Messages not yet acknowledged (scheduled, due or leased).
    pub async fn pending_count(&self) -> usize {
        self.shared.state.lock().await.messages.len()
    }

    /// Messages dropped after exhausting `max_deliveries`.
    pub async fn dead_letters(&self) -> Vec<Envelope> {
        self.shared.state.lock().await.dead_letters.clone()
    }

    fn ensure_dispatcher(&self) {
        if !self.shared.dispatcher_started.swap(true, Ordering::SeqCst) {
            let weak = Arc::downgrade(&self.shared);
            let notify = self.shared.notify.clone();
            tokio::spawn(dispatch_loop(weak, notify));
        }
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

async fn dispatch_loop(weak: Weak<Shared>, notify: Arc<Notify>) {
    loop {
        let Some(shared) = weak.upgrade() else {
            debug!("in-memory bus dropped, dispatcher exiting");
            return;
        };
        let next_wake = dispatch_due(&shared).await;
        let idle = shared.poll_interval;
        drop(shared);

        let sleep_for = next_wake
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .map(|d| d.min(idle))
            .unwrap_or(idle);

        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

/// Deliver every due message. Returns the earliest future time at which a
/// scheduled message becomes due or a lease expires.
async fn dispatch_due(shared: &Arc<Shared>) -> Option<DateTime<Utc>> {
    let now = Utc::now();
    let mut state = shared.state.lock().await;
    let BusState {
        messages,
        subscribers,
        next_subscriber,
        dead_letters,
    } = &mut *state;

    subscribers.retain(|s| !s.sender.is_closed());

    let mut next_wake: Option<DateTime<Utc>> = None;
    let mut wake_at = |at: DateTime<Utc>| {
        next_wake = Some(next_wake.map_or(at, |w| w.min(at)));
    };

    let ids: Vec<MessageId> = messages.keys().copied().collect();
    for id in ids {
        let Some(message) = messages.get_mut(&id) else {
            continue;
        };

        let due = match message.lease_until {
            Some(lease) if lease > now => {
                wake_at(lease);
                false
            }
            Some(_) => true,
            None if message.deliver_at > now => {
                wake_at(message.deliver_at);
                false
            }
            None => true,
        };
        if !due {
            continue;
        }

        if message.envelope.delivery_count >= shared.max_deliveries {
            if let Some(dead) = messages.remove(&id) {
                warn!(
                    message_id = %id,
                    subject = %dead.envelope.subject,
                    deliveries = dead.envelope.delivery_count,
                    "message exceeded max deliveries, dead-lettering"
                );
                dead_letters.push(dead.envelope);
            }
            continue;
        }

        if subscribers.is_empty() {
            continue;
        }

        let count = subscribers.len();
        for offset in 0..count {
            let index = (*next_subscriber + offset) % count;
            let subscriber = &subscribers[index];
            if !message.envelope.matches(&subscriber.prefix) {
                continue;
            }

            let mut envelope = message.envelope.clone();
            envelope.delivery_count += 1;
            let handle = Arc::new(MemoryAck {
                shared: Arc::downgrade(shared),
                id,
                delivery_count: envelope.delivery_count,
            });
            match subscriber.sender.try_send(Delivery::new(envelope, handle)) {
                Ok(()) => {
                    message.envelope.delivery_count += 1;
                    let lease = now + shared.lease_period();
                    message.lease_until = Some(lease);
                    wake_at(lease);
                    *next_subscriber = (index + 1) % count;
                    break;
                }
                Err(_) => continue,
            }
        }
    }

    next_wake
}

// ---------------------------------------------------------------------------
// Acknowledgement
// ---------------------------------------------------------------------------

impl Shared {
    fn lease_period(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ack_wait).unwrap_or(chrono::Duration::seconds(30))
    }
}

struct MemoryAck {
    shared: Weak<Shared>,
    id: MessageId,
    /// Delivery number this handle was issued for.
    delivery_count: u32,
}

impl AckHandle for MemoryAck {
    fn ack(&self) -> BoxFuture<'_, Result<(), BusError>> {
        Box::pin(async move {
            let shared = self.shared.upgrade().ok_or(BusError::Closed)?;
            shared.state.lock().await.messages.remove(&self.id);
            Ok(())
        })
    }

    fn nack(&self, delay: Option<Duration>) -> BoxFuture<'_, Result<(), BusError>> {
        Box::pin(async move {
            let shared = self.shared.upgrade().ok_or(BusError::Closed)?;
            {
                let mut state = shared.state.lock().await;
                if let Some(message) = state.messages.get_mut(&self.id) {
                    let delay = delay
                        .and_then(|d| chrono::Duration::from_std(d).ok())
                        .unwrap_or(chrono::Duration::zero());
                    message.lease_until = None;
                    message.deliver_at = Utc::now() + delay;
                }
            }
            shared.notify.notify_one();
            Ok(())
        })
    }

    fn in_progress(&self) -> BoxFuture<'_, Result<bool, BusError>> {
        Box::pin(async move {
            let shared = self.shared.upgrade().ok_or(BusError::Closed)?;
            let mut state = shared.state.lock().await;
            let Some(message) = state.messages.get_mut(&self.id) else {
                return Ok(false);
            };
            let leased = message.lease_until.is_some()
                && message.envelope.delivery_count == self.delivery_count;
            if !leased {
                return Ok(false);
            }
            message.lease_until = Some(Utc::now() + shared.lease_period());
            Ok(true)
        })
    }

    fn lease(&self) -> Duration {
        self.shared
            .upgrade()
            .map_or(Duration::from_secs(30), |shared| shared.ack_wait)
    }
}

// ---------------------------------------------------------------------------
// MessageBus impl
// ---------------------------------------------------------------------------

impl MessageBus for InMemoryMessageBus {
    async fn publish(
        &self,
        subject: &str,
        payload: Value,
        headers: Headers,
        options: PublishOptions,
    ) -> Result<MessageId, BusError> {
        let now = Utc::now();
        let id = Uuid::now_v7();
        let message = StoredMessage {
            envelope: Envelope {
                id,
                subject: subject.to_string(),
                payload,
                headers,
                delivery_count: 0,
                published_at: now,
            },
            deliver_at: options.deliver_at.unwrap_or(now),
            lease_until: None,
        };
        self.shared.state.lock().await.messages.insert(id, message);
        self.shared.notify.notify_one();
        debug!(message_id = %id, subject, "published message");
        Ok(id)
    }

    async fn subscribe(&self, subject_prefix: &str) -> Result<mpsc::Receiver<Delivery>, BusError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.shared.state.lock().await.subscribers.push(Subscriber {
            prefix: subject_prefix.to_string(),
            sender,
        });
        self.ensure_dispatcher();
        self.shared.notify.notify_one();
        Ok(receiver)
    }

    async fn cancel_scheduled(&self, id: &MessageId) -> Result<bool, BusError> {
        let mut state = self.shared.state.lock().await;
        let cancellable = state
            .messages
            .get(id)
            .is_some_and(|m| m.lease_until.is_none());
        if cancellable {
            state.messages.remove(id);
        }
        Ok(cancellable)
    }
}
