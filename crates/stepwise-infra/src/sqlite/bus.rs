//! SQLite-backed durable `MessageBus`.
//!
//! Messages live in `bus_messages` until acknowledged, so scheduled timers,
//! cron ticks and in-flight step tasks survive a restart. A dispatcher task
//! (spawned on the first `subscribe`) polls for due rows, leases each one for
//! `ack_wait` and hands it to a matching subscriber. Leasing is a guarded
//! UPDATE on `delivery_count`, so two processes sharing the database never
//! lease the same delivery twice. The same guard scopes `in_progress` lease
//! extensions to the delivery that holds the lease. Rows that exceed
//! `max_deliveries` move to `bus_dead_letters`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use stepwise_core::message::{
    AckHandle, BusError, Delivery, Envelope, Headers, MessageBus, MessageId, PublishOptions,
};
use stepwise_types::config::EngineConfig;
use tokio::sync::{Mutex, Notify, mpsc};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid};

/// Buffer size for each subscriber's delivery channel.
const SUBSCRIBER_BUFFER: usize = 256;

/// Rows examined per dispatch pass.
const DISPATCH_BATCH: i64 = 256;

struct Subscriber {
    prefix: String,
    sender: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct Subscribers {
    list: Vec<Subscriber>,
    next: usize,
}

struct Shared {
    pool: DatabasePool,
    subscribers: Mutex<Subscribers>,
    notify: Arc<Notify>,
    ack_wait: Duration,
    max_deliveries: u32,
    poll_interval: Duration,
    dispatcher_started: AtomicBool,
}

/// Durable `MessageBus` stored in the workflow database.
#[derive(Clone)]
pub struct SqliteMessageBus {
    shared: Arc<Shared>,
}

fn storage_error(e: impl std::fmt::Display) -> BusError {
    BusError::Storage(e.to_string())
}

impl SqliteMessageBus {
    pub fn new(
        pool: DatabasePool,
        ack_wait: Duration,
        max_deliveries: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                subscribers: Mutex::new(Subscribers::default()),
                notify: Arc::new(Notify::new()),
                ack_wait,
                max_deliveries: max_deliveries.max(1),
                poll_interval,
                dispatcher_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(pool: DatabasePool, config: &EngineConfig) -> Self {
        Self::new(
            pool,
            Duration::from_secs(config.ack_wait_secs),
            config.max_deliveries,
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    /// Messages not yet acknowledged (scheduled, due or leased).
    pub async fn pending_count(&self) -> Result<usize, BusError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM bus_messages")
            .fetch_one(&self.shared.pool.reader)
            .await
            .map_err(storage_error)?;
        let n: i64 = row.try_get("n").map_err(storage_error)?;
        Ok(n as usize)
    }

    /// Messages dropped after exhausting `max_deliveries`, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<Envelope>, BusError> {
        let rows = sqlx::query("SELECT * FROM bus_dead_letters ORDER BY dead_at ASC")
            .fetch_all(&self.shared.pool.reader)
            .await
            .map_err(storage_error)?;
        rows.iter().map(envelope_from_row).collect()
    }

    fn ensure_dispatcher(&self) {
        if !self.shared.dispatcher_started.swap(true, Ordering::SeqCst) {
            let weak = Arc::downgrade(&self.shared);
            let notify = self.shared.notify.clone();
            tokio::spawn(dispatch_loop(weak, notify));
        }
    }
}

fn envelope_from_row(row: &SqliteRow) -> Result<Envelope, BusError> {
    let id: String = row.try_get("id").map_err(storage_error)?;
    let payload: String = row.try_get("payload").map_err(storage_error)?;
    let headers: String = row.try_get("headers").map_err(storage_error)?;
    let delivery_count: i64 = row.try_get("delivery_count").map_err(storage_error)?;
    let published_at: String = row.try_get("published_at").map_err(storage_error)?;
    Ok(Envelope {
        id: parse_uuid(&id).map_err(storage_error)?,
        subject: row.try_get("subject").map_err(storage_error)?,
        payload: serde_json::from_str(&payload)?,
        headers: serde_json::from_str(&headers)?,
        delivery_count: delivery_count.max(0) as u32,
        published_at: parse_datetime(&published_at).map_err(storage_error)?,
    })
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

async fn dispatch_loop(weak: Weak<Shared>, notify: Arc<Notify>) {
    loop {
        let Some(shared) = weak.upgrade() else {
            tracing::debug!("sqlite bus dropped, dispatcher exiting");
            return;
        };
        let next_wake = match dispatch_due(&shared).await {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(error = %e, "bus dispatch failed");
                None
            }
        };
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

/// Deliver every due row. Returns the earliest future time at which a
/// scheduled row becomes due or a lease expires.
async fn dispatch_due(shared: &Arc<Shared>) -> Result<Option<DateTime<Utc>>, BusError> {
    let now = Utc::now();
    let now_str = format_datetime(&now);
    let mut subscribers = shared.subscribers.lock().await;
    subscribers.list.retain(|s| !s.sender.is_closed());

    let rows = sqlx::query(
        r#"SELECT * FROM bus_messages
           WHERE (lease_until IS NULL AND deliver_at <= ?1)
              OR (lease_until IS NOT NULL AND lease_until <= ?1)
           ORDER BY id ASC
           LIMIT ?2"#,
    )
    .bind(&now_str)
    .bind(DISPATCH_BATCH)
    .fetch_all(&shared.pool.writer)
    .await
    .map_err(storage_error)?;

    for row in &rows {
        let envelope = envelope_from_row(row)?;

        if envelope.delivery_count >= shared.max_deliveries {
            dead_letter(shared, &envelope).await?;
            continue;
        }

        let count = subscribers.list.len();
        for offset in 0..count {
            let index = (subscribers.next + offset) % count;
            let subscriber = &subscribers.list[index];
            if !envelope.matches(&subscriber.prefix) || subscriber.sender.capacity() == 0 {
                continue;
            }
            if !lease(shared, &envelope, now).await? {
                break;
            }

            let mut delivered = envelope.clone();
            delivered.delivery_count += 1;
            let handle = Arc::new(SqliteAck {
                shared: Arc::downgrade(shared),
                id: envelope.id,
                delivery_count: delivered.delivery_count,
            });
            if subscriber.sender.try_send(Delivery::new(delivered, handle)).is_err() {
                release(shared, &envelope).await?;
                continue;
            }
            subscribers.next = (index + 1) % count;
            break;
        }
    }
    drop(subscribers);

    let row = sqlx::query(
        "SELECT MIN(COALESCE(lease_until, deliver_at)) AS next_at FROM bus_messages",
    )
    .fetch_one(&shared.pool.writer)
    .await
    .map_err(storage_error)?;
    let next_at: Option<String> = row.try_get("next_at").map_err(storage_error)?;
    Ok(next_at
        .as_deref()
        .and_then(|s| parse_datetime(s).ok())
        .filter(|at| *at > now))
}

/// Take the lease on a due row. Fails when another dispatcher got there first.
async fn lease(shared: &Shared, envelope: &Envelope, now: DateTime<Utc>) -> Result<bool, BusError> {
    let lease_until = now + shared.lease_period();
    let result = sqlx::query(
        r#"UPDATE bus_messages SET lease_until = ?, delivery_count = delivery_count + 1
           WHERE id = ? AND delivery_count = ?"#,
    )
    .bind(format_datetime(&lease_until))
    .bind(envelope.id.to_string())
    .bind(envelope.delivery_count as i64)
    .execute(&shared.pool.writer)
    .await
    .map_err(storage_error)?;
    Ok(result.rows_affected() == 1)
}

/// Undo a lease whose delivery never reached the subscriber.
async fn release(shared: &Shared, envelope: &Envelope) -> Result<(), BusError> {
    sqlx::query(
        r#"UPDATE bus_messages SET lease_until = NULL, delivery_count = ?
           WHERE id = ?"#,
    )
    .bind(envelope.delivery_count as i64)
    .bind(envelope.id.to_string())
    .execute(&shared.pool.writer)
    .await
    .map_err(storage_error)?;
    Ok(())
}

async fn dead_letter(shared: &Shared, envelope: &Envelope) -> Result<(), BusError> {
    tracing::warn!(
        message_id = %envelope.id,
        subject = %envelope.subject,
        deliveries = envelope.delivery_count,
        "message exceeded max deliveries, dead-lettering"
    );
    let mut tx = shared.pool.writer.begin().await.map_err(storage_error)?;
    sqlx::query(
        r#"INSERT INTO bus_dead_letters
           (id, subject, payload, headers, delivery_count, published_at, dead_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(id) DO NOTHING"#,
    )
    .bind(envelope.id.to_string())
    .bind(&envelope.subject)
    .bind(serde_json::to_string(&envelope.payload)?)
    .bind(serde_json::to_string(&envelope.headers)?)
    .bind(envelope.delivery_count as i64)
    .bind(format_datetime(&envelope.published_at))
    .bind(format_datetime(&Utc::now()))
    .execute(&mut *tx)
    .await
    .map_err(storage_error)?;
    sqlx::query("DELETE FROM bus_messages WHERE id = ?")
        .bind(envelope.id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;
    tx.commit().await.map_err(storage_error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Acknowledgement
// ---------------------------------------------------------------------------

impl Shared {
    fn lease_period(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ack_wait).unwrap_or(chrono::Duration::seconds(30))
    }
}

struct SqliteAck {
    shared: Weak<Shared>,
    id: MessageId,
    /// `delivery_count` stored on the row while this delivery holds the lease.
    delivery_count: u32,
}

impl AckHandle for SqliteAck {
    fn ack(&self) -> BoxFuture<'_, Result<(), BusError>> {
        Box::pin(async move {
            let shared = self.shared.upgrade().ok_or(BusError::Closed)?;
            sqlx::query("DELETE FROM bus_messages WHERE id = ?")
                .bind(self.id.to_string())
                .execute(&shared.pool.writer)
                .await
                .map_err(storage_error)?;
            Ok(())
        })
    }

    fn nack(&self, delay: Option<Duration>) -> BoxFuture<'_, Result<(), BusError>> {
        Box::pin(async move {
            let shared = self.shared.upgrade().ok_or(BusError::Closed)?;
            let delay = delay
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .unwrap_or(chrono::Duration::zero());
            sqlx::query("UPDATE bus_messages SET lease_until = NULL, deliver_at = ? WHERE id = ?")
                .bind(format_datetime(&(Utc::now() + delay)))
                .bind(self.id.to_string())
                .execute(&shared.pool.writer)
                .await
                .map_err(storage_error)?;
            shared.notify.notify_one();
            Ok(())
        })
    }

    fn in_progress(&self) -> BoxFuture<'_, Result<bool, BusError>> {
        Box::pin(async move {
            let shared = self.shared.upgrade().ok_or(BusError::Closed)?;
            let lease_until = Utc::now() + shared.lease_period();
            let result = sqlx::query(
                r#"UPDATE bus_messages SET lease_until = ?
                   WHERE id = ? AND delivery_count = ? AND lease_until IS NOT NULL"#,
            )
            .bind(format_datetime(&lease_until))
            .bind(self.id.to_string())
            .bind(self.delivery_count as i64)
            .execute(&shared.pool.writer)
            .await
            .map_err(storage_error)?;
            Ok(result.rows_affected() == 1)
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

impl MessageBus for SqliteMessageBus {
    async fn publish(
        &self,
        subject: &str,
        payload: Value,
        headers: Headers,
        options: PublishOptions,
    ) -> Result<MessageId, BusError> {
        let now = Utc::now();
        let id = Uuid::now_v7();
        sqlx::query(
            r#"INSERT INTO bus_messages
               (id, subject, payload, headers, delivery_count, published_at, deliver_at)
               VALUES (?, ?, ?, ?, 0, ?, ?)"#,
        )
        .bind(id.to_string())
        .bind(subject)
        .bind(serde_json::to_string(&payload)?)
        .bind(serde_json::to_string(&headers)?)
        .bind(format_datetime(&now))
        .bind(format_datetime(&options.deliver_at.unwrap_or(now)))
        .execute(&self.shared.pool.writer)
        .await
        .map_err(storage_error)?;
        self.shared.notify.notify_one();
        tracing::debug!(message_id = %id, subject, "published message");
        Ok(id)
    }

    async fn subscribe(&self, subject_prefix: &str) -> Result<mpsc::Receiver<Delivery>, BusError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.shared.subscribers.lock().await.list.push(Subscriber {
            prefix: subject_prefix.to_string(),
            sender,
        });
        self.ensure_dispatcher();
        self.shared.notify.notify_one();
        Ok(receiver)
    }

    async fn cancel_scheduled(&self, id: &MessageId) -> Result<bool, BusError> {
        let result = sqlx::query("DELETE FROM bus_messages WHERE id = ? AND lease_until IS NULL")
            .bind(id.to_string())
            .execute(&self.shared.pool.writer)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::test_pool;
    use serde_json::json;

    fn bus(pool: DatabasePool, ack_wait_ms: u64) -> SqliteMessageBus {
        SqliteMessageBus::new(
            pool,
            Duration::from_millis(ack_wait_ms),
            3,
            Duration::from_millis(10),
        )
    }

    async fn recv(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_publish_ack_removes_row() {
        let (_dir, pool) = test_pool().await;
        let bus = bus(pool, 1_000);
        let mut rx = bus.subscribe("workflow.run.").await.unwrap();

        let mut headers = Headers::new();
        headers.insert("traceparent".into(), "00-abc-def-01".into());
        bus.publish("workflow.run.x", json!({"n": 1}), headers, PublishOptions::immediate())
            .await
            .unwrap();

        let delivery = recv(&mut rx).await;
        assert_eq!(delivery.envelope.payload, json!({"n": 1}));
        assert_eq!(delivery.envelope.delivery_count, 1);
        assert_eq!(
            delivery.envelope.headers.get("traceparent").map(String::as_str),
            Some("00-abc-def-01")
        );
        delivery.ack().await.unwrap();
        assert_eq!(bus.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_subject_stays_pending() {
        let (_dir, pool) = test_pool().await;
        let bus = bus(pool, 1_000);
        let mut rx = bus.subscribe("workflow.run.").await.unwrap();
        bus.publish("workflow.cron.a", json!(1), Headers::new(), PublishOptions::immediate())
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(got.is_err());
        assert_eq!(bus.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delayed_delivery_waits_until_due() {
        let (_dir, pool) = test_pool().await;
        let bus = bus(pool, 1_000);
        let mut rx = bus.subscribe("t.").await.unwrap();

        let started = std::time::Instant::now();
        bus.publish("t.a", json!(1), Headers::new(), PublishOptions::after(Duration::from_millis(150)))
            .await
            .unwrap();

        let delivery = recv(&mut rx).await;
        assert!(started.elapsed() >= Duration::from_millis(140));
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_redelivers() {
        let (_dir, pool) = test_pool().await;
        let bus = bus(pool, 50);
        let mut rx = bus.subscribe("t.").await.unwrap();
        bus.publish("t.a", json!(1), Headers::new(), PublishOptions::immediate())
            .await
            .unwrap();

        let first = recv(&mut rx).await;
        let second = recv(&mut rx).await;
        assert_eq!(first.envelope.id, second.envelope.id);
        assert_eq!(second.envelope.delivery_count, 2);
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_in_progress_extends_lease_for_current_delivery_only() {
        let (_dir, pool) = test_pool().await;
        let bus = bus(pool, 80);
        let mut rx = bus.subscribe("t.").await.unwrap();
        bus.publish("t.a", json!(1), Headers::new(), PublishOptions::immediate())
            .await
            .unwrap();

        let delivery = recv(&mut rx).await;
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(delivery.in_progress().await.unwrap());
        }
        assert!(rx.try_recv().is_err(), "extended lease must not be redelivered");

        // Stop beating: the lease runs out and the next delivery owns it.
        let second = recv(&mut rx).await;
        assert_eq!(second.envelope.delivery_count, 2);
        assert!(!delivery.in_progress().await.unwrap());
        assert!(second.in_progress().await.unwrap());
        second.ack().await.unwrap();
        assert!(!delivery.in_progress().await.unwrap());
    }

    #[tokio::test]
    async fn test_max_deliveries_dead_letters() {
        let (_dir, pool) = test_pool().await;
        let bus = bus(pool, 1_000);
        let mut rx = bus.subscribe("t.").await.unwrap();
        bus.publish("t.a", json!({"k": "v"}), Headers::new(), PublishOptions::immediate())
            .await
            .unwrap();

        for _ in 0..3 {
            recv(&mut rx).await.nack(None).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(bus.pending_count().await.unwrap(), 0);
        let dead = bus.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, json!({"k": "v"}));
        assert_eq!(dead[0].delivery_count, 3);
    }

    #[tokio::test]
    async fn test_cancel_scheduled_only_before_delivery() {
        let (_dir, pool) = test_pool().await;
        let bus = bus(pool, 1_000);
        let mut rx = bus.subscribe("t.").await.unwrap();
        let scheduled = bus
            .publish("t.a", json!(1), Headers::new(), PublishOptions::after(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(bus.cancel_scheduled(&scheduled).await.unwrap());
        assert!(!bus.cancel_scheduled(&scheduled).await.unwrap());

        let leased = bus
            .publish("t.b", json!(2), Headers::new(), PublishOptions::immediate())
            .await
            .unwrap();
        let delivery = recv(&mut rx).await;
        assert_eq!(delivery.envelope.id, leased);
        assert!(!bus.cancel_scheduled(&leased).await.unwrap());
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_messages_survive_reopen() {
        let (dir, pool) = test_pool().await;
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        let id = bus(pool, 1_000)
            .publish("t.a", json!("durable"), Headers::new(), PublishOptions::immediate())
            .await
            .unwrap();

        let reopened = bus(DatabasePool::new(&url).await.unwrap(), 1_000);
        assert_eq!(reopened.pending_count().await.unwrap(), 1);
        let mut rx = reopened.subscribe("t.").await.unwrap();
        let delivery = recv(&mut rx).await;
        assert_eq!(delivery.envelope.id, id);
        assert_eq!(delivery.envelope.payload, json!("durable"));
        delivery.ack().await.unwrap();
    }
}
