//! Message envelope carried by the bus.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Bus-assigned message identifier (UUIDv7).
pub type MessageId = Uuid;

/// String headers attached to a message (trace context, etc.).
pub type Headers = HashMap<String, String>;

/// A message as handed to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub subject: String,
    pub payload: Value,
    #[serde(default)]
    pub headers: Headers,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    /// Deserialize the payload into a typed message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Whether this envelope's subject falls under `prefix`.
    pub fn matches(&self, prefix: &str) -> bool {
        self.subject.starts_with(prefix)
    }
}
