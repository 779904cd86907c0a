//! Durable message bus contract and the in-process implementation.
//!
//! - `envelope` -- the message as delivered (id, subject, payload, headers)
//! - `bus` -- `MessageBus` trait, delivery acknowledgement, errors
//! - `memory` -- `InMemoryMessageBus` with delayed delivery and redelivery

pub mod bus;
pub mod envelope;
pub mod memory;

pub use bus::{AckHandle, BusError, Delivery, MessageBus, PublishOptions};
pub use envelope::{Envelope, Headers, MessageId};
pub use memory::InMemoryMessageBus;
