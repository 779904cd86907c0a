//! Shared domain types for Stepwise.
//!
//! This crate contains the types every other crate agrees on: workflow
//! definitions, run and step-run records, bus message payloads, engine
//! configuration, and the storage error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod message;
pub mod workflow;
