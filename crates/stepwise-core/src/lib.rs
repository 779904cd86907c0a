//! Workflow engine and port definitions for Stepwise.
//!
//! This crate defines the "ports" (repository, message bus, trace
//! propagation, agent execution) that the infrastructure layer implements,
//! plus the engine itself: definition loading, step executors, the run
//! coordinator, workers and cron scheduling. It depends only on
//! `stepwise-types` -- never on `stepwise-infra` or any database/IO crate.
//!
//! In-memory implementations of the repository and bus ship here so the
//! engine can be embedded and tested without infrastructure.

pub mod message;
pub mod repository;
pub mod trace;
pub mod workflow;
