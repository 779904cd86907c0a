//! Workflow engine: definitions, execution, coordination and scheduling.
//!
//! - `definition` -- YAML/JSON parsing, validation, content hashing
//! - `context` -- per-run JSON context, dot paths, `{{ }}` templates
//! - `expression` -- JEXL evaluator with undefined-reference detection
//! - `schema` -- shape validation and producer/consumer compatibility
//! - `executor` -- step executor trait, registry, transition resolution
//! - `steps` -- built-in executors, one per state kind
//! - `branch` -- inline execution of parallel/foreach/try sub-graphs
//! - `retry` -- backoff policy
//! - `agent` -- collaborator contract for operation steps
//! - `coordinator` -- run lifecycle, per-run serialization, recovery
//! - `worker` -- bus consumer driving the coordinator
//! - `scheduler` -- cron trigger schedules and ticks

pub mod agent;
pub mod branch;
pub mod context;
pub mod coordinator;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod steps;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
