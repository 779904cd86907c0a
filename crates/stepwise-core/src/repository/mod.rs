//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepwise-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` provides an in-process
//! implementation for embedding and tests.

pub mod memory;
pub mod workflow;

/// Filter for run list queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    /// Only runs of this workflow definition id.
    pub definition_id: Option<String>,
    /// Only runs in this status.
    pub status: Option<stepwise_types::workflow::RunStatus>,
    /// Maximum rows returned (newest first). `None` means the default of 50.
    pub limit: Option<u32>,
}

impl RunFilter {
    pub fn limit_or_default(&self) -> u32 {
        self.limit.unwrap_or(50)
    }
}
