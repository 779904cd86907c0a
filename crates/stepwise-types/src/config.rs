//! Engine configuration types for Stepwise.
//!
//! `EngineConfig` represents the `[engine]` table of `config.toml`. Every
//! field has a default so an empty or missing file yields a working engine.

use serde::{Deserialize, Serialize};

/// Top-level `config.toml` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Tunables for the coordinator, workers and message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum step-tasks a worker processes concurrently.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Seconds an unacknowledged delivery stays leased before redelivery.
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,

    /// Deliveries after which a message is dead-lettered.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// How often a polling bus checks for due messages.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Timeout applied to steps that declare none.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Delay before recovery republishes in-flight runs after start-up.
    #[serde(default = "default_recovery_delay_secs")]
    pub recovery_delay_secs: u64,

    /// Runs idle for longer than this are not recovered.
    #[serde(default = "default_recovery_max_age_secs")]
    pub recovery_max_age_secs: u64,

    /// Upper bound on the serialized run context, in bytes.
    #[serde(default = "default_max_context_bytes")]
    pub max_context_bytes: usize,
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_ack_wait_secs() -> u64 {
    30
}

fn default_max_deliveries() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_recovery_delay_secs() -> u64 {
    2
}

fn default_recovery_max_age_secs() -> u64 {
    4 * 60 * 60
}

fn default_max_context_bytes() -> usize {
    1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: default_worker_concurrency(),
            ack_wait_secs: default_ack_wait_secs(),
            max_deliveries: default_max_deliveries(),
            poll_interval_ms: default_poll_interval_ms(),
            default_step_timeout_secs: default_step_timeout_secs(),
            recovery_delay_secs: default_recovery_delay_secs(),
            recovery_max_age_secs: default_recovery_max_age_secs(),
            max_context_bytes: default_max_context_bytes(),
        }
    }
}
