//! Scheduler configuration types and builders

use serde::{Deserialize, Serialize};
use service_builder::builder;
use std::time::Duration;

/// Tuning knobs for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[builder]
pub struct SchedulerConfig {
    /// How often the dispatch loop polls the registry for due definitions
    #[builder(default = "Duration::from_secs(1)", getter)]
    pub poll_frequency: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_frequency: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfigBuilder {
    /// Fast polling for local development.
    pub fn development() -> Self {
        SchedulerConfigBuilder::new().poll_frequency(Duration::from_millis(100))
    }

    /// Minimal dispatch latency for tests.
    pub fn testing() -> Self {
        SchedulerConfigBuilder::new().poll_frequency(Duration::from_millis(10))
    }
}
