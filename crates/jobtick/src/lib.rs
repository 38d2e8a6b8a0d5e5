//! # jobtick
//!
//! In-process job scheduling for async Rust applications.
//!
//! A [`Scheduler`] owns a registry of job definitions, polls it on a fixed
//! frequency, and launches every due definition as an independent Tokio
//! task. Each run is tracked as a [`JobExecution`] with one-way lifecycle
//! state, a cancellation token linked to the scheduler, and start/finish
//! events for observers.
//!
//! ## Features
//!
//! - **Cron and one-shot schedules**: standard 5- or 6-field cron
//!   expressions evaluated in UTC, with earliest-start bounds and optional
//!   jitter windows
//! - **Overlap control**: runs of one definition are serialized by default;
//!   due instants that fall while a run is in flight are dropped, not queued
//! - **Retry integration**: pluggable [`RetryPolicy`] implementations drive
//!   the workload attempt by attempt
//! - **Cancellation tree**: stopping the scheduler cancels every run, then
//!   waits for user code to wind down
//! - **Dependency injection seam**: an optional [`ServiceProvider`] opens a
//!   scope per execution for constructor-injected runners
//!
//! ## Quick Start
//!
//! ```rust
//! use jobtick::{ActionJob, Schedule, Scheduler};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let scheduler = Scheduler::new();
//!
//! scheduler.add(
//!     ActionJob::new("heartbeat", "Heartbeat", |execution, _services, _cancel| async move {
//!         println!("beat from execution {}", execution.id());
//!         Ok(())
//!     })
//!     .with_schedule(Schedule::cron("*/1 * * * * *")),
//! );
//!
//! scheduler.start_with_poll(Duration::from_millis(10));
//! tokio::time::sleep(Duration::from_millis(50)).await;
//! scheduler.stop().await;
//!
//! assert!(!scheduler.is_running());
//! # });
//! ```

use thiserror::Error;
use uuid::Uuid;

pub mod clock;
pub mod config;
pub mod definition;
pub mod execution;
pub mod notify;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod services;

pub use clock::*;
pub use config::*;
pub use definition::*;
pub use execution::*;
pub use notify::*;
pub use retry::*;
pub use schedule::*;
pub use scheduler::*;
pub use services::*;

/// Unique identifier of one execution.
pub type ExecutionId = Uuid;

/// Terminal failure of a single run.
#[derive(Debug, Error)]
pub enum JobError {
    /// The run was cancelled before user code finished.
    #[error("execution was cancelled")]
    Cancelled,

    /// A failure described by a plain message.
    #[error("{0}")]
    Message(String),

    /// Any other error surfaced by user code.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl JobError {
    /// Failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        JobError::Message(message.into())
    }

    /// Failure wrapping an arbitrary error.
    pub fn other(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        JobError::Other(Box::new(error))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

/// Result type for job workloads and scheduler plumbing.
pub type JobResult<T> = Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_errors_display_their_text() {
        let error = JobError::msg("disk full");
        assert_eq!(error.to_string(), "disk full");
        assert!(!error.is_cancelled());
    }

    #[test]
    fn cancelled_is_recognizable() {
        assert!(JobError::Cancelled.is_cancelled());
    }

    #[test]
    fn other_preserves_the_source_message() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "broken pipe");
        let error = JobError::other(io);
        assert_eq!(error.to_string(), "broken pipe");
    }
}
