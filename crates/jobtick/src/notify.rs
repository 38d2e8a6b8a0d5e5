//! Observer surface: notifier sinks and start/finish hooks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::definition::JobDefinition;
use crate::execution::JobExecution;

/// Sink for scheduler lifecycle events.
///
/// Hooks run synchronously from the emitting context (the dispatch tick
/// or an execution body) and must therefore be quick and non-blocking.
/// Every hook defaults to a no-op; implement only the ones of interest.
pub trait Notifier: Send + Sync {
    fn definition_added(&self, _definition: &Arc<dyn JobDefinition>) {}

    fn definition_removed(&self, _definition: &Arc<dyn JobDefinition>) {}

    fn scheduler_started(&self) {}

    fn scheduler_stopped(&self) {}

    fn job_started(&self, _execution: &Arc<JobExecution>) {}

    fn job_finished(&self, _execution: &Arc<JobExecution>) {}
}

/// Plain handler registered for job start/finish events.
pub type ExecutionHook = Arc<dyn Fn(&Arc<JobExecution>) + Send + Sync>;

/// Invoke an observer, logging instead of propagating a panic.
pub(crate) fn guarded<F: FnOnce()>(context: &str, hook: F) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        error!("{context} observer panicked; ignoring");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_swallows_panics() {
        guarded("test", || panic!("boom"));
    }

    #[test]
    fn guarded_runs_the_hook() {
        let mut ran = false;
        guarded("test", || ran = true);
        assert!(ran);
    }
}
