//! Per-run state: one [`JobExecution`] per launched run.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::definition::JobDefinition;
use crate::{ExecutionId, JobError};

/// One run of a definition.
///
/// Executions are created by the scheduler, transition one way from
/// running to finished, and are never mutated once the finish time is set.
/// They stay in the scheduler's roster until their definition is retired.
pub struct JobExecution {
    id: ExecutionId,
    definition: Arc<dyn JobDefinition>,
    start_time: DateTime<Utc>,
    finish_time: RwLock<Option<DateTime<Utc>>>,
    error: RwLock<Option<Arc<JobError>>>,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

impl JobExecution {
    pub(crate) fn new(
        definition: Arc<dyn JobDefinition>,
        start_time: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (finished, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            definition,
            start_time,
            finish_time: RwLock::new(None),
            error: RwLock::new(None),
            cancel,
            finished,
        })
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// The definition this run belongs to.
    pub fn definition(&self) -> &Arc<dyn JobDefinition> {
        &self.definition
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn finish_time(&self) -> Option<DateTime<Utc>> {
        *self.finish_time.read()
    }

    /// Terminal error of the run, set at most once.
    pub fn error(&self) -> Option<Arc<JobError>> {
        self.error.read().clone()
    }

    /// A run is running until its finish time is set.
    pub fn is_running(&self) -> bool {
        self.finish_time.read().is_none()
    }

    /// Whether the run finished without an error. `None` while running.
    pub fn succeeded(&self) -> Option<bool> {
        if self.is_running() {
            return None;
        }
        Some(self.error.read().is_none())
    }

    /// Wall-clock time between start and finish. `None` while running.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finish_time().map(|finish| finish - self.start_time)
    }

    /// Cancel this run without affecting its siblings or the scheduler.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled when either this run or the owning scheduler is
    /// cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the run has finished and its completion hooks have fired.
    pub async fn wait(&self) {
        let mut finished = self.finished.subscribe();
        while !*finished.borrow_and_update() {
            if finished.changed().await.is_err() {
                break;
            }
        }
    }

    pub(crate) fn record_error(&self, error: JobError) {
        *self.error.write() = Some(Arc::new(error));
    }

    pub(crate) fn mark_finished(&self, at: DateTime<Utc>) {
        *self.finish_time.write() = Some(at);
    }

    pub(crate) fn notify_finished(&self) {
        self.finished.send_replace(true);
    }
}

impl fmt::Debug for JobExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobExecution")
            .field("id", &self.id)
            .field("definition", &self.definition.id())
            .field("start_time", &self.start_time)
            .field("finish_time", &*self.finish_time.read())
            .field("error", &self.error.read().as_deref().map(|e| e.to_string()))
            .finish()
    }
}
