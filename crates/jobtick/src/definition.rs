//! Job definitions: what to run and when.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::execution::JobExecution;
use crate::retry::{run_with_policy, RetryContext, RetryPolicy};
use crate::schedule::Schedule;
use crate::services::ServiceScope;
use crate::JobResult;

/// A registered specification of work: identity, schedule, overlap rule,
/// retry policy and the workload itself.
///
/// The scheduler treats every attribute as read-only after `add`; the
/// schedule sits behind a mutex only so the launch path can record the
/// start of each run.
#[async_trait]
pub trait JobDefinition: Send + Sync {
    /// Stable identifier, unique per registry in practice.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    fn schedule(&self) -> Option<&Mutex<Schedule>>;

    /// Whether two runs of this definition may be in flight at once.
    fn executions_can_overlap(&self) -> bool {
        false
    }

    fn retry_policy(&self) -> Option<Arc<dyn RetryPolicy>> {
        None
    }

    /// Run the workload under the retry policy, observing cancellation.
    /// Terminal failures are surfaced unchanged, never swallowed.
    async fn execute(
        &self,
        execution: Arc<JobExecution>,
        services: Option<Arc<dyn ServiceScope>>,
        cancel: CancellationToken,
    ) -> JobResult<()>;
}

/// Boxed workload of an [`ActionJob`], invoked once per attempt.
pub type JobAction = Arc<
    dyn Fn(
            Arc<JobExecution>,
            Option<Arc<dyn ServiceScope>>,
            CancellationToken,
        ) -> BoxFuture<'static, JobResult<()>>
        + Send
        + Sync,
>;

/// Definition backed by an async closure.
pub struct ActionJob {
    id: String,
    name: String,
    schedule: Option<Mutex<Schedule>>,
    overlap: bool,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    action: JobAction,
}

impl ActionJob {
    pub fn new<F, Fut>(id: impl Into<String>, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(Arc<JobExecution>, Option<Arc<dyn ServiceScope>>, CancellationToken) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = JobResult<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            schedule: None,
            overlap: false,
            retry_policy: None,
            action: Arc::new(move |execution, services, cancel| {
                Box::pin(action(execution, services, cancel))
            }),
        }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(Mutex::new(schedule));
        self
    }

    /// Allow runs of this definition to overlap. Off by default: due
    /// instants that fall while a run is in flight are dropped, not queued.
    pub fn allow_overlap(mut self) -> Self {
        self.overlap = true;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

#[async_trait]
impl JobDefinition for ActionJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self) -> Option<&Mutex<Schedule>> {
        self.schedule.as_ref()
    }

    fn executions_can_overlap(&self) -> bool {
        self.overlap
    }

    fn retry_policy(&self) -> Option<Arc<dyn RetryPolicy>> {
        self.retry_policy.clone()
    }

    async fn execute(
        &self,
        execution: Arc<JobExecution>,
        services: Option<Arc<dyn ServiceScope>>,
        cancel: CancellationToken,
    ) -> JobResult<()> {
        let ctx = RetryContext::new(execution.clone());
        let action = self.action.clone();
        let attempt = move || action(execution.clone(), services.clone(), cancel.clone());
        run_with_policy(self.retry_policy(), &ctx, &attempt).await
    }
}

/// A runner object constructed fresh for every attempt of a [`RunnerJob`]
/// and dropped once the attempt ends, whatever its outcome.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &mut self,
        execution: Arc<JobExecution>,
        cancel: CancellationToken,
    ) -> JobResult<()>;
}

/// Factory producing a runner. It receives the execution's service scope
/// when the scheduler has a provider configured, so constructor injection
/// can be preferred over direct construction.
pub type RunnerFactory<R> = Arc<dyn Fn(Option<&dyn ServiceScope>) -> JobResult<R> + Send + Sync>;

/// Definition backed by a runner type.
pub struct RunnerJob<R: JobRunner + 'static> {
    id: String,
    name: String,
    schedule: Option<Mutex<Schedule>>,
    overlap: bool,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    factory: RunnerFactory<R>,
}

impl<R: JobRunner + Default + 'static> RunnerJob<R> {
    /// Definition whose runner is default-constructed for every attempt.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_factory(id, name, |_services| Ok(R::default()))
    }
}

impl<R: JobRunner + 'static> RunnerJob<R> {
    /// Definition whose runner comes out of the given factory.
    pub fn with_factory<F>(id: impl Into<String>, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Option<&dyn ServiceScope>) -> JobResult<R> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            schedule: None,
            overlap: false,
            retry_policy: None,
            factory: Arc::new(factory),
        }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(Mutex::new(schedule));
        self
    }

    /// Allow runs of this definition to overlap. Off by default.
    pub fn allow_overlap(mut self) -> Self {
        self.overlap = true;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

#[async_trait]
impl<R: JobRunner + 'static> JobDefinition for RunnerJob<R> {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self) -> Option<&Mutex<Schedule>> {
        self.schedule.as_ref()
    }

    fn executions_can_overlap(&self) -> bool {
        self.overlap
    }

    fn retry_policy(&self) -> Option<Arc<dyn RetryPolicy>> {
        self.retry_policy.clone()
    }

    async fn execute(
        &self,
        execution: Arc<JobExecution>,
        services: Option<Arc<dyn ServiceScope>>,
        cancel: CancellationToken,
    ) -> JobResult<()> {
        let ctx = RetryContext::new(execution.clone());
        let factory = self.factory.clone();
        let attempt = move || -> BoxFuture<'static, JobResult<()>> {
            let factory = factory.clone();
            let execution = execution.clone();
            let services = services.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                let mut runner = factory(services.as_deref())?;
                runner.run(execution, cancel).await
            })
        };
        run_with_policy(self.retry_policy(), &ctx, &attempt).await
    }
}
