//! Registry ownership, the dispatch loop, and execution lifecycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::definition::JobDefinition;
use crate::execution::JobExecution;
use crate::notify::{guarded, ExecutionHook, Notifier};
use crate::services::{ServiceProvider, ServiceScope};
use crate::ExecutionId;

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    provider: Option<Arc<dyn ServiceProvider>>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Swap the time source. Tests inject a
    /// [`ManualClock`](crate::clock::ManualClock) here.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Container whose scopes back dependency-injected runners. One scope
    /// is opened per execution and dropped when the run ends.
    pub fn service_provider(mut self, provider: Arc<dyn ServiceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn build(self) -> Scheduler {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                config: self.config,
                clock: self.clock,
                provider: self.provider,
                definitions: Mutex::new(Vec::new()),
                executions: DashMap::new(),
                force_start: DashSet::new(),
                notifiers: RwLock::new(Vec::new()),
                started_hooks: RwLock::new(Vec::new()),
                completed_hooks: RwLock::new(Vec::new()),
                runtime: Mutex::new(None),
            }),
        }
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            config: SchedulerConfig::default(),
            clock: Arc::new(SystemClock),
            provider: None,
        }
    }
}

/// In-process job scheduler.
///
/// Owns the definition registry and the execution roster, runs one
/// dispatch task while started, and launches every due definition as an
/// independent Tokio task. Cheap to clone; clones share the same
/// scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct RuntimeState {
    root: CancellationToken,
    dispatch: JoinHandle<()>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    provider: Option<Arc<dyn ServiceProvider>>,
    definitions: Mutex<Vec<Arc<dyn JobDefinition>>>,
    executions: DashMap<ExecutionId, Arc<JobExecution>>,
    force_start: DashSet<String>,
    notifiers: RwLock<Vec<Arc<dyn Notifier>>>,
    started_hooks: RwLock<Vec<ExecutionHook>>,
    completed_hooks: RwLock<Vec<ExecutionHook>>,
    runtime: Mutex<Option<RuntimeState>>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Scheduler with the default configuration, the system clock and no
    /// service provider.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::builder().config(config).build()
    }

    // ── Registry ─────────────────────────────────────────────────────────

    /// Append a definition to the registry. Never fails; a duplicate id is
    /// a caller error and is not rejected here.
    pub fn add<D: JobDefinition + 'static>(&self, definition: D) {
        self.add_arc(Arc::new(definition));
    }

    pub fn add_arc(&self, definition: Arc<dyn JobDefinition>) {
        info!(
            "adding job definition {} ({})",
            definition.id(),
            definition.name()
        );
        self.inner.definitions.lock().push(definition.clone());
        self.inner.notify(|n| n.definition_added(&definition));
    }

    pub fn add_all(&self, definitions: impl IntoIterator<Item = Arc<dyn JobDefinition>>) {
        for definition in definitions {
            self.add_arc(definition);
        }
    }

    /// Remove every definition with the given id. Unknown ids are a
    /// silent no-op.
    pub fn remove(&self, id: &str) {
        let removed: Vec<Arc<dyn JobDefinition>> = {
            let mut definitions = self.inner.definitions.lock();
            let mut removed = Vec::new();
            definitions.retain(|definition| {
                if definition.id() == id {
                    removed.push(definition.clone());
                    false
                } else {
                    true
                }
            });
            removed
        };
        for definition in removed {
            info!("removed job definition {}", definition.id());
            self.inner.notify(|n| n.definition_removed(&definition));
        }
    }

    pub fn remove_all<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            self.remove(id.as_ref());
        }
    }

    /// Snapshot of the registry in insertion order. Mutating the returned
    /// vector never affects the registry.
    pub fn definitions(&self) -> Vec<Arc<dyn JobDefinition>> {
        self.inner.definitions.lock().clone()
    }

    pub fn definitions_where(
        &self,
        predicate: impl Fn(&Arc<dyn JobDefinition>) -> bool,
    ) -> Vec<Arc<dyn JobDefinition>> {
        self.inner
            .definitions
            .lock()
            .iter()
            .filter(|definition| predicate(definition))
            .cloned()
            .collect()
    }

    /// First definition with the given id.
    pub fn definition(&self, id: &str) -> Option<Arc<dyn JobDefinition>> {
        self.inner
            .definitions
            .lock()
            .iter()
            .find(|definition| definition.id() == id)
            .cloned()
    }

    // ── Executions ───────────────────────────────────────────────────────

    /// Snapshot of the executions of a definition, newest start first.
    pub fn executions(&self, definition_id: &str) -> Vec<Arc<JobExecution>> {
        self.executions_where(definition_id, |_| true)
    }

    pub fn executions_where(
        &self,
        definition_id: &str,
        predicate: impl Fn(&Arc<JobExecution>) -> bool,
    ) -> Vec<Arc<JobExecution>> {
        let mut executions: Vec<Arc<JobExecution>> = self
            .inner
            .executions
            .iter()
            .filter(|execution| {
                execution.definition().id() == definition_id && predicate(execution.value())
            })
            .map(|execution| execution.value().clone())
            .collect();
        executions.sort_by(|a, b| b.start_time().cmp(&a.start_time()));
        executions
    }

    // ── Observers ────────────────────────────────────────────────────────

    pub fn add_notifier(&self, notifier: Arc<dyn Notifier>) {
        self.inner.notifiers.write().push(notifier);
    }

    /// Register a hook fired right before each execution's user code runs.
    pub fn on_job_started(&self, hook: impl Fn(&Arc<JobExecution>) + Send + Sync + 'static) {
        self.inner.started_hooks.write().push(Arc::new(hook));
    }

    /// Register a hook fired once each execution has finished.
    pub fn on_job_completed(&self, hook: impl Fn(&Arc<JobExecution>) + Send + Sync + 'static) {
        self.inner.completed_hooks.write().push(Arc::new(hook));
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Start the dispatch loop with the configured poll frequency. A no-op
    /// when already running. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        self.start_with_poll(*self.inner.config.get_poll_frequency());
    }

    pub fn start_with_poll(&self, poll_frequency: Duration) {
        {
            let mut runtime = self.inner.runtime.lock();
            if runtime.is_some() {
                debug!("scheduler already running, ignoring start");
                return;
            }
            let root = CancellationToken::new();
            let dispatch = tokio::spawn(dispatch_loop(
                self.inner.clone(),
                root.clone(),
                poll_frequency,
            ));
            *runtime = Some(RuntimeState { root, dispatch });
        }
        info!("scheduler started (poll every {poll_frequency:?})");
        self.inner.notify(|n| n.scheduler_started());
    }

    /// Cancel the root token, then wait for the dispatch task and every
    /// running execution to finish. A no-op when not running. Runs that
    /// ignore cancellation delay the return indefinitely.
    pub async fn stop(&self) {
        let Some(state) = self.inner.runtime.lock().take() else {
            debug!("scheduler not running, ignoring stop");
            return;
        };
        state.root.cancel();
        if state.dispatch.await.is_err() {
            warn!("dispatch task panicked during shutdown");
        }

        let running: Vec<Arc<JobExecution>> = self
            .inner
            .executions
            .iter()
            .filter(|execution| execution.is_running())
            .map(|execution| execution.value().clone())
            .collect();
        if !running.is_empty() {
            info!("waiting for {} running execution(s)", running.len());
            join_all(running.iter().map(|execution| execution.wait())).await;
        }

        info!("scheduler stopped");
        self.inner.notify(|n| n.scheduler_stopped());
    }

    pub fn is_running(&self) -> bool {
        self.inner.runtime.lock().is_some()
    }

    /// Flag a definition for one immediate dispatch on the next tick,
    /// bypassing its schedule and overlap rule. Unknown or already-flagged
    /// ids are silently accepted; the flag is dropped when drained.
    pub fn force_start(&self, definition_id: impl Into<String>) {
        self.inner.force_start.insert(definition_id.into());
    }

    /// Point-in-time counters over the registry and roster.
    pub fn stats(&self) -> SchedulerStats {
        let mut running = 0usize;
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for execution in self.inner.executions.iter() {
            match execution.succeeded() {
                None => running += 1,
                Some(true) => succeeded += 1,
                Some(false) => failed += 1,
            }
        }
        SchedulerStats {
            definitions: self.inner.definitions.lock().len(),
            executions_total: self.inner.executions.len(),
            executions_running: running,
            executions_succeeded: succeeded,
            executions_failed: failed,
            is_running: self.is_running(),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub definitions: usize,
    pub executions_total: usize,
    pub executions_running: usize,
    pub executions_succeeded: usize,
    pub executions_failed: usize,
    pub is_running: bool,
}

async fn dispatch_loop(
    inner: Arc<SchedulerInner>,
    root: CancellationToken,
    poll_frequency: Duration,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_frequency) => {}
            _ = root.cancelled() => break,
        }
        tick(&inner, &root);
    }
    debug!("dispatch loop exited");
}

/// One dispatch tick: drain the force-start flags, evaluate eligibility in
/// registry insertion order, launch what is due, then retire expired
/// definitions.
fn tick(inner: &Arc<SchedulerInner>, root: &CancellationToken) {
    let forced = inner.drain_force_start();
    let definitions = inner.definitions.lock().clone();
    let now = inner.clock.now();
    for definition in &definitions {
        if inner.can_run(definition, &forced, now) {
            launch(inner, definition.clone(), root);
        }
    }
    inner.retire_expired();
}

/// Launch one execution: capture the start time, link cancellation to the
/// root, advance the schedule, emit the start event, then spawn the body.
fn launch(inner: &Arc<SchedulerInner>, definition: Arc<dyn JobDefinition>, root: &CancellationToken) {
    let start_time = inner.clock.now();
    let cancel = root.child_token();
    let execution = JobExecution::new(definition.clone(), start_time, cancel.clone());

    if let Some(schedule) = definition.schedule() {
        schedule.lock().set_last_run_time(Some(start_time));
    }

    inner.executions.insert(execution.id(), execution.clone());
    debug!(
        "starting execution {} of job {} ({})",
        execution.id(),
        definition.id(),
        definition.name()
    );
    inner.emit_job_started(&execution);

    let inner = inner.clone();
    tokio::spawn(async move {
        let outcome = async {
            let scope = match &inner.provider {
                Some(provider) => Some(Arc::<dyn ServiceScope>::from(provider.create_scope()?)),
                None => None,
            };
            definition.execute(execution.clone(), scope, cancel).await
        }
        .await;

        if let Err(error) = outcome {
            warn!(
                "execution {} of job {} failed: {error}",
                execution.id(),
                definition.id()
            );
            execution.record_error(error);
        }
        execution.mark_finished(inner.clock.now());
        inner.emit_job_completed(&execution);
        execution.notify_finished();
    });
}

impl SchedulerInner {
    fn notify(&self, hook: impl Fn(&dyn Notifier)) {
        let notifiers: Vec<Arc<dyn Notifier>> = self.notifiers.read().clone();
        for notifier in notifiers {
            guarded("notifier", || hook(notifier.as_ref()));
        }
    }

    fn emit_job_started(&self, execution: &Arc<JobExecution>) {
        let hooks: Vec<ExecutionHook> = self.started_hooks.read().clone();
        for hook in hooks {
            guarded("job started", || hook(execution));
        }
        self.notify(|n| n.job_started(execution));
    }

    fn emit_job_completed(&self, execution: &Arc<JobExecution>) {
        let hooks: Vec<ExecutionHook> = self.completed_hooks.read().clone();
        for hook in hooks {
            guarded("job completed", || hook(execution));
        }
        self.notify(|n| n.job_finished(execution));
    }

    /// Move the force-start flags set since the last tick into a local
    /// set, keeping eligibility itself a pure read.
    fn drain_force_start(&self) -> HashSet<String> {
        let forced: HashSet<String> = self
            .force_start
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in &forced {
            self.force_start.remove(id);
        }
        forced
    }

    /// Eligibility, evaluated in order: force-start flag, overlap rule,
    /// then schedule.
    fn can_run(
        &self,
        definition: &Arc<dyn JobDefinition>,
        forced: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if forced.contains(definition.id()) {
            return true;
        }
        if !definition.executions_can_overlap() && self.has_running_execution(definition.id()) {
            return false;
        }
        match definition.schedule() {
            Some(schedule) => match schedule.lock().next_run_time() {
                Some(next_run) => now >= next_run,
                None => false,
            },
            None => true,
        }
    }

    fn has_running_execution(&self, definition_id: &str) -> bool {
        self.executions
            .iter()
            .any(|execution| execution.is_running() && execution.definition().id() == definition_id)
    }

    /// Retire definitions that can never run again: no cron expression and
    /// no run still in flight. Their executions leave the roster with
    /// them. Cron-driven definitions are never retired here.
    fn retire_expired(&self) {
        let retired: Vec<Arc<dyn JobDefinition>> = {
            let mut definitions = self.definitions.lock();
            let mut retired = Vec::new();
            definitions.retain(|definition| {
                if self.is_expired(definition) {
                    retired.push(definition.clone());
                    false
                } else {
                    true
                }
            });
            retired
        };
        for definition in retired {
            info!("retiring one-shot job definition {}", definition.id());
            self.executions
                .retain(|_, execution| execution.definition().id() != definition.id());
            self.notify(|n| n.definition_removed(&definition));
        }
    }

    fn is_expired(&self, definition: &Arc<dyn JobDefinition>) -> bool {
        if self.has_running_execution(definition.id()) {
            return false;
        }
        match definition.schedule() {
            Some(schedule) => {
                let schedule = schedule.lock();
                !schedule.has_cron() && schedule.is_exhausted()
            }
            None => true,
        }
    }
}
