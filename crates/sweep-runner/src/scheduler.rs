//! Task dispatch over serial or threaded workers.
//!
//! Every task of a strategy is queued up front. Workers pop tasks, resolve
//! restart dependencies against the output store, run the unit, and save the
//! result (or an error record) immediately. A task whose base entry is not in
//! the store yet goes back to the end of the queue; once the base has settled
//! without leaving an entry, retries draw from a budget of `len(tasks)`
//! shared by the whole run, after which the task is recorded as
//! `UnresolvedDependency`.
//!
//! A panicking unit settles its task with a `Panic` error record. The panic
//! is reported once, through the `task failed` warning, not on raw stderr.

use crate::adapter::Outcome;
use crate::error::{ConfigError, ContractError, SweepError};
use crate::registry::UnitHandle;
use crate::store::{OutputRecord, OutputStore, RunMetadata, Variation};
use crate::strategy::Strategy;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const UNRESOLVED_DEPENDENCY: &str = "UnresolvedDependency";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Serial,
    /// `workers == 0` picks half the available cores (at least one).
    Parallel { workers: usize },
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub mode: ExecutionMode,
    /// Pause after requeueing a task whose base is still running.
    pub backoff: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Serial,
            backoff: Duration::from_millis(10),
        }
    }
}

impl SchedulerOptions {
    pub fn parallel(workers: usize) -> Self {
        Self {
            mode: ExecutionMode::Parallel { workers },
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub unresolved: usize,
    pub store_failures: usize,
    pub reschedules: usize,
    /// Run metadata was written.
    pub finalized: bool,
}

#[derive(Debug, Clone)]
struct QueuedTask {
    id: String,
    config: Value,
    variation: Variation,
    base: Option<String>,
}

struct Shared<'s> {
    store: &'s mut dyn OutputStore,
    unsettled: HashSet<String>,
    reschedules: usize,
    report: RunReport,
}

enum Step {
    Settled,
    Requeue,
}

pub struct TaskScheduler {
    strategy: Strategy,
    defaults: Value,
    tasks: Vec<QueuedTask>,
}

impl TaskScheduler {
    pub fn new(strategy: Strategy, defaults: Value) -> Result<Self, ConfigError> {
        let mut configs = strategy.configurations(&defaults)?;
        let tasks = strategy
            .tasks()
            .iter()
            .map(|task| QueuedTask {
                id: task.id.clone(),
                config: configs.remove(&task.id).unwrap_or_else(|| defaults.clone()),
                variation: task.variation(),
                base: task.base.clone(),
            })
            .collect();
        Ok(Self {
            strategy,
            defaults,
            tasks,
        })
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn tasks(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.id.as_str()).collect()
    }

    pub fn configuration(&self, id: &str) -> Option<&Value> {
        self.tasks.iter().find(|t| t.id == id).map(|t| &t.config)
    }

    pub fn metadata(&self) -> RunMetadata {
        RunMetadata::new(
            self.defaults.clone(),
            self.strategy.metadata(),
            self.strategy.task_ids(),
        )
    }

    pub fn run_serial(
        &self,
        unit: &UnitHandle,
        store: &mut dyn OutputStore,
    ) -> Result<RunReport, ContractError> {
        self.run(unit, store, &SchedulerOptions::default())
    }

    pub fn run_parallel(
        &self,
        unit: &UnitHandle,
        store: &mut dyn OutputStore,
        workers: usize,
    ) -> Result<RunReport, ContractError> {
        self.run(unit, store, &SchedulerOptions::parallel(workers))
    }

    /// Runs every task, then writes run metadata. Task failures end up in the
    /// store and the report; only a unit that breaks its contract aborts the
    /// run, before any task starts.
    pub fn run(
        &self,
        unit: &UnitHandle,
        store: &mut dyn OutputStore,
        options: &SchedulerOptions,
    ) -> Result<RunReport, ContractError> {
        unit.instantiate()?;
        let started = Instant::now();
        info!(
            unit = unit.name(),
            strategy = self.strategy.name(),
            tasks = self.tasks.len(),
            mode = ?options.mode,
            backend = store.backend(),
            "starting sweep"
        );

        let queue = Mutex::new((0..self.tasks.len()).collect::<VecDeque<_>>());
        let shared = Mutex::new(Shared {
            store,
            unsettled: self.tasks.iter().map(|t| t.id.clone()).collect(),
            reschedules: 0,
            report: RunReport {
                total: self.tasks.len(),
                ..RunReport::default()
            },
        });

        match options.mode {
            ExecutionMode::Serial => self.drain(unit, &shared, &queue, None),
            ExecutionMode::Parallel { workers } => {
                let workers = resolve_workers(workers).min(self.tasks.len()).max(1);
                debug!(workers, "spawning workers");
                thread::scope(|scope| {
                    for _ in 0..workers {
                        scope.spawn(|| self.drain(unit, &shared, &queue, Some(options.backoff)));
                    }
                });
            }
        }

        let Shared {
            store,
            reschedules,
            mut report,
            ..
        } = shared.into_inner();
        report.reschedules = reschedules;
        match store.finalize(&self.metadata()) {
            Ok(()) => report.finalized = true,
            Err(err) => error!(
                backend = store.backend(),
                error = %err,
                "failed to write run metadata"
            ),
        }
        info!(
            completed = report.completed,
            failed = report.failed,
            unresolved = report.unresolved,
            store_failures = report.store_failures,
            reschedules = report.reschedules,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sweep finished"
        );
        Ok(report)
    }

    /// Runs one task on the caller thread. A missing base entry means a cold
    /// start rather than a wait. Run metadata is not written.
    pub fn run_task(
        &self,
        id: &str,
        unit: &UnitHandle,
        store: &mut dyn OutputStore,
    ) -> Result<RunReport, SweepError> {
        let index = self
            .tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| ConfigError::UnknownTask(id.to_string()))?;
        unit.instantiate()?;
        let shared = Mutex::new(Shared {
            store,
            unsettled: HashSet::new(),
            reschedules: 0,
            report: RunReport {
                total: 1,
                ..RunReport::default()
            },
        });
        self.execute(index, unit, &shared, false);
        Ok(shared.into_inner().report)
    }

    fn drain(
        &self,
        unit: &UnitHandle,
        shared: &Mutex<Shared<'_>>,
        queue: &Mutex<VecDeque<usize>>,
        backoff: Option<Duration>,
    ) {
        loop {
            let next = queue.lock().pop_front();
            let Some(index) = next else {
                break;
            };
            if let Step::Requeue = self.execute(index, unit, shared, true) {
                queue.lock().push_back(index);
                if let Some(pause) = backoff {
                    thread::sleep(pause);
                }
            }
        }
    }

    fn execute(
        &self,
        index: usize,
        unit: &UnitHandle,
        shared: &Mutex<Shared<'_>>,
        wait_for_base: bool,
    ) -> Step {
        let task = &self.tasks[index];
        let mut adapter = match unit.instantiate() {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!(task = %task.id, error = %err, "unit rejected");
                let mut state = shared.lock();
                state.report.failed += 1;
                persist(&mut state, task, &OutputRecord::error("ContractError", err.to_string()));
                return Step::Settled;
            }
        };
        let config = adapter.configure(&task.config);

        let mut prior: Option<Outcome> = None;
        if let (true, Some(base)) = (adapter.supports_restart(), task.base.as_deref()) {
            let mut state = shared.lock();
            if state.store.dir().iter().any(|entry| entry == base) {
                match state.store.load_like(base, adapter.result_shape()) {
                    Ok(Some(outcome)) => prior = Some(outcome),
                    Ok(None) => {
                        warn!(task = %task.id, base, "base entry holds no result; running from scratch")
                    }
                    Err(err) => warn!(
                        task = %task.id,
                        base,
                        error = %err,
                        "could not load base entry; running from scratch"
                    ),
                }
            } else if !wait_for_base {
                debug!(task = %task.id, base, "base entry absent; running from scratch");
            } else if state.unsettled.contains(base) {
                debug!(task = %task.id, base, "base still pending; requeueing");
                return Step::Requeue;
            } else if state.reschedules < self.tasks.len() {
                state.reschedules += 1;
                debug!(
                    task = %task.id,
                    base,
                    reschedules = state.reschedules,
                    "base settled without an entry; requeueing"
                );
                return Step::Requeue;
            } else {
                warn!(task = %task.id, base, "giving up on missing base entry");
                state.report.unresolved += 1;
                let record = OutputRecord::error(
                    UNRESOLVED_DEPENDENCY,
                    format!("base entry `{}` never became available", base),
                );
                persist(&mut state, task, &record);
                return Step::Settled;
            }
        }

        info!(task = %task.id, restart = prior.is_some(), "running task");
        let result = match prior {
            Some(prior) => adapter.restart(prior, &config),
            None => adapter.run(&config),
        };

        let mut state = shared.lock();
        let record = match result {
            Ok(outcome) => {
                state.report.completed += 1;
                OutputRecord::Success(outcome)
            }
            Err(err) => {
                warn!(task = %task.id, kind = err.kind(), error = %err, "task failed");
                state.report.failed += 1;
                OutputRecord::from(&err)
            }
        };
        persist(&mut state, task, &record);
        Step::Settled
    }
}

/// Saves under the caller's lock and marks the task settled whatever the
/// outcome.
fn persist(state: &mut Shared<'_>, task: &QueuedTask, record: &OutputRecord) {
    if let Err(err) = state.store.save(record, &task.id, Some(&task.variation)) {
        state.report.store_failures += 1;
        warn!(
            task = %task.id,
            backend = state.store.backend(),
            error = %err,
            "failed to save result"
        );
        let fallback = OutputRecord::error("StoreError", err.to_string());
        if let Err(err) = state.store.save(&fallback, &task.id, Some(&task.variation)) {
            warn!(task = %task.id, error = %err, "failed to record store error");
        }
    }
    state.unsettled.remove(&task.id);
}

fn resolve_workers(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}
