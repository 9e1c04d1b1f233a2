//! Parameter-sweep batch runner.
//!
//! A run definition names a sweep strategy, the defaults it varies and where
//! results go. [`run_sweep`] expands the strategy into tasks, runs them on a
//! registered simulation unit (serially or on a worker pool) and persists
//! every result or error record in an output store.

pub mod adapter;
pub mod definition;
pub mod error;
mod fsutil;
pub mod overlay;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod units;

pub use adapter::{Capabilities, Outcome, ResultShape, SimulationAdapter, SimulationUnit};
pub use definition::{OutputSettings, RunDefinition};
pub use error::{ConfigError, ContractError, StoreError, SweepError, TaskError};
pub use registry::{UnitFactory, UnitHandle, UnitRegistry};
pub use scheduler::{ExecutionMode, RunReport, SchedulerOptions, TaskScheduler};
pub use store::{open_store, OutputFormat, OutputRecord, OutputStore, RunMetadata, WriteMode};
pub use strategy::{Strategy, StrategyDefinition, Task};

use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Strategy to pick when the definition names several.
    pub strategy: Option<String>,
    /// Output name override; may carry a directory and an extension.
    pub output: Option<String>,
    pub scheduler: SchedulerOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub unit: String,
    pub strategy: String,
    pub backend: &'static str,
    pub output: Option<PathBuf>,
    pub report: RunReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub base: Option<String>,
    pub variation: store::Variation,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub strategies: Vec<String>,
    pub strategy: String,
    pub variant: &'static str,
    pub definition: Value,
    pub tasks: Vec<TaskSummary>,
    pub output: Option<Value>,
}

pub fn run_sweep(
    registry: &UnitRegistry,
    unit: &str,
    definition_path: &Path,
    options: &RunOptions,
) -> Result<RunResult, SweepError> {
    let definition = RunDefinition::from_yaml_path(definition_path)?;
    run_definition(registry, unit, &definition, options)
}

/// Runs an already-loaded definition. Setup problems (bad definition, unit
/// contract, unopenable store) are errors; task failures are not.
pub fn run_definition(
    registry: &UnitRegistry,
    unit: &str,
    definition: &RunDefinition,
    options: &RunOptions,
) -> Result<RunResult, SweepError> {
    let handle = registry.get(unit)?;
    let adapter = handle.instantiate()?;
    let strategy = definition.strategy(options.strategy.as_deref())?;
    let strategy_name = strategy.name().to_string();
    let defaults = adapter.configure(definition.defaults());
    let scheduler = TaskScheduler::new(strategy, defaults)?;

    let settings = definition
        .output_settings(options.output.as_deref())?
        .unwrap_or_else(OutputSettings::memory);
    let mut store = open_store(&settings)?;
    let report = scheduler.run(handle, &mut *store, &options.scheduler)?;
    let output = store.target().map(Path::to_path_buf);
    if let Some(path) = &output {
        info!(path = %path.display(), "results written");
    }
    Ok(RunResult {
        unit: unit.to_string(),
        strategy: strategy_name,
        backend: store.backend(),
        output,
        report,
    })
}

/// Expands a definition without running anything.
pub fn describe_sweep(
    definition_path: &Path,
    strategy: Option<&str>,
    output: Option<&str>,
) -> Result<SweepSummary, SweepError> {
    let definition = RunDefinition::from_yaml_path(definition_path)?;
    describe_definition(&definition, strategy, output)
}

pub fn describe_definition(
    definition: &RunDefinition,
    strategy: Option<&str>,
    output: Option<&str>,
) -> Result<SweepSummary, SweepError> {
    let picked = definition.strategy(strategy)?;
    let tasks = picked
        .tasks()
        .iter()
        .map(|task| TaskSummary {
            id: task.id.clone(),
            base: task.base.clone(),
            variation: task.variation(),
        })
        .collect();
    Ok(SweepSummary {
        strategies: definition.strategy_names(),
        strategy: picked.name().to_string(),
        variant: picked.definition().variant(),
        definition: picked.metadata(),
        tasks,
        output: definition.output_settings(output)?.map(|s| s.to_value()),
    })
}

/// Entries stored in an existing output file.
pub fn list_entries(path: &Path) -> Result<Vec<String>, SweepError> {
    Ok(store::open_existing(path)?.dir())
}
