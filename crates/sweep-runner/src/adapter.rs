//! Uniform calling contract for pluggable simulation units.

use crate::error::{ContractError, TaskError};
use crate::overlay::{self, value_type_name};
use indexmap::IndexMap;
use serde_json::Value;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

/// Result payload of one task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Single(Value),
    /// Several named results, e.g. a coarse and a refined solution.
    Members(IndexMap<String, Value>),
}

impl Outcome {
    pub fn shape(&self) -> ResultShape {
        match self {
            Outcome::Single(_) => ResultShape::Single,
            Outcome::Members(members) => ResultShape::Members(members.keys().cloned().collect()),
        }
    }

    pub fn member(&self, name: &str) -> Option<&Value> {
        match self {
            Outcome::Members(members) => members.get(name),
            Outcome::Single(_) => None,
        }
    }
}

/// Layout of an [`Outcome`], used as the template when reloading a stored
/// result for a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultShape {
    Single,
    Members(Vec<String>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Unit can warm-start from a prior result.
    pub restart: bool,
}

/// A pluggable simulation unit.
///
/// `defaults` and `run` are required. Units that can warm-start report
/// `capabilities().restart` and override `restart` and `result_shape`.
pub trait SimulationUnit: Send {
    fn defaults(&self) -> Value;

    fn run(&mut self, config: &Value) -> Result<Outcome, TaskError>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn result_shape(&self) -> ResultShape {
        ResultShape::Single
    }

    fn restart(&mut self, prior: Outcome, config: &Value) -> Result<Outcome, TaskError> {
        let _ = (prior, config);
        Err(TaskError::RestartUnsupported)
    }
}

/// A unit instance whose contract has been checked. One adapter serves one
/// task invocation.
pub struct SimulationAdapter {
    name: String,
    unit: Box<dyn SimulationUnit>,
    defaults: Value,
    capabilities: Capabilities,
    shape: ResultShape,
}

impl std::fmt::Debug for SimulationAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationAdapter")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("shape", &self.shape)
            .finish()
    }
}

impl SimulationAdapter {
    pub fn new(name: &str, unit: Box<dyn SimulationUnit>) -> Result<Self, ContractError> {
        let defaults = unit.defaults();
        if !defaults.is_object() {
            return Err(ContractError::DefaultsNotMapping {
                unit: name.to_string(),
                found: value_type_name(&defaults),
            });
        }
        let capabilities = unit.capabilities();
        let shape = unit.result_shape();
        if capabilities.restart && matches!(&shape, ResultShape::Members(names) if names.is_empty()) {
            return Err(ContractError::RestartShape(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            unit,
            defaults,
            capabilities,
            shape,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &Value {
        &self.defaults
    }

    pub fn supports_restart(&self) -> bool {
        self.capabilities.restart
    }

    pub fn result_shape(&self) -> &ResultShape {
        &self.shape
    }

    /// Unit defaults deep-merged with a task configuration.
    pub fn configure(&self, task_config: &Value) -> Value {
        let mut config = self.defaults.clone();
        overlay::merge(&mut config, task_config);
        config
    }

    pub fn run(&mut self, config: &Value) -> Result<Outcome, TaskError> {
        let unit = &mut self.unit;
        guarded(|| unit.run(config))
    }

    pub fn restart(&mut self, prior: Outcome, config: &Value) -> Result<Outcome, TaskError> {
        if !self.capabilities.restart {
            return Err(TaskError::RestartUnsupported);
        }
        let unit = &mut self.unit;
        guarded(|| unit.restart(prior, config))
    }
}

thread_local! {
    static GUARDED: Cell<bool> = const { Cell::new(false) };
    static LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chains onto the existing panic hook. Panics raised inside [`guarded`] only
/// record their location; the scheduler reports them through `tracing`.
fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARDED.with(Cell::get) {
                let location = info.location().map(|l| format!("{}:{}", l.file(), l.line()));
                LOCATION.with(|slot| *slot.borrow_mut() = location);
            } else {
                previous(info);
            }
        }));
    });
}

fn guarded<F>(call: F) -> Result<Outcome, TaskError>
where
    F: FnOnce() -> Result<Outcome, TaskError>,
{
    install_panic_hook();
    let outer = GUARDED.with(|g| g.replace(true));
    let result = panic::catch_unwind(AssertUnwindSafe(call));
    GUARDED.with(|g| g.set(outer));
    result.unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        let message = match LOCATION.with(|slot| slot.borrow_mut().take()) {
            Some(location) => format!("{} at {}", message, location),
            None => message,
        };
        Err(TaskError::Panicked(message))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
