use super::number_at;
use crate::adapter::{Outcome, SimulationUnit};
use crate::error::TaskError;
use serde_json::{json, Value};
use std::thread;
use std::time::Duration;

/// Sleeps for `sleep` seconds and reports the value back.
#[derive(Debug, Default)]
pub struct Minimal;

impl SimulationUnit for Minimal {
    fn defaults(&self) -> Value {
        json!({"sleep": 0.2})
    }

    fn run(&mut self, config: &Value) -> Result<Outcome, TaskError> {
        let sleep = number_at(config, "sleep")?;
        if sleep < 0.0 {
            return Err(TaskError::invalid("sleep", "must not be negative"));
        }
        tracing::debug!(sleep, "minimal unit sleeping");
        thread::sleep(Duration::from_secs_f64(sleep));
        Ok(Outcome::Single(json!({"sleep": [config["sleep"].clone()]})))
    }
}
