use super::number_at;
use crate::adapter::{Capabilities, Outcome, ResultShape, SimulationUnit};
use crate::error::TaskError;
use indexmap::IndexMap;
use serde_json::{json, Value};

/// Steady 1D heat conduction with a uniform source, relaxed by Jacobi
/// iteration between two fixed-temperature boundaries.
///
/// Restart interpolates a prior temperature profile onto the current grid
/// and uses it as the initial guess, so sweeping `grid.points` from coarse to
/// fine converges in fewer iterations per case.
#[derive(Debug, Default)]
pub struct Relaxation;

struct Problem {
    points: usize,
    spacing: f64,
    left: f64,
    right: f64,
    source: f64,
    tolerance: f64,
    max_iterations: u64,
}

impl Problem {
    fn from_config(config: &Value) -> Result<Self, TaskError> {
        let points = number_at(config, "grid.points")?;
        if points < 3.0 || points.fract() != 0.0 {
            return Err(TaskError::invalid("grid.points", "must be an integer >= 3"));
        }
        let length = number_at(config, "grid.length")?;
        if length <= 0.0 {
            return Err(TaskError::invalid("grid.length", "must be positive"));
        }
        let tolerance = number_at(config, "solver.tolerance")?;
        if tolerance <= 0.0 {
            return Err(TaskError::invalid("solver.tolerance", "must be positive"));
        }
        let max_iterations = number_at(config, "solver.max_iterations")?;
        if max_iterations < 1.0 {
            return Err(TaskError::invalid("solver.max_iterations", "must be at least 1"));
        }
        let points = points as usize;
        Ok(Self {
            points,
            spacing: length / (points - 1) as f64,
            left: number_at(config, "boundary.left")?,
            right: number_at(config, "boundary.right")?,
            source: number_at(config, "heat.source")?,
            tolerance,
            max_iterations: max_iterations as u64,
        })
    }

    fn cold_start(&self) -> Vec<f64> {
        let mut u = vec![self.left; self.points];
        u[self.points - 1] = self.right;
        u
    }

    fn solve(&self, mut u: Vec<f64>) -> Result<Outcome, TaskError> {
        u[0] = self.left;
        u[self.points - 1] = self.right;
        let forcing = self.spacing * self.spacing * self.source;
        let mut next = u.clone();
        let mut residual = f64::INFINITY;
        let mut iterations = 0;
        while iterations < self.max_iterations {
            iterations += 1;
            residual = 0.0;
            for i in 1..self.points - 1 {
                next[i] = 0.5 * (u[i - 1] + u[i + 1] + forcing);
                residual = f64::max(residual, (next[i] - u[i]).abs());
            }
            std::mem::swap(&mut u, &mut next);
            if residual < self.tolerance {
                break;
            }
        }
        if residual >= self.tolerance {
            return Err(TaskError::simulation(
                "ConvergenceError",
                format!(
                    "no convergence after {} iterations (residual {:e})",
                    iterations, residual
                ),
            ));
        }
        tracing::debug!(points = self.points, iterations, residual, "relaxation converged");
        let mut members = IndexMap::new();
        members.insert("profile".to_string(), json!(u));
        members.insert(
            "stats".to_string(),
            json!({"iterations": iterations, "residual": residual, "points": self.points}),
        );
        Ok(Outcome::Members(members))
    }
}

/// Linear interpolation of `prior` (uniform grid) onto `points` nodes.
fn interpolate(prior: &[f64], points: usize) -> Vec<f64> {
    let last = (prior.len() - 1) as f64;
    (0..points)
        .map(|i| {
            let x = i as f64 / (points - 1) as f64 * last;
            let lo = x.floor() as usize;
            let hi = (lo + 1).min(prior.len() - 1);
            let t = x - lo as f64;
            prior[lo] * (1.0 - t) + prior[hi] * t
        })
        .collect()
}

impl SimulationUnit for Relaxation {
    fn defaults(&self) -> Value {
        json!({
            "grid": {"points": 17, "length": "1.0 m"},
            "boundary": {"left": "300 kelvin", "right": "400 kelvin"},
            "heat": {"source": 0.0},
            "solver": {"tolerance": 1e-6, "max_iterations": 200000}
        })
    }

    fn run(&mut self, config: &Value) -> Result<Outcome, TaskError> {
        let problem = Problem::from_config(config)?;
        let guess = problem.cold_start();
        problem.solve(guess)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { restart: true }
    }

    fn result_shape(&self) -> ResultShape {
        ResultShape::Members(vec!["profile".to_string(), "stats".to_string()])
    }

    fn restart(&mut self, prior: Outcome, config: &Value) -> Result<Outcome, TaskError> {
        let problem = Problem::from_config(config)?;
        let profile: Vec<f64> = prior
            .member("profile")
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        if profile.len() < 2 {
            return Err(TaskError::invalid("profile", "prior result has no usable profile"));
        }
        problem.solve(interpolate(&profile, problem.points))
    }
}
