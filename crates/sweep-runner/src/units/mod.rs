//! Built-in simulation units.

mod minimal;
mod relaxation;

pub use minimal::Minimal;
pub use relaxation::Relaxation;

use crate::error::TaskError;
use crate::overlay::quantity;
use serde_json::Value;

/// Reads a numeric leaf at dotted `path`, accepting `"<magnitude> <unit>"`
/// strings.
pub(crate) fn number_at(config: &Value, path: &str) -> Result<f64, TaskError> {
    let leaf = path
        .split('.')
        .try_fold(config, |cur, key| cur.get(key))
        .ok_or_else(|| TaskError::invalid(path, "missing"))?;
    let (magnitude, _unit) =
        quantity(leaf).ok_or_else(|| TaskError::invalid(path, format!("not a number: {}", leaf)))?;
    if !magnitude.is_finite() {
        return Err(TaskError::invalid(path, "not finite"));
    }
    Ok(magnitude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn number_at_reads_quantities() {
        let config = json!({"a": {"b": "300 kelvin", "c": 2}, "d": "x"});
        assert_eq!(number_at(&config, "a.b").expect("b"), 300.0);
        assert_eq!(number_at(&config, "a.c").expect("c"), 2.0);
        assert_eq!(number_at(&config, "d").expect_err("d").kind(), "InvalidParameter");
        assert!(number_at(&config, "a.z").is_err());
    }
}
