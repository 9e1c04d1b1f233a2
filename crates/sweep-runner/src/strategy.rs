//! Sweep strategies: expansion of a declarative definition into tasks.
//!
//! A run definition names one or more strategies under `strategy:`; the key
//! (up to an optional `-suffix`) selects the variant:
//!
//! ```yaml
//! strategy:
//!   sequence:
//!     initial.phi: [0.4, 0.6, 0.8]
//!   matrix-fine:
//!     initial.phi: [0.4, 0.6]
//!     initial.P: [1, 2]
//! ```

use crate::error::ConfigError;
use crate::overlay::{self, value_label, value_type_name, AxisPath};
use crate::store::Variation;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct Axis {
    pub path: AxisPath,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrategyDefinition {
    /// Exactly one axis.
    Sequence(Axis),
    /// Cartesian product over two or more axes, in declaration order.
    Matrix(Vec<Axis>),
    /// Pre-strategy `{entry, values}` form; loads as a `Sequence`.
    Legacy { entry: AxisPath, values: Vec<Value> },
}

impl StrategyDefinition {
    pub fn sequence(body: &Value) -> Result<Self, ConfigError> {
        let mut axes = parse_axes(body)?;
        if axes.len() != 1 {
            return Err(ConfigError::AxisCount {
                variant: "sequence",
                expected: 1,
                exact: true,
                found: axes.len(),
            });
        }
        Ok(Self::Sequence(axes.remove(0)))
    }

    pub fn matrix(body: &Value) -> Result<Self, ConfigError> {
        let axes = parse_axes(body)?;
        if axes.len() < 2 {
            return Err(ConfigError::AxisCount {
                variant: "matrix",
                expected: 2,
                exact: false,
                found: axes.len(),
            });
        }
        Ok(Self::Matrix(axes))
    }

    pub fn legacy(body: &Value) -> Result<Self, ConfigError> {
        if !body.is_object() {
            return Err(ConfigError::NotAMapping(value_type_name(body)));
        }
        let entry = body
            .get("entry")
            .and_then(|v| v.as_str())
            .ok_or(ConfigError::LegacyField("entry"))?;
        let values = body
            .get("values")
            .and_then(|v| v.as_array())
            .ok_or(ConfigError::LegacyField("values"))?;
        if values.is_empty() {
            return Err(ConfigError::EmptyAxis(entry.to_string()));
        }
        Ok(Self::Legacy {
            entry: AxisPath::parse(entry)?,
            values: values.clone(),
        })
    }

    pub fn variant(&self) -> &'static str {
        match self {
            StrategyDefinition::Sequence(_) => "sequence",
            StrategyDefinition::Matrix(_) => "matrix",
            StrategyDefinition::Legacy { .. } => "legacy",
        }
    }

    fn normalize(self) -> Self {
        match self {
            StrategyDefinition::Legacy { entry, values } => {
                StrategyDefinition::Sequence(Axis {
                    path: entry,
                    values,
                })
            }
            other => other,
        }
    }

    fn axes(&self) -> Vec<&Axis> {
        match self {
            StrategyDefinition::Sequence(axis) => vec![axis],
            StrategyDefinition::Matrix(axes) => axes.iter().collect(),
            StrategyDefinition::Legacy { .. } => Vec::new(),
        }
    }

    /// Document form, as it appears in run metadata.
    pub fn to_value(&self) -> Value {
        match self {
            StrategyDefinition::Legacy { entry, values } => {
                json!({"entry": entry.to_string(), "values": values})
            }
            _ => {
                let mut body = Map::new();
                for axis in self.axes() {
                    body.insert(axis.path.to_string(), Value::Array(axis.values.clone()));
                }
                Value::Object(body)
            }
        }
    }
}

fn parse_axes(body: &Value) -> Result<Vec<Axis>, ConfigError> {
    let map = body
        .as_object()
        .ok_or(ConfigError::NotAMapping(value_type_name(body)))?;
    let mut axes = Vec::with_capacity(map.len());
    for (key, values) in map {
        let values = match values.as_array() {
            Some(values) if !values.is_empty() => values.clone(),
            _ => return Err(ConfigError::EmptyAxis(key.clone())),
        };
        axes.push(Axis {
            path: AxisPath::parse(key)?,
            values,
        });
    }
    Ok(axes)
}

/// One concrete case of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub overlay: Vec<(AxisPath, Value)>,
    /// Task whose result warm-starts this one, if any.
    pub base: Option<String>,
}

impl Task {
    pub fn variation(&self) -> Variation {
        self.overlay
            .iter()
            .map(|(path, value)| (path.to_string(), value.clone()))
            .collect()
    }

    pub fn apply_to(&self, defaults: &Value) -> Value {
        self.overlay
            .iter()
            .fold(defaults.clone(), |tree, (path, value)| {
                overlay::apply(tree, path, value)
            })
    }
}

#[derive(Debug, Clone)]
pub struct Strategy {
    name: String,
    definition: StrategyDefinition,
    tasks: Vec<Task>,
}

impl Strategy {
    /// Picks a strategy out of a `{name: body}` mapping.
    ///
    /// Without `name` the mapping must hold exactly one strategy.
    pub fn load(definition: &Value, name: Option<&str>) -> Result<Self, ConfigError> {
        let map = definition
            .as_object()
            .ok_or(ConfigError::NotAMapping(value_type_name(definition)))?;
        let (key, body) = match name {
            Some(name) => map
                .iter()
                .find(|(key, _)| key.as_str() == name)
                .ok_or_else(|| ConfigError::MissingStrategy(name.to_string()))?,
            None => {
                let mut entries = map.iter();
                match (entries.next(), entries.next()) {
                    (None, _) => return Err(ConfigError::NoStrategy),
                    (Some(entry), None) => entry,
                    (Some(_), Some(_)) => {
                        return Err(ConfigError::AmbiguousStrategy(map.keys().cloned().collect()))
                    }
                }
            }
        };
        let variant = key.split('-').next().unwrap_or(key).to_ascii_lowercase();
        let parsed = match variant.as_str() {
            "sequence" => StrategyDefinition::sequence(body)?,
            "matrix" => StrategyDefinition::matrix(body)?,
            "legacy" => StrategyDefinition::legacy(body)?,
            _ => return Err(ConfigError::UnknownStrategy(key.clone())),
        };
        Self::new(key, parsed)
    }

    /// Converts the old `variation: {entry, values}` block.
    pub fn from_legacy(body: &Value) -> Result<Self, ConfigError> {
        Self::new("sequence", StrategyDefinition::legacy(body)?)
    }

    pub fn new(name: &str, definition: StrategyDefinition) -> Result<Self, ConfigError> {
        let definition = definition.normalize();
        let tasks = expand(&definition.axes())?;
        Ok(Self {
            name: name.to_string(),
            definition,
            tasks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &StrategyDefinition {
        &self.definition
    }

    /// `{name: body}` as recorded in run metadata.
    pub fn metadata(&self) -> Value {
        let mut out = Map::new();
        out.insert(self.name.clone(), self.definition.to_value());
        Value::Object(out)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Concrete configuration for every task, keyed by task id.
    ///
    /// Every swept path must already exist in `defaults`.
    pub fn configurations(&self, defaults: &Value) -> Result<BTreeMap<String, Value>, ConfigError> {
        for axis in self.definition.axes() {
            if !overlay::contains(defaults, &axis.path) {
                return Err(ConfigError::UnknownAxis(axis.path.to_string()));
            }
        }
        Ok(self
            .tasks
            .iter()
            .map(|task| (task.id.clone(), task.apply_to(defaults)))
            .collect())
    }
}

fn expand(axes: &[&Axis]) -> Result<Vec<Task>, ConfigError> {
    let mut combos = Vec::new();
    cartesian(axes, &mut Vec::with_capacity(axes.len()), &mut combos);

    let task_id = |combo: &[usize]| -> String {
        axes.iter()
            .zip(combo)
            .map(|(axis, &i)| format!("{}_{}", axis.path, value_label(&axis.values[i])))
            .collect::<Vec<_>>()
            .join("_")
    };

    let mut seen: HashSet<String> = HashSet::with_capacity(combos.len());
    let mut tasks = Vec::with_capacity(combos.len());
    for combo in &combos {
        let id = task_id(combo);
        if !seen.insert(id.clone()) {
            return Err(ConfigError::DuplicateTask(id));
        }
        let base = match combo.split_last() {
            Some((&last, head)) if last != 0 => {
                let mut base = head.to_vec();
                base.push(0);
                Some(task_id(&base))
            }
            _ => None,
        };
        let overlay = axes
            .iter()
            .zip(combo)
            .map(|(axis, &i)| (axis.path.clone(), axis.values[i].clone()))
            .collect();
        tasks.push(Task { id, overlay, base });
    }
    Ok(tasks)
}

fn cartesian(axes: &[&Axis], prefix: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
    let Some((axis, rest)) = axes.split_first() else {
        if !prefix.is_empty() {
            out.push(prefix.clone());
        }
        return;
    };
    for i in 0..axis.values.len() {
        prefix.push(i);
        cartesian(rest, prefix, out);
        prefix.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_of<'a>(strategy: &'a Strategy, id: &str) -> Option<&'a str> {
        strategy.task(id).and_then(|t| t.base.as_deref())
    }

    #[test]
    fn sequence_produces_one_task_per_value() {
        let strategy =
            Strategy::load(&json!({"sequence": {"chem.ratio": [0.5, 1.0, 1.5]}}), None).expect("load");
        assert_eq!(strategy.name(), "sequence");
        assert_eq!(
            strategy.task_ids(),
            vec!["chem.ratio_0.5", "chem.ratio_1.0", "chem.ratio_1.5"]
        );

        let defaults = json!({"chem": {"ratio": 1.0, "fuel": "H2"}, "steps": 10});
        let configs = strategy.configurations(&defaults).expect("configurations");
        assert_eq!(configs.len(), 3);
        for (id, value) in [("chem.ratio_0.5", 0.5), ("chem.ratio_1.0", 1.0), ("chem.ratio_1.5", 1.5)] {
            let config = &configs[id];
            assert_eq!(config["chem"]["ratio"], json!(value));
            let mut restored = config.clone();
            restored["chem"]["ratio"] = defaults["chem"]["ratio"].clone();
            assert_eq!(restored, defaults, "{} differs outside the axis", id);
        }
    }

    #[test]
    fn matrix_covers_every_combination() {
        let strategy =
            Strategy::load(&json!({"matrix": {"a": [1, 2], "b": [3, 4]}}), None).expect("load");
        let ids: HashSet<String> = strategy.task_ids().into_iter().collect();
        let expected: HashSet<String> = ["a_1_b_3", "a_1_b_4", "a_2_b_3", "a_2_b_4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn matrix_task_count_is_product_of_cardinalities() {
        let strategy = Strategy::load(
            &json!({"matrix": {"x": [1, 2, 3], "y": ["a", "b"], "z": [true, false]}}),
            None,
        )
        .expect("load");
        assert_eq!(strategy.tasks().len(), 12);
        let distinct: HashSet<String> = strategy
            .tasks()
            .iter()
            .map(|t| format!("{:?}", t.overlay))
            .collect();
        assert_eq!(distinct.len(), 12);
        // last axis varies fastest
        assert_eq!(strategy.tasks()[0].id, "x_1_y_a_z_true");
        assert_eq!(strategy.tasks()[1].id, "x_1_y_a_z_false");
    }

    #[test]
    fn quantity_defaults_keep_their_unit() {
        let strategy =
            Strategy::load(&json!({"sequence": {"initial.T": [1000, 1200]}}), None).expect("load");
        let configs = strategy
            .configurations(&json!({"initial": {"T": "900 kelvin"}}))
            .expect("configurations");
        assert_eq!(configs["initial.T_1200"]["initial"]["T"], json!("1200 kelvin"));
    }

    #[test]
    fn load_rejects_invalid_definitions() {
        let err = Strategy::load(&json!({"sequence": {"foo": [0, 1], "bar": [3, 4]}}), None)
            .expect_err("two axes");
        assert!(err.to_string().starts_with("invalid length"));

        let err = Strategy::load(&json!({"matrix": {"bar": [3, 4]}}), None).expect_err("one axis");
        assert!(matches!(err, ConfigError::AxisCount { variant: "matrix", .. }));

        let err = Strategy::load(&json!({"sequence": [0, 1, 2]}), None).expect_err("list body");
        assert!(matches!(err, ConfigError::NotAMapping("array")));

        let err = Strategy::load(&json!({"foobar": {"foo": [0, 1]}}), None).expect_err("unknown");
        assert!(matches!(err, ConfigError::UnknownStrategy(name) if name == "foobar"));

        let err = Strategy::load(&json!({"sequence": {"foo": []}}), None).expect_err("empty");
        assert!(matches!(err, ConfigError::EmptyAxis(_)));

        let err = Strategy::load(&json!({}), None).expect_err("none");
        assert!(matches!(err, ConfigError::NoStrategy));

        let err = Strategy::load(&json!("sequence"), None).expect_err("scalar");
        assert!(matches!(err, ConfigError::NotAMapping("string")));
    }

    #[test]
    fn named_strategies_require_explicit_choice() {
        let definition = json!({
            "sequence-1": {"spam": [0.4, 0.6]},
            "sequence-2": {"eggs": [1, 2, 3]},
        });
        let err = Strategy::load(&definition, None).expect_err("ambiguous");
        assert!(matches!(err, ConfigError::AmbiguousStrategy(names) if names.len() == 2));

        let strategy = Strategy::load(&definition, Some("sequence-2")).expect("named");
        assert_eq!(strategy.task_ids(), vec!["eggs_1", "eggs_2", "eggs_3"]);
        assert_eq!(strategy.metadata(), json!({"sequence-2": {"eggs": [1, 2, 3]}}));

        let err = Strategy::load(&definition, Some("matrix")).expect_err("missing");
        assert!(matches!(err, ConfigError::MissingStrategy(_)));
    }

    #[test]
    fn legacy_variation_becomes_sequence() {
        let strategy =
            Strategy::from_legacy(&json!({"entry": "sleep", "values": [0.4, 0.6]})).expect("legacy");
        assert_eq!(strategy.definition().variant(), "sequence");
        assert_eq!(strategy.task_ids(), vec!["sleep_0.4", "sleep_0.6"]);
        assert_eq!(strategy.metadata(), json!({"sequence": {"sleep": [0.4, 0.6]}}));

        let err = Strategy::from_legacy(&json!({"values": [1]})).expect_err("no entry");
        assert!(matches!(err, ConfigError::LegacyField("entry")));
    }

    #[test]
    fn unknown_axis_is_rejected() {
        let strategy = Strategy::load(&json!({"sequence": {"foo.ham": [1, 2]}}), None).expect("load");
        let err = strategy
            .configurations(&json!({"foo": {"spam": 2.0}}))
            .expect_err("unknown axis");
        assert!(matches!(err, ConfigError::UnknownAxis(path) if path == "foo.ham"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = Strategy::load(&json!({"sequence": {"a": [1, 1]}}), None).expect_err("dup");
        assert!(matches!(err, ConfigError::DuplicateTask(id) if id == "a_1"));
    }

    #[test]
    fn base_is_first_value_of_last_axis() {
        let strategy = Strategy::load(
            &json!({"matrix": {"phi": [0.5, 1.0], "transport": ["mix", "multi", "soret"]}}),
            None,
        )
        .expect("load");
        assert_eq!(base_of(&strategy, "phi_0.5_transport_mix"), None);
        assert_eq!(
            base_of(&strategy, "phi_0.5_transport_multi"),
            Some("phi_0.5_transport_mix")
        );
        assert_eq!(
            base_of(&strategy, "phi_1.0_transport_soret"),
            Some("phi_1.0_transport_mix")
        );

        let sequence = Strategy::load(&json!({"sequence": {"grid": [10, 20, 40]}}), None).expect("load");
        assert_eq!(base_of(&sequence, "grid_10"), None);
        assert_eq!(base_of(&sequence, "grid_40"), Some("grid_10"));
    }

    #[test]
    fn variation_lists_axis_values() {
        let strategy =
            Strategy::load(&json!({"matrix": {"a.b": [1], "c": ["x"]}}), None).expect("load");
        let variation = strategy.tasks()[0].variation();
        assert_eq!(variation.get("a.b"), Some(&json!(1)));
        assert_eq!(variation.get("c"), Some(&json!("x")));
    }
}
