//! Locating and replacing values inside nested configuration trees.
//!
//! Configuration trees are plain `serde_json::Value` maps. Quantities are
//! written as `"<magnitude> <unit>"` strings; replacing such a leaf keeps the
//! unit so sweeps can list bare numbers.

use crate::error::ConfigError;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub const DIMENSIONLESS: &str = "dimensionless";

/// Dotted path into a configuration tree, e.g. `initial.phi`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AxisPath {
    segments: Vec<String>,
}

impl AxisPath {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let segments: Vec<String> = raw.split('.').map(|s| s.trim().to_string()).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ConfigError::InvalidAxisPath(raw.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for AxisPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromStr for AxisPath {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Returns `tree` with the value at `path` replaced; unchanged if any key on
/// the path is missing.
pub fn apply(mut tree: Value, path: &AxisPath, value: &Value) -> Value {
    replace(&mut tree, path, value);
    tree
}

/// In-place variant of [`apply`]. Returns whether the path was found.
pub fn replace(tree: &mut Value, path: &AxisPath, value: &Value) -> bool {
    let Some((last, parents)) = path.segments.split_last() else {
        return false;
    };
    let mut cur = tree;
    for segment in parents {
        match cur.get_mut(segment.as_str()) {
            Some(next) => cur = next,
            None => return false,
        }
    }
    match cur.get_mut(last.as_str()) {
        Some(slot) => {
            replace_leaf(slot, value);
            true
        }
        None => false,
    }
}

fn replace_leaf(slot: &mut Value, value: &Value) {
    let unit = match slot {
        // legacy single-element lists
        Value::Array(items) if items.len() == 1 => {
            items[0] = value.clone();
            return;
        }
        Value::String(current) => parse_unit(current).1,
        _ => None,
    };
    *slot = match unit {
        Some(unit) if !carries_unit(value) => {
            Value::String(write_unit(value_label(value), Some(&unit)))
        }
        _ => value.clone(),
    };
}

fn carries_unit(value: &Value) -> bool {
    match value {
        Value::String(s) => parse_unit(s).1.is_some(),
        _ => false,
    }
}

pub fn contains(tree: &Value, path: &AxisPath) -> bool {
    lookup(tree, path).is_some()
}

pub fn lookup<'a>(tree: &'a Value, path: &AxisPath) -> Option<&'a Value> {
    path.segments
        .iter()
        .try_fold(tree, |cur, segment| cur.get(segment.as_str()))
}

/// Deep merge: maps merge key by key, anything else in `overlay` replaces.
pub fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

fn quantity_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)\s").expect("static regex")
    })
}

/// Splits `"<magnitude> <unit>"`. A magnitude followed only by whitespace is
/// `dimensionless`; strings without a leading magnitude come back whole with
/// no unit.
pub fn parse_unit(raw: &str) -> (String, Option<String>) {
    let Some(caps) = quantity_pattern().captures(raw) else {
        return (raw.to_string(), None);
    };
    let magnitude = caps[1].to_string();
    let rest = raw[magnitude.len()..].trim();
    let unit = if rest.is_empty() {
        DIMENSIONLESS.to_string()
    } else {
        rest.to_string()
    };
    (magnitude, Some(unit))
}

pub fn write_unit(magnitude: impl fmt::Display, unit: Option<&str>) -> String {
    match unit {
        Some(unit) if unit != DIMENSIONLESS => format!("{} {}", magnitude, unit),
        _ => magnitude.to_string(),
    }
}

/// Numeric magnitude and unit of a configuration leaf.
pub fn quantity(value: &Value) -> Option<(f64, Option<String>)> {
    match value {
        Value::Number(n) => n.as_f64().map(|m| (m, None)),
        Value::String(s) => match parse_unit(s) {
            (magnitude, Some(unit)) => {
                let unit = (unit != DIMENSIONLESS).then_some(unit);
                magnitude.parse().ok().map(|m| (m, unit))
            }
            (raw, None) => raw.trim().parse().ok().map(|m| (m, None)),
        },
        _ => None,
    }
}

/// Text used for a value inside task ids and table cells.
pub fn value_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(raw: &str) -> AxisPath {
        AxisPath::parse(raw).expect("path")
    }

    fn defaults() -> Value {
        json!({"foo": {"spam": 2.0, "eggs": 3.14}, "bar": 3})
    }

    #[test]
    fn replaces_top_level_entry() {
        let out = apply(defaults(), &path("bar"), &json!(4));
        assert_eq!(out["foo"], defaults()["foo"]);
        assert_eq!(out["bar"], json!(4));
    }

    #[test]
    fn replaces_nested_entry() {
        let out = apply(defaults(), &path("foo.spam"), &json!(5.0));
        assert_eq!(out["foo"]["spam"], json!(5.0));
        assert_eq!(out["foo"]["eggs"], json!(3.14));
        assert_eq!(out["bar"], json!(3));
    }

    #[test]
    fn missing_keys_leave_tree_unchanged() {
        assert_eq!(apply(defaults(), &path("baz"), &json!(6.0)), defaults());
        assert_eq!(apply(defaults(), &path("foo.ham"), &json!(6.0)), defaults());
        assert_eq!(apply(defaults(), &path("bar.deeper"), &json!(6.0)), defaults());
        let mut tree = defaults();
        assert!(!replace(&mut tree, &path("foo.ham"), &json!(1)));
    }

    #[test]
    fn keeps_unit_suffix_of_quantity_strings() {
        let tree = json!({"initial": {"T": "1000 kelvin", "fuel": "H2"}});
        let out = apply(tree, &path("initial.T"), &json!(1200));
        assert_eq!(out["initial"]["T"], json!("1200 kelvin"));

        let out = apply(out, &path("initial.T"), &json!("1.5 kK"));
        assert_eq!(out["initial"]["T"], json!("1.5 kK"));

        let out = apply(out, &path("initial.fuel"), &json!("CH4"));
        assert_eq!(out["initial"]["fuel"], json!("CH4"));
    }

    #[test]
    fn replaces_element_of_single_element_lists() {
        let tree = json!({"T": [300.0]});
        let out = apply(tree, &path("T"), &json!(500.0));
        assert_eq!(out["T"], json!([500.0]));
    }

    #[test]
    fn longer_lists_are_replaced_whole() {
        let out = apply(json!({"grid": [10, 20, 30]}), &path("grid"), &json!(5));
        assert_eq!(out, json!({"grid": 5}));
        let out = apply(json!({"T": [300.0, "kelvin"]}), &path("T"), &json!([1, 2]));
        assert_eq!(out["T"], json!([1, 2]));
        let out = apply(json!({"empty": []}), &path("empty"), &json!(1));
        assert_eq!(out["empty"], json!(1));
    }

    #[test]
    fn apply_is_idempotent() {
        let tree = json!({"a": {"b": "2.5 m", "c": [1, 2], "d": true}});
        for (p, v) in [("a.b", json!(4)), ("a.c", json!(9)), ("a.d", json!(false))] {
            let once = apply(tree.clone(), &path(p), &v);
            let twice = apply(once.clone(), &path(p), &v);
            assert_eq!(once, twice, "path {}", p);
        }
    }

    #[test]
    fn unit_strings_round_trip() {
        for (m, u) in [("300", "kelvin"), ("1.5", "atm"), ("-0.25", "m/s"), ("5e-6", "s"), ("2.", "bar")] {
            let written = write_unit(m, Some(u));
            assert_eq!(parse_unit(&written), (m.to_string(), Some(u.to_string())));
        }
    }

    #[test]
    fn dimensionless_unit_is_omitted() {
        assert_eq!(write_unit("0.5", Some(DIMENSIONLESS)), "0.5");
        assert_eq!(write_unit(2, None), "2");
        assert_eq!(parse_unit("3 "), ("3".to_string(), Some(DIMENSIONLESS.to_string())));
        assert_eq!(parse_unit("mix"), ("mix".to_string(), None));
        assert_eq!(parse_unit("42"), ("42".to_string(), None));
    }

    #[test]
    fn quantity_reads_numbers_and_unit_strings() {
        assert_eq!(quantity(&json!(2)), Some((2.0, None)));
        assert_eq!(quantity(&json!("1 atm")), Some((1.0, Some("atm".to_string()))));
        assert_eq!(quantity(&json!("0.5")), Some((0.5, None)));
        assert_eq!(quantity(&json!("H2")), None);
        assert_eq!(quantity(&json!([1])), None);
    }

    #[test]
    fn merge_is_deep() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": 1});
        merge(&mut base, &json!({"a": {"y": 3, "z": 4}, "c": [1]}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": 1, "c": [1]}));
    }

    #[test]
    fn axis_path_rejects_empty_segments() {
        assert!(AxisPath::parse("a..b").is_err());
        assert!(AxisPath::parse("").is_err());
        assert_eq!(path("a.b").to_string(), "a.b");
        assert_eq!(lookup(&json!({"a": {"b": 7}}), &path("a.b")), Some(&json!(7)));
    }
}
