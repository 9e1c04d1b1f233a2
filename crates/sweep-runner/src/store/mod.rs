//! Output stores: where task results and run metadata are persisted.
//!
//! Every backend keeps results keyed by task id ("entry"). Saving an entry
//! that already exists fails unless the store was opened with `force`.

mod group;
mod memory;
mod table;

pub use group::GroupStore;
pub use memory::{MemoryStore, StoredEntry};
pub use table::TableStore;

use crate::adapter::{Outcome, ResultShape};
use crate::definition::OutputSettings;
use crate::error::{StoreError, TaskError};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Axis path → value of one task, in axis declaration order.
pub type Variation = IndexMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputRecord {
    Success(Outcome),
    Error(ErrorRecord),
}

impl OutputRecord {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(ErrorRecord {
            kind: kind.into(),
            message: message.into(),
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl From<Outcome> for OutputRecord {
    fn from(outcome: Outcome) -> Self {
        Self::Success(outcome)
    }
}

impl From<&TaskError> for OutputRecord {
    fn from(err: &TaskError) -> Self {
        Self::error(err.kind(), err.to_string())
    }
}

/// Written once, after every task has settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub defaults: Value,
    /// `{name: definition}` of the strategy that produced the tasks.
    pub strategy: Value,
    pub tasks: Vec<String>,
    pub finalized_at: DateTime<Utc>,
}

impl RunMetadata {
    pub fn new(defaults: Value, strategy: Value, tasks: Vec<String>) -> Self {
        Self {
            defaults,
            strategy,
            tasks,
            finalized_at: Utc::now(),
        }
    }

    pub(crate) fn attrs(&self) -> IndexMap<String, Value> {
        let mut attrs = IndexMap::new();
        attrs.insert("defaults".to_string(), self.defaults.clone());
        attrs.insert("strategy".to_string(), self.strategy.clone());
        attrs.insert("tasks".to_string(), json!(self.tasks));
        attrs.insert(
            "finalized_at".to_string(),
            Value::String(self.finalized_at.to_rfc3339()),
        );
        attrs
    }
}

pub trait OutputStore: Send {
    /// Short backend name used in logs.
    fn backend(&self) -> &'static str;

    /// Location of the persisted output, if any.
    fn target(&self) -> Option<&Path>;

    fn save(
        &mut self,
        record: &OutputRecord,
        entry: &str,
        variation: Option<&Variation>,
    ) -> Result<(), StoreError>;

    /// Entries currently present, in insertion order.
    fn dir(&self) -> Vec<String>;

    /// Reloads a stored result in the layout of `like`. `Ok(None)` when the
    /// entry is absent or holds an error record.
    fn load_like(&self, entry: &str, like: &ResultShape) -> Result<Option<Outcome>, StoreError>;

    fn finalize(&mut self, metadata: &RunMetadata) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Group,
    Table,
    Memory,
}

impl OutputFormat {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "json" | "h5" | "hdf" | "hdf5" | "group" => Ok(Self::Group),
            "csv" | "table" => Ok(Self::Table),
            "memory" => Ok(Self::Memory),
            other => Err(StoreError::UnknownFormat(other.to_string())),
        }
    }

    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::Group => Some("json"),
            Self::Table => Some("csv"),
            Self::Memory => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "json",
            Self::Table => "csv",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Keep existing entries; add new ones.
    #[default]
    Append,
    /// Start from an empty target.
    Write,
}

impl WriteMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "a" | "append" => Some(Self::Append),
            "w" | "write" => Some(Self::Write),
            _ => None,
        }
    }
}

/// Opens the backend selected by `settings`.
pub fn open_store(settings: &OutputSettings) -> Result<Box<dyn OutputStore>, StoreError> {
    let store: Box<dyn OutputStore> = match settings.format {
        OutputFormat::Group => Box::new(GroupStore::open(
            settings.file(),
            settings.mode,
            settings.force,
        )?),
        OutputFormat::Table => Box::new(TableStore::open(
            settings.file(),
            settings.mode,
            settings.force,
        )?),
        OutputFormat::Memory => Box::new(MemoryStore::with_force(settings.force)),
    };
    tracing::debug!(
        backend = store.backend(),
        target = ?store.target(),
        "opened output store"
    );
    Ok(store)
}

/// Opens an existing output file read-side, picking the backend from its
/// extension.
pub fn open_existing(path: &Path) -> Result<Box<dyn OutputStore>, StoreError> {
    if !path.exists() {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", path.display()),
        )));
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| StoreError::UnknownFormat(path.display().to_string()))?;
    let path = PathBuf::from(path);
    match OutputFormat::parse(ext)? {
        OutputFormat::Group => Ok(Box::new(GroupStore::open(path, WriteMode::Append, false)?)),
        OutputFormat::Table => Ok(Box::new(TableStore::open(path, WriteMode::Append, false)?)),
        OutputFormat::Memory => Err(StoreError::UnknownFormat(ext.to_string())),
    }
}

/// Fits a stored success payload to `like`.
pub(crate) fn reshape(
    entry: &str,
    stored: &Outcome,
    like: &ResultShape,
) -> Result<Outcome, StoreError> {
    let incompatible = |reason: String| StoreError::Incompatible {
        entry: entry.to_string(),
        reason,
    };
    match (like, stored) {
        (ResultShape::Single, Outcome::Single(value)) => Ok(Outcome::Single(value.clone())),
        (ResultShape::Single, Outcome::Members(members)) => match members.len() {
            1 => Ok(Outcome::Single(members[0].clone())),
            n => Err(incompatible(format!("expected one result, found {} members", n))),
        },
        (ResultShape::Members(_), Outcome::Single(_)) => {
            Err(incompatible("stored as a single result".to_string()))
        }
        (ResultShape::Members(names), Outcome::Members(members)) => names
            .iter()
            .map(|name| {
                members
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
                    .ok_or_else(|| incompatible(format!("missing member `{}`", name)))
            })
            .collect::<Result<IndexMap<_, _>, _>>()
            .map(Outcome::Members),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(pairs: &[(&str, Value)]) -> Outcome {
        Outcome::Members(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn format_aliases() {
        for raw in ["json", "h5", "HDF5", ".hdf"] {
            assert_eq!(OutputFormat::parse(raw).expect(raw), OutputFormat::Group);
        }
        assert_eq!(OutputFormat::parse("csv").expect("csv"), OutputFormat::Table);
        assert!(matches!(
            OutputFormat::parse("xlsx"),
            Err(StoreError::UnknownFormat(_))
        ));
        assert_eq!(WriteMode::parse("w"), Some(WriteMode::Write));
        assert_eq!(WriteMode::parse("append"), Some(WriteMode::Append));
        assert_eq!(WriteMode::parse("x"), None);
    }

    #[test]
    fn reshape_selects_requested_members() {
        let stored = members(&[("coarse", json!([1])), ("refined", json!([2])), ("extra", json!(0))]);
        let like = ResultShape::Members(vec!["refined".into(), "coarse".into()]);
        let out = reshape("e", &stored, &like).expect("reshape");
        assert_eq!(out, members(&[("refined", json!([2])), ("coarse", json!([1]))]));

        let like = ResultShape::Members(vec!["missing".into()]);
        assert!(matches!(
            reshape("e", &stored, &like),
            Err(StoreError::Incompatible { .. })
        ));
        assert!(reshape("e", &Outcome::Single(json!(1)), &like).is_err());
    }

    #[test]
    fn single_member_reshapes_to_single() {
        let stored = members(&[("only", json!(3))]);
        let out = reshape("e", &stored, &ResultShape::Single).expect("reshape");
        assert_eq!(out, Outcome::Single(json!(3)));
    }

    #[test]
    fn task_errors_become_error_records() {
        let record = OutputRecord::from(&TaskError::simulation("ValueError", "bad phi"));
        assert_eq!(record, OutputRecord::error("ValueError", "bad phi"));
        assert!(record.is_error());
    }

    #[test]
    fn metadata_attrs_are_ordered() {
        let meta = RunMetadata::new(json!({"a": 1}), json!({"sequence": {"a": [1]}}), vec!["a_1".into()]);
        let keys: Vec<_> = meta.attrs().keys().cloned().collect();
        assert_eq!(keys, ["defaults", "strategy", "tasks", "finalized_at"]);
    }
}
