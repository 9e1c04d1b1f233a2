use super::{reshape, ErrorRecord, OutputRecord, OutputStore, RunMetadata, Variation, WriteMode};
use crate::adapter::{Outcome, ResultShape};
use crate::error::StoreError;
use crate::fsutil::atomic_write_bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Container {
    #[serde(default)]
    attrs: IndexMap<String, Value>,
    #[serde(default)]
    groups: IndexMap<String, Group>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Group {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    attrs: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    members: Option<IndexMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorRecord>,
}

impl Group {
    fn new(record: &OutputRecord, variation: Option<&Variation>) -> Self {
        let mut group = Group {
            attrs: variation.cloned().unwrap_or_default(),
            ..Group::default()
        };
        match record {
            OutputRecord::Success(Outcome::Single(value)) => group.data = Some(value.clone()),
            OutputRecord::Success(Outcome::Members(members)) => {
                group.members = Some(members.clone())
            }
            OutputRecord::Error(err) => group.error = Some(err.clone()),
        }
        group
    }

    fn record(&self) -> OutputRecord {
        if let Some(err) = &self.error {
            return OutputRecord::Error(err.clone());
        }
        match (&self.data, &self.members) {
            (_, Some(members)) => OutputRecord::Success(Outcome::Members(members.clone())),
            (data, None) => OutputRecord::Success(Outcome::Single(data.clone().unwrap_or(Value::Null))),
        }
    }
}

/// Hierarchical store: one JSON container file holding a keyed group per
/// entry. Each group carries the task's variation as attributes and either a
/// single dataset, named members, or an error record. Run metadata lands in
/// the container's top-level attributes.
#[derive(Debug)]
pub struct GroupStore {
    path: PathBuf,
    force: bool,
    container: Container,
    finalized: bool,
}

impl GroupStore {
    pub fn open(path: impl Into<PathBuf>, mode: WriteMode, force: bool) -> Result<Self, StoreError> {
        let path = path.into();
        let container = if path.exists() {
            match mode {
                WriteMode::Write if !force => return Err(StoreError::TargetExists(path)),
                WriteMode::Write => {
                    debug!(path = %path.display(), "truncating existing output");
                    fs::remove_file(&path)?;
                    Container::default()
                }
                WriteMode::Append => read_container(&path)?,
            }
        } else {
            Container::default()
        };
        Ok(Self {
            path,
            force,
            container,
            finalized: false,
        })
    }

    /// Top-level attributes; holds run metadata once finalized.
    pub fn attrs(&self) -> &IndexMap<String, Value> {
        &self.container.attrs
    }

    /// Variation attributes of one entry.
    pub fn entry_attrs(&self, entry: &str) -> Option<&IndexMap<String, Value>> {
        self.container.groups.get(entry).map(|g| &g.attrs)
    }

    pub fn record(&self, entry: &str) -> Option<OutputRecord> {
        self.container.groups.get(entry).map(Group::record)
    }

    fn flush(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.container)?;
        atomic_write_bytes(&self.path, &bytes)?;
        Ok(())
    }
}

fn read_container(path: &Path) -> Result<Container, StoreError> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

impl OutputStore for GroupStore {
    fn backend(&self) -> &'static str {
        "group"
    }

    fn target(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn save(
        &mut self,
        record: &OutputRecord,
        entry: &str,
        variation: Option<&Variation>,
    ) -> Result<(), StoreError> {
        if self.container.groups.contains_key(entry) && !self.force {
            return Err(StoreError::EntryExists(entry.to_string()));
        }
        let previous = self
            .container
            .groups
            .insert(entry.to_string(), Group::new(record, variation));
        if let Err(err) = self.flush() {
            match previous {
                Some(group) => {
                    self.container.groups.insert(entry.to_string(), group);
                }
                None => {
                    self.container.groups.shift_remove(entry);
                }
            }
            return Err(err);
        }
        debug!(entry, path = %self.path.display(), "saved group");
        Ok(())
    }

    fn dir(&self) -> Vec<String> {
        self.container.groups.keys().cloned().collect()
    }

    fn load_like(&self, entry: &str, like: &ResultShape) -> Result<Option<Outcome>, StoreError> {
        match self.record(entry) {
            Some(OutputRecord::Success(outcome)) => reshape(entry, &outcome, like).map(Some),
            Some(OutputRecord::Error(_)) | None => Ok(None),
        }
    }

    fn finalize(&mut self, metadata: &RunMetadata) -> Result<(), StoreError> {
        if self.finalized {
            return Err(StoreError::AlreadyFinalized);
        }
        self.container.attrs.extend(metadata.attrs());
        self.flush()?;
        self.finalized = true;
        Ok(())
    }
}
