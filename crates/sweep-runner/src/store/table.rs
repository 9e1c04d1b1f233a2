use super::{OutputRecord, OutputStore, RunMetadata, Variation, WriteMode};
use crate::adapter::{Outcome, ResultShape};
use crate::error::StoreError;
use crate::fsutil::atomic_write_bytes;
use crate::overlay::value_label;
use indexmap::IndexMap;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const ENTRY_COLUMN: &str = "output";
const VARIATION_NAMESPACE: &str = "variation";
const RESULT_NAMESPACE: &str = "result";

type Row = IndexMap<String, String>;

/// Tabular store: one CSV row per entry. Columns are `output`, the variation
/// (dots become underscores), then the flattened result. A variation column
/// named `output` is written as `variation.output`; a result column whose
/// name is already taken gets a `result.` prefix. The header is the union of
/// all row columns in first-seen order.
#[derive(Debug)]
pub struct TableStore {
    path: PathBuf,
    force: bool,
    header: Vec<String>,
    rows: Vec<Row>,
}

impl TableStore {
    pub fn open(path: impl Into<PathBuf>, mode: WriteMode, force: bool) -> Result<Self, StoreError> {
        let path = path.into();
        let mut store = Self {
            path,
            force,
            header: vec![ENTRY_COLUMN.to_string()],
            rows: Vec::new(),
        };
        if store.path.exists() {
            match mode {
                WriteMode::Write if !force => return Err(StoreError::TargetExists(store.path)),
                WriteMode::Write => {
                    debug!(path = %store.path.display(), "truncating existing table");
                    fs::remove_file(&store.path)?;
                }
                WriteMode::Append => store.read_existing()?,
            }
        }
        Ok(store)
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Cell values of one entry's row; empty cells are omitted.
    pub fn row(&self, entry: &str) -> Option<&IndexMap<String, String>> {
        self.position(entry).map(|i| &self.rows[i])
    }

    fn read_existing(&mut self) -> Result<(), StoreError> {
        let mut reader = csv::Reader::from_path(&self.path)?;
        let header: Vec<String> = reader.headers()?.iter().map(String::from).collect();
        if header.first().map(String::as_str) != Some(ENTRY_COLUMN) {
            return Err(StoreError::Corrupt {
                path: self.path.clone(),
                reason: format!("first column must be `{}`", ENTRY_COLUMN),
            });
        }
        for record in reader.records() {
            let record = record?;
            let row: Row = header
                .iter()
                .zip(record.iter())
                .filter(|(_, cell)| !cell.is_empty())
                .map(|(column, cell)| (column.clone(), cell.to_string()))
                .collect();
            self.rows.push(row);
        }
        self.header = header;
        Ok(())
    }

    fn position(&self, entry: &str) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.get(ENTRY_COLUMN).map(String::as_str) == Some(entry))
    }

    fn flush(&self) -> Result<(), StoreError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.header)?;
        for row in &self.rows {
            writer.write_record(
                self.header
                    .iter()
                    .map(|column| row.get(column).map(String::as_str).unwrap_or("")),
            )?;
        }
        let bytes = writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
        atomic_write_bytes(&self.path, &bytes)?;
        Ok(())
    }
}

fn build_row(
    record: &OutputRecord,
    entry: &str,
    variation: Option<&Variation>,
) -> Result<Row, StoreError> {
    let mut cells = Cells {
        entry,
        row: Row::new(),
    };
    cells.row.insert(ENTRY_COLUMN.to_string(), entry.to_string());
    for (path, value) in variation.into_iter().flatten() {
        cells.insert(path.replace('.', "_"), VARIATION_NAMESPACE, value_label(value))?;
    }
    match record {
        OutputRecord::Success(Outcome::Single(value)) => cells.flatten("", value)?,
        OutputRecord::Success(Outcome::Members(members)) => match members.len() {
            1 => cells.flatten("", &members[0])?,
            n => {
                return Err(StoreError::Unsupported {
                    backend: "csv",
                    operation: format!("{} results per entry", n),
                })
            }
        },
        OutputRecord::Error(err) => {
            cells.insert("error.kind".to_string(), RESULT_NAMESPACE, err.kind.clone())?;
            cells.insert("error.message".to_string(), RESULT_NAMESPACE, err.message.clone())?;
        }
    }
    Ok(cells.row)
}

struct Cells<'a> {
    entry: &'a str,
    row: Row,
}

impl Cells<'_> {
    /// Earlier columns win: a taken name moves under `namespace`, and a
    /// taken namespaced name is an error.
    fn insert(&mut self, column: String, namespace: &str, cell: String) -> Result<(), StoreError> {
        let column = if self.row.contains_key(&column) {
            format!("{}.{}", namespace, column)
        } else {
            column
        };
        if self.row.contains_key(&column) {
            return Err(StoreError::ColumnClash {
                entry: self.entry.to_string(),
                column,
            });
        }
        self.row.insert(column, cell);
        Ok(())
    }

    /// Nested maps become `a.b` columns; a bare value lands in `value`.
    fn flatten(&mut self, prefix: &str, value: &Value) -> Result<(), StoreError> {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let column = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    self.flatten(&column, child)?;
                }
                Ok(())
            }
            other => {
                let column = if prefix.is_empty() { "value" } else { prefix };
                self.insert(column.to_string(), RESULT_NAMESPACE, value_label(other))
            }
        }
    }
}

impl OutputStore for TableStore {
    fn backend(&self) -> &'static str {
        "csv"
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
        let existing = self.position(entry);
        if existing.is_some() && !self.force {
            return Err(StoreError::EntryExists(entry.to_string()));
        }
        let row = build_row(record, entry, variation)?;

        let header_len = self.header.len();
        for column in row.keys() {
            if !self.header.contains(column) {
                self.header.push(column.clone());
            }
        }
        let previous = match existing {
            Some(i) => Some(std::mem::replace(&mut self.rows[i], row)),
            None => {
                self.rows.push(row);
                None
            }
        };

        if let Err(err) = self.flush() {
            self.header.truncate(header_len);
            match (existing, previous) {
                (Some(i), Some(prev)) => self.rows[i] = prev,
                _ => {
                    self.rows.pop();
                }
            }
            return Err(err);
        }
        debug!(entry, path = %self.path.display(), "saved row");
        Ok(())
    }

    fn dir(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| row.get(ENTRY_COLUMN).cloned())
            .collect()
    }

    fn load_like(&self, _entry: &str, _like: &ResultShape) -> Result<Option<Outcome>, StoreError> {
        Err(StoreError::Unsupported {
            backend: "csv",
            operation: "restart loading".to_string(),
        })
    }

    fn finalize(&mut self, _metadata: &RunMetadata) -> Result<(), StoreError> {
        debug!(path = %self.path.display(), "csv output keeps no run metadata");
        Ok(())
    }
}
