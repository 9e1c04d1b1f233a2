use super::{reshape, OutputRecord, OutputStore, RunMetadata, Variation};
use crate::adapter::{Outcome, ResultShape};
use crate::error::StoreError;
use indexmap::IndexMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub record: OutputRecord,
    pub variation: Variation,
}

/// Keeps everything in process. Used when a run has no `output` section.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: IndexMap<String, StoredEntry>,
    metadata: Option<RunMetadata>,
    force: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_force(force: bool) -> Self {
        Self {
            force,
            ..Self::default()
        }
    }

    pub fn entries(&self) -> &IndexMap<String, StoredEntry> {
        &self.entries
    }

    pub fn get(&self, entry: &str) -> Option<&OutputRecord> {
        self.entries.get(entry).map(|stored| &stored.record)
    }

    pub fn metadata(&self) -> Option<&RunMetadata> {
        self.metadata.as_ref()
    }
}

impl OutputStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn target(&self) -> Option<&Path> {
        None
    }

    fn save(
        &mut self,
        record: &OutputRecord,
        entry: &str,
        variation: Option<&Variation>,
    ) -> Result<(), StoreError> {
        if self.entries.contains_key(entry) && !self.force {
            return Err(StoreError::EntryExists(entry.to_string()));
        }
        self.entries.insert(
            entry.to_string(),
            StoredEntry {
                record: record.clone(),
                variation: variation.cloned().unwrap_or_default(),
            },
        );
        Ok(())
    }

    fn dir(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn load_like(&self, entry: &str, like: &ResultShape) -> Result<Option<Outcome>, StoreError> {
        match self.entries.get(entry).map(|stored| &stored.record) {
            Some(OutputRecord::Success(outcome)) => reshape(entry, outcome, like).map(Some),
            Some(OutputRecord::Error(_)) | None => Ok(None),
        }
    }

    fn finalize(&mut self, metadata: &RunMetadata) -> Result<(), StoreError> {
        if self.metadata.is_some() {
            return Err(StoreError::AlreadyFinalized);
        }
        self.metadata = Some(metadata.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn single(v: serde_json::Value) -> OutputRecord {
        OutputRecord::Success(Outcome::Single(v))
    }

    #[test]
    fn save_conflicts_without_force() {
        let mut store = MemoryStore::new();
        store.save(&single(json!(1)), "a_1", None).expect("first save");
        assert_eq!(store.dir(), ["a_1"]);
        let err = store.save(&single(json!(2)), "a_1", None).expect_err("conflict");
        assert!(matches!(err, StoreError::EntryExists(ref e) if e == "a_1"));

        let mut forced = MemoryStore::with_force(true);
        forced.save(&single(json!(1)), "a_1", None).expect("first save");
        forced.save(&single(json!(2)), "a_1", None).expect("forced save");
        assert_eq!(forced.get("a_1"), Some(&single(json!(2))));
    }

    #[test]
    fn load_like_skips_missing_and_errors() {
        let mut store = MemoryStore::new();
        store
            .save(&OutputRecord::error("ValueError", "bad"), "a_1", None)
            .expect("save");
        assert_eq!(store.load_like("nope", &ResultShape::Single).expect("load"), None);
        assert_eq!(store.load_like("a_1", &ResultShape::Single).expect("load"), None);
    }

    #[test]
    fn finalize_only_once() {
        let mut store = MemoryStore::new();
        let meta = RunMetadata::new(json!({}), json!({}), Vec::new());
        store.finalize(&meta).expect("finalize");
        assert!(matches!(store.finalize(&meta), Err(StoreError::AlreadyFinalized)));
        assert_eq!(store.metadata(), Some(&meta));
    }
}
