//! Durable per-pipeline checkpoint store.
//!
//! One JSON record file per pipeline name maps step identities to arbitrary
//! state. The pipeline runner creates an entry when a step first runs,
//! merges updates as it progresses and clears the store once the whole run
//! succeeds, so an interrupted job can reload prior progress and resume at
//! the right step.
//!
//! The store is single-writer per pipeline run. Concurrent pipelines must
//! use independent stores keyed by distinct pipeline names.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{CmorError, Result};

/// Arbitrary JSON-serializable step state.
pub type CheckpointData = Map<String, Value>;

/// Stable identity of one step instance within a pipeline.
///
/// Combines the step name with a disambiguating instance token so the same
/// step function used twice in one pipeline does not collide. The token is
/// the step's position, which keeps identities stable across resumed runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepIdentity {
    name: String,
    token: String,
}

impl StepIdentity {
    pub fn new(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
        }
    }

    pub fn at_position(name: impl Into<String>, position: usize) -> Self {
        Self::new(name, format!("{position:02}"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record key inside the store file.
    pub fn key(&self) -> String {
        format!("{}_{}", self.name, self.token)
    }
}

/// Persistent, keyed record store for one pipeline's step state.
#[derive(Debug)]
pub struct PipelineDb {
    pipeline_name: String,
    db_file: PathBuf,
    artifact_dir: PathBuf,
    entries: BTreeMap<String, CheckpointData>,
}

impl PipelineDb {
    pub fn new(pipeline_name: impl Into<String>, dir: impl AsRef<Path>) -> Self {
        let pipeline_name = pipeline_name.into();
        let dir = dir.as_ref();
        let file_stem = sanitize(&pipeline_name);
        Self {
            db_file: dir.join(format!("{file_stem}.json")),
            artifact_dir: dir.join(file_stem),
            pipeline_name,
            entries: BTreeMap::new(),
        }
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    pub fn db_file(&self) -> &Path {
        &self.db_file
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys currently recorded, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn contains(&self, step: &StepIdentity) -> bool {
        self.entries.contains_key(&step.key())
    }

    /// Record a new step entry. Fails if the identity is already present.
    pub fn create(&mut self, step: &StepIdentity, data: CheckpointData) -> Result<()> {
        let key = step.key();
        if self.entries.contains_key(&key) {
            return Err(CmorError::DuplicateCheckpoint(key));
        }
        self.entries.insert(key, data);
        Ok(())
    }

    pub fn read(&self, step: &StepIdentity) -> Option<&CheckpointData> {
        self.entries.get(&step.key())
    }

    /// Entry lookup by raw record key, for inspection tooling.
    pub fn entry_by_key(&self, key: &str) -> Option<&CheckpointData> {
        self.entries.get(key)
    }

    /// Merge `partial` into an existing entry, key by key. Unrelated keys
    /// are kept.
    pub fn update(&mut self, step: &StepIdentity, partial: CheckpointData) -> Result<()> {
        let key = step.key();
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or(CmorError::UnknownCheckpoint(key))?;
        for (field, value) in partial {
            entry.insert(field, value);
        }
        Ok(())
    }

    pub fn delete(&mut self, step: &StepIdentity) {
        self.entries.remove(&step.key());
    }

    /// Where a step may cache its completed output frame for resumption.
    pub fn artifact_path(&self, step: &StepIdentity) -> PathBuf {
        self.artifact_dir.join(format!("{}.parquet", step.key()))
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Persist the current mapping to the store file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.db_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(&self.entries)?;
        fs::write(&self.db_file, payload)?;
        Ok(())
    }

    /// Reload the mapping from the store file. A missing file loads as an
    /// empty store.
    pub fn load(&mut self) -> Result<()> {
        if !self.db_file.exists() {
            self.entries.clear();
            return Ok(());
        }
        let payload = fs::read_to_string(&self.db_file)?;
        self.entries = serde_json::from_str(&payload)?;
        Ok(())
    }

    /// Drop all entries, the store file and any cached artifacts. Called on
    /// successful pipeline completion and by explicit cleanup.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        if self.db_file.exists() {
            fs::remove_file(&self.db_file)?;
        }
        if self.artifact_dir.exists() {
            fs::remove_dir_all(&self.artifact_dir)?;
        }
        Ok(())
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(pairs: &[(&str, &str)]) -> CheckpointData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn create_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PipelineDb::new("test_pipeline", dir.path());
        let step = StepIdentity::at_position("load_inputs", 0);

        db.create(&step, data(&[("status", "running")])).unwrap();
        assert_eq!(db.read(&step).unwrap()["status"], json!("running"));
    }

    #[test]
    fn duplicate_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PipelineDb::new("test_pipeline", dir.path());
        let step = StepIdentity::at_position("load_inputs", 0);

        db.create(&step, data(&[])).unwrap();
        assert!(matches!(
            db.create(&step, data(&[])),
            Err(CmorError::DuplicateCheckpoint(_))
        ));
    }

    #[test]
    fn update_merges_without_discarding_unrelated_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PipelineDb::new("test_pipeline", dir.path());
        let step = StepIdentity::at_position("time_average", 2);

        db.create(&step, data(&[("status", "running"), ("note", "kept")]))
            .unwrap();
        db.update(&step, data(&[("status", "completed")])).unwrap();

        let entry = db.read(&step).unwrap();
        assert_eq!(entry["status"], json!("completed"));
        assert_eq!(entry["note"], json!("kept"));
    }

    #[test]
    fn update_of_unknown_step_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PipelineDb::new("test_pipeline", dir.path());
        let step = StepIdentity::at_position("missing", 0);
        assert!(matches!(
            db.update(&step, data(&[])),
            Err(CmorError::UnknownCheckpoint(_))
        ));
    }

    #[test]
    fn delete_removes_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PipelineDb::new("test_pipeline", dir.path());
        let step = StepIdentity::at_position("write_output", 5);

        db.create(&step, data(&[("status", "completed")])).unwrap();
        db.delete(&step);
        assert!(db.read(&step).is_none());
        assert!(!db.contains(&step));
    }

    #[test]
    fn save_then_load_round_trips_the_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PipelineDb::new("test_pipeline", dir.path());
        let first = StepIdentity::at_position("load_inputs", 0);
        let second = StepIdentity::at_position("time_average", 1);

        db.create(&first, data(&[("status", "completed")])).unwrap();
        db.create(&second, data(&[("status", "running")])).unwrap();
        db.save().unwrap();
        assert!(db.db_file().exists());

        let mut reloaded = PipelineDb::new("test_pipeline", dir.path());
        reloaded.load().unwrap();
        assert_eq!(
            reloaded.read(&first).unwrap()["status"],
            json!("completed")
        );
        assert_eq!(reloaded.read(&second).unwrap()["status"], json!("running"));
        assert_eq!(reloaded.keys().count(), 2);
    }

    #[test]
    fn same_step_name_twice_does_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PipelineDb::new("test_pipeline", dir.path());
        let first = StepIdentity::at_position("convert_units", 1);
        let second = StepIdentity::at_position("convert_units", 3);

        db.create(&first, data(&[("pass", "one")])).unwrap();
        db.create(&second, data(&[("pass", "two")])).unwrap();
        assert_eq!(db.read(&first).unwrap()["pass"], json!("one"));
        assert_eq!(db.read(&second).unwrap()["pass"], json!("two"));
    }

    #[test]
    fn clear_removes_store_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = PipelineDb::new("test_pipeline", dir.path());
        let step = StepIdentity::at_position("load_inputs", 0);
        db.create(&step, data(&[])).unwrap();
        db.save().unwrap();

        db.clear().unwrap();
        assert!(db.is_empty());
        assert!(!db.db_file().exists());
    }
}
