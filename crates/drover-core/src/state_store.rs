//! Scheduler state store: a JSON snapshot file partitioned by parent
//! id, read-modify-merge-written so interleaved updates from multiple
//! workers never lose set members, plus the startup recovery sequence
//! that lets a run survive interruption between "agent completed" and
//! "tracker status written".

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::adapters::{AdapterError, TaskManager};
use crate::task::TaskStatus;

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("failed to read state file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to write state file {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("failed to parse state file {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("failed to serialize state file {path}: {source}")]
    Serialize { path: PathBuf, source: serde_json::Error },
    #[error("recovery failed: {0}")]
    Recovery(#[from] AdapterError),
}

/// Per-parent state tracked across the life of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParentSnapshot {
    pub in_flight: BTreeSet<String>,
    pub completed: BTreeSet<String>,
    pub blocked: BTreeSet<String>,
    #[serde(default)]
    pub task_data: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    parents: BTreeMap<String, ParentSnapshot>,
}

/// A snapshot checked out for editing, remembering the view it started
/// from (`base`) so [`StateStore::save`] can compute a three-way merge
/// against whatever is on disk by the time it writes.
pub struct LoadedSnapshot {
    pub parent_id: String,
    pub base: ParentSnapshot,
    pub snapshot: ParentSnapshot,
}

pub struct StateStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(StateStore { path: path.into(), guard: Mutex::new(()) })
    }

    pub async fn load(&self, parent_id: &str) -> Result<LoadedSnapshot, StateStoreError> {
        let _permit = self.guard.lock().await;
        let file = self.read_file().await?;
        let snapshot = file.parents.get(parent_id).cloned().unwrap_or_default();
        Ok(LoadedSnapshot {
            parent_id: parent_id.to_string(),
            base: snapshot.clone(),
            snapshot,
        })
    }

    pub async fn save(&self, loaded: &LoadedSnapshot) -> Result<(), StateStoreError> {
        let _permit = self.guard.lock().await;
        let mut file = self.read_file().await?;
        let current = file.parents.get(&loaded.parent_id).cloned().unwrap_or_default();
        let merged = merge_parent_snapshot(&current, &loaded.base, &loaded.snapshot);
        file.parents.insert(loaded.parent_id.clone(), merged);
        self.write_file_atomic(&file).await
    }

    async fn read_file(&self) -> Result<StateFile, StateStoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| StateStoreError::Parse {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateFile::default()),
            Err(source) => Err(StateStoreError::Read { path: self.path.clone(), source }),
        }
    }

    async fn write_file_atomic(&self, file: &StateFile) -> Result<(), StateStoreError> {
        let rendered = serde_json::to_string_pretty(file)
            .map_err(|source| StateStoreError::Serialize { path: self.path.clone(), source })?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| StateStoreError::Write { path: self.path.clone(), source })?;

        let dir = dir.to_path_buf();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StateStoreError> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)
                .map_err(|source| StateStoreError::Write { path: path.clone(), source })?;
            use std::io::Write;
            tmp.write_all(rendered.as_bytes())
                .map_err(|source| StateStoreError::Write { path: path.clone(), source })?;
            tmp.persist(&path)
                .map_err(|e| StateStoreError::Write { path: path.clone(), source: e.error })?;
            Ok(())
        })
        .await
        .expect("state store write task panicked")?;

        Ok(())
    }
}

/// Merge one set field: a key disappears iff `base` had it and `next`
/// does not; a key appears iff `next` has it and `base` did not;
/// otherwise `current`'s presence wins.
fn merge_set(current: &BTreeSet<String>, base: &BTreeSet<String>, next: &BTreeSet<String>) -> BTreeSet<String> {
    let mut merged = current.clone();
    for removed in base.difference(next) {
        merged.remove(removed);
    }
    for added in next.difference(base) {
        merged.insert(added.clone());
    }
    merged
}

/// Merge task data per-key, last-writer-wins: a key this caller
/// actually changed (its value differs from `base`) overwrites
/// `current`; a key the caller left untouched defers to whatever is
/// already on disk.
fn merge_task_data(
    current: &BTreeMap<String, BTreeMap<String, String>>,
    base: &BTreeMap<String, BTreeMap<String, String>>,
    next: &BTreeMap<String, BTreeMap<String, String>>,
) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut merged = current.clone();
    for (task_id, next_map) in next {
        let base_map = base.get(task_id);
        let merged_map = merged.entry(task_id.clone()).or_default();
        for (key, value) in next_map {
            let unchanged = base_map.and_then(|m| m.get(key)) == Some(value);
            if !unchanged {
                merged_map.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

fn merge_parent_snapshot(current: &ParentSnapshot, base: &ParentSnapshot, next: &ParentSnapshot) -> ParentSnapshot {
    ParentSnapshot {
        in_flight: merge_set(&current.in_flight, &base.in_flight, &next.in_flight),
        completed: merge_set(&current.completed, &base.completed, &next.completed),
        blocked: merge_set(&current.blocked, &base.blocked, &next.blocked),
        task_data: merge_task_data(&current.task_data, &base.task_data, &next.task_data),
    }
}

/// Startup recovery (`spec.md` §4.6): replays the persisted snapshot
/// against the tracker so a run can resume cleanly after being killed
/// mid-task, then clears the snapshot's `in_flight` set.
pub async fn recover(
    store: &StateStore,
    parent_id: &str,
    tracker: &dyn TaskManager,
) -> Result<(), StateStoreError> {
    let mut loaded = store.load(parent_id).await?;

    for id in std::mem::take(&mut loaded.snapshot.completed) {
        tracker.set_task_status(&id, TaskStatus::Closed).await?;
    }

    for id in std::mem::take(&mut loaded.snapshot.blocked) {
        tracker.set_task_status(&id, TaskStatus::Blocked).await?;
        let triage = loaded
            .snapshot
            .task_data
            .get(&id)
            .cloned()
            .unwrap_or_else(|| BTreeMap::from([("triage_status".to_string(), "blocked".to_string())]));
        tracker.set_task_data(&id, triage).await?;
    }

    for id in std::mem::take(&mut loaded.snapshot.in_flight) {
        tracker.set_task_status(&id, TaskStatus::Open).await?;
    }

    store.save(&loaded).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_set_removes_keys_gone_from_base_but_keeps_current_additions() {
        let current: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let base: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let next: BTreeSet<String> = ["a"].iter().map(|s| s.to_string()).collect();
        // caller removed "b" (was in base, not in next) -- must disappear.
        // caller never mentioned "c" -- current's presence wins.
        let merged = merge_set(&current, &base, &next);
        assert!(merged.contains("a"));
        assert!(!merged.contains("b"));
        assert!(merged.contains("c"));
    }

    #[test]
    fn merge_set_adds_keys_new_in_next() {
        let current: BTreeSet<String> = ["a"].iter().map(|s| s.to_string()).collect();
        let base: BTreeSet<String> = ["a"].iter().map(|s| s.to_string()).collect();
        let next: BTreeSet<String> = ["a", "z"].iter().map(|s| s.to_string()).collect();
        let merged = merge_set(&current, &base, &next);
        assert!(merged.contains("z"));
    }

    #[test]
    fn merge_task_data_applies_only_actually_changed_keys() {
        let mut current = BTreeMap::new();
        current.insert(
            "t-1".to_string(),
            BTreeMap::from([("triage_reason".to_string(), "concurrent writer's value".to_string())]),
        );
        let base = BTreeMap::from([(
            "t-1".to_string(),
            BTreeMap::from([("triage_reason".to_string(), "original".to_string())]),
        )]);
        let next = BTreeMap::from([(
            "t-1".to_string(),
            BTreeMap::from([
                ("triage_reason".to_string(), "original".to_string()),
                ("triage_status".to_string(), "blocked".to_string()),
            ]),
        )]);

        let merged = merge_task_data(&current, &base, &next);
        // triage_reason untouched by this writer -> current's concurrent value wins.
        assert_eq!(
            merged.get("t-1").unwrap().get("triage_reason").unwrap(),
            "concurrent writer's value"
        );
        // triage_status is new -> applied.
        assert_eq!(merged.get("t-1").unwrap().get("triage_status").unwrap(), "blocked");
    }

    #[tokio::test]
    async fn save_then_load_round_trips_and_merges_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);

        let mut a = store.load("root").await.unwrap();
        a.snapshot.in_flight.insert("t-1".to_string());
        store.save(&a).await.unwrap();

        let mut b = store.load("root").await.unwrap();
        b.snapshot.in_flight.insert("t-2".to_string());
        store.save(&b).await.unwrap();

        let merged = store.load("root").await.unwrap();
        assert!(merged.snapshot.in_flight.contains("t-1"));
        assert!(merged.snapshot.in_flight.contains("t-2"));
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("state.json");
        let store = StateStore::new(&path);
        let loaded = store.load("root").await.unwrap();
        assert!(loaded.snapshot.in_flight.is_empty());
    }
}
