// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Filesystem storage engine.
//!
//! ```text
//! <root>/
//!   agent_states/<agent>.json
//!   tasks/<task>.json
//!   knowledge_sharing/<event>.json
//!   performance_metrics/<metric>.json
//!   snapshots/<session>.json
//!   snapshots/<session>.summary.json
//!   snapshots/.staging/<session>.json
//! ```
//!
//! Every file holds one codec frame and is replaced via temp file, fsync and
//! rename, so readers see either the old or the new record. Writes to the same
//! file are serialized by a per-path async lock; different files interleave.
//! A path's lock lives only while someone holds or waits for it.
//!
//! A snapshot is committed by renaming its staging file into `snapshots/` and
//! then writing its summary. Listing only reads summaries, so a snapshot whose
//! commit did not finish is never listed. Staging files left behind by a crash
//! are removed on open.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::codec;
use crate::domain::agent::{Agent, AgentId};
use crate::domain::knowledge::KnowledgeShareEvent;
use crate::domain::metrics::PerformanceMetric;
use crate::domain::repository::{PersistenceStore, RepositoryError};
use crate::domain::snapshot::{SessionId, SessionSnapshot, SnapshotSummary};
use crate::domain::task::{Task, TaskId};

const AGENT_STATES: &str = "agent_states";
const TASKS: &str = "tasks";
const KNOWLEDGE_SHARING: &str = "knowledge_sharing";
const PERFORMANCE_METRICS: &str = "performance_metrics";
const SNAPSHOTS: &str = "snapshots";
const STAGING: &str = ".staging";
const RECORD_EXT: &str = ".json";
const SUMMARY_EXT: &str = ".summary.json";

pub struct FileSystemPersistenceStore {
    root: PathBuf,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl FileSystemPersistenceStore {
    /// Open (creating if needed) a store rooted at `root`, sweeping leftovers
    /// of interrupted writes.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let root = root.as_ref().to_path_buf();
        for table in [AGENT_STATES, TASKS, KNOWLEDGE_SHARING, PERFORMANCE_METRICS, SNAPSHOTS] {
            tokio::fs::create_dir_all(root.join(table)).await?;
        }
        let staging = root.join(SNAPSHOTS).join(STAGING);
        tokio::fs::create_dir_all(&staging).await?;

        let store = Self {
            root,
            locks: DashMap::new(),
        };
        let swept = store.sweep().await?;
        info!(root = ?store.root, swept, "Opened filesystem persistence store");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding an agent record.
    pub fn agent_path(&self, id: &AgentId) -> PathBuf {
        self.record_path(AGENT_STATES, id.as_str())
    }

    pub fn snapshot_path(&self, id: SessionId) -> PathBuf {
        self.record_path(SNAPSHOTS, &id.to_string())
    }

    fn record_path(&self, table: &str, key: &str) -> PathBuf {
        self.root
            .join(table)
            .join(format!("{}{}", file_key(key), RECORD_EXT))
    }

    fn summary_path(&self, id: SessionId) -> PathBuf {
        self.root
            .join(SNAPSHOTS)
            .join(format!("{}{}", id, SUMMARY_EXT))
    }

    fn staging_path(&self, id: SessionId) -> PathBuf {
        self.root
            .join(SNAPSHOTS)
            .join(STAGING)
            .join(format!("{}{}", id, RECORD_EXT))
    }

    async fn lock_for(&self, path: &Path) -> PathGuard<'_> {
        let lock = self
            .locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        PathGuard {
            locks: &self.locks,
            path: path.to_path_buf(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of per-path locks currently allocated.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// Remove staged snapshots and temp files from interrupted writes.
    async fn sweep(&self) -> Result<usize, RepositoryError> {
        let mut removed = 0;
        let staging = self.root.join(SNAPSHOTS).join(STAGING);
        let mut entries = tokio::fs::read_dir(&staging).await?;
        while let Some(entry) = entries.next_entry().await? {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
        for table in [AGENT_STATES, TASKS, KNOWLEDGE_SHARING, PERFORMANCE_METRICS, SNAPSHOTS] {
            let mut entries = tokio::fs::read_dir(self.root.join(table)).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') && name.ends_with(".tmp") {
                    tokio::fs::remove_file(entry.path()).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            warn!(removed, "Swept leftovers of interrupted writes");
        }
        Ok(removed)
    }

    async fn put(&self, path: &Path, bytes: &[u8]) -> Result<(), RepositoryError> {
        let _guard = self.lock_for(path).await;
        write_atomic(path, bytes).await
    }

    async fn append(&self, path: &Path, record: &str, bytes: &[u8]) -> Result<(), RepositoryError> {
        let _guard = self.lock_for(path).await;
        if tokio::fs::try_exists(path).await? {
            return Err(RepositoryError::Conflict(record.to_string()));
        }
        write_atomic(path, bytes).await
    }

    async fn get(&self, path: &Path) -> Result<Option<Vec<u8>>, RepositoryError> {
        let _guard = self.lock_for(path).await;
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, path: &Path) -> Result<(), RepositoryError> {
        let _guard = self.lock_for(path).await;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Record files of a table, skipping temp files and summaries.
    async fn table_files(&self, table: &str, ext: &str) -> Result<Vec<PathBuf>, RepositoryError> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(table)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(ext) {
                continue;
            }
            if ext == RECORD_EXT && name.ends_with(SUMMARY_EXT) {
                continue;
            }
            files.push(entry.path());
        }
        files.sort();
        Ok(files)
    }

    async fn decode_table<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>, RepositoryError> {
        let mut records = Vec::new();
        for path in self.table_files(table, RECORD_EXT).await? {
            if let Some(bytes) = self.get(&path).await? {
                records.push(codec::decode(&record_name(&path), &bytes)?);
            }
        }
        Ok(records)
    }
}

/// Write-to-temp, fsync, rename. The temp file lives in the target directory
/// so the rename never crosses filesystems.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RepositoryError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    debug!(path = ?path, bytes = bytes.len(), "Committed record");
    Ok(())
}

/// File-name-safe form of a record key. Unreserved characters pass through,
/// everything else is percent-encoded.
fn file_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn record_name(path: &Path) -> String {
    let table = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}/{}", table, file)
}

#[async_trait]
impl PersistenceStore for FileSystemPersistenceStore {
    async fn save_agent(&self, agent: &Agent) -> Result<(), RepositoryError> {
        let bytes = codec::encode_agent(agent)?;
        self.put(&self.agent_path(&agent.id), &bytes).await
    }

    async fn load_agent(&self, id: &AgentId) -> Result<Option<Agent>, RepositoryError> {
        let path = self.agent_path(id);
        match self.get(&path).await? {
            Some(bytes) => Ok(Some(codec::decode_agent(&record_name(&path), &bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, RepositoryError> {
        let mut agents = Vec::new();
        for path in self.table_files(AGENT_STATES, RECORD_EXT).await? {
            if let Some(bytes) = self.get(&path).await? {
                agents.push(codec::decode_agent(&record_name(&path), &bytes)?);
            }
        }
        Ok(agents)
    }

    async fn delete_agent(&self, id: &AgentId) -> Result<(), RepositoryError> {
        self.remove(&self.agent_path(id)).await
    }

    async fn save_task(&self, task: &Task) -> Result<(), RepositoryError> {
        let bytes = codec::encode(task)?;
        self.put(&self.record_path(TASKS, task.id.as_str()), &bytes).await
    }

    async fn load_task(&self, id: &TaskId) -> Result<Option<Task>, RepositoryError> {
        let path = self.record_path(TASKS, id.as_str());
        match self.get(&path).await? {
            Some(bytes) => Ok(Some(codec::decode(&record_name(&path), &bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, RepositoryError> {
        self.decode_table(TASKS).await
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), RepositoryError> {
        self.remove(&self.record_path(TASKS, id.as_str())).await
    }

    async fn append_knowledge_event(&self, event: &KnowledgeShareEvent) -> Result<(), RepositoryError> {
        let bytes = codec::encode(event)?;
        let path = self.record_path(KNOWLEDGE_SHARING, &event.id.0.to_string());
        self.append(&path, &record_name(&path), &bytes).await
    }

    async fn list_knowledge_events(&self) -> Result<Vec<KnowledgeShareEvent>, RepositoryError> {
        let mut events: Vec<KnowledgeShareEvent> = self.decode_table(KNOWLEDGE_SHARING).await?;
        events.sort_by_key(|event| event.shared_at);
        Ok(events)
    }

    async fn append_metric(&self, metric: &PerformanceMetric) -> Result<(), RepositoryError> {
        let bytes = codec::encode(metric)?;
        let path = self.record_path(PERFORMANCE_METRICS, &metric.id.0.to_string());
        self.append(&path, &record_name(&path), &bytes).await
    }

    async fn list_metrics(&self) -> Result<Vec<PerformanceMetric>, RepositoryError> {
        let mut metrics: Vec<PerformanceMetric> = self.decode_table(PERFORMANCE_METRICS).await?;
        metrics.sort_by_key(|metric| metric.recorded_at);
        Ok(metrics)
    }

    async fn stage_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), RepositoryError> {
        let bytes = codec::encode_snapshot(snapshot)?;
        self.put(&self.staging_path(snapshot.session_id), &bytes).await
    }

    async fn commit_snapshot(&self, session_id: SessionId) -> Result<(), RepositoryError> {
        let staged = self.staging_path(session_id);
        let committed = self.snapshot_path(session_id);

        let bytes = self
            .get(&staged)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("staged snapshot {}", session_id)))?;
        let snapshot = codec::decode_snapshot(&record_name(&staged), &bytes)?;

        {
            let _guard = self.lock_for(&committed).await;
            tokio::fs::rename(&staged, &committed).await?;
        }
        let summary = codec::encode(&SnapshotSummary::from(&snapshot))?;
        self.put(&self.summary_path(session_id), &summary).await?;
        info!(session_id = %session_id, agents = snapshot.agent_states.len(), tasks = snapshot.task_states.len(), "Committed session snapshot");
        Ok(())
    }

    async fn discard_staged_snapshot(&self, session_id: SessionId) -> Result<(), RepositoryError> {
        self.remove(&self.staging_path(session_id)).await
    }

    async fn load_snapshot(&self, session_id: SessionId) -> Result<Option<SessionSnapshot>, RepositoryError> {
        // Not committed until its summary exists
        if self.get(&self.summary_path(session_id)).await?.is_none() {
            return Ok(None);
        }
        let path = self.snapshot_path(session_id);
        match self.get(&path).await? {
            Some(bytes) => Ok(Some(codec::decode_snapshot(&record_name(&path), &bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>, RepositoryError> {
        let mut summaries = Vec::new();
        for path in self.table_files(SNAPSHOTS, SUMMARY_EXT).await? {
            if let Some(bytes) = self.get(&path).await? {
                summaries.push(codec::decode::<SnapshotSummary>(&record_name(&path), &bytes)?);
            }
        }
        summaries.sort_by_key(|summary| summary.saved_at);
        Ok(summaries)
    }
}

/// Holds a path's lock; drops the map entry when nobody else wants it.
struct PathGuard<'a> {
    locks: &'a DashMap<PathBuf, Arc<Mutex<()>>>,
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        // Release our reference first so an idle lock is held by the map only.
        self.guard.take();
        self.locks
            .remove_if(&self.path, |_, lock| Arc::strong_count(lock) == 1);
    }
}
