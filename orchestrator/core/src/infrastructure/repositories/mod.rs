// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Storage Engine Implementations
//!
//! Infrastructure implementations of the `PersistenceStore` contract defined in
//! the domain layer.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve coordination records
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **InMemoryPersistenceStore** - encoded records in process memory; for
//!   tests and single-process deployments
//! - **FileSystemPersistenceStore** - one framed JSON document per record,
//!   crash-safe via temp file + fsync + rename
//!
//! Both engines store the byte frames produced by [`codec`], so integrity is
//! checked the same way everywhere.

pub mod codec;
pub mod file_store;

pub use file_store::FileSystemPersistenceStore;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::agent::{Agent, AgentId};
use crate::domain::knowledge::{KnowledgeEventId, KnowledgeShareEvent};
use crate::domain::metrics::{MetricId, PerformanceMetric};
use crate::domain::repository::{PersistenceStore, RepositoryError, StorageBackend};
use crate::domain::snapshot::{SessionId, SessionSnapshot, SnapshotSummary};
use crate::domain::task::{Task, TaskId};

#[derive(Default)]
struct Tables {
    agent_states: BTreeMap<AgentId, Vec<u8>>,
    tasks: BTreeMap<TaskId, Vec<u8>>,
    knowledge_sharing: Vec<(KnowledgeEventId, Vec<u8>)>,
    performance_metrics: Vec<(MetricId, Vec<u8>)>,
    staged_snapshots: HashMap<SessionId, Vec<u8>>,
    snapshots: BTreeMap<SessionId, Vec<u8>>,
    snapshot_summaries: Vec<SnapshotSummary>,
}

#[derive(Clone, Default)]
pub struct InMemoryPersistenceStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryPersistenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn agent_key(id: &AgentId) -> String {
    format!("agent_states/{}", id)
}

fn task_key(id: &TaskId) -> String {
    format!("tasks/{}", id)
}

fn snapshot_key(id: SessionId) -> String {
    format!("snapshots/{}", id)
}

#[async_trait]
impl PersistenceStore for InMemoryPersistenceStore {
    async fn save_agent(&self, agent: &Agent) -> Result<(), RepositoryError> {
        let bytes = codec::encode_agent(agent)?;
        self.tables.write().agent_states.insert(agent.id.clone(), bytes);
        Ok(())
    }

    async fn load_agent(&self, id: &AgentId) -> Result<Option<Agent>, RepositoryError> {
        let bytes = self.tables.read().agent_states.get(id).cloned();
        bytes
            .map(|bytes| codec::decode_agent(&agent_key(id), &bytes))
            .transpose()
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, RepositoryError> {
        let records: Vec<(AgentId, Vec<u8>)> = self
            .tables
            .read()
            .agent_states
            .iter()
            .map(|(id, bytes)| (id.clone(), bytes.clone()))
            .collect();
        records
            .iter()
            .map(|(id, bytes)| codec::decode_agent(&agent_key(id), bytes))
            .collect()
    }

    async fn delete_agent(&self, id: &AgentId) -> Result<(), RepositoryError> {
        self.tables.write().agent_states.remove(id);
        Ok(())
    }

    async fn save_task(&self, task: &Task) -> Result<(), RepositoryError> {
        let bytes = codec::encode(task)?;
        self.tables.write().tasks.insert(task.id.clone(), bytes);
        Ok(())
    }

    async fn load_task(&self, id: &TaskId) -> Result<Option<Task>, RepositoryError> {
        let bytes = self.tables.read().tasks.get(id).cloned();
        bytes.map(|bytes| codec::decode(&task_key(id), &bytes)).transpose()
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, RepositoryError> {
        let records: Vec<(TaskId, Vec<u8>)> = self
            .tables
            .read()
            .tasks
            .iter()
            .map(|(id, bytes)| (id.clone(), bytes.clone()))
            .collect();
        records
            .iter()
            .map(|(id, bytes)| codec::decode(&task_key(id), bytes))
            .collect()
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), RepositoryError> {
        self.tables.write().tasks.remove(id);
        Ok(())
    }

    async fn append_knowledge_event(&self, event: &KnowledgeShareEvent) -> Result<(), RepositoryError> {
        let bytes = codec::encode(event)?;
        let mut tables = self.tables.write();
        if tables.knowledge_sharing.iter().any(|(id, _)| *id == event.id) {
            return Err(RepositoryError::Conflict(format!(
                "knowledge_sharing/{}",
                event.id.0
            )));
        }
        tables.knowledge_sharing.push((event.id, bytes));
        Ok(())
    }

    async fn list_knowledge_events(&self) -> Result<Vec<KnowledgeShareEvent>, RepositoryError> {
        let records = self.tables.read().knowledge_sharing.clone();
        records
            .iter()
            .map(|(id, bytes)| codec::decode(&format!("knowledge_sharing/{}", id.0), bytes))
            .collect()
    }

    async fn append_metric(&self, metric: &PerformanceMetric) -> Result<(), RepositoryError> {
        let bytes = codec::encode(metric)?;
        let mut tables = self.tables.write();
        if tables.performance_metrics.iter().any(|(id, _)| *id == metric.id) {
            return Err(RepositoryError::Conflict(format!(
                "performance_metrics/{}",
                metric.id.0
            )));
        }
        tables.performance_metrics.push((metric.id, bytes));
        Ok(())
    }

    async fn list_metrics(&self) -> Result<Vec<PerformanceMetric>, RepositoryError> {
        let records = self.tables.read().performance_metrics.clone();
        records
            .iter()
            .map(|(id, bytes)| codec::decode(&format!("performance_metrics/{}", id.0), bytes))
            .collect()
    }

    async fn stage_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), RepositoryError> {
        let bytes = codec::encode_snapshot(snapshot)?;
        self.tables
            .write()
            .staged_snapshots
            .insert(snapshot.session_id, bytes);
        Ok(())
    }

    async fn commit_snapshot(&self, session_id: SessionId) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write();
        let bytes = tables
            .staged_snapshots
            .remove(&session_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("staged snapshot {}", session_id)))?;
        // Summary comes from the staged bytes, so it reflects exactly what is committed
        let snapshot = codec::decode_snapshot(&snapshot_key(session_id), &bytes)?;
        tables.snapshot_summaries.push(SnapshotSummary::from(&snapshot));
        tables.snapshots.insert(session_id, bytes);
        Ok(())
    }

    async fn discard_staged_snapshot(&self, session_id: SessionId) -> Result<(), RepositoryError> {
        self.tables.write().staged_snapshots.remove(&session_id);
        Ok(())
    }

    async fn load_snapshot(&self, session_id: SessionId) -> Result<Option<SessionSnapshot>, RepositoryError> {
        let bytes = self.tables.read().snapshots.get(&session_id).cloned();
        bytes
            .map(|bytes| codec::decode_snapshot(&snapshot_key(session_id), &bytes))
            .transpose()
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>, RepositoryError> {
        Ok(self.tables.read().snapshot_summaries.clone())
    }
}

/// Build the engine selected by configuration.
pub async fn create_persistence_store(
    backend: &StorageBackend,
) -> Result<Arc<dyn PersistenceStore>, RepositoryError> {
    match backend {
        StorageBackend::InMemory => {
            tracing::info!("Using in-memory persistence store");
            Ok(Arc::new(InMemoryPersistenceStore::new()))
        }
        StorageBackend::FileSystem { data_dir } => {
            tracing::info!("Using filesystem persistence store at {:?}", data_dir);
            Ok(Arc::new(FileSystemPersistenceStore::open(data_dir).await?))
        }
    }
}
