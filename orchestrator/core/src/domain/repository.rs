// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Storage Engine Contract
//!
//! The contract every storage engine satisfies, defined in the domain layer and
//! implemented in `crate::infrastructure::repositories`.
//!
//! | Table | Access | Record |
//! |-------|--------|--------|
//! | `agent_states` | upsert / load / delete | `Agent` |
//! | `tasks` | upsert / load / delete | `Task` |
//! | `knowledge_sharing` | append-only | `KnowledgeShareEvent` |
//! | `performance_metrics` | append-only | `PerformanceMetric` |
//! | `snapshots` | stage, then commit | `SessionSnapshot` |
//!
//! ## Integrity
//!
//! Every record goes through the shared record codec
//! (`infrastructure::repositories::codec`), which recomputes learned-state
//! checksums on encode and verifies them on decode. A load that fails
//! verification returns [`RepositoryError::Integrity`]; there is no unverified
//! read path.
//!
//! ## Visibility
//!
//! A record is either fully visible with a valid checksum or not visible at
//! all. Staged snapshots are never returned by `load_snapshot` or
//! `list_snapshots`.

use async_trait::async_trait;

use crate::domain::agent::{Agent, AgentId};
use crate::domain::knowledge::KnowledgeShareEvent;
use crate::domain::metrics::PerformanceMetric;
use crate::domain::snapshot::{SessionId, SessionSnapshot, SnapshotSummary};
use crate::domain::task::{Task, TaskId};

/// Storage backend selected from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    InMemory,
    FileSystem { data_dir: std::path::PathBuf },
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    // agent_states
    async fn save_agent(&self, agent: &Agent) -> Result<(), RepositoryError>;
    async fn load_agent(&self, id: &AgentId) -> Result<Option<Agent>, RepositoryError>;
    async fn list_agents(&self) -> Result<Vec<Agent>, RepositoryError>;
    async fn delete_agent(&self, id: &AgentId) -> Result<(), RepositoryError>;

    // tasks
    async fn save_task(&self, task: &Task) -> Result<(), RepositoryError>;
    async fn load_task(&self, id: &TaskId) -> Result<Option<Task>, RepositoryError>;
    async fn list_tasks(&self) -> Result<Vec<Task>, RepositoryError>;
    async fn delete_task(&self, id: &TaskId) -> Result<(), RepositoryError>;

    /// Fails with [`RepositoryError::Conflict`] if the id was already appended.
    async fn append_knowledge_event(&self, event: &KnowledgeShareEvent) -> Result<(), RepositoryError>;
    async fn list_knowledge_events(&self) -> Result<Vec<KnowledgeShareEvent>, RepositoryError>;

    /// Fails with [`RepositoryError::Conflict`] if the id was already appended.
    async fn append_metric(&self, metric: &PerformanceMetric) -> Result<(), RepositoryError>;
    async fn list_metrics(&self) -> Result<Vec<PerformanceMetric>, RepositoryError>;

    /// Write the snapshot where no reader can see it.
    async fn stage_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), RepositoryError>;

    /// Atomically publish a staged snapshot.
    async fn commit_snapshot(&self, session_id: SessionId) -> Result<(), RepositoryError>;

    /// Drop a staged snapshot that will not be committed. Missing is not an error.
    async fn discard_staged_snapshot(&self, session_id: SessionId) -> Result<(), RepositoryError>;

    async fn load_snapshot(&self, session_id: SessionId) -> Result<Option<SessionSnapshot>, RepositoryError>;

    /// Committed snapshots, oldest first.
    async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>, RepositoryError>;

    /// Most recent committed snapshot that contains `agent_id`.
    async fn latest_snapshot_for_agent(
        &self,
        agent_id: &AgentId,
    ) -> Result<Option<SessionSnapshot>, RepositoryError> {
        let mut summaries = self.list_snapshots().await?;
        summaries.sort_by_key(|summary| summary.saved_at);
        for summary in summaries.iter().rev() {
            if summary.agent_ids.contains(agent_id) {
                return self.load_snapshot(summary.session_id).await;
            }
        }
        Ok(None)
    }
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Checksum mismatch for {record}: stored {expected}, computed {actual}")]
    Integrity {
        record: String,
        expected: String,
        actual: String,
    },

    #[error("Record already exists: {0}")]
    Conflict(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RepositoryError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => RepositoryError::NotFound(err.to_string()),
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}
