// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::agent::{Agent, AgentId, AgentState, SpawnConfig};
use crate::domain::compute::{TrainingOutcome, TrainingSample};
use crate::domain::error::CoordinationError;
use crate::domain::knowledge::KnowledgePayload;
use crate::domain::snapshot::SessionId;

/// How `reconcile` settled a disagreement between the registry and a
/// persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResolution {
    Unchanged,
    /// The persisted record was newer and replaced the in-memory agent.
    AdoptedPersisted,
    /// The in-memory agent was newer and was written back.
    PersistedInMemory,
}

#[async_trait]
pub trait AgentLifecycleService: Send + Sync {
    /// Validate, persist as SPAWNING, then promote to ACTIVE and persist again.
    async fn spawn(&self, config: SpawnConfig, deadline: Option<Duration>) -> Result<Agent, CoordinationError>;

    /// Spawn under a caller-chosen id. A live agent already registered under
    /// that id is returned unchanged.
    async fn spawn_with_id(
        &self,
        id: AgentId,
        config: SpawnConfig,
        deadline: Option<Duration>,
    ) -> Result<Agent, CoordinationError>;

    async fn transition(&self, id: &AgentId, to: AgentState) -> Result<Agent, CoordinationError>;
    async fn terminate(&self, id: &AgentId) -> Result<(), CoordinationError>;
    async fn heartbeat(&self, id: &AgentId) -> Result<(), CoordinationError>;

    /// Move a live agent to FAILED if it has been silent for longer than
    /// `timeout`. Returns whether it was failed.
    async fn fail_if_unresponsive(&self, id: &AgentId, timeout: Duration) -> Result<bool, CoordinationError>;
    async fn mark_recovery_exhausted(&self, id: &AgentId) -> Result<(), CoordinationError>;

    async fn train(
        &self,
        id: &AgentId,
        data: &[TrainingSample],
        epochs: u32,
    ) -> Result<TrainingOutcome, CoordinationError>;
    async fn infer(&self, id: &AgentId, input: &[f32]) -> Result<Vec<f32>, CoordinationError>;

    /// Blend shared knowledge into a live agent and persist the result.
    async fn apply_knowledge(&self, id: &AgentId, payload: &KnowledgePayload) -> Result<Agent, CoordinationError>;

    /// Last-write-wins on `last_active_at` between the registry and `persisted`.
    async fn reconcile(&self, persisted: Agent) -> Result<(Agent, SyncResolution), CoordinationError>;

    /// Register agents brought back from a snapshot. Returns how many were
    /// installed.
    async fn install_restored(&self, agents: Vec<Agent>, session_id: SessionId) -> usize;

    async fn get(&self, id: &AgentId) -> Result<Agent, CoordinationError>;
    async fn list(&self) -> Vec<Agent>;
    async fn active_agents(&self) -> Vec<Agent>;
}
