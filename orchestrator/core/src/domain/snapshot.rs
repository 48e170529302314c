// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session Snapshots
//!
//! A snapshot captures every member agent and every task of one swarm at a
//! single point in time. Snapshots are written stage-then-commit; only
//! committed snapshots are ever listed or loaded.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::{Agent, AgentId};
use crate::domain::swarm::SwarmId;
use crate::domain::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub per_agent_bytes: BTreeMap<AgentId, u64>,
    pub total_bytes: u64,
}

impl MemorySnapshot {
    pub fn from_agents(agents: &[Agent]) -> Self {
        let per_agent_bytes: BTreeMap<AgentId, u64> = agents
            .iter()
            .map(|agent| (agent.id.clone(), agent.memory_usage_bytes))
            .collect();
        let total_bytes = per_agent_bytes.values().sum();
        Self {
            per_agent_bytes,
            total_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub swarm_id: SwarmId,
    pub agent_states: Vec<Agent>,
    pub task_states: Vec<Task>,
    pub memory_snapshot: MemorySnapshot,
    pub saved_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn capture(swarm_id: SwarmId, agents: Vec<Agent>, tasks: Vec<Task>, now: DateTime<Utc>) -> Self {
        let memory_snapshot = MemorySnapshot::from_agents(&agents);
        Self {
            session_id: SessionId::new(),
            swarm_id,
            agent_states: agents,
            task_states: tasks,
            memory_snapshot,
            saved_at: now,
        }
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<&Agent> {
        self.agent_states.iter().find(|agent| &agent.id == agent_id)
    }

    pub fn contains_agent(&self, agent_id: &AgentId) -> bool {
        self.agent(agent_id).is_some()
    }

    /// Number of records a restore must bring back for full continuity.
    pub fn referenced_records(&self) -> usize {
        self.agent_states.len() + self.task_states.len()
    }
}

/// Listing entry for committed snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub session_id: SessionId,
    pub swarm_id: SwarmId,
    pub saved_at: DateTime<Utc>,
    pub agent_ids: Vec<AgentId>,
    pub task_count: usize,
}

impl From<&SessionSnapshot> for SnapshotSummary {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            swarm_id: snapshot.swarm_id,
            saved_at: snapshot.saved_at,
            agent_ids: snapshot.agent_states.iter().map(|a| a.id.clone()).collect(),
            task_count: snapshot.task_states.len(),
        }
    }
}
