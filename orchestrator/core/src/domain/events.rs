// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentId, AgentState};
use crate::domain::knowledge::KnowledgeType;
use crate::domain::metrics::OperationCategory;
use crate::domain::snapshot::SessionId;
use crate::domain::swarm::SwarmId;
use crate::domain::task::TaskId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentLifecycleEvent {
    AgentSpawned {
        agent_id: AgentId,
        agent_type: String,
        spawned_at: DateTime<Utc>,
    },
    AgentStateChanged {
        agent_id: AgentId,
        from: AgentState,
        to: AgentState,
        changed_at: DateTime<Utc>,
    },
    AgentTrained {
        agent_id: AgentId,
        accuracy: f64,
        convergence_epoch: u32,
        trained_at: DateTime<Utc>,
    },
    AgentRestored {
        agent_id: AgentId,
        session_id: SessionId,
        restored_at: DateTime<Utc>,
    },
    AgentTerminated {
        agent_id: AgentId,
        terminated_at: DateTime<Utc>,
    },
}

impl AgentLifecycleEvent {
    pub fn agent_id(&self) -> &AgentId {
        match self {
            AgentLifecycleEvent::AgentSpawned { agent_id, .. }
            | AgentLifecycleEvent::AgentStateChanged { agent_id, .. }
            | AgentLifecycleEvent::AgentTrained { agent_id, .. }
            | AgentLifecycleEvent::AgentRestored { agent_id, .. }
            | AgentLifecycleEvent::AgentTerminated { agent_id, .. } => agent_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEvent {
    TaskSubmitted {
        task_id: TaskId,
        submitted_at: DateTime<Utc>,
    },
    TaskReady {
        task_id: TaskId,
        ready_at: DateTime<Utc>,
    },
    TaskAssigned {
        task_id: TaskId,
        agent_id: AgentId,
        assigned_at: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: TaskId,
        agent_id: AgentId,
        completed_at: DateTime<Utc>,
    },
    TaskFailed {
        task_id: TaskId,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    TaskCancelled {
        task_id: TaskId,
        /// True when the task was already running and only its result is
        /// dropped.
        result_discarded: bool,
        cancelled_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MeshEvent {
    MeshEstablished {
        swarm_id: SwarmId,
        members: usize,
        connections: usize,
        coordination_efficiency: f64,
        established_at: DateTime<Utc>,
    },
    KnowledgeShared {
        swarm_id: Option<SwarmId>,
        source_agent_id: AgentId,
        target_agent_id: AgentId,
        knowledge_type: KnowledgeType,
        success: bool,
        shared_at: DateTime<Utc>,
    },
    PropagationCompleted {
        source_agent_id: AgentId,
        successes: usize,
        failures: usize,
        convergence_score: f64,
        degraded: bool,
        completed_at: DateTime<Utc>,
    },
    MemberReplaced {
        swarm_id: SwarmId,
        old_agent_id: AgentId,
        new_agent_id: AgentId,
        replaced_at: DateTime<Utc>,
    },
    MeshTornDown {
        swarm_id: SwarmId,
        torn_down_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PersistenceEvent {
    SnapshotCommitted {
        session_id: SessionId,
        swarm_id: SwarmId,
        agents: usize,
        tasks: usize,
        committed_at: DateTime<Utc>,
    },
    SnapshotRestored {
        session_id: SessionId,
        continuity_score: f64,
        degraded: bool,
        restored_at: DateTime<Utc>,
    },
    IntegrityViolation {
        record: String,
        detected_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecoveryEvent {
    AgentUnresponsive {
        agent_id: AgentId,
        last_active_at: DateTime<Utc>,
        detected_at: DateTime<Utc>,
    },
    RecoveryStarted {
        agent_id: AgentId,
        started_at: DateTime<Utc>,
    },
    RecoveryCompleted {
        failed_agent_id: AgentId,
        replacement_agent_id: AgentId,
        duration_ms: u64,
        completed_at: DateTime<Utc>,
    },
    RecoveryFailed {
        agent_id: AgentId,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PerformanceEvent {
    BudgetExceeded {
        category: OperationCategory,
        elapsed_ms: f64,
        budget_ms: f64,
        observed_at: DateTime<Utc>,
    },
    RegressionDetected {
        category: OperationCategory,
        rolling_average_ms: f64,
        baseline_ms: f64,
        detected_at: DateTime<Utc>,
    },
}
