// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Persistence service.
//!
//! Thin application layer over the configured [`PersistenceStore`]: maps
//! storage errors into [`CoordinationError`], reports save/load latency to the
//! governor, and implements the two multi-record operations, snapshot capture
//! (stage then commit) and restore preparation.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::application::governor::PerformanceGovernor;
use crate::domain::agent::{Agent, AgentId};
use crate::domain::clock::Clock;
use crate::domain::error::CoordinationError;
use crate::domain::events::PersistenceEvent;
use crate::domain::knowledge::KnowledgeShareEvent;
use crate::domain::metrics::OperationCategory;
use crate::domain::repository::PersistenceStore;
use crate::domain::snapshot::{SessionId, SessionSnapshot, SnapshotSummary};
use crate::domain::swarm::SwarmId;
use crate::domain::task::{Task, TaskId};
use crate::infrastructure::event_bus::EventBus;

/// Outcome of preparing a snapshot for restore.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreReport {
    pub session_id: SessionId,
    pub swarm_id: SwarmId,
    pub agents_referenced: usize,
    pub agents_restored: usize,
    pub tasks_referenced: usize,
    pub tasks_restored: usize,
    /// Referenced agents that had no persisted record at restore time.
    pub missing_agents: Vec<AgentId>,
    /// Agents whose current record failed its checksum and was rewritten
    /// from the snapshot copy.
    pub repaired_agents: Vec<AgentId>,
    /// Records that could not be written back; not counted as restored.
    pub unwritten_records: Vec<String>,
    pub continuity_score: f64,
    pub threshold: f64,
    pub degraded: bool,
}

impl RestoreReport {
    /// The non-fatal degraded-restore signal, when the score fell below the
    /// threshold.
    pub fn degradation(&self) -> Option<CoordinationError> {
        self.degraded.then(|| CoordinationError::DegradedRestore {
            session_id: self.session_id.to_string(),
            continuity_score: self.continuity_score,
            threshold: self.threshold,
        })
    }
}

/// Records brought back from a snapshot, ready to be installed into the
/// registry and the task graph.
#[derive(Debug, Clone)]
pub struct RestoredSession {
    pub report: RestoreReport,
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
}

pub struct PersistenceService {
    store: Arc<dyn PersistenceStore>,
    governor: Arc<PerformanceGovernor>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl PersistenceService {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        governor: Arc<PerformanceGovernor>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            governor,
            event_bus,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.store
    }

    pub async fn save_agent(&self, agent: &Agent) -> Result<(), CoordinationError> {
        let (result, _) = self
            .governor
            .timed(OperationCategory::Save, self.store.save_agent(agent))
            .await;
        result.map_err(CoordinationError::from)
    }

    pub async fn load_agent(&self, id: &AgentId) -> Result<Option<Agent>, CoordinationError> {
        let (result, _) = self
            .governor
            .timed(OperationCategory::Load, self.store.load_agent(id))
            .await;
        result.map_err(|e| self.integrity_checked(e.into()))
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, CoordinationError> {
        self.store
            .list_agents()
            .await
            .map_err(|e| self.integrity_checked(e.into()))
    }

    pub async fn delete_agent(&self, id: &AgentId) -> Result<(), CoordinationError> {
        Ok(self.store.delete_agent(id).await?)
    }

    pub async fn save_task(&self, task: &Task) -> Result<(), CoordinationError> {
        let (result, _) = self
            .governor
            .timed(OperationCategory::Save, self.store.save_task(task))
            .await;
        result.map_err(CoordinationError::from)
    }

    pub async fn load_task(&self, id: &TaskId) -> Result<Option<Task>, CoordinationError> {
        let (result, _) = self
            .governor
            .timed(OperationCategory::Load, self.store.load_task(id))
            .await;
        result.map_err(|e| self.integrity_checked(e.into()))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, CoordinationError> {
        self.store
            .list_tasks()
            .await
            .map_err(|e| self.integrity_checked(e.into()))
    }

    pub async fn delete_task(&self, id: &TaskId) -> Result<(), CoordinationError> {
        Ok(self.store.delete_task(id).await?)
    }

    pub async fn append_knowledge_event(&self, event: &KnowledgeShareEvent) -> Result<(), CoordinationError> {
        Ok(self.store.append_knowledge_event(event).await?)
    }

    pub async fn list_knowledge_events(&self) -> Result<Vec<KnowledgeShareEvent>, CoordinationError> {
        self.store
            .list_knowledge_events()
            .await
            .map_err(|e| self.integrity_checked(e.into()))
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>, CoordinationError> {
        Ok(self.store.list_snapshots().await?)
    }

    pub async fn load_snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot, CoordinationError> {
        let (result, _) = self
            .governor
            .timed(OperationCategory::Load, self.store.load_snapshot(session_id))
            .await;
        result
            .map_err(|e| self.integrity_checked(e.into()))?
            .ok_or_else(|| CoordinationError::SnapshotNotFound(session_id.to_string()))
    }

    pub async fn latest_snapshot_for_agent(
        &self,
        agent_id: &AgentId,
    ) -> Result<Option<SessionSnapshot>, CoordinationError> {
        self.store
            .latest_snapshot_for_agent(agent_id)
            .await
            .map_err(|e| self.integrity_checked(e.into()))
    }

    /// Capture every member agent and every task of the swarm into one
    /// snapshot. The prior committed snapshot stays visible until the commit.
    pub async fn save_session_snapshot(
        &self,
        swarm_id: SwarmId,
        members: &BTreeSet<AgentId>,
    ) -> Result<SessionSnapshot, CoordinationError> {
        let (result, _) = self
            .governor
            .timed(OperationCategory::Save, self.capture_and_commit(swarm_id, members))
            .await;
        let snapshot = result?;

        info!(
            session_id = %snapshot.session_id,
            swarm_id = %swarm_id,
            agents = snapshot.agent_states.len(),
            tasks = snapshot.task_states.len(),
            "Committed session snapshot"
        );
        self.event_bus
            .publish_persistence_event(PersistenceEvent::SnapshotCommitted {
                session_id: snapshot.session_id,
                swarm_id,
                agents: snapshot.agent_states.len(),
                tasks: snapshot.task_states.len(),
                committed_at: snapshot.saved_at,
            });
        Ok(snapshot)
    }

    async fn capture_and_commit(
        &self,
        swarm_id: SwarmId,
        members: &BTreeSet<AgentId>,
    ) -> Result<SessionSnapshot, CoordinationError> {
        let mut agents = Vec::with_capacity(members.len());
        for id in members {
            let agent = self
                .load_agent(id)
                .await?
                .ok_or_else(|| CoordinationError::Persistence(format!(
                    "agent {} has no persisted record and cannot be captured",
                    id
                )))?;
            agents.push(agent);
        }

        let tasks: Vec<Task> = self
            .list_tasks()
            .await?
            .into_iter()
            .filter(|task| {
                task.swarm_id == Some(swarm_id)
                    || task
                        .assigned_agent_id
                        .as_ref()
                        .map(|agent_id| members.contains(agent_id))
                        .unwrap_or(false)
            })
            .collect();

        let snapshot = SessionSnapshot::capture(swarm_id, agents, tasks, self.clock.now());
        self.store.stage_snapshot(&snapshot).await?;
        if let Err(e) = self.store.commit_snapshot(snapshot.session_id).await {
            warn!(session_id = %snapshot.session_id, error = %e, "Snapshot commit failed; discarding staged copy");
            if let Err(discard) = self.store.discard_staged_snapshot(snapshot.session_id).await {
                warn!(session_id = %snapshot.session_id, error = %discard, "Failed to discard staged snapshot");
            }
            return Err(e.into());
        }
        Ok(snapshot)
    }

    /// Load a committed snapshot, check which of its records can come back,
    /// and write those back to the store. Does not touch the registry.
    ///
    /// A task counts as restored only when its assigned agent (if any) was
    /// restored too.
    pub async fn prepare_restore(
        &self,
        session_id: SessionId,
        threshold: f64,
    ) -> Result<RestoredSession, CoordinationError> {
        let (result, _) = self
            .governor
            .timed(OperationCategory::Restore, self.restore_records(session_id, threshold))
            .await;
        let restored = result?;
        let report = &restored.report;

        if report.degraded {
            warn!(
                session_id = %session_id,
                continuity_score = report.continuity_score,
                threshold = report.threshold,
                missing_agents = report.missing_agents.len(),
                "Degraded restore; continuing with the records available"
            );
        } else {
            info!(session_id = %session_id, continuity_score = report.continuity_score, "Restored session snapshot");
        }
        self.event_bus
            .publish_persistence_event(PersistenceEvent::SnapshotRestored {
                session_id,
                continuity_score: report.continuity_score,
                degraded: report.degraded,
                restored_at: self.clock.now(),
            });
        Ok(restored)
    }

    async fn restore_records(
        &self,
        session_id: SessionId,
        threshold: f64,
    ) -> Result<RestoredSession, CoordinationError> {
        let snapshot = self.load_snapshot(session_id).await?;
        let now = self.clock.now();

        let mut agents = Vec::with_capacity(snapshot.agent_states.len());
        let mut missing_agents = Vec::new();
        let mut repaired_agents = Vec::new();
        let mut unwritten_records = Vec::new();
        for captured in &snapshot.agent_states {
            match self.load_agent(&captured.id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    missing_agents.push(captured.id.clone());
                    continue;
                }
                Err(CoordinationError::DataIntegrity { record, .. }) => {
                    warn!(agent_id = %captured.id, record = %record, "Current record is corrupt; rewriting from snapshot copy");
                    repaired_agents.push(captured.id.clone());
                }
                Err(e) => {
                    warn!(agent_id = %captured.id, error = %e, "Could not read current agent record; skipping");
                    unwritten_records.push(format!("agent_states/{}", captured.id));
                    continue;
                }
            }
            let mut agent = captured.clone();
            agent.touch(now);
            if let Err(e) = self.save_agent(&agent).await {
                warn!(agent_id = %agent.id, error = %e, "Failed to write restored agent; skipping");
                unwritten_records.push(format!("agent_states/{}", agent.id));
                continue;
            }
            agents.push(agent);
        }

        let restored_ids: BTreeSet<&AgentId> = agents.iter().map(|agent| &agent.id).collect();
        let mut tasks = Vec::with_capacity(snapshot.task_states.len());
        for task in &snapshot.task_states {
            let reachable = task
                .assigned_agent_id
                .as_ref()
                .map(|agent_id| restored_ids.contains(agent_id))
                .unwrap_or(true);
            if !reachable {
                continue;
            }
            if let Err(e) = self.save_task(task).await {
                warn!(task_id = %task.id, error = %e, "Failed to write restored task; skipping");
                unwritten_records.push(format!("tasks/{}", task.id));
                continue;
            }
            tasks.push(task.clone());
        }

        let referenced = snapshot.referenced_records();
        let continuity_score = if referenced == 0 {
            1.0
        } else {
            (agents.len() + tasks.len()) as f64 / referenced as f64
        };

        let report = RestoreReport {
            session_id,
            swarm_id: snapshot.swarm_id,
            agents_referenced: snapshot.agent_states.len(),
            agents_restored: agents.len(),
            tasks_referenced: snapshot.task_states.len(),
            tasks_restored: tasks.len(),
            missing_agents,
            repaired_agents,
            unwritten_records,
            continuity_score,
            threshold,
            degraded: continuity_score < threshold,
        };
        Ok(RestoredSession {
            report,
            agents,
            tasks,
        })
    }

    fn integrity_checked(&self, err: CoordinationError) -> CoordinationError {
        if let CoordinationError::DataIntegrity { record, .. } = &err {
            error!(record = %record, "Integrity check failed on load");
            metrics::counter!("synapse_integrity_violations_total").increment(1);
            self.event_bus
                .publish_persistence_event(PersistenceEvent::IntegrityViolation {
                    record: record.clone(),
                    detected_at: self.clock.now(),
                });
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{Activation, AgentState, CapabilityProfile, NeuralConfig, SpawnConfig};
    use crate::domain::config::GovernorConfig;
    use crate::infrastructure::clock::SystemClock;
    use crate::infrastructure::repositories::InMemoryPersistenceStore;
    use chrono::Utc;

    fn service() -> PersistenceService {
        let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryPersistenceStore::new());
        let bus = EventBus::new(64);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let governor = Arc::new(PerformanceGovernor::new(
            GovernorConfig::default(),
            store.clone(),
            bus.clone(),
            clock.clone(),
        ));
        PersistenceService::new(store, governor, bus, clock)
    }

    fn active_agent(id: &str) -> Agent {
        let config = SpawnConfig::new(
            CapabilityProfile::new("worker", ["x"]),
            NeuralConfig::v1(vec![2, 3, 1], Activation::Tanh, 0.05),
        );
        let now = Utc::now();
        let mut agent = Agent::spawning(AgentId::from(id), config, now);
        agent.transition_to(AgentState::Active, now).unwrap();
        agent
    }

    #[tokio::test]
    async fn test_snapshot_captures_members_and_swarm_tasks() {
        let service = service();
        let swarm = SwarmId::new();
        for id in ["a", "b"] {
            service.save_agent(&active_agent(id)).await.unwrap();
        }
        service.save_task(&Task::new("t1", "infer").in_swarm(swarm)).await.unwrap();
        service.save_task(&Task::new("t2", "infer")).await.unwrap();

        let members: BTreeSet<AgentId> = ["a", "b"].into_iter().map(AgentId::from).collect();
        let snapshot = service.save_session_snapshot(swarm, &members).await.unwrap();
        assert_eq!(snapshot.agent_states.len(), 2);
        assert_eq!(snapshot.task_states.len(), 1);
        assert_eq!(service.list_snapshots().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_requires_persisted_members() {
        let service = service();
        let members: BTreeSet<AgentId> = [AgentId::from("ghost")].into_iter().collect();
        let err = service
            .save_session_snapshot(SwarmId::new(), &members)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Persistence(_)));
        assert!(service.list_snapshots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_with_missing_agent_is_degraded() {
        let service = service();
        let swarm = SwarmId::new();
        for id in ["a", "b"] {
            service.save_agent(&active_agent(id)).await.unwrap();
        }
        let mut task = Task::new("t1", "infer").in_swarm(swarm);
        task.assigned_agent_id = Some(AgentId::from("b"));
        service.save_task(&task).await.unwrap();

        let members: BTreeSet<AgentId> = ["a", "b"].into_iter().map(AgentId::from).collect();
        let snapshot = service.save_session_snapshot(swarm, &members).await.unwrap();
        service.delete_agent(&AgentId::from("b")).await.unwrap();

        let restored = service.prepare_restore(snapshot.session_id, 0.9).await.unwrap();
        let report = &restored.report;
        assert_eq!(report.agents_restored, 1);
        assert_eq!(report.tasks_restored, 0);
        assert_eq!(report.missing_agents, vec![AgentId::from("b")]);
        assert!((report.continuity_score - 1.0 / 3.0).abs() < 1e-9);
        assert!(report.degraded);
        assert!(matches!(report.degradation(), Some(CoordinationError::DegradedRestore { .. })));
    }

    #[tokio::test]
    async fn test_restore_unknown_session() {
        let service = service();
        let err = service.prepare_restore(SessionId::new(), 0.9).await.unwrap_err();
        assert!(matches!(err, CoordinationError::SnapshotNotFound(_)));
    }
}
