// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent Lifecycle Manager
//!
//! Owns the agent registry: a concurrent map of per-agent async mutexes.
//! Every mutation locks exactly one agent, applies the transition, persists
//! it, and only then publishes the event. A failed persist reverts the
//! in-memory record so the registry never runs ahead of the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::application::agent::{AgentLifecycleService, SyncResolution};
use crate::application::deadline::Deadline;
use crate::application::governor::PerformanceGovernor;
use crate::application::persistence::PersistenceService;
use crate::domain::agent::{Agent, AgentId, AgentState, SpawnConfig};
use crate::domain::clock::Clock;
use crate::domain::compute::{ComputeEngine, TrainingOutcome, TrainingSample};
use crate::domain::config::LifecycleConfig;
use crate::domain::error::CoordinationError;
use crate::domain::events::AgentLifecycleEvent;
use crate::domain::knowledge::KnowledgePayload;
use crate::domain::metrics::OperationCategory;
use crate::domain::snapshot::SessionId;
use crate::infrastructure::event_bus::EventBus;

type AgentHandle = Arc<Mutex<Agent>>;

pub struct StandardAgentLifecycleService {
    registry: DashMap<AgentId, AgentHandle>,
    persistence: Arc<PersistenceService>,
    governor: Arc<PerformanceGovernor>,
    compute: Arc<dyn ComputeEngine>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl StandardAgentLifecycleService {
    pub fn new(
        persistence: Arc<PersistenceService>,
        governor: Arc<PerformanceGovernor>,
        compute: Arc<dyn ComputeEngine>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        governor.set_budget(OperationCategory::Spawn, config.spawn_budget);
        Self {
            registry: DashMap::new(),
            persistence,
            governor,
            compute,
            event_bus,
            clock,
            config,
        }
    }

    pub fn spawn_budget(&self) -> Duration {
        self.config.spawn_budget
    }

    pub fn registered(&self) -> usize {
        self.registry.len()
    }

    fn handle(&self, id: &AgentId) -> Option<AgentHandle> {
        self.registry.get(id).map(|entry| entry.value().clone())
    }

    fn require(&self, id: &AgentId) -> Result<AgentHandle, CoordinationError> {
        self.handle(id)
            .ok_or_else(|| CoordinationError::AgentNotFound(id.clone()))
    }

    fn record_registry_size(&self) {
        metrics::gauge!("synapse_registered_agents").set(self.registry.len() as f64);
    }

    /// Transition, persist, publish. Must be called with the agent's lock held.
    async fn apply_transition(&self, agent: &mut Agent, to: AgentState) -> Result<AgentState, CoordinationError> {
        let previous = agent.clone();
        let from = agent.transition_to(to, self.clock.now())?;
        if let Err(e) = self.persistence.save_agent(agent).await {
            warn!(agent_id = %agent.id, from = %from, to = %to, error = %e, "Persisting transition failed; reverting");
            *agent = previous;
            return Err(e);
        }
        debug!(agent_id = %agent.id, from = %from, to = %to, "Agent state changed");
        self.event_bus
            .publish_agent_event(AgentLifecycleEvent::AgentStateChanged {
                agent_id: agent.id.clone(),
                from,
                to,
                changed_at: agent.updated_at,
            });
        Ok(from)
    }

    fn release(&self, id: &AgentId) {
        self.registry.remove(id);
        self.record_registry_size();
        self.event_bus
            .publish_agent_event(AgentLifecycleEvent::AgentTerminated {
                agent_id: id.clone(),
                terminated_at: self.clock.now(),
            });
    }

    async fn abandon_spawn(&self, id: &AgentId) {
        if let Err(e) = self.persistence.delete_agent(id).await {
            warn!(agent_id = %id, error = %e, "Failed to remove abandoned spawn record");
        }
    }

    async fn spawn_agent(
        &self,
        id: AgentId,
        config: SpawnConfig,
        deadline: Option<Duration>,
    ) -> Result<Agent, CoordinationError> {
        config.validate()?;
        let deadline = Deadline::new("spawn", deadline);

        let mut agent = Agent::spawning(id, config, self.clock.now());
        self.persistence.save_agent(&agent).await?;

        if let Err(e) = deadline.check() {
            self.abandon_spawn(&agent.id).await;
            return Err(e);
        }

        agent.transition_to(AgentState::Active, self.clock.now())?;
        if let Err(e) = self.persistence.save_agent(&agent).await {
            self.abandon_spawn(&agent.id).await;
            return Err(e);
        }

        if let Err(e) = deadline.check() {
            self.abandon_spawn(&agent.id).await;
            return Err(e);
        }

        self.registry
            .insert(agent.id.clone(), Arc::new(Mutex::new(agent.clone())));
        self.record_registry_size();

        self.event_bus
            .publish_agent_event(AgentLifecycleEvent::AgentSpawned {
                agent_id: agent.id.clone(),
                agent_type: agent.capability_profile.agent_type.clone(),
                spawned_at: agent.created_at,
            });
        self.event_bus
            .publish_agent_event(AgentLifecycleEvent::AgentStateChanged {
                agent_id: agent.id.clone(),
                from: AgentState::Spawning,
                to: AgentState::Active,
                changed_at: agent.updated_at,
            });

        let observation = self.governor.observe(OperationCategory::Spawn, deadline.elapsed());
        info!(
            agent_id = %agent.id,
            agent_type = %agent.capability_profile.agent_type,
            elapsed_ms = observation.elapsed_ms,
            "Agent spawned"
        );
        Ok(agent)
    }
}

#[async_trait]
impl AgentLifecycleService for StandardAgentLifecycleService {
    async fn spawn(&self, config: SpawnConfig, deadline: Option<Duration>) -> Result<Agent, CoordinationError> {
        self.spawn_agent(AgentId::new(), config, deadline).await
    }

    async fn spawn_with_id(
        &self,
        id: AgentId,
        config: SpawnConfig,
        deadline: Option<Duration>,
    ) -> Result<Agent, CoordinationError> {
        if let Some(handle) = self.handle(&id) {
            let existing = handle.lock().await;
            if !existing.state.is_terminal() {
                debug!(agent_id = %id, "Agent already registered; spawn is a no-op");
                return Ok(existing.clone());
            }
        }
        self.spawn_agent(id, config, deadline).await
    }

    async fn transition(&self, id: &AgentId, to: AgentState) -> Result<Agent, CoordinationError> {
        let handle = self.require(id)?;
        let mut agent = handle.lock().await;
        self.apply_transition(&mut agent, to).await?;
        let updated = agent.clone();
        drop(agent);

        if to.is_terminal() {
            self.release(id);
        }
        Ok(updated)
    }

    async fn terminate(&self, id: &AgentId) -> Result<(), CoordinationError> {
        if let Some(handle) = self.handle(id) {
            let mut agent = handle.lock().await;
            if !agent.state.is_terminal() {
                self.apply_transition(&mut agent, AgentState::Terminated).await?;
            }
            drop(agent);
            self.release(id);
            info!(agent_id = %id, "Agent terminated");
            return Ok(());
        }

        // Not registered: already released, or only present in the store
        match self.persistence.load_agent(id).await? {
            Some(agent) if agent.state.is_terminal() => Ok(()),
            Some(mut agent) => {
                agent.transition_to(AgentState::Terminated, self.clock.now())?;
                self.persistence.save_agent(&agent).await?;
                self.event_bus
                    .publish_agent_event(AgentLifecycleEvent::AgentTerminated {
                        agent_id: id.clone(),
                        terminated_at: agent.updated_at,
                    });
                Ok(())
            }
            None => Err(CoordinationError::AgentNotFound(id.clone())),
        }
    }

    async fn heartbeat(&self, id: &AgentId) -> Result<(), CoordinationError> {
        let handle = self.require(id)?;
        let mut agent = handle.lock().await;
        if !agent.state.is_live() {
            return Err(CoordinationError::Validation(format!(
                "agent {} is {} and cannot heartbeat",
                id, agent.state
            )));
        }
        agent.touch(self.clock.now());
        Ok(())
    }

    async fn fail_if_unresponsive(&self, id: &AgentId, timeout: Duration) -> Result<bool, CoordinationError> {
        let handle = self.require(id)?;
        let mut agent = handle.lock().await;
        if !agent.state.is_live() {
            return Ok(false);
        }
        let silent_for = (self.clock.now() - agent.last_active_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if silent_for <= timeout {
            return Ok(false);
        }
        self.apply_transition(&mut agent, AgentState::Failed).await?;
        Ok(true)
    }

    async fn mark_recovery_exhausted(&self, id: &AgentId) -> Result<(), CoordinationError> {
        let handle = self.require(id)?;
        let mut agent = handle.lock().await;
        agent.recovery_exhausted = true;
        agent.updated_at = self.clock.now();
        if let Err(e) = self.persistence.save_agent(&agent).await {
            agent.recovery_exhausted = false;
            return Err(e);
        }
        Ok(())
    }

    async fn train(
        &self,
        id: &AgentId,
        data: &[TrainingSample],
        epochs: u32,
    ) -> Result<TrainingOutcome, CoordinationError> {
        let handle = self.require(id)?;
        let working = {
            let mut agent = handle.lock().await;
            self.apply_transition(&mut agent, AgentState::Training).await?;
            agent.clone()
        };

        let result = self.compute.train(&working, data, epochs).await;

        let mut agent = handle.lock().await;
        match result {
            Ok(outcome) => {
                if let Some(learned_state) = &outcome.learned_state {
                    agent.replace_learned_state(learned_state.clone());
                }
                agent.learning_progress = outcome.accuracy.clamp(0.0, 1.0);
                self.apply_transition(&mut agent, AgentState::Active).await?;
                info!(
                    agent_id = %id,
                    accuracy = outcome.accuracy,
                    convergence_epoch = outcome.convergence_epoch,
                    "Training finished"
                );
                self.event_bus
                    .publish_agent_event(AgentLifecycleEvent::AgentTrained {
                        agent_id: id.clone(),
                        accuracy: outcome.accuracy,
                        convergence_epoch: outcome.convergence_epoch,
                        trained_at: agent.updated_at,
                    });
                Ok(outcome)
            }
            Err(e) => {
                warn!(agent_id = %id, error = %e, "Training failed; marking agent FAILED");
                if agent.state.can_transition_to(AgentState::Failed) {
                    self.apply_transition(&mut agent, AgentState::Failed).await?;
                }
                Err(e.into())
            }
        }
    }

    async fn infer(&self, id: &AgentId, input: &[f32]) -> Result<Vec<f32>, CoordinationError> {
        let handle = self.require(id)?;
        let working = {
            let agent = handle.lock().await;
            if agent.state != AgentState::Active {
                return Err(CoordinationError::Validation(format!(
                    "agent {} is {} and cannot serve inference",
                    id, agent.state
                )));
            }
            agent.clone()
        };

        let output = self.compute.infer(&working, input).await?;

        let mut agent = handle.lock().await;
        agent.total_inferences += 1;
        agent.touch(self.clock.now());
        Ok(output)
    }

    async fn apply_knowledge(&self, id: &AgentId, payload: &KnowledgePayload) -> Result<Agent, CoordinationError> {
        payload.validate()?;
        let handle = self.require(id)?;
        let mut agent = handle.lock().await;
        if !agent.state.is_live() {
            return Err(CoordinationError::Validation(format!(
                "agent {} is {} and cannot receive knowledge",
                id, agent.state
            )));
        }

        let previous = agent.clone();
        payload.apply_to(&mut agent);
        agent.updated_at = self.clock.now();
        if let Err(e) = self.persistence.save_agent(&agent).await {
            *agent = previous;
            return Err(e);
        }
        Ok(agent.clone())
    }

    async fn reconcile(&self, persisted: Agent) -> Result<(Agent, SyncResolution), CoordinationError> {
        let id = persisted.id.clone();
        let Some(handle) = self.handle(&id) else {
            if persisted.state.is_terminal() {
                return Ok((persisted, SyncResolution::Unchanged));
            }
            self.registry
                .insert(id.clone(), Arc::new(Mutex::new(persisted.clone())));
            self.record_registry_size();
            return Ok((persisted, SyncResolution::AdoptedPersisted));
        };

        let mut agent = handle.lock().await;
        let resolution = if persisted.last_active_at > agent.last_active_at {
            *agent = persisted;
            SyncResolution::AdoptedPersisted
        } else if agent.last_active_at > persisted.last_active_at || *agent != persisted {
            self.persistence.save_agent(&agent).await?;
            SyncResolution::PersistedInMemory
        } else {
            SyncResolution::Unchanged
        };
        let winner = agent.clone();
        drop(agent);

        if winner.state.is_terminal() {
            self.registry.remove(&id);
            self.record_registry_size();
        }
        Ok((winner, resolution))
    }

    async fn install_restored(&self, agents: Vec<Agent>, session_id: SessionId) -> usize {
        let mut installed = 0;
        for agent in agents {
            if agent.state.is_terminal() {
                continue;
            }
            let id = agent.id.clone();
            match self.handle(&id) {
                Some(handle) => *handle.lock().await = agent,
                None => {
                    self.registry.insert(id.clone(), Arc::new(Mutex::new(agent)));
                }
            }
            self.event_bus
                .publish_agent_event(AgentLifecycleEvent::AgentRestored {
                    agent_id: id,
                    session_id,
                    restored_at: self.clock.now(),
                });
            installed += 1;
        }
        self.record_registry_size();
        installed
    }

    async fn get(&self, id: &AgentId) -> Result<Agent, CoordinationError> {
        if let Some(handle) = self.handle(id) {
            return Ok(handle.lock().await.clone());
        }
        self.persistence
            .load_agent(id)
            .await?
            .ok_or_else(|| CoordinationError::AgentNotFound(id.clone()))
    }

    async fn list(&self) -> Vec<Agent> {
        let handles: Vec<AgentHandle> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut agents = Vec::with_capacity(handles.len());
        for handle in handles {
            agents.push(handle.lock().await.clone());
        }
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    async fn active_agents(&self) -> Vec<Agent> {
        self.list()
            .await
            .into_iter()
            .filter(|agent| agent.state == AgentState::Active)
            .collect()
    }
}
