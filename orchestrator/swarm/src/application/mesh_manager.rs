// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mesh Topology Manager
//!
//! Establishes swarm sessions and moves knowledge between members.
//!
//! Propagation fans out to every target at once and joins before scoring.
//! Each target gets its own [`KnowledgeShareEvent`], appended to the store
//! whether the delivery succeeded or not; one failed target never blocks or
//! rolls back another. The source is copied out of the registry before the
//! fan-out, so no agent lock is held while waiting on targets.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use synapse_core::application::{
    run_with_deadline, AgentLifecycleService, PerformanceGovernor, PersistenceService, SyncResolution,
};
use synapse_core::domain::agent::{Agent, AgentId};
use synapse_core::domain::clock::Clock;
use synapse_core::domain::config::MeshConfig;
use synapse_core::domain::error::CoordinationError;
use synapse_core::domain::events::MeshEvent;
use synapse_core::domain::knowledge::{KnowledgeEventId, KnowledgePayload, KnowledgeShareEvent};
use synapse_core::domain::metrics::OperationCategory;
use synapse_core::domain::swarm::{SwarmId, SwarmSession, Topology};
use synapse_core::infrastructure::EventBus;

use crate::domain::{convergence_score, establish_session, substitute_member, validate_members};

/// Delivers a payload to one target and returns the target's state after it
/// was applied.
#[async_trait]
pub trait KnowledgeTransport: Send + Sync {
    async fn deliver(&self, target: &AgentId, payload: &KnowledgePayload) -> Result<Agent, CoordinationError>;
}

/// In-process transport: applies the payload through the lifecycle manager.
/// Targets that are not live are unreachable.
pub struct LifecycleTransport {
    lifecycle: Arc<dyn AgentLifecycleService>,
}

impl LifecycleTransport {
    pub fn new(lifecycle: Arc<dyn AgentLifecycleService>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl KnowledgeTransport for LifecycleTransport {
    async fn deliver(&self, target: &AgentId, payload: &KnowledgePayload) -> Result<Agent, CoordinationError> {
        self.lifecycle.apply_knowledge(target, payload).await
    }
}

#[derive(Debug, Clone)]
pub struct PropagationReport {
    pub source_agent_id: AgentId,
    pub events: Vec<KnowledgeShareEvent>,
    pub successes: usize,
    pub failures: usize,
    pub convergence_score: f64,
    /// Convergence fell below the configured minimum.
    pub degraded: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub agents: Vec<Agent>,
    pub adopted_persisted: usize,
    pub kept_in_memory: usize,
    pub unchanged: usize,
    /// Ids with no persisted record.
    pub missing: Vec<AgentId>,
}

pub struct MeshTopologyManager {
    sessions: RwLock<BTreeMap<SwarmId, SwarmSession>>,
    lifecycle: Arc<dyn AgentLifecycleService>,
    persistence: Arc<PersistenceService>,
    transport: Arc<dyn KnowledgeTransport>,
    governor: Arc<PerformanceGovernor>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    config: MeshConfig,
}

impl MeshTopologyManager {
    pub fn new(
        lifecycle: Arc<dyn AgentLifecycleService>,
        persistence: Arc<PersistenceService>,
        governor: Arc<PerformanceGovernor>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        config: MeshConfig,
    ) -> Self {
        let transport = Arc::new(LifecycleTransport::new(lifecycle.clone()));
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            lifecycle,
            persistence,
            transport,
            governor,
            event_bus,
            clock,
            config,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn KnowledgeTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub async fn establish_mesh(
        &self,
        agent_ids: Vec<AgentId>,
        topology: Topology,
    ) -> Result<SwarmSession, CoordinationError> {
        validate_members(&agent_ids)?;

        let mut members = Vec::with_capacity(agent_ids.len());
        for id in &agent_ids {
            let agent = self.lifecycle.get(id).await?;
            if !agent.state.is_live() {
                return Err(CoordinationError::Validation(format!(
                    "agent {} is {} and cannot join a mesh",
                    id, agent.state
                )));
            }
            members.push(agent);
        }

        let session = establish_session(SwarmId::new(), topology, &members, self.clock.now())?;
        self.sessions
            .write()
            .await
            .insert(session.swarm_id, session.clone());

        info!(
            swarm_id = %session.swarm_id,
            members = session.member_agent_ids.len(),
            connections = session.connections.len(),
            coordination_efficiency = session.coordination_efficiency,
            "Mesh established"
        );
        self.event_bus.publish_mesh_event(MeshEvent::MeshEstablished {
            swarm_id: session.swarm_id,
            members: session.member_agent_ids.len(),
            connections: session.connections.len(),
            coordination_efficiency: session.coordination_efficiency,
            established_at: session.created_at,
        });
        Ok(session)
    }

    /// Re-create a full-mesh session under a known id, used after restore.
    /// An existing session with that id is left as it is.
    pub async fn adopt_session(&self, swarm_id: SwarmId, members: &[Agent]) -> Result<SwarmSession, CoordinationError> {
        if let Some(existing) = self.sessions.read().await.get(&swarm_id) {
            return Ok(existing.clone());
        }
        let live: Vec<Agent> = members
            .iter()
            .filter(|agent| !agent.state.is_terminal())
            .cloned()
            .collect();
        let session = establish_session(swarm_id, Topology::Mesh, &live, self.clock.now())?;
        self.sessions
            .write()
            .await
            .entry(swarm_id)
            .or_insert_with(|| session.clone());
        debug!(swarm_id = %swarm_id, members = live.len(), "Adopted restored swarm session");
        Ok(session)
    }

    /// Fan `payload` out from `source_id` to every target.
    ///
    /// With a deadline, the caller gets `Timeout` once it passes while the
    /// fan-out finishes in the background.
    pub async fn propagate_knowledge(
        self: &Arc<Self>,
        source_id: &AgentId,
        payload: KnowledgePayload,
        target_ids: Vec<AgentId>,
        deadline: Option<Duration>,
    ) -> Result<PropagationReport, CoordinationError> {
        let this = Arc::clone(self);
        let source_id = source_id.clone();
        run_with_deadline("propagate", deadline, async move {
            this.fan_out(source_id, payload, target_ids).await
        })
        .await
    }

    async fn fan_out(
        &self,
        source_id: AgentId,
        payload: KnowledgePayload,
        target_ids: Vec<AgentId>,
    ) -> Result<PropagationReport, CoordinationError> {
        payload.validate()?;
        validate_members(&target_ids)?;
        if target_ids.contains(&source_id) {
            return Err(CoordinationError::Validation(format!(
                "agent {} cannot propagate to itself",
                source_id
            )));
        }

        let started = Instant::now();
        let source = self.lifecycle.get(&source_id).await?;
        let resolved = payload.resolve_against(&source);
        let swarm_id = self.swarm_of(&source_id).await;
        let timeout = self.config.propagation_timeout;

        let deliveries = target_ids.iter().map(|target| {
            let transport = self.transport.clone();
            let payload = &resolved;
            async move {
                let outcome = match tokio::time::timeout(timeout, transport.deliver(target, payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(CoordinationError::Timeout {
                        operation: "knowledge delivery",
                        deadline: timeout,
                    }),
                };
                (target.clone(), outcome)
            }
        });
        let outcomes = join_all(deliveries).await;

        let mut events = Vec::with_capacity(outcomes.len());
        let mut after = Vec::with_capacity(outcomes.len());
        for (target, outcome) in outcomes {
            let shared_at = self.clock.now();
            let (success, failure_reason, updated) = match outcome {
                Ok(agent) => (true, None, Some(agent)),
                Err(e) => {
                    warn!(source = %source_id, target = %target, error = %e, "Knowledge delivery failed");
                    (false, Some(e.to_string()), None)
                }
            };
            after.push(updated);

            let event = KnowledgeShareEvent {
                id: KnowledgeEventId::new(),
                source_agent_id: source_id.clone(),
                target_agent_id: target.clone(),
                shared_at,
                knowledge_type: resolved.knowledge_type,
                payload: resolved.clone(),
                success,
                failure_reason,
            };
            if let Err(e) = self.persistence.append_knowledge_event(&event).await {
                warn!(event_id = %event.id.0, error = %e, "Failed to record knowledge share");
            }
            metrics::counter!(
                "synapse_knowledge_shares_total",
                "outcome" => if success { "success" } else { "failure" }
            )
            .increment(1);
            self.event_bus.publish_mesh_event(MeshEvent::KnowledgeShared {
                swarm_id,
                source_agent_id: source_id.clone(),
                target_agent_id: target,
                knowledge_type: resolved.knowledge_type,
                success,
                shared_at,
            });
            events.push(event);
        }

        let successes = events.iter().filter(|e| e.success).count();
        let failures = events.len() - successes;
        let convergence = convergence_score(&source, &after);
        let degraded = convergence < self.config.min_convergence;

        self.governor
            .observe(OperationCategory::Propagate, started.elapsed());
        if degraded {
            warn!(
                source = %source_id,
                convergence_score = convergence,
                min_convergence = self.config.min_convergence,
                successes,
                failures,
                "Degraded propagation"
            );
        } else {
            info!(source = %source_id, convergence_score = convergence, successes, failures, "Knowledge propagated");
        }
        self.event_bus.publish_mesh_event(MeshEvent::PropagationCompleted {
            source_agent_id: source_id.clone(),
            successes,
            failures,
            convergence_score: convergence,
            degraded,
            completed_at: self.clock.now(),
        });

        Ok(PropagationReport {
            source_agent_id: source_id,
            events,
            successes,
            failures,
            convergence_score: convergence,
            degraded,
        })
    }

    /// Pull each agent's persisted record and settle it against the registry,
    /// last write on `last_active_at` wins.
    pub async fn synchronize_state(&self, agent_ids: &[AgentId]) -> Result<SyncReport, CoordinationError> {
        let mut report = SyncReport::default();
        for id in agent_ids {
            let Some(persisted) = self.persistence.load_agent(id).await? else {
                report.missing.push(id.clone());
                continue;
            };
            let (agent, resolution) = self.lifecycle.reconcile(persisted).await?;
            match resolution {
                SyncResolution::AdoptedPersisted => report.adopted_persisted += 1,
                SyncResolution::PersistedInMemory => report.kept_in_memory += 1,
                SyncResolution::Unchanged => report.unchanged += 1,
            }
            report.agents.push(agent);
        }
        debug!(
            adopted = report.adopted_persisted,
            kept = report.kept_in_memory,
            missing = report.missing.len(),
            "State synchronized"
        );
        Ok(report)
    }

    pub async fn teardown(&self, swarm_id: SwarmId) -> Result<SwarmSession, CoordinationError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(&swarm_id)
            .ok_or_else(|| CoordinationError::SwarmNotFound(swarm_id.to_string()))?;
        info!(swarm_id = %swarm_id, "Mesh torn down");
        self.event_bus.publish_mesh_event(MeshEvent::MeshTornDown {
            swarm_id,
            torn_down_at: self.clock.now(),
        });
        Ok(session)
    }

    pub async fn session(&self, swarm_id: SwarmId) -> Option<SwarmSession> {
        self.sessions.read().await.get(&swarm_id).cloned()
    }

    pub async fn sessions(&self) -> Vec<SwarmSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    async fn swarm_of(&self, agent_id: &AgentId) -> Option<SwarmId> {
        self.sessions
            .read()
            .await
            .values()
            .find(|session| session.contains(agent_id))
            .map(|session| session.swarm_id)
    }

    /// Put `replacement` in `old`'s place in every session. Returns the
    /// affected swarms.
    pub async fn replace_member(&self, old: &AgentId, replacement: &AgentId) -> Result<Vec<SwarmId>, CoordinationError> {
        let affected: Vec<SwarmSession> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|session| session.contains(old))
            .cloned()
            .collect();
        if affected.is_empty() {
            return Ok(Vec::new());
        }

        let new_agent = self.lifecycle.get(replacement).await?;
        let mut profiles = HashMap::new();
        for session in &affected {
            for peer in session.peers_of(old) {
                if !profiles.contains_key(&peer) {
                    let agent = self.lifecycle.get(&peer).await?;
                    profiles.insert(peer, agent.capability_profile);
                }
            }
        }

        let now = self.clock.now();
        let mut swarms = Vec::with_capacity(affected.len());
        let mut sessions = self.sessions.write().await;
        for swarm_id in affected.iter().map(|s| s.swarm_id) {
            if let Some(session) = sessions.get_mut(&swarm_id) {
                substitute_member(session, old, &new_agent, &profiles);
                swarms.push(swarm_id);
                self.event_bus.publish_mesh_event(MeshEvent::MemberReplaced {
                    swarm_id,
                    old_agent_id: old.clone(),
                    new_agent_id: replacement.clone(),
                    replaced_at: now,
                });
            }
        }
        Ok(swarms)
    }
}
