// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Swarm Coordinator
//!
//! Wires the lifecycle manager, task orchestrator, mesh manager, persistence
//! service, recovery controller and performance governor over one store, one
//! event bus and one clock, and exposes the Coordination and Metrics APIs.
//!
//! Restoring a session snapshot goes through three owners in order: the
//! persistence service writes back what can be restored, the registry and the
//! task graph install it, and the mesh manager re-creates the swarm session.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use synapse_core::application::{
    run_with_deadline, AgentLifecycleService, CancelOutcome, OrchestrationReport, PerformanceGovernor,
    PersistenceService, RestoreReport, StandardAgentLifecycleService, TaskOrchestrator,
};
use synapse_core::domain::agent::{Agent, AgentId, AgentState, SpawnConfig};
use synapse_core::domain::clock::Clock;
use synapse_core::domain::compute::{ComputeEngine, TrainingOutcome, TrainingSample};
use synapse_core::domain::config::CoordinatorConfigManifest;
use synapse_core::domain::error::CoordinationError;
use synapse_core::domain::knowledge::KnowledgePayload;
use synapse_core::domain::metrics::{PerformanceMetric, PerformanceReport};
use synapse_core::domain::repository::PersistenceStore;
use synapse_core::domain::snapshot::{SessionId, SessionSnapshot, SnapshotSummary};
use synapse_core::domain::swarm::{SwarmId, SwarmSession, Topology};
use synapse_core::domain::task::{OrchestrationStrategy, Task, TaskId};
use synapse_core::infrastructure::{
    create_persistence_store, ActivationComputeEngine, EventBus, EventReceiver, SystemClock,
};

use crate::application::mesh_manager::{MeshTopologyManager, PropagationReport, SyncReport};
use crate::application::recovery::{FailureDetector, RecoveryController, RecoveryOutcome, RecoveryReport};

struct Monitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SwarmCoordinator {
    config: CoordinatorConfigManifest,
    event_bus: EventBus,
    governor: Arc<PerformanceGovernor>,
    persistence: Arc<PersistenceService>,
    lifecycle: Arc<dyn AgentLifecycleService>,
    orchestrator: Arc<TaskOrchestrator>,
    mesh: Arc<MeshTopologyManager>,
    detector: Arc<FailureDetector>,
    recovery: Arc<RecoveryController>,
    monitor: Mutex<Option<Monitor>>,
}

impl SwarmCoordinator {
    pub fn new(
        config: CoordinatorConfigManifest,
        store: Arc<dyn PersistenceStore>,
        compute: Arc<dyn ComputeEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let spec = &config.spec;
        let event_bus = EventBus::new(spec.event_bus.capacity);
        let governor = Arc::new(PerformanceGovernor::new(
            spec.governor.clone(),
            store.clone(),
            event_bus.clone(),
            clock.clone(),
        ));
        let persistence = Arc::new(PersistenceService::new(
            store,
            governor.clone(),
            event_bus.clone(),
            clock.clone(),
        ));
        let lifecycle: Arc<dyn AgentLifecycleService> = Arc::new(StandardAgentLifecycleService::new(
            persistence.clone(),
            governor.clone(),
            compute,
            event_bus.clone(),
            clock.clone(),
            spec.lifecycle.clone(),
        ));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            lifecycle.clone(),
            persistence.clone(),
            governor.clone(),
            event_bus.clone(),
            clock.clone(),
            spec.orchestrator.clone(),
        ));
        let mesh = Arc::new(MeshTopologyManager::new(
            lifecycle.clone(),
            persistence.clone(),
            governor.clone(),
            event_bus.clone(),
            clock.clone(),
            spec.mesh.clone(),
        ));
        let detector = Arc::new(FailureDetector::new(
            lifecycle.clone(),
            event_bus.clone(),
            clock.clone(),
            spec.failure_detector.clone(),
        ));
        let recovery = Arc::new(RecoveryController::new(
            lifecycle.clone(),
            persistence.clone(),
            mesh.clone(),
            governor.clone(),
            event_bus.clone(),
            clock,
            config.recovery_budget(),
        ));

        Self {
            config,
            event_bus,
            governor,
            persistence,
            lifecycle,
            orchestrator,
            mesh,
            detector,
            recovery,
            monitor: Mutex::new(None),
        }
    }

    /// Build a coordinator from a manifest: opens the configured store and
    /// uses the built-in compute engine and the wall clock.
    pub async fn from_config(config: CoordinatorConfigManifest) -> anyhow::Result<Self> {
        config.validate()?;
        let backend = config.spec.persistence.storage_backend();
        let store = create_persistence_store(&backend)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open persistence store: {}", e))?;
        info!(backend = ?backend, "Coordinator storage ready");
        Ok(Self::new(
            config,
            store,
            Arc::new(ActivationComputeEngine::new()),
            Arc::new(SystemClock),
        ))
    }

    pub fn config(&self) -> &CoordinatorConfigManifest {
        &self.config
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    pub fn lifecycle(&self) -> &Arc<dyn AgentLifecycleService> {
        &self.lifecycle
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    pub fn mesh(&self) -> &Arc<MeshTopologyManager> {
        &self.mesh
    }

    pub fn recovery(&self) -> &Arc<RecoveryController> {
        &self.recovery
    }

    pub fn persistence(&self) -> &Arc<PersistenceService> {
        &self.persistence
    }

    pub fn governor(&self) -> &Arc<PerformanceGovernor> {
        &self.governor
    }

    // ── Agents ──────────────────────────────────────────────────────────

    pub async fn spawn(&self, config: SpawnConfig, deadline: Option<Duration>) -> Result<Agent, CoordinationError> {
        self.lifecycle.spawn(config, deadline).await
    }

    pub async fn terminate(&self, agent_id: &AgentId) -> Result<(), CoordinationError> {
        self.lifecycle.terminate(agent_id).await
    }

    pub async fn transition(&self, agent_id: &AgentId, to: AgentState) -> Result<Agent, CoordinationError> {
        self.lifecycle.transition(agent_id, to).await
    }

    pub async fn heartbeat(&self, agent_id: &AgentId) -> Result<(), CoordinationError> {
        self.lifecycle.heartbeat(agent_id).await
    }

    pub async fn agent(&self, agent_id: &AgentId) -> Result<Agent, CoordinationError> {
        self.lifecycle.get(agent_id).await
    }

    pub async fn agents(&self) -> Vec<Agent> {
        self.lifecycle.list().await
    }

    pub async fn train(
        &self,
        agent_id: &AgentId,
        data: &[TrainingSample],
        epochs: u32,
    ) -> Result<TrainingOutcome, CoordinationError> {
        self.lifecycle.train(agent_id, data, epochs).await
    }

    pub async fn infer(&self, agent_id: &AgentId, input: &[f32]) -> Result<Vec<f32>, CoordinationError> {
        self.lifecycle.infer(agent_id, input).await
    }

    // ── Tasks ───────────────────────────────────────────────────────────

    pub async fn submit_task(&self, task: Task) -> Result<TaskId, CoordinationError> {
        self.orchestrator.submit(task).await
    }

    pub async fn submit_tasks(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>, CoordinationError> {
        self.orchestrator.submit_batch(tasks).await
    }

    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<CancelOutcome, CoordinationError> {
        self.orchestrator.cancel(task_id).await
    }

    pub fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.orchestrator.task(task_id)
    }

    /// Run the graph to quiescence. `None` uses the configured strategy.
    pub async fn orchestrate(
        &self,
        strategy: Option<OrchestrationStrategy>,
    ) -> Result<OrchestrationReport, CoordinationError> {
        let strategy = strategy.unwrap_or_else(|| self.orchestrator.default_strategy());
        self.orchestrator.orchestrate(strategy).await
    }

    // ── Mesh ────────────────────────────────────────────────────────────

    pub async fn establish_mesh(
        &self,
        agent_ids: Vec<AgentId>,
        topology: Topology,
    ) -> Result<SwarmSession, CoordinationError> {
        self.mesh.establish_mesh(agent_ids, topology).await
    }

    pub async fn propagate_knowledge(
        &self,
        source_id: &AgentId,
        payload: KnowledgePayload,
        target_ids: Vec<AgentId>,
        deadline: Option<Duration>,
    ) -> Result<PropagationReport, CoordinationError> {
        self.mesh
            .propagate_knowledge(source_id, payload, target_ids, deadline)
            .await
    }

    pub async fn synchronize_state(&self, agent_ids: &[AgentId]) -> Result<SyncReport, CoordinationError> {
        self.mesh.synchronize_state(agent_ids).await
    }

    pub async fn teardown(&self, swarm_id: SwarmId) -> Result<SwarmSession, CoordinationError> {
        self.mesh.teardown(swarm_id).await
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    pub async fn save_session_snapshot(&self, swarm_id: SwarmId) -> Result<SessionSnapshot, CoordinationError> {
        let session = self
            .mesh
            .session(swarm_id)
            .await
            .ok_or_else(|| CoordinationError::SwarmNotFound(swarm_id.to_string()))?;
        let members: BTreeSet<AgentId> = session.member_agent_ids;
        self.persistence.save_session_snapshot(swarm_id, &members).await
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>, CoordinationError> {
        self.persistence.list_snapshots().await
    }

    /// Bring a session back. A degraded restore still succeeds; the report
    /// says so.
    pub async fn restore_session_snapshot(
        &self,
        session_id: SessionId,
        deadline: Option<Duration>,
    ) -> Result<RestoreReport, CoordinationError> {
        let threshold = self.config.spec.failure_detector.restore_continuity_threshold;
        let persistence = self.persistence.clone();
        let lifecycle = self.lifecycle.clone();
        let orchestrator = self.orchestrator.clone();
        let mesh = self.mesh.clone();

        run_with_deadline("restore", deadline, async move {
            let restored = persistence.prepare_restore(session_id, threshold).await?;
            let report = restored.report;

            let agents_installed = lifecycle
                .install_restored(restored.agents.clone(), session_id)
                .await;
            let tasks_installed = orchestrator.install_restored(restored.tasks);
            if !restored.agents.is_empty() {
                mesh.adopt_session(report.swarm_id, &restored.agents).await?;
            }

            info!(
                session_id = %session_id,
                swarm_id = %report.swarm_id,
                agents = agents_installed,
                tasks = tasks_installed,
                "Session restored"
            );
            Ok(report)
        })
        .await
    }

    // ── Recovery ────────────────────────────────────────────────────────

    pub async fn recover(
        &self,
        agent_id: &AgentId,
        deadline: Option<Duration>,
    ) -> Result<RecoveryOutcome, CoordinationError> {
        self.recovery.recover(agent_id, deadline).await
    }

    pub async fn recover_all(&self, agent_ids: Vec<AgentId>) -> RecoveryReport {
        self.recovery.recover_all(agent_ids).await
    }

    pub async fn detect_failures(&self) -> Vec<AgentId> {
        self.detector.scan().await
    }

    pub async fn serve_request(&self, input: &[f32]) -> Result<Vec<f32>, CoordinationError> {
        self.recovery.serve_request(input).await
    }

    /// Start the background liveness monitor. A second call is a no-op.
    pub async fn start_monitor(&self) {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let controller = self
            .config
            .spec
            .failure_detector
            .auto_recover
            .then(|| self.recovery.clone());
        let handle = self.detector.clone().spawn_monitor(controller, token.clone());
        *monitor = Some(Monitor { token, handle });
    }

    /// Stop background work and wait for it to finish.
    pub async fn shutdown(&self) {
        let Some(monitor) = self.monitor.lock().await.take() else {
            return;
        };
        monitor.token.cancel();
        if let Err(e) = monitor.handle.await {
            warn!(error = %e, "Liveness monitor ended abnormally");
        }
    }

    // ── Metrics ─────────────────────────────────────────────────────────

    pub async fn record_metric(&self, metric: PerformanceMetric) -> Result<(), CoordinationError> {
        self.governor.record_metric(metric).await
    }

    pub fn performance_report(&self) -> PerformanceReport {
        self.governor.report()
    }
}
