// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Failure Detector & Recovery Controller
//!
//! The detector turns silence into `FAILED`. The controller rebuilds a failed
//! agent from its most recent persisted state under the derived id
//! `recovery-<failedId>` and swaps the replacement into every swarm session.
//!
//! ```text
//!  original:     FAILED ─► RECOVERING ─────────────► TERMINATED
//!  replacement:              SPAWNING ─► ACTIVE ──► (joins swarms)
//! ```
//!
//! A source that fails its integrity check marks the original as exhausted:
//! it stays `FAILED` and is never retried. While recovery runs, requests are
//! routed to the remaining `ACTIVE` agents and counted by the
//! [`ServiceContinuityTracker`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use synapse_core::application::{run_with_deadline, AgentLifecycleService, PerformanceGovernor, PersistenceService};
use synapse_core::domain::agent::{Agent, AgentId, AgentState};
use synapse_core::domain::clock::Clock;
use synapse_core::domain::config::FailureDetectorConfig;
use synapse_core::domain::error::CoordinationError;
use synapse_core::domain::events::RecoveryEvent;
use synapse_core::domain::metrics::OperationCategory;
use synapse_core::infrastructure::EventBus;

use crate::application::mesh_manager::MeshTopologyManager;

/// Marks live agents that have been silent past the heartbeat timeout.
pub struct FailureDetector {
    lifecycle: Arc<dyn AgentLifecycleService>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    config: FailureDetectorConfig,
}

impl FailureDetector {
    pub fn new(
        lifecycle: Arc<dyn AgentLifecycleService>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        config: FailureDetectorConfig,
    ) -> Self {
        Self {
            lifecycle,
            event_bus,
            clock,
            config,
        }
    }

    /// One liveness pass. Returns the agents failed by this pass.
    pub async fn scan(&self) -> Vec<AgentId> {
        let mut failed = Vec::new();
        for agent in self.lifecycle.list().await {
            if !agent.state.is_live() {
                continue;
            }
            match self
                .lifecycle
                .fail_if_unresponsive(&agent.id, self.config.heartbeat_timeout)
                .await
            {
                Ok(true) => {
                    let detected_at = self.clock.now();
                    warn!(
                        agent_id = %agent.id,
                        last_active_at = %agent.last_active_at,
                        "Agent unresponsive; marked FAILED"
                    );
                    metrics::counter!("synapse_unresponsive_agents_total").increment(1);
                    self.event_bus
                        .publish_recovery_event(RecoveryEvent::AgentUnresponsive {
                            agent_id: agent.id.clone(),
                            last_active_at: agent.last_active_at,
                            detected_at,
                        });
                    failed.push(agent.id);
                }
                Ok(false) => {}
                // Terminated between list() and the check
                Err(CoordinationError::AgentNotFound(_)) => {}
                Err(e) => warn!(agent_id = %agent.id, error = %e, "Liveness check failed"),
            }
        }
        failed
    }

    /// Scan on `scan_interval` until `shutdown` fires. With `auto_recover`
    /// enabled and a controller supplied, newly failed agents are recovered
    /// from the loop.
    pub fn spawn_monitor(
        self: Arc<Self>,
        controller: Option<Arc<RecoveryController>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                scan_interval_ms = self.config.scan_interval.as_millis() as u64,
                heartbeat_timeout_ms = self.config.heartbeat_timeout.as_millis() as u64,
                auto_recover = self.config.auto_recover,
                "Liveness monitor started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let failed = self.scan().await;
                        if failed.is_empty() || !self.config.auto_recover {
                            continue;
                        }
                        if let Some(controller) = &controller {
                            let report = controller.recover_all(failed).await;
                            info!(
                                recovered = report.recovered.len(),
                                failed = report.failed.len(),
                                "Automatic recovery pass finished"
                            );
                        }
                    }
                }
            }
            info!("Liveness monitor stopped");
        })
    }
}

/// Counts requests and successful responses. Uptime is measured over a
/// window opened with [`ServiceContinuityTracker::open_window`].
#[derive(Debug, Default)]
pub struct ServiceContinuityTracker {
    total: AtomicU64,
    succeeded: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct ContinuityWindow {
    total: u64,
    succeeded: u64,
}

impl ServiceContinuityTracker {
    pub fn record(&self, success: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn open_window(&self) -> ContinuityWindow {
        ContinuityWindow {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
        }
    }

    /// Successful responses over total requests since `window` opened; 1.0
    /// when nothing was requested.
    pub fn uptime_since(&self, window: ContinuityWindow) -> f64 {
        let total = self.total.load(Ordering::Relaxed).saturating_sub(window.total);
        let succeeded = self
            .succeeded
            .load(Ordering::Relaxed)
            .saturating_sub(window.succeeded);
        if total == 0 {
            return 1.0;
        }
        (succeeded as f64 / total as f64).min(1.0)
    }

    pub fn lifetime_uptime(&self) -> f64 {
        self.uptime_since(ContinuityWindow {
            total: 0,
            succeeded: 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub failed_agent_id: AgentId,
    pub replacement_agent_id: AgentId,
    pub elapsed: Duration,
    /// Finished within the recovery budget.
    pub within_budget: bool,
}

#[derive(Debug)]
pub struct RecoveryReport {
    pub recovered: Vec<RecoveryOutcome>,
    pub failed: Vec<(AgentId, CoordinationError)>,
    pub success_rate: f64,
    pub service_uptime: f64,
    pub elapsed: Duration,
}

pub struct RecoveryController {
    lifecycle: Arc<dyn AgentLifecycleService>,
    persistence: Arc<PersistenceService>,
    mesh: Arc<MeshTopologyManager>,
    governor: Arc<PerformanceGovernor>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    continuity: ServiceContinuityTracker,
    budget: Duration,
}

impl RecoveryController {
    pub fn new(
        lifecycle: Arc<dyn AgentLifecycleService>,
        persistence: Arc<PersistenceService>,
        mesh: Arc<MeshTopologyManager>,
        governor: Arc<PerformanceGovernor>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        budget: Duration,
    ) -> Self {
        governor.set_budget(OperationCategory::Recover, budget);
        Self {
            lifecycle,
            persistence,
            mesh,
            governor,
            event_bus,
            clock,
            continuity: ServiceContinuityTracker::default(),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn continuity(&self) -> &ServiceContinuityTracker {
        &self.continuity
    }

    /// Rebuild `failed_id`. Safe to call again: once the original is gone and
    /// the replacement is live, the existing replacement is reported.
    pub async fn recover(
        self: &Arc<Self>,
        failed_id: &AgentId,
        deadline: Option<Duration>,
    ) -> Result<RecoveryOutcome, CoordinationError> {
        let this = Arc::clone(self);
        let failed_id = failed_id.clone();
        run_with_deadline("recover", deadline, async move { this.run_recovery(failed_id).await }).await
    }

    async fn run_recovery(&self, failed_id: AgentId) -> Result<RecoveryOutcome, CoordinationError> {
        let started = Instant::now();
        let replacement_id = AgentId::recovery_of(&failed_id);
        let original = self.lifecycle.get(&failed_id).await?;

        if original.state.is_terminal() {
            return match self.lifecycle.get(&replacement_id).await {
                Ok(replacement) if replacement.state.is_live() => {
                    debug!(agent_id = %failed_id, replacement = %replacement_id, "Already recovered");
                    Ok(RecoveryOutcome {
                        failed_agent_id: failed_id,
                        replacement_agent_id: replacement_id,
                        elapsed: started.elapsed(),
                        within_budget: true,
                    })
                }
                _ => Err(CoordinationError::RecoveryFailure {
                    agent_id: failed_id,
                    reason: "agent is terminated and has no live replacement".to_string(),
                }),
            };
        }
        if original.recovery_exhausted {
            return Err(CoordinationError::RecoveryFailure {
                agent_id: failed_id,
                reason: "a previous recovery failed; no further retries".to_string(),
            });
        }
        if !matches!(original.state, AgentState::Failed | AgentState::Recovering) {
            return Err(CoordinationError::Validation(format!(
                "agent {} is {}; only FAILED agents can be recovered",
                failed_id, original.state
            )));
        }

        let source = match self.recovery_source(&original).await {
            Ok(source) => source,
            Err(reason) => return Err(self.give_up(&failed_id, reason).await),
        };

        info!(agent_id = %failed_id, replacement = %replacement_id, "Recovery started");
        self.event_bus
            .publish_recovery_event(RecoveryEvent::RecoveryStarted {
                agent_id: failed_id.clone(),
                started_at: self.clock.now(),
            });
        if original.state == AgentState::Failed {
            self.lifecycle
                .transition(&failed_id, AgentState::Recovering)
                .await?;
        }

        let replacement = match self
            .lifecycle
            .spawn_with_id(replacement_id.clone(), source.respawn_config(), None)
            .await
        {
            Ok(agent) => agent,
            Err(e) => {
                error!(agent_id = %failed_id, error = %e, "Replacement spawn failed; terminating original");
                if let Err(term) = self.lifecycle.terminate(&failed_id).await {
                    warn!(agent_id = %failed_id, error = %term, "Failed to terminate original after spawn failure");
                }
                self.publish_failed(&failed_id, &e.to_string());
                return Err(CoordinationError::RecoveryFailure {
                    agent_id: failed_id,
                    reason: format!("replacement spawn failed: {}", e),
                });
            }
        };

        self.lifecycle.terminate(&failed_id).await?;
        let swarms = self.mesh.replace_member(&failed_id, &replacement.id).await?;

        let elapsed = started.elapsed();
        let observation = self.governor.observe(OperationCategory::Recover, elapsed);
        let within_budget = !observation.budget_exceeded;
        metrics::counter!("synapse_recoveries_total", "outcome" => "success").increment(1);
        info!(
            agent_id = %failed_id,
            replacement = %replacement.id,
            swarms = swarms.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            within_budget,
            "Recovery completed"
        );
        self.event_bus
            .publish_recovery_event(RecoveryEvent::RecoveryCompleted {
                failed_agent_id: failed_id.clone(),
                replacement_agent_id: replacement.id.clone(),
                duration_ms: elapsed.as_millis() as u64,
                completed_at: self.clock.now(),
            });

        Ok(RecoveryOutcome {
            failed_agent_id: failed_id,
            replacement_agent_id: replacement.id,
            elapsed,
            within_budget,
        })
    }

    /// Newest committed snapshot holding the agent, else its own record.
    /// The chosen state must pass its checksum.
    async fn recovery_source(&self, original: &Agent) -> Result<Agent, String> {
        let from_snapshot = self
            .persistence
            .latest_snapshot_for_agent(&original.id)
            .await
            .map_err(|e| e.to_string())?
            .and_then(|snapshot| snapshot.agent(&original.id).cloned());

        let source = match from_snapshot {
            Some(agent) => agent,
            None => self
                .persistence
                .load_agent(&original.id)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| "no persisted state to recover from".to_string())?,
        };
        source
            .learned_state
            .verify()
            .map_err(|reason| format!("recovery source failed integrity check: {}", reason))?;
        Ok(source)
    }

    async fn give_up(&self, failed_id: &AgentId, reason: String) -> CoordinationError {
        error!(agent_id = %failed_id, reason = %reason, "Recovery failed; agent stays FAILED");
        if let Err(e) = self.lifecycle.mark_recovery_exhausted(failed_id).await {
            warn!(agent_id = %failed_id, error = %e, "Failed to mark recovery exhausted");
        }
        self.publish_failed(failed_id, &reason);
        CoordinationError::RecoveryFailure {
            agent_id: failed_id.clone(),
            reason,
        }
    }

    fn publish_failed(&self, failed_id: &AgentId, reason: &str) {
        metrics::counter!("synapse_recoveries_total", "outcome" => "failure").increment(1);
        self.event_bus
            .publish_recovery_event(RecoveryEvent::RecoveryFailed {
                agent_id: failed_id.clone(),
                reason: reason.to_string(),
                failed_at: self.clock.now(),
            });
    }

    /// Recover every id concurrently, each bounded by the recovery budget.
    /// One agent's failure does not affect the others.
    pub async fn recover_all(self: &Arc<Self>, failed_ids: Vec<AgentId>) -> RecoveryReport {
        self.recover_all_within(failed_ids, Some(self.budget)).await
    }

    /// As [`recover_all`](Self::recover_all) with an explicit per-agent
    /// deadline. Recoveries that overrun it are reported as timeouts and
    /// finish in the background.
    pub async fn recover_all_within(
        self: &Arc<Self>,
        failed_ids: Vec<AgentId>,
        deadline: Option<Duration>,
    ) -> RecoveryReport {
        let window = self.continuity.open_window();
        let started = Instant::now();

        let results = join_all(failed_ids.into_iter().map(|id| async move {
            let result = self.recover(&id, deadline).await;
            if let Err(e) = &result {
                if e.is_timeout() {
                    warn!(agent_id = %id, deadline_ms = deadline.map(|d| d.as_millis() as u64), "Recovery overran its deadline");
                }
            }
            (id, result)
        }))
        .await;

        let mut recovered = Vec::new();
        let mut failed = Vec::new();
        for (id, result) in results {
            match result {
                Ok(outcome) => recovered.push(outcome),
                Err(e) => failed.push((id, e)),
            }
        }
        let attempted = recovered.len() + failed.len();
        let success_rate = if attempted == 0 {
            1.0
        } else {
            recovered.len() as f64 / attempted as f64
        };

        RecoveryReport {
            recovered,
            failed,
            success_rate,
            service_uptime: self.continuity.uptime_since(window),
            elapsed: started.elapsed(),
        }
    }

    /// Route one inference request to the least-loaded `ACTIVE` agent, falling
    /// through to the next one if it fails. Counted for service continuity.
    pub async fn serve_request(&self, input: &[f32]) -> Result<Vec<f32>, CoordinationError> {
        let mut candidates = self.lifecycle.active_agents().await;
        candidates.sort_by(|a, b| {
            a.total_inferences
                .cmp(&b.total_inferences)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut last_error = None;
        for agent in candidates {
            match self.lifecycle.infer(&agent.id, input).await {
                Ok(output) => {
                    self.continuity.record(true);
                    return Ok(output);
                }
                Err(e) => {
                    debug!(agent_id = %agent.id, error = %e, "Request routing fell through");
                    last_error = Some(e);
                }
            }
        }
        self.continuity.record(false);
        Err(last_error.unwrap_or_else(|| {
            CoordinationError::NoEligibleAgent("no ACTIVE agent available to serve the request".to_string())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_core::application::StandardAgentLifecycleService;
    use synapse_core::domain::agent::{Activation, CapabilityProfile, NeuralConfig, SpawnConfig};
    use synapse_core::domain::config::{GovernorConfig, LifecycleConfig, MeshConfig};
    use synapse_core::domain::repository::PersistenceStore;
    use synapse_core::domain::swarm::Topology;
    use synapse_core::infrastructure::{ActivationComputeEngine, InMemoryPersistenceStore, ManualClock};

    struct Fixture {
        clock: Arc<ManualClock>,
        lifecycle: Arc<StandardAgentLifecycleService>,
        mesh: Arc<MeshTopologyManager>,
        detector: FailureDetector,
        controller: Arc<RecoveryController>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryPersistenceStore::new());
        let bus = EventBus::new(512);
        let governor = Arc::new(PerformanceGovernor::new(
            GovernorConfig::default(),
            store.clone(),
            bus.clone(),
            dyn_clock.clone(),
        ));
        let persistence = Arc::new(PersistenceService::new(store, governor.clone(), bus.clone(), dyn_clock.clone()));
        let lifecycle = Arc::new(StandardAgentLifecycleService::new(
            persistence.clone(),
            governor.clone(),
            Arc::new(ActivationComputeEngine::new()),
            bus.clone(),
            dyn_clock.clone(),
            LifecycleConfig::default(),
        ));
        let mesh = Arc::new(MeshTopologyManager::new(
            lifecycle.clone(),
            persistence.clone(),
            governor.clone(),
            bus.clone(),
            dyn_clock.clone(),
            MeshConfig::default(),
        ));
        let detector = FailureDetector::new(
            lifecycle.clone(),
            bus.clone(),
            dyn_clock.clone(),
            FailureDetectorConfig::default(),
        );
        let controller = Arc::new(RecoveryController::new(
            lifecycle.clone(),
            persistence,
            mesh.clone(),
            governor,
            bus,
            dyn_clock,
            Duration::from_secs(5),
        ));
        Fixture {
            clock,
            lifecycle,
            mesh,
            detector,
            controller,
        }
    }

    async fn spawn(f: &Fixture) -> AgentId {
        let config = SpawnConfig::new(
            CapabilityProfile::new("worker", ["x"]),
            NeuralConfig::v1(vec![2, 2], Activation::Relu, 0.1),
        );
        f.lifecycle.spawn(config, None).await.unwrap().id
    }

    #[tokio::test]
    async fn test_scan_fails_silent_agents_only() {
        let f = fixture();
        let quiet = spawn(&f).await;
        let chatty = spawn(&f).await;

        f.clock.advance(FailureDetectorConfig::default().heartbeat_timeout + Duration::from_secs(1));
        f.lifecycle.heartbeat(&chatty).await.unwrap();

        let failed = f.detector.scan().await;
        assert_eq!(failed, vec![quiet.clone()]);
        assert_eq!(f.lifecycle.get(&quiet).await.unwrap().state, AgentState::Failed);
        assert_eq!(f.lifecycle.get(&chatty).await.unwrap().state, AgentState::Active);
    }

    #[tokio::test]
    async fn test_recover_replaces_member_and_is_idempotent() {
        let f = fixture();
        let a = spawn(&f).await;
        let b = spawn(&f).await;
        let session = f
            .mesh
            .establish_mesh(vec![a.clone(), b.clone()], Topology::Mesh)
            .await
            .unwrap();
        let before = f.lifecycle.get(&b).await.unwrap();
        f.lifecycle.transition(&b, AgentState::Failed).await.unwrap();

        let outcome = f.controller.recover(&b, None).await.unwrap();
        assert_eq!(outcome.replacement_agent_id, AgentId::recovery_of(&b));

        let replacement = f.lifecycle.get(&outcome.replacement_agent_id).await.unwrap();
        assert_eq!(replacement.state, AgentState::Active);
        assert_eq!(replacement.learned_state, before.learned_state);
        assert_eq!(f.lifecycle.get(&b).await.unwrap().state, AgentState::Terminated);
        assert!(f.mesh.session(session.swarm_id).await.unwrap().contains(&replacement.id));

        let again = f.controller.recover(&b, None).await.unwrap();
        assert_eq!(again.replacement_agent_id, replacement.id);
    }

    #[tokio::test]
    async fn test_recover_rejects_healthy_agent() {
        let f = fixture();
        let a = spawn(&f).await;
        assert!(matches!(
            f.controller.recover(&a, None).await,
            Err(CoordinationError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_request_prefers_least_loaded() {
        let f = fixture();
        let a = spawn(&f).await;
        let b = spawn(&f).await;
        f.lifecycle.infer(&a, &[1.0, 1.0]).await.unwrap();

        let window = f.controller.continuity().open_window();
        f.controller.serve_request(&[1.0, 1.0]).await.unwrap();
        assert_eq!(f.lifecycle.get(&b).await.unwrap().total_inferences, 1);
        assert_eq!(f.controller.continuity().uptime_since(window), 1.0);
    }

    #[tokio::test]
    async fn test_serve_request_without_agents_counts_as_downtime() {
        let f = fixture();
        let window = f.controller.continuity().open_window();
        assert!(f.controller.serve_request(&[1.0]).await.is_err());
        assert_eq!(f.controller.continuity().uptime_since(window), 0.0);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_cancel() {
        let f = fixture();
        let token = CancellationToken::new();
        let handle = Arc::new(f.detector).spawn_monitor(None, token.clone());
        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_uptime_without_requests() {
        let tracker = ServiceContinuityTracker::default();
        assert_eq!(tracker.lifetime_uptime(), 1.0);
        tracker.record(true);
        tracker.record(false);
        assert_eq!(tracker.lifetime_uptime(), 0.5);
    }
}
