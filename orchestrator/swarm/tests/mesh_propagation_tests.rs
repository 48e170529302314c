// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Knowledge propagation across a mesh with unreachable and slow targets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use synapse_core::application::AgentLifecycleService;
use synapse_core::domain::agent::{Activation, Agent, AgentId, CapabilityProfile, NeuralConfig, SpawnConfig};
use synapse_core::domain::config::{CoordinatorConfigManifest, MeshConfig};
use synapse_core::domain::error::CoordinationError;
use synapse_core::domain::events::MeshEvent;
use synapse_core::domain::knowledge::{KnowledgePayload, KnowledgeType};
use synapse_core::domain::swarm::Topology;
use synapse_core::infrastructure::{
    ActivationComputeEngine, DomainEvent, EventBus, InMemoryPersistenceStore, SystemClock,
};
use synapse_swarm::application::{KnowledgeTransport, LifecycleTransport, MeshTopologyManager};
use synapse_swarm::SwarmCoordinator;

fn coordinator() -> SwarmCoordinator {
    SwarmCoordinator::new(
        CoordinatorConfigManifest::default(),
        Arc::new(InMemoryPersistenceStore::new()),
        Arc::new(ActivationComputeEngine::new()),
        Arc::new(SystemClock),
    )
}

fn worker(tags: &[&str]) -> SpawnConfig {
    SpawnConfig::new(
        CapabilityProfile::new("worker", tags.iter().copied()),
        NeuralConfig::v1(vec![3, 3], Activation::Tanh, 0.1),
    )
}

async fn spawn_many(coordinator: &SwarmCoordinator, n: usize) -> Vec<AgentId> {
    let mut ids = Vec::with_capacity(n);
    for _ in 0..n {
        ids.push(coordinator.spawn(worker(&["nlp"]), None).await.unwrap().id);
    }
    ids
}

/// Delays delivery to one target, delegating everything to the lifecycle.
struct SlowTransport {
    inner: LifecycleTransport,
    slow: AgentId,
    delay: Duration,
}

#[async_trait]
impl KnowledgeTransport for SlowTransport {
    async fn deliver(&self, target: &AgentId, payload: &KnowledgePayload) -> Result<Agent, CoordinationError> {
        if target == &self.slow {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.deliver(target, payload).await
    }
}

fn manager_with(
    coordinator: &SwarmCoordinator,
    config: MeshConfig,
    slow: AgentId,
    delay: Duration,
) -> Arc<MeshTopologyManager> {
    let lifecycle: Arc<dyn AgentLifecycleService> = coordinator.lifecycle().clone();
    let transport = SlowTransport {
        inner: LifecycleTransport::new(lifecycle.clone()),
        slow,
        delay,
    };
    Arc::new(
        MeshTopologyManager::new(
            lifecycle,
            coordinator.persistence().clone(),
            coordinator.governor().clone(),
            EventBus::new(64),
            Arc::new(SystemClock),
            config,
        )
        .with_transport(Arc::new(transport)),
    )
}

#[tokio::test]
async fn test_partial_propagation_records_every_target() {
    let coordinator = coordinator();
    let ids = spawn_many(&coordinator, 4).await;
    let (source, targets) = (ids[0].clone(), ids[1..].to_vec());
    coordinator
        .establish_mesh(ids.clone(), Topology::Mesh)
        .await
        .unwrap();

    // Unreachable: no longer registered with the lifecycle manager.
    coordinator.terminate(&targets[2]).await.unwrap();

    let mut events = coordinator.subscribe();
    let report = coordinator
        .propagate_knowledge(&source, KnowledgePayload::weights(1.0), targets.clone(), None)
        .await
        .unwrap();

    assert_eq!(report.successes, 2);
    assert_eq!(report.failures, 1);
    assert_eq!(report.events.len(), 3);
    let failed: Vec<&AgentId> = report
        .events
        .iter()
        .filter(|e| !e.success)
        .map(|e| &e.target_agent_id)
        .collect();
    assert_eq!(failed, vec![&targets[2]]);
    assert!(report.events.iter().all(|e| e.knowledge_type == KnowledgeType::Weights));
    assert!(report
        .events
        .iter()
        .filter(|e| !e.success)
        .all(|e| e.failure_reason.is_some()));

    let stored = coordinator.persistence().list_knowledge_events().await.unwrap();
    assert_eq!(stored.len(), 3);

    // Two targets converged fully, one not at all.
    assert!((report.convergence_score - 2.0 / 3.0).abs() < 1e-3);
    assert!(!report.degraded);

    let shared = events
        .drain()
        .into_iter()
        .filter(|event| matches!(event, DomainEvent::Mesh(MeshEvent::KnowledgeShared { .. })))
        .count();
    assert_eq!(shared, 3);
}

#[tokio::test]
async fn test_low_convergence_is_flagged_degraded() {
    let coordinator = coordinator();
    let ids = spawn_many(&coordinator, 3).await;
    for target in &ids[1..] {
        coordinator.terminate(target).await.unwrap();
    }

    let report = coordinator
        .propagate_knowledge(&ids[0], KnowledgePayload::weights(0.5), ids[1..].to_vec(), None)
        .await
        .unwrap();
    assert_eq!(report.successes, 0);
    assert_eq!(report.convergence_score, 0.0);
    assert!(report.degraded);
}

#[tokio::test]
async fn test_slow_target_times_out_without_blocking_others() {
    let coordinator = coordinator();
    let ids = spawn_many(&coordinator, 3).await;
    let config = MeshConfig {
        propagation_timeout: Duration::from_millis(50),
        ..MeshConfig::default()
    };
    let manager = manager_with(&coordinator, config, ids[2].clone(), Duration::from_millis(500));

    let report = manager
        .propagate_knowledge(&ids[0], KnowledgePayload::weights(1.0), ids[1..].to_vec(), None)
        .await
        .unwrap();
    assert_eq!(report.successes, 1);
    assert_eq!(report.failures, 1);
    let slow = report
        .events
        .iter()
        .find(|e| e.target_agent_id == ids[2])
        .unwrap();
    assert!(!slow.success);
}

#[tokio::test]
async fn test_deadline_expiry_finishes_in_background() {
    let coordinator = coordinator();
    let ids = spawn_many(&coordinator, 3).await;
    let manager = manager_with(&coordinator, MeshConfig::default(), ids[2].clone(), Duration::from_millis(150));

    let err = manager
        .propagate_knowledge(
            &ids[0],
            KnowledgePayload::weights(1.0),
            ids[1..].to_vec(),
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let stored = coordinator.persistence().list_knowledge_events().await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|e| e.success));
}

#[tokio::test]
async fn test_self_propagation_is_rejected() {
    let coordinator = coordinator();
    let ids = spawn_many(&coordinator, 2).await;
    let err = coordinator
        .propagate_knowledge(&ids[0], KnowledgePayload::weights(1.0), vec![ids[0].clone()], None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::Validation(_)));
    assert!(coordinator
        .persistence()
        .list_knowledge_events()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_teardown_then_resync_from_store() {
    let coordinator = coordinator();
    let ids = spawn_many(&coordinator, 2).await;
    let session = coordinator
        .establish_mesh(ids.clone(), Topology::Star)
        .await
        .unwrap();
    assert_eq!(session.connections.len(), 1);

    let torn = coordinator.teardown(session.swarm_id).await.unwrap();
    assert_eq!(torn.swarm_id, session.swarm_id);
    assert!(coordinator.mesh().session(session.swarm_id).await.is_none());

    let report = coordinator.synchronize_state(&ids).await.unwrap();
    assert_eq!(report.agents.len(), 2);
    assert!(report.missing.is_empty());
}
