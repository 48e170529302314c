// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integrity tests for the filesystem storage engine.
//!
//! Records written through the lifecycle manager must come back byte-identical
//! after the store is reopened, and any single flipped bit in a stored file must
//! surface as `DataIntegrity` rather than as a silently different agent.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;

use synapse_core::application::{AgentLifecycleService, PerformanceGovernor, PersistenceService, StandardAgentLifecycleService};
use synapse_core::domain::agent::{Activation, Agent, AgentId, CapabilityProfile, NeuralConfig, SpawnConfig};
use synapse_core::domain::clock::Clock;
use synapse_core::domain::config::{GovernorConfig, LifecycleConfig};
use synapse_core::domain::error::CoordinationError;
use synapse_core::domain::events::PersistenceEvent;
use synapse_core::domain::repository::PersistenceStore;
use synapse_core::domain::swarm::SwarmId;
use synapse_core::infrastructure::{
    ActivationComputeEngine, DomainEvent, EventBus, FileSystemPersistenceStore, SystemClock,
};

struct Stack {
    store: Arc<FileSystemPersistenceStore>,
    persistence: Arc<PersistenceService>,
    lifecycle: StandardAgentLifecycleService,
    bus: EventBus,
}

async fn open(dir: &TempDir) -> Stack {
    let store = Arc::new(FileSystemPersistenceStore::open(dir.path()).await.unwrap());
    let dyn_store: Arc<dyn PersistenceStore> = store.clone();
    let bus = EventBus::new(256);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let governor = Arc::new(PerformanceGovernor::new(
        GovernorConfig::default(),
        dyn_store.clone(),
        bus.clone(),
        clock.clone(),
    ));
    let persistence = Arc::new(PersistenceService::new(dyn_store, governor.clone(), bus.clone(), clock.clone()));
    let lifecycle = StandardAgentLifecycleService::new(
        persistence.clone(),
        governor,
        Arc::new(ActivationComputeEngine::new()),
        bus.clone(),
        clock,
        LifecycleConfig::default(),
    );
    Stack {
        store,
        persistence,
        lifecycle,
        bus,
    }
}

fn worker() -> SpawnConfig {
    SpawnConfig::new(
        CapabilityProfile::new("worker", ["nlp"]),
        NeuralConfig::v1(vec![4, 3, 2], Activation::Tanh, 0.05),
    )
}

#[tokio::test]
async fn test_agent_round_trip_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let spawned: Agent = {
        let stack = open(&dir).await;
        stack.lifecycle.spawn(worker(), None).await.unwrap()
    };

    let reopened = open(&dir).await;
    let loaded = reopened
        .persistence
        .load_agent(&spawned.id)
        .await
        .unwrap()
        .expect("agent record should survive reopen");

    assert_eq!(loaded.learned_state.weights, spawned.learned_state.weights);
    assert_eq!(loaded.learned_state.biases, spawned.learned_state.biases);
    assert_eq!(loaded.learned_state.checksum, spawned.learned_state.checksum);
    assert!(loaded.learned_state.verify().is_ok());
    assert_eq!(loaded.neural_config, spawned.neural_config);
}

#[tokio::test]
async fn test_corrupted_agent_is_reported_on_the_bus() {
    let dir = TempDir::new().unwrap();
    let stack = open(&dir).await;
    let agent = stack.lifecycle.spawn(worker(), None).await.unwrap();

    let path = stack.store.agent_path(&agent.id);
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 2;
    bytes[last] ^= 0x04;
    std::fs::write(&path, bytes).unwrap();

    let mut events = stack.bus.subscribe();
    let err = stack.persistence.load_agent(&agent.id).await.unwrap_err();
    assert!(matches!(err, CoordinationError::DataIntegrity { .. }));

    let violations = events
        .drain()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                DomainEvent::Persistence(PersistenceEvent::IntegrityViolation { .. })
            )
        })
        .count();
    assert_eq!(violations, 1);
}

#[tokio::test]
async fn test_restore_rewrites_corrupt_live_record_from_snapshot() {
    let dir = TempDir::new().unwrap();
    let stack = open(&dir).await;
    let mut members = BTreeSet::new();
    for _ in 0..3 {
        members.insert(stack.lifecycle.spawn(worker(), None).await.unwrap().id);
    }
    let snapshot = stack
        .persistence
        .save_session_snapshot(SwarmId::new(), &members)
        .await
        .unwrap();

    let damaged: AgentId = members.iter().nth(1).cloned().unwrap();
    let path = stack.store.agent_path(&damaged);
    let mut bytes = std::fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    std::fs::write(&path, bytes).unwrap();

    let restored = stack
        .persistence
        .prepare_restore(snapshot.session_id, 0.9)
        .await
        .unwrap();
    let report = &restored.report;
    assert_eq!(report.agents_restored, 3);
    assert_eq!(report.repaired_agents, vec![damaged.clone()]);
    assert!(report.missing_agents.is_empty());
    assert!(report.unwritten_records.is_empty());
    assert_eq!(report.continuity_score, 1.0);
    assert!(!report.degraded);

    let healed = stack.persistence.load_agent(&damaged).await.unwrap().unwrap();
    assert!(healed.learned_state.verify().is_ok());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_any_single_bit_flip_is_detected(offset in any::<prop::sample::Index>(), bit in 0u8..8) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let dir = TempDir::new().unwrap();
            let stack = open(&dir).await;
            let agent = stack.lifecycle.spawn(worker(), None).await.unwrap();

            let path = stack.store.agent_path(&agent.id);
            let mut bytes = std::fs::read(&path).unwrap();
            let at = offset.index(bytes.len());
            bytes[at] ^= 1 << bit;
            std::fs::write(&path, bytes).unwrap();

            let result = stack.persistence.load_agent(&agent.id).await;
            prop_assert!(
                matches!(result, Err(CoordinationError::DataIntegrity { .. })),
                "flip at byte {} bit {} was not detected: {:?}",
                at,
                bit,
                result.map(|a| a.map(|a| a.id))
            );
            Ok(())
        })?;
    }
}
