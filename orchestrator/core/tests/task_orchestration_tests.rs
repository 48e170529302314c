// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Orchestration tests over a recording executor.
//!
//! The executor snapshots the status of every dependency at the moment a task
//! starts, which lets the tests assert the topological guarantee directly
//! instead of inferring it from completion order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use synapse_core::application::{
    AgentLifecycleService, CancelOutcome, PerformanceGovernor, PersistenceService, StandardAgentLifecycleService,
    TaskExecutor, TaskOrchestrator,
};
use synapse_core::domain::agent::{Activation, Agent, AgentId, CapabilityProfile, NeuralConfig, SpawnConfig};
use synapse_core::domain::clock::Clock;
use synapse_core::domain::config::{GovernorConfig, LifecycleConfig, OrchestratorConfig};
use synapse_core::domain::error::CoordinationError;
use synapse_core::domain::knowledge::KnowledgeShareEvent;
use synapse_core::domain::metrics::PerformanceMetric;
use synapse_core::domain::repository::{PersistenceStore, RepositoryError};
use synapse_core::domain::snapshot::{SessionId, SessionSnapshot, SnapshotSummary};
use synapse_core::domain::task::{OrchestrationStrategy, Task, TaskId, TaskStatus, DEPENDENCY_FAILED};
use synapse_core::infrastructure::{ActivationComputeEngine, EventBus, InMemoryPersistenceStore, SystemClock};

/// Task id plus the dependency statuses observed when it started.
type Started = (TaskId, Vec<Option<TaskStatus>>);

struct RecordingExecutor {
    orchestrator: Mutex<Option<std::sync::Weak<TaskOrchestrator>>>,
    started: Mutex<Vec<Started>>,
    failing: Vec<TaskId>,
}

impl RecordingExecutor {
    fn new(failing: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            orchestrator: Mutex::new(None),
            started: Mutex::new(Vec::new()),
            failing: failing.iter().map(|id| TaskId::from(*id)).collect(),
        })
    }

    fn order(&self) -> Vec<TaskId> {
        self.started.lock().iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn execute(&self, task: &Task, _agent_id: &AgentId) -> Result<Vec<f32>, CoordinationError> {
        let orchestrator = self.orchestrator.lock().as_ref().and_then(|weak| weak.upgrade());
        let statuses = task
            .dependencies
            .iter()
            .map(|dep| orchestrator.as_ref().and_then(|o| o.task(dep)).map(|t| t.status))
            .collect();
        self.started.lock().push((task.id.clone(), statuses));
        tokio::time::sleep(Duration::from_millis(2)).await;

        if self.failing.contains(&task.id) {
            return Err(CoordinationError::Internal(format!("{} exploded", task.id)));
        }
        Ok(vec![1.0])
    }
}

/// Blocks until released, so a test can act while the task is RUNNING.
struct GatedExecutor {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl TaskExecutor for GatedExecutor {
    async fn execute(&self, _task: &Task, _agent_id: &AgentId) -> Result<Vec<f32>, CoordinationError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(vec![0.5])
    }
}

/// Tracks how many executions overlap.
#[derive(Default)]
struct InFlightExecutor {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for InFlightExecutor {
    async fn execute(&self, _task: &Task, _agent_id: &AgentId) -> Result<Vec<f32>, CoordinationError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![1.0])
    }
}

/// Rejects writes of one task id and every task delete.
struct TaskWriteFailures {
    inner: InMemoryPersistenceStore,
    rejected: TaskId,
}

#[async_trait]
impl PersistenceStore for TaskWriteFailures {
    async fn save_agent(&self, agent: &Agent) -> Result<(), RepositoryError> {
        self.inner.save_agent(agent).await
    }
    async fn load_agent(&self, id: &AgentId) -> Result<Option<Agent>, RepositoryError> {
        self.inner.load_agent(id).await
    }
    async fn list_agents(&self) -> Result<Vec<Agent>, RepositoryError> {
        self.inner.list_agents().await
    }
    async fn delete_agent(&self, id: &AgentId) -> Result<(), RepositoryError> {
        self.inner.delete_agent(id).await
    }
    async fn save_task(&self, task: &Task) -> Result<(), RepositoryError> {
        if task.id == self.rejected {
            return Err(RepositoryError::Database("write rejected".to_string()));
        }
        self.inner.save_task(task).await
    }
    async fn load_task(&self, id: &TaskId) -> Result<Option<Task>, RepositoryError> {
        self.inner.load_task(id).await
    }
    async fn list_tasks(&self) -> Result<Vec<Task>, RepositoryError> {
        self.inner.list_tasks().await
    }
    async fn delete_task(&self, _id: &TaskId) -> Result<(), RepositoryError> {
        Err(RepositoryError::Database("delete rejected".to_string()))
    }
    async fn append_knowledge_event(&self, event: &KnowledgeShareEvent) -> Result<(), RepositoryError> {
        self.inner.append_knowledge_event(event).await
    }
    async fn list_knowledge_events(&self) -> Result<Vec<KnowledgeShareEvent>, RepositoryError> {
        self.inner.list_knowledge_events().await
    }
    async fn append_metric(&self, metric: &PerformanceMetric) -> Result<(), RepositoryError> {
        self.inner.append_metric(metric).await
    }
    async fn list_metrics(&self) -> Result<Vec<PerformanceMetric>, RepositoryError> {
        self.inner.list_metrics().await
    }
    async fn stage_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), RepositoryError> {
        self.inner.stage_snapshot(snapshot).await
    }
    async fn commit_snapshot(&self, session_id: SessionId) -> Result<(), RepositoryError> {
        self.inner.commit_snapshot(session_id).await
    }
    async fn discard_staged_snapshot(&self, session_id: SessionId) -> Result<(), RepositoryError> {
        self.inner.discard_staged_snapshot(session_id).await
    }
    async fn load_snapshot(&self, session_id: SessionId) -> Result<Option<SessionSnapshot>, RepositoryError> {
        self.inner.load_snapshot(session_id).await
    }
    async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>, RepositoryError> {
        self.inner.list_snapshots().await
    }
}

struct Harness {
    lifecycle: Arc<StandardAgentLifecycleService>,
    persistence: Arc<PersistenceService>,
    governor: Arc<PerformanceGovernor>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl Harness {
    fn new() -> Self {
        Self::over(Arc::new(InMemoryPersistenceStore::new()))
    }

    fn over(store: Arc<dyn PersistenceStore>) -> Self {
        let bus = EventBus::new(512);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let governor = Arc::new(PerformanceGovernor::new(
            GovernorConfig::default(),
            store.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let persistence = Arc::new(PersistenceService::new(store, governor.clone(), bus.clone(), clock.clone()));
        let lifecycle = Arc::new(StandardAgentLifecycleService::new(
            persistence.clone(),
            governor.clone(),
            Arc::new(ActivationComputeEngine::new()),
            bus.clone(),
            clock.clone(),
            LifecycleConfig::default(),
        ));
        Self {
            lifecycle,
            persistence,
            governor,
            bus,
            clock,
        }
    }

    fn orchestrator(&self, executor: Arc<dyn TaskExecutor>) -> Arc<TaskOrchestrator> {
        self.orchestrator_with_limit(executor, 4)
    }

    fn orchestrator_with_limit(&self, executor: Arc<dyn TaskExecutor>, concurrency_limit: usize) -> Arc<TaskOrchestrator> {
        Arc::new(
            TaskOrchestrator::new(
                self.lifecycle.clone(),
                self.persistence.clone(),
                self.governor.clone(),
                self.bus.clone(),
                self.clock.clone(),
                OrchestratorConfig {
                    strategy: OrchestrationStrategy::Parallel,
                    concurrency_limit,
                },
            )
            .with_executor(executor),
        )
    }

    async fn spawn(&self, tag: &str) -> AgentId {
        let config = SpawnConfig::new(
            CapabilityProfile::new("worker", [tag]),
            NeuralConfig::v1(vec![2, 1], Activation::Linear, 0.1),
        );
        self.lifecycle.spawn(config, None).await.unwrap().id
    }
}

fn recording(harness: &Harness, failing: &[&str]) -> (Arc<RecordingExecutor>, Arc<TaskOrchestrator>) {
    let executor = RecordingExecutor::new(failing);
    let orchestrator = harness.orchestrator(executor.clone());
    *executor.orchestrator.lock() = Some(Arc::downgrade(&orchestrator));
    (executor, orchestrator)
}

/// ```text
///   a ──► c ──► e
///   b ──► d ──┘
///   b ──► c
/// ```
fn diamond() -> Vec<Task> {
    vec![
        Task::new("e", "merge").depends_on("c").depends_on("d"),
        Task::new("c", "step").depends_on("a").depends_on("b").with_priority(5),
        Task::new("d", "step").depends_on("b"),
        Task::new("a", "root"),
        Task::new("b", "root").with_priority(10),
    ]
}

#[tokio::test]
async fn test_no_task_starts_before_its_dependencies_complete() {
    for strategy in [OrchestrationStrategy::Sequential, OrchestrationStrategy::Parallel] {
        let harness = Harness::new();
        harness.spawn("x").await;
        harness.spawn("x").await;
        let (executor, orchestrator) = recording(&harness, &[]);

        orchestrator.submit_batch(diamond()).await.unwrap();
        let report = orchestrator.orchestrate(strategy).await.unwrap();

        assert_eq!(report.completed.len(), 5, "{:?}", strategy);
        assert!(report.failed.is_empty());
        for (task_id, statuses) in executor.started.lock().iter() {
            assert!(
                statuses.iter().all(|s| *s == Some(TaskStatus::Completed)),
                "{} started with dependencies {:?} under {:?}",
                task_id,
                statuses,
                strategy
            );
        }
        assert_eq!(executor.order().last(), Some(&TaskId::from("e")));
    }
}

#[tokio::test]
async fn test_sequential_respects_priority_among_ready_tasks() {
    let harness = Harness::new();
    harness.spawn("x").await;
    let (executor, orchestrator) = recording(&harness, &[]);

    orchestrator.submit_batch(diamond()).await.unwrap();
    orchestrator
        .orchestrate(OrchestrationStrategy::Sequential)
        .await
        .unwrap();

    // b outranks a; once b completes, d was submitted before a.
    let expected: Vec<TaskId> = ["b", "d", "a", "c", "e"].into_iter().map(TaskId::from).collect();
    assert_eq!(executor.order(), expected);
}

#[tokio::test]
async fn test_failure_cascades_to_dependents_only() {
    let harness = Harness::new();
    harness.spawn("x").await;
    let (_, orchestrator) = recording(&harness, &["a"]);

    orchestrator.submit_batch(diamond()).await.unwrap();
    let report = orchestrator
        .orchestrate(OrchestrationStrategy::Parallel)
        .await
        .unwrap();

    let c = orchestrator.task(&TaskId::from("c")).unwrap();
    let e = orchestrator.task(&TaskId::from("e")).unwrap();
    assert_eq!(c.status, TaskStatus::Failed);
    assert_eq!(c.failure_reason.as_deref(), Some(DEPENDENCY_FAILED));
    assert_eq!(e.status, TaskStatus::Failed);
    assert_eq!(
        orchestrator.task(&TaskId::from("d")).unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(report.failed.len(), 3);
}

#[tokio::test]
async fn test_cycle_is_rejected_and_nothing_is_added() {
    let harness = Harness::new();
    let (_, orchestrator) = recording(&harness, &[]);

    let err = orchestrator
        .submit_batch(vec![
            Task::new("a", "step").depends_on("b"),
            Task::new("b", "step").depends_on("a"),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::CyclicDependency { .. }));
    assert!(orchestrator.tasks().is_empty());
    assert!(harness.persistence.list_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_tasks_without_capable_agents_stay_ready() {
    let harness = Harness::new();
    harness.spawn("nlp").await;
    let (_, orchestrator) = recording(&harness, &[]);

    orchestrator
        .submit_batch(vec![
            Task::new("see", "classify").requires_tag("vision"),
            Task::new("read", "classify").requires_tag("nlp"),
        ])
        .await
        .unwrap();
    let report = orchestrator
        .orchestrate(OrchestrationStrategy::Parallel)
        .await
        .unwrap();

    assert_eq!(report.completed, vec![TaskId::from("read")]);
    assert_eq!(report.blocked, vec![TaskId::from("see")]);
    assert_eq!(
        orchestrator.task(&TaskId::from("see")).unwrap().status,
        TaskStatus::Ready
    );
}

#[tokio::test]
async fn test_cancel_while_running_discards_result() {
    let harness = Harness::new();
    harness.spawn("x").await;
    let executor = Arc::new(GatedExecutor {
        started: Notify::new(),
        release: Notify::new(),
    });
    let orchestrator = harness.orchestrator(executor.clone());
    orchestrator
        .submit_batch(vec![Task::new("slow", "step"), Task::new("after", "step").depends_on("slow")])
        .await
        .unwrap();

    let run = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.orchestrate(OrchestrationStrategy::Sequential).await })
    };
    executor.started.notified().await;

    let outcome = orchestrator.cancel(&TaskId::from("slow")).await.unwrap();
    assert_eq!(outcome, CancelOutcome::ResultDiscarded);
    executor.release.notify_one();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.discarded, 1);
    let slow = orchestrator.task(&TaskId::from("slow")).unwrap();
    assert_eq!(slow.status, TaskStatus::Failed);
    assert!(slow.output.is_none());
    assert_eq!(
        orchestrator.task(&TaskId::from("after")).unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn test_cancel_pending_task_removes_it() {
    let harness = Harness::new();
    let (_, orchestrator) = recording(&harness, &[]);
    orchestrator
        .submit(Task::new("later", "step").depends_on("never"))
        .await
        .unwrap();

    let outcome = orchestrator.cancel(&TaskId::from("later")).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Removed);
    assert!(orchestrator.task(&TaskId::from("later")).is_none());
    assert!(harness
        .persistence
        .load_task(&TaskId::from("later"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_parallel_spreads_load_across_agents() {
    let harness = Harness::new();
    let first = harness.spawn("x").await;
    let second = harness.spawn("x").await;
    let (_, orchestrator) = recording(&harness, &[]);

    orchestrator
        .submit_batch((0..4).map(|i| Task::new(format!("t{}", i), "step")).collect())
        .await
        .unwrap();
    orchestrator
        .orchestrate(OrchestrationStrategy::Parallel)
        .await
        .unwrap();

    let mut per_agent: HashMap<AgentId, usize> = HashMap::new();
    for task in orchestrator.tasks() {
        *per_agent.entry(task.assigned_agent_id.unwrap()).or_default() += 1;
    }
    assert_eq!(per_agent.get(&first), Some(&2));
    assert_eq!(per_agent.get(&second), Some(&2));
    assert_eq!(harness.lifecycle.list().await.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_dispatch_honours_concurrency_limit() {
    let harness = Harness::new();
    for _ in 0..3 {
        harness.spawn("x").await;
    }
    let executor = Arc::new(InFlightExecutor::default());
    let orchestrator = harness.orchestrator_with_limit(executor.clone(), 2);

    orchestrator
        .submit_batch((0..9).map(|i| Task::new(format!("t{}", i), "step")).collect())
        .await
        .unwrap();
    let report = orchestrator
        .orchestrate(OrchestrationStrategy::Parallel)
        .await
        .unwrap();

    assert_eq!(report.completed.len(), 9);
    let peak = executor.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "{} tasks ran at once", peak);
    assert!(peak >= 1);
}

#[tokio::test]
async fn test_failed_batch_write_rolls_back_even_when_cleanup_fails() {
    let harness = Harness::over(Arc::new(TaskWriteFailures {
        inner: InMemoryPersistenceStore::new(),
        rejected: TaskId::from("second"),
    }));
    let (_, orchestrator) = recording(&harness, &[]);

    let err = orchestrator
        .submit_batch(vec![Task::new("first", "step"), Task::new("second", "step")])
        .await
        .unwrap_err();
    // The write error is reported, not the failed cleanup.
    assert!(matches!(err, CoordinationError::Persistence(ref msg) if msg.contains("write rejected")));
    assert!(orchestrator.tasks().is_empty());
    assert!(orchestrator.task(&TaskId::from("first")).is_none());
}
