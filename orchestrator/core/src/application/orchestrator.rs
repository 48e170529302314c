// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Task Orchestrator
//!
//! Holds the task dependency graph and drives it to quiescence.
//!
//! - Submission is atomic per batch and rejects cycles over the union of the
//!   existing graph and the batch. Dependencies on unknown tasks are allowed
//!   and keep the dependent PENDING.
//! - A task is READY only once every dependency is COMPLETED. A FAILED
//!   dependency fails its dependents with [`DEPENDENCY_FAILED`].
//! - Ready tasks run highest priority first, then in submission order.
//!   `Sequential` runs one at a time; `Parallel` dispatches the whole ready
//!   set bounded by the concurrency limit.
//! - Cancelling a RUNNING task does not interrupt it; its result is dropped
//!   when it finishes.
//!
//! The graph lock is never held across an await. Status changes are applied
//! under the lock and persisted afterwards.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::agent::AgentLifecycleService;
use crate::application::governor::PerformanceGovernor;
use crate::application::persistence::PersistenceService;
use crate::domain::agent::AgentId;
use crate::domain::clock::Clock;
use crate::domain::config::OrchestratorConfig;
use crate::domain::error::CoordinationError;
use crate::domain::events::TaskEvent;
use crate::domain::metrics::OperationCategory;
use crate::domain::task::{
    OrchestrationStrategy, Task, TaskGraphValidator, TaskId, TaskStatus, DEPENDENCY_FAILED,
};
use crate::infrastructure::event_bus::EventBus;

const CANCELLED: &str = "cancelled while running";

/// Runs one assigned task.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, agent_id: &AgentId) -> Result<Vec<f32>, CoordinationError>;
}

/// Default executor: feeds the task input through the assigned agent.
pub struct InferenceExecutor {
    lifecycle: Arc<dyn AgentLifecycleService>,
}

impl InferenceExecutor {
    pub fn new(lifecycle: Arc<dyn AgentLifecycleService>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl TaskExecutor for InferenceExecutor {
    async fn execute(&self, task: &Task, agent_id: &AgentId) -> Result<Vec<f32>, CoordinationError> {
        self.lifecycle.infer(agent_id, &task.input).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task had not started and was removed from the graph.
    Removed,
    /// The task is running; its result will be discarded.
    ResultDiscarded,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrchestrationReport {
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    /// Tasks left PENDING or READY when the graph went quiet.
    pub blocked: Vec<TaskId>,
    /// Running tasks whose results were dropped because they were cancelled.
    pub discarded: usize,
    pub rounds: usize,
}

#[derive(Default)]
struct TaskGraph {
    tasks: BTreeMap<TaskId, Task>,
    next_sequence: u64,
}

impl TaskGraph {
    fn running_per_agent(&self) -> HashMap<AgentId, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            if task.status == TaskStatus::Running {
                if let Some(agent_id) = &task.assigned_agent_id {
                    *counts.entry(agent_id.clone()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    fn ready_in_dispatch_order(&self) -> Vec<Task> {
        let mut ready: Vec<Task> = self
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Ready)
            .cloned()
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));
        ready
    }
}

pub struct TaskOrchestrator {
    graph: Mutex<TaskGraph>,
    run_lock: tokio::sync::Mutex<()>,
    lifecycle: Arc<dyn AgentLifecycleService>,
    executor: Arc<dyn TaskExecutor>,
    persistence: Arc<PersistenceService>,
    governor: Arc<PerformanceGovernor>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl TaskOrchestrator {
    pub fn new(
        lifecycle: Arc<dyn AgentLifecycleService>,
        persistence: Arc<PersistenceService>,
        governor: Arc<PerformanceGovernor>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        let executor = Arc::new(InferenceExecutor::new(lifecycle.clone()));
        Self {
            graph: Mutex::new(TaskGraph::default()),
            run_lock: tokio::sync::Mutex::new(()),
            lifecycle,
            executor,
            persistence,
            governor,
            event_bus,
            clock,
            config,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn default_strategy(&self) -> OrchestrationStrategy {
        self.config.strategy
    }

    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.graph.lock().tasks.get(id).cloned()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.graph.lock().tasks.values().cloned().collect()
    }

    pub async fn submit(&self, task: Task) -> Result<TaskId, CoordinationError> {
        let mut ids = self.submit_batch(vec![task]).await?;
        ids.pop()
            .ok_or_else(|| CoordinationError::Internal("empty submission".to_string()))
    }

    /// Add every task or none of them.
    pub async fn submit_batch(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>, CoordinationError> {
        for task in &tasks {
            task.validate()?;
        }

        let now = self.clock.now();
        let accepted: Vec<Task> = {
            let mut graph = self.graph.lock();

            let mut batch_ids = BTreeSet::new();
            for task in &tasks {
                if graph.tasks.contains_key(&task.id) || !batch_ids.insert(task.id.clone()) {
                    return Err(CoordinationError::Validation(format!(
                        "task {} was already submitted",
                        task.id
                    )));
                }
            }

            let mut edges: HashMap<&TaskId, &BTreeSet<TaskId>> = graph
                .tasks
                .values()
                .map(|task| (&task.id, &task.dependencies))
                .collect();
            for task in &tasks {
                edges.insert(&task.id, &task.dependencies);
            }
            TaskGraphValidator::check_for_cycles(&edges)?;

            let mut accepted = Vec::with_capacity(tasks.len());
            for mut task in tasks {
                task.sequence = graph.next_sequence;
                graph.next_sequence += 1;
                task.status = TaskStatus::Pending;
                task.assigned_agent_id = None;
                task.cancelled = false;
                task.output = None;
                task.failure_reason = None;
                task.submitted_at = now;
                task.updated_at = now;
                graph.tasks.insert(task.id.clone(), task.clone());
                accepted.push(task);
            }
            accepted
        };

        for (index, task) in accepted.iter().enumerate() {
            if let Err(e) = self.persistence.save_task(task).await {
                warn!(task_id = %task.id, error = %e, "Persisting submission failed; rolling back batch");
                {
                    let mut graph = self.graph.lock();
                    for task in &accepted {
                        graph.tasks.remove(&task.id);
                    }
                }
                for written in &accepted[..index] {
                    if let Err(rollback) = self.persistence.delete_task(&written.id).await {
                        warn!(task_id = %written.id, error = %rollback, "Failed to remove rolled-back task record");
                    }
                }
                return Err(e);
            }
        }

        for task in &accepted {
            debug!(task_id = %task.id, dependencies = task.dependencies.len(), "Task submitted");
            self.event_bus.publish_task_event(TaskEvent::TaskSubmitted {
                task_id: task.id.clone(),
                submitted_at: now,
            });
        }
        Ok(accepted.into_iter().map(|task| task.id).collect())
    }

    /// Promote PENDING tasks whose dependencies all completed and fail those
    /// with a failed dependency. Returns the newly ready ids.
    pub async fn resolve(&self) -> Result<Vec<TaskId>, CoordinationError> {
        let (ready, _) = self.resolve_graph().await?;
        Ok(ready)
    }

    /// Newly ready ids in submission order, plus ids failed by cascade.
    async fn resolve_graph(&self) -> Result<(Vec<TaskId>, Vec<TaskId>), CoordinationError> {
        let now = self.clock.now();
        let (ready, failed) = {
            let mut graph = self.graph.lock();
            let mut ready = Vec::new();
            let mut failed = Vec::new();

            loop {
                let mut changed = false;
                let pending: Vec<TaskId> = graph
                    .tasks
                    .values()
                    .filter(|task| task.status == TaskStatus::Pending)
                    .map(|task| task.id.clone())
                    .collect();

                for id in pending {
                    let Some(task) = graph.tasks.get(&id) else { continue };
                    let statuses: Vec<Option<TaskStatus>> = task
                        .dependencies
                        .iter()
                        .map(|dep| graph.tasks.get(dep).map(|t| t.status))
                        .collect();

                    let next = if statuses.contains(&Some(TaskStatus::Failed)) {
                        Some(TaskStatus::Failed)
                    } else if statuses.iter().all(|s| *s == Some(TaskStatus::Completed)) {
                        Some(TaskStatus::Ready)
                    } else {
                        None
                    };

                    if let (Some(status), Some(task)) = (next, graph.tasks.get_mut(&id)) {
                        if status == TaskStatus::Failed {
                            task.fail(DEPENDENCY_FAILED, now);
                            failed.push(task.clone());
                        } else {
                            task.set_status(TaskStatus::Ready, now);
                            ready.push(task.clone());
                        }
                        changed = true;
                    }
                }

                if !changed {
                    break;
                }
            }
            (ready, failed)
        };

        for task in &ready {
            self.persistence.save_task(task).await?;
            self.event_bus.publish_task_event(TaskEvent::TaskReady {
                task_id: task.id.clone(),
                ready_at: now,
            });
        }
        for task in &failed {
            self.persistence.save_task(task).await?;
            self.event_bus.publish_task_event(TaskEvent::TaskFailed {
                task_id: task.id.clone(),
                reason: DEPENDENCY_FAILED.to_string(),
                failed_at: now,
            });
        }

        let mut ready_ids: Vec<(u64, TaskId)> = ready.into_iter().map(|t| (t.sequence, t.id)).collect();
        ready_ids.sort();
        Ok((
            ready_ids.into_iter().map(|(_, id)| id).collect(),
            failed.into_iter().map(|t| t.id).collect(),
        ))
    }

    /// Pick the least-loaded ACTIVE agent whose tags cover the task, mark the
    /// task RUNNING on it and return the agent id.
    pub async fn assign(&self, task_id: &TaskId) -> Result<AgentId, CoordinationError> {
        let started = Instant::now();
        let required_tags = {
            let graph = self.graph.lock();
            let task = graph
                .tasks
                .get(task_id)
                .ok_or_else(|| CoordinationError::TaskNotFound(task_id.to_string()))?;
            if task.status != TaskStatus::Ready {
                return Err(CoordinationError::Validation(format!(
                    "task {} is {:?}, only READY tasks can be assigned",
                    task_id, task.status
                )));
            }
            task.required_tags.clone()
        };

        let candidates = self.lifecycle.active_agents().await;
        let now = self.clock.now();
        let assigned = {
            let mut graph = self.graph.lock();
            let load = graph.running_per_agent();
            let chosen = candidates
                .iter()
                .filter(|agent| agent.capability_profile.satisfies(&required_tags))
                .min_by(|a, b| {
                    let load_a = load.get(&a.id).copied().unwrap_or(0);
                    let load_b = load.get(&b.id).copied().unwrap_or(0);
                    load_a.cmp(&load_b).then_with(|| a.id.cmp(&b.id))
                })
                .map(|agent| agent.id.clone())
                .ok_or_else(|| CoordinationError::NoEligibleAgent(task_id.to_string()))?;

            let task = graph
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| CoordinationError::TaskNotFound(task_id.to_string()))?;
            if task.status != TaskStatus::Ready {
                return Err(CoordinationError::Validation(format!(
                    "task {} changed state during assignment",
                    task_id
                )));
            }
            task.assigned_agent_id = Some(chosen.clone());
            task.set_status(TaskStatus::Running, now);
            task.clone()
        };

        self.persistence.save_task(&assigned).await?;
        let agent_id = assigned
            .assigned_agent_id
            .clone()
            .ok_or_else(|| CoordinationError::Internal("assignment lost its agent".to_string()))?;
        self.event_bus.publish_task_event(TaskEvent::TaskAssigned {
            task_id: task_id.clone(),
            agent_id: agent_id.clone(),
            assigned_at: now,
        });
        self.governor.observe(OperationCategory::Assign, started.elapsed());
        debug!(task_id = %task_id, agent_id = %agent_id, "Task assigned");
        Ok(agent_id)
    }

    pub async fn cancel(&self, task_id: &TaskId) -> Result<CancelOutcome, CoordinationError> {
        let outcome = {
            let mut graph = self.graph.lock();
            let task = graph
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| CoordinationError::TaskNotFound(task_id.to_string()))?;
            let status = task.status;
            match status {
                TaskStatus::Running => {
                    task.cancelled = true;
                    CancelOutcome::ResultDiscarded
                }
                TaskStatus::Pending | TaskStatus::Ready => {
                    graph.tasks.remove(task_id);
                    CancelOutcome::Removed
                }
                TaskStatus::Completed | TaskStatus::Failed => {
                    return Err(CoordinationError::Validation(format!(
                        "task {} has already finished",
                        task_id
                    )));
                }
            }
        };

        match outcome {
            CancelOutcome::Removed => self.persistence.delete_task(task_id).await?,
            CancelOutcome::ResultDiscarded => {
                if let Some(task) = self.task(task_id) {
                    self.persistence.save_task(&task).await?;
                }
            }
        }

        info!(task_id = %task_id, outcome = ?outcome, "Task cancelled");
        self.event_bus.publish_task_event(TaskEvent::TaskCancelled {
            task_id: task_id.clone(),
            result_discarded: outcome == CancelOutcome::ResultDiscarded,
            cancelled_at: self.clock.now(),
        });
        Ok(outcome)
    }

    /// Put tasks brought back from a snapshot into the graph. Tasks that were
    /// RUNNING when captured go back to READY.
    pub fn install_restored(&self, tasks: Vec<Task>) -> usize {
        let now = self.clock.now();
        let mut graph = self.graph.lock();
        let count = tasks.len();
        for mut task in tasks {
            if task.status == TaskStatus::Running {
                task.assigned_agent_id = None;
                task.cancelled = false;
                task.set_status(TaskStatus::Ready, now);
            }
            graph.next_sequence = graph.next_sequence.max(task.sequence + 1);
            graph.tasks.insert(task.id.clone(), task);
        }
        count
    }

    /// Drive the graph until no task can make progress.
    pub async fn orchestrate(
        &self,
        strategy: OrchestrationStrategy,
    ) -> Result<OrchestrationReport, CoordinationError> {
        let _run = self.run_lock.lock().await;
        let mut report = OrchestrationReport::default();
        let mut unassignable: BTreeSet<TaskId> = BTreeSet::new();

        loop {
            let (_, cascaded) = self.resolve_graph().await?;
            report.failed.extend(cascaded);
            let ready: Vec<Task> = self
                .graph
                .lock()
                .ready_in_dispatch_order()
                .into_iter()
                .filter(|task| !unassignable.contains(&task.id))
                .collect();
            if ready.is_empty() {
                break;
            }
            report.rounds += 1;

            let batch = match strategy {
                OrchestrationStrategy::Sequential => ready.into_iter().take(1).collect(),
                OrchestrationStrategy::Parallel => ready,
            };

            let mut assigned = Vec::with_capacity(batch.len());
            for task in batch {
                match self.assign(&task.id).await {
                    Ok(agent_id) => assigned.push((task, agent_id)),
                    Err(CoordinationError::NoEligibleAgent(_)) => {
                        warn!(task_id = %task.id, "No eligible agent; leaving task READY");
                        unassignable.insert(task.id);
                    }
                    Err(e) => return Err(e),
                }
            }

            let results = self.execute_all(assigned).await;
            for (task_id, agent_id, result) in results {
                self.finish(&task_id, &agent_id, result, &mut report).await?;
            }
        }

        let (_, cascaded) = self.resolve_graph().await?;
        report.failed.extend(cascaded);
        report.blocked = self
            .graph
            .lock()
            .tasks
            .values()
            .filter(|task| matches!(task.status, TaskStatus::Pending | TaskStatus::Ready))
            .map(|task| task.id.clone())
            .collect();

        info!(
            strategy = ?strategy,
            completed = report.completed.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            discarded = report.discarded,
            "Orchestration finished"
        );
        Ok(report)
    }

    async fn execute_all(
        &self,
        assigned: Vec<(Task, AgentId)>,
    ) -> Vec<(TaskId, AgentId, Result<Vec<f32>, CoordinationError>)> {
        if assigned.len() == 1 {
            let mut results = Vec::with_capacity(1);
            for (task, agent_id) in assigned {
                let result = self.executor.execute(&task, &agent_id).await;
                results.push((task.id, agent_id, result));
            }
            return results;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency_limit.max(1)));
        let mut join_set = JoinSet::new();
        for (index, (task, agent_id)) in assigned.into_iter().enumerate() {
            let executor = self.executor.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => executor.execute(&task, &agent_id).await,
                    Err(_) => Err(CoordinationError::Internal("dispatch semaphore closed".to_string())),
                };
                (index, task.id, agent_id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(e) => warn!(error = %e, "Task execution panicked"),
            }
        }
        results.sort_by_key(|(index, ..)| *index);
        results
            .into_iter()
            .map(|(_, task_id, agent_id, result)| (task_id, agent_id, result))
            .collect()
    }

    async fn finish(
        &self,
        task_id: &TaskId,
        agent_id: &AgentId,
        result: Result<Vec<f32>, CoordinationError>,
        report: &mut OrchestrationReport,
    ) -> Result<(), CoordinationError> {
        let now = self.clock.now();
        let finished = {
            let mut graph = self.graph.lock();
            let Some(task) = graph.tasks.get_mut(task_id) else {
                return Ok(());
            };
            if task.cancelled {
                task.output = None;
                task.fail(CANCELLED, now);
                report.discarded += 1;
            } else {
                match result {
                    Ok(output) => {
                        task.output = Some(output);
                        task.set_status(TaskStatus::Completed, now);
                    }
                    Err(e) => task.fail(e.to_string(), now),
                }
            }
            task.clone()
        };

        self.persistence.save_task(&finished).await?;
        if finished.status == TaskStatus::Completed {
            report.completed.push(task_id.clone());
            self.event_bus.publish_task_event(TaskEvent::TaskCompleted {
                task_id: task_id.clone(),
                agent_id: agent_id.clone(),
                completed_at: now,
            });
        } else {
            report.failed.push(task_id.clone());
            let reason = finished.failure_reason.clone().unwrap_or_default();
            warn!(task_id = %task_id, agent_id = %agent_id, reason = %reason, "Task failed");
            self.event_bus.publish_task_event(TaskEvent::TaskFailed {
                task_id: task_id.clone(),
                reason,
                failed_at: now,
            });
        }
        Ok(())
    }
}
