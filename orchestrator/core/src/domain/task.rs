// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Aggregate
//!
//! Tasks form a dependency graph owned by the orchestrator. The dependency set
//! is fixed at submission; everything else on the record moves with the status.
//!
//! ```text
//! PENDING ──▶ READY ──▶ RUNNING ──▶ COMPLETED
//!    │          │          └──────▶ FAILED
//!    └──────────┴─────────────────▶ FAILED (dependency failed)
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::AgentId;
use crate::domain::error::CoordinationError;
use crate::domain::swarm::SwarmId;

/// Reason recorded on tasks whose prerequisite failed.
pub const DEPENDENCY_FAILED: &str = "dependency failed";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
}

/// How ready tasks are dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationStrategy {
    /// One task at a time, in submission order.
    #[default]
    Sequential,
    /// Every ready task at once, bounded by the concurrency limit.
    Parallel,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    /// Higher runs first among tasks that become ready together in a
    /// parallel wave; never overrides dependency order.
    pub priority: i32,
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub required_tags: BTreeSet<String>,
    #[serde(default)]
    pub input: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm_id: Option<SwarmId>,
    pub assigned_agent_id: Option<AgentId>,
    pub status: TaskStatus,
    /// Monotonic submission order, assigned by the orchestrator.
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, task_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task_type: task_type.into(),
            priority: 0,
            dependencies: BTreeSet::new(),
            required_tags: BTreeSet::new(),
            input: Vec::new(),
            swarm_id: None,
            assigned_agent_id: None,
            status: TaskStatus::Pending,
            sequence: 0,
            cancelled: false,
            output: None,
            failure_reason: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn requires_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tags.insert(tag.into());
        self
    }

    pub fn with_input(mut self, input: Vec<f32>) -> Self {
        self.input = input;
        self
    }

    pub fn in_swarm(mut self, swarm_id: SwarmId) -> Self {
        self.swarm_id = Some(swarm_id);
        self
    }

    pub fn validate(&self) -> Result<(), CoordinationError> {
        if self.id.as_str().trim().is_empty() {
            return Err(CoordinationError::Validation(
                "task id must not be empty".to_string(),
            ));
        }
        if self.task_type.trim().is_empty() {
            return Err(CoordinationError::Validation(format!(
                "task {} has an empty type",
                self.id
            )));
        }
        if self.dependencies.contains(&self.id) {
            return Err(CoordinationError::CyclicDependency {
                path: vec![self.id.to_string(), self.id.to_string()],
            });
        }
        Ok(())
    }

    pub fn set_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.failure_reason = Some(reason.into());
        self.set_status(TaskStatus::Failed, now);
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Cycle detection over the union of an existing graph and a batch of new
/// tasks. Unknown dependencies (forward references) are leaves.
pub struct TaskGraphValidator;

impl TaskGraphValidator {
    /// Returns the offending path (first node repeated at the end) if the
    /// combined graph contains a cycle.
    pub fn find_cycle<'a>(
        edges: &HashMap<&'a TaskId, &'a BTreeSet<TaskId>>,
    ) -> Option<Vec<TaskId>> {
        fn visit<'a>(
            current: &'a TaskId,
            edges: &HashMap<&'a TaskId, &'a BTreeSet<TaskId>>,
            visited: &mut HashMap<&'a TaskId, bool>,
            rec_stack: &mut Vec<&'a TaskId>,
        ) -> Option<Vec<TaskId>> {
            visited.insert(current, true);
            rec_stack.push(current);

            if let Some(dependencies) = edges.get(current).copied() {
                for dependency in dependencies {
                    if let Some(start) = rec_stack.iter().position(|id| *id == dependency) {
                        let mut path: Vec<TaskId> =
                            rec_stack[start..].iter().map(|id| (*id).clone()).collect();
                        path.push(dependency.clone());
                        return Some(path);
                    }
                    if !visited.get(dependency).copied().unwrap_or(false) {
                        if let Some(path) = visit(dependency, edges, visited, rec_stack) {
                            return Some(path);
                        }
                    }
                }
            }

            rec_stack.pop();
            None
        }

        let mut roots: Vec<&'a TaskId> = edges.keys().copied().collect();
        roots.sort();

        let mut visited = HashMap::new();
        for root in roots {
            if visited.get(root).copied().unwrap_or(false) {
                continue;
            }
            let mut rec_stack = Vec::new();
            if let Some(path) = visit(root, edges, &mut visited, &mut rec_stack) {
                return Some(path);
            }
        }
        None
    }

    pub fn check_for_cycles<'a>(
        edges: &HashMap<&'a TaskId, &'a BTreeSet<TaskId>>,
    ) -> Result<(), CoordinationError> {
        match Self::find_cycle(edges) {
            Some(path) => Err(CoordinationError::CyclicDependency {
                path: path.into_iter().map(|id| id.to_string()).collect(),
            }),
            None => Ok(()),
        }
    }
}
