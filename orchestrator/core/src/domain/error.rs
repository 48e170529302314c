// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Coordination Error Taxonomy
//!
//! Every externally visible operation returns [`CoordinationError`].
//!
//! - `Validation` and `DataIntegrity` abort the single operation and leave
//!   state unchanged.
//! - `DegradedRestore` is non-fatal: it is carried inside a successful
//!   `RestoreReport` and only surfaced as an error value on request.
//! - `RecoveryFailure` concerns one agent; other recoveries proceed.

use std::time::Duration;

use thiserror::Error;

use crate::domain::agent::{AgentId, AgentState};
use crate::domain::compute::ComputeError;
use crate::domain::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid state transition for agent {agent_id}: {from} -> {to}")]
    InvalidStateTransition {
        agent_id: AgentId,
        from: AgentState,
        to: AgentState,
    },

    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("integrity check failed for {record}: expected {expected}, computed {actual}")]
    DataIntegrity {
        record: String,
        expected: String,
        actual: String,
    },

    #[error("recovery of agent {agent_id} failed: {reason}")]
    RecoveryFailure { agent_id: AgentId, reason: String },

    #[error("degraded restore of session {session_id}: continuity {continuity_score:.3} below {threshold:.3}")]
    DegradedRestore {
        session_id: String,
        continuity_score: f64,
        threshold: f64,
    },

    #[error("{operation} exceeded its deadline of {deadline:?}")]
    Timeout {
        operation: &'static str,
        deadline: Duration,
    },

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("swarm not found: {0}")]
    SwarmNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("no eligible agent for task {0}")]
    NoEligibleAgent(String),

    #[error("compute engine error: {0}")]
    Compute(#[from] ComputeError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoordinationError::Timeout { .. })
    }

    /// Errors that leave state untouched and can be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Timeout { .. } | CoordinationError::Persistence(_)
        )
    }
}

impl From<RepositoryError> for CoordinationError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Integrity {
                record,
                expected,
                actual,
            } => CoordinationError::DataIntegrity {
                record,
                expected,
                actual,
            },
            other => CoordinationError::Persistence(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_maps_to_data_integrity() {
        let err: CoordinationError = RepositoryError::Integrity {
            record: "agent_states/a".to_string(),
            expected: "sha256:00".to_string(),
            actual: "sha256:ff".to_string(),
        }
        .into();
        assert!(matches!(err, CoordinationError::DataIntegrity { .. }));

        let err: CoordinationError = RepositoryError::Database("disk full".to_string()).into();
        assert!(matches!(err, CoordinationError::Persistence(ref m) if m.contains("disk full")));
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = CoordinationError::CyclicDependency {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency detected: a -> b -> a");
    }
}
