// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Compute Engine Contract
//!
//! The numeric work an agent performs is opaque to coordination. The engine is
//! called with a copy of the agent's record and returns results; it never sees
//! the registry or the store.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::agent::{Agent, LearnedState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    pub input: Vec<f32>,
    pub target: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    /// In [0, 1]; becomes the agent's learning progress.
    pub accuracy: f64,
    pub convergence_epoch: u32,
    /// Updated parameters, when the engine changed them.
    pub learned_state: Option<LearnedState>,
}

/// Declared latency contract of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeSla {
    pub infer: Duration,
    pub train_per_epoch: Duration,
}

impl Default for ComputeSla {
    fn default() -> Self {
        Self {
            infer: Duration::from_millis(10),
            train_per_epoch: Duration::from_millis(50),
        }
    }
}

#[async_trait]
pub trait ComputeEngine: Send + Sync {
    async fn infer(&self, agent: &Agent, input: &[f32]) -> Result<Vec<f32>, ComputeError>;

    async fn train(
        &self,
        agent: &Agent,
        data: &[TrainingSample],
        epochs: u32,
    ) -> Result<TrainingOutcome, ComputeError>;

    fn sla(&self) -> ComputeSla {
        ComputeSla::default()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComputeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("engine failure: {0}")]
    Engine(String),

    #[error("compute exceeded its SLA of {0:?}")]
    SlaExceeded(Duration),
}
