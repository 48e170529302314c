// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Reference Compute Engine
//!
//! Scalar dense forward pass over the agent's learned parameters. Good enough
//! to exercise coordination end to end; not meant for real workloads.
//!
//! - Inputs hold at most [`MAX_INPUT_LEN`] finite values with
//!   `|x| <= MAX_INPUT_MAGNITUDE`. Valid inputs are zero-padded or truncated to
//!   the width of the input layer.
//! - `Activation::Tanh` is `tanh(0.5 * x)`.
//! - Training nudges output-layer biases along the mean error and reports
//!   `accuracy = 1 / (1 + mse)`.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::domain::agent::{Activation, Agent, LearnedState};
use crate::domain::compute::{ComputeEngine, ComputeError, TrainingOutcome, TrainingSample};

pub const MAX_INPUT_LEN: usize = 10_000;
pub const MAX_INPUT_MAGNITUDE: f32 = 1000.0;

/// Epoch-over-epoch error improvement below which training counts as converged.
const CONVERGENCE_EPSILON: f64 = 1e-4;

#[derive(Debug, Default)]
pub struct ActivationComputeEngine {
    operations: AtomicU64,
}

impl ActivationComputeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total inference and training calls served.
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Bytes held by an agent's parameters.
    pub fn memory_usage(agent: &Agent) -> u64 {
        agent.learned_state.size_bytes()
    }

    fn validate_input(input: &[f32]) -> Result<(), ComputeError> {
        if input.len() > MAX_INPUT_LEN {
            return Err(ComputeError::InvalidInput(format!(
                "input has {} values, limit is {}",
                input.len(),
                MAX_INPUT_LEN
            )));
        }
        if let Some(bad) = input
            .iter()
            .find(|x| !x.is_finite() || x.abs() > MAX_INPUT_MAGNITUDE)
        {
            return Err(ComputeError::InvalidInput(format!(
                "input value {} is not finite or exceeds {}",
                bad, MAX_INPUT_MAGNITUDE
            )));
        }
        Ok(())
    }
}

fn activate(activation: Activation, x: f32) -> f32 {
    match activation {
        Activation::Tanh => (0.5 * x).tanh(),
        Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        Activation::Relu => x.max(0.0),
        Activation::Linear => x,
    }
}

struct Network<'a> {
    layers: &'a [u32],
    activation: Activation,
    weights: Vec<f32>,
    biases: Vec<f32>,
}

impl<'a> Network<'a> {
    fn of(agent: &'a Agent) -> Self {
        Self {
            layers: agent.neural_config.architecture(),
            activation: agent.neural_config.activation(),
            weights: agent.learned_state.weights_f32(),
            biases: agent.learned_state.biases_f32(),
        }
    }

    fn forward(&self, input: &[f32]) -> Vec<f32> {
        let width = self.layers.first().copied().unwrap_or(0) as usize;
        let mut current: Vec<f32> = (0..width)
            .map(|i| input.get(i).copied().unwrap_or(0.0))
            .collect();

        let mut w_offset = 0;
        let mut b_offset = 0;
        for pair in self.layers.windows(2) {
            let (fan_in, fan_out) = (pair[0] as usize, pair[1] as usize);
            let mut next = Vec::with_capacity(fan_out);
            for j in 0..fan_out {
                let mut sum = self.biases.get(b_offset + j).copied().unwrap_or(0.0);
                for (i, x) in current.iter().enumerate() {
                    let w = self
                        .weights
                        .get(w_offset + i * fan_out + j)
                        .copied()
                        .unwrap_or(0.0);
                    sum += w * x;
                }
                next.push(activate(self.activation, sum));
            }
            w_offset += fan_in * fan_out;
            b_offset += fan_out;
            current = next;
        }
        current
    }

    fn output_bias_range(&self) -> std::ops::Range<usize> {
        let out = self.layers.last().copied().unwrap_or(0) as usize;
        let end = self.biases.len();
        end.saturating_sub(out)..end
    }
}

fn mean_squared_error(network: &Network<'_>, data: &[TrainingSample]) -> (f64, Vec<f32>) {
    let outputs = network.layers.last().copied().unwrap_or(0) as usize;
    let mut total = 0.0f64;
    let mut count = 0usize;
    let mut mean_error = vec![0.0f32; outputs];
    for sample in data {
        let predicted = network.forward(&sample.input);
        for (k, p) in predicted.iter().enumerate() {
            let target = sample.target.get(k).copied().unwrap_or(0.0);
            let err = target - p;
            total += (err as f64) * (err as f64);
            mean_error[k] += err / data.len() as f32;
            count += 1;
        }
    }
    let mse = if count == 0 { 0.0 } else { total / count as f64 };
    (mse, mean_error)
}

#[async_trait]
impl ComputeEngine for ActivationComputeEngine {
    async fn infer(&self, agent: &Agent, input: &[f32]) -> Result<Vec<f32>, ComputeError> {
        Self::validate_input(input)?;
        self.operations.fetch_add(1, Ordering::Relaxed);
        Ok(Network::of(agent).forward(input))
    }

    async fn train(
        &self,
        agent: &Agent,
        data: &[TrainingSample],
        epochs: u32,
    ) -> Result<TrainingOutcome, ComputeError> {
        if data.is_empty() {
            return Err(ComputeError::InvalidInput("training data is empty".to_string()));
        }
        if epochs == 0 {
            return Err(ComputeError::InvalidInput("epochs must be at least 1".to_string()));
        }
        for sample in data {
            Self::validate_input(&sample.input)?;
            Self::validate_input(&sample.target)?;
        }
        self.operations.fetch_add(1, Ordering::Relaxed);

        let rate = agent.neural_config.learning_rate() as f32;
        let mut network = Network::of(agent);
        let (mut previous, _) = mean_squared_error(&network, data);
        let mut convergence_epoch = epochs;

        for epoch in 1..=epochs {
            let (_, mean_error) = mean_squared_error(&network, data);
            let range = network.output_bias_range();
            for (bias, err) in network.biases[range].iter_mut().zip(mean_error.iter()) {
                *bias += rate * err;
            }
            let (mse, _) = mean_squared_error(&network, data);
            if (previous - mse).abs() < CONVERGENCE_EPSILON {
                convergence_epoch = epoch;
                previous = mse;
                break;
            }
            previous = mse;
        }

        let accuracy = (1.0 / (1.0 + previous)).clamp(0.0, 1.0);
        debug!(agent_id = %agent.id, accuracy, convergence_epoch, "training finished");

        Ok(TrainingOutcome {
            accuracy,
            convergence_epoch,
            learned_state: Some(LearnedState::from_parameters(&network.weights, &network.biases)),
        })
    }
}
