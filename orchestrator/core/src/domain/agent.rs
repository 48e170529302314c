// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Aggregate
//!
//! The agent is the unit of work in a swarm: a stateful worker with a
//! persisted lifecycle and learned parameters.
//!
//! ## Lifecycle
//!
//! | From | Allowed targets |
//! |------|-----------------|
//! | `Spawning` | `Active`, `Terminated` |
//! | `Active` | `Training`, `Failed`, `Terminated` |
//! | `Training` | `Active`, `Failed`, `Terminated` |
//! | `Failed` | `Recovering`, `Terminated` |
//! | `Recovering` | `Active`, `Terminated` |
//! | `Terminated` | none |
//!
//! Mutation goes through [`Agent::transition_to`]; the aggregate itself never
//! touches storage. Persistence is the caller's job (see
//! `application::lifecycle`).

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::blob::{self, base64_bytes};
use crate::domain::error::CoordinationError;

/// Prefix for every checksum produced for learned state.
const CHECKSUM_PREFIX: &str = "sha256:";

/// Prefix used for ids of agents rebuilt by the recovery controller.
const RECOVERY_PREFIX: &str = "recovery-";

/// Initial weights are drawn uniformly from `(-spread, spread)`.
const INITIAL_WEIGHT_SPREAD: f32 = 0.05;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    /// Allocate a fresh, globally unique agent id.
    pub fn new() -> Self {
        Self(format!("agent-{}", Uuid::new_v4()))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Deterministic id of the replacement for a failed agent.
    pub fn recovery_of(failed: &AgentId) -> Self {
        Self(format!("{}{}", RECOVERY_PREFIX, failed.0))
    }

    pub fn is_recovery(&self) -> bool {
        self.0.starts_with(RECOVERY_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Spawning,
    Active,
    Training,
    Failed,
    Recovering,
    Terminated,
}

impl AgentState {
    /// Whether the lifecycle table allows `self -> to`.
    pub fn can_transition_to(self, to: AgentState) -> bool {
        use AgentState::*;
        match (self, to) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Spawning, Active) => true,
            (Active, Training) | (Active, Failed) => true,
            (Training, Active) | (Training, Failed) => true,
            (Failed, Recovering) => true,
            (Recovering, Active) => true,
            _ => false,
        }
    }

    /// Live agents are expected to heartbeat and can receive knowledge.
    pub fn is_live(self) -> bool {
        matches!(self, AgentState::Active | AgentState::Training)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Terminated)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Spawning => "SPAWNING",
            AgentState::Active => "ACTIVE",
            AgentState::Training => "TRAINING",
            AgentState::Failed => "FAILED",
            AgentState::Recovering => "RECOVERING",
            AgentState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Agent type plus the specialization tags used for task matching and mesh
/// connection strength.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub agent_type: String,
    pub specialization_tags: BTreeSet<String>,
}

impl CapabilityProfile {
    pub fn new(agent_type: impl Into<String>, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            agent_type: agent_type.into(),
            specialization_tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    /// True when every required tag is present in this profile.
    pub fn satisfies(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.specialization_tags)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Tanh,
    Sigmoid,
    Relu,
    Linear,
}

/// Neural configuration, tagged with its schema version so that blobs written
/// by older builds are rejected at decode time rather than misread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema", rename_all = "lowercase")]
pub enum NeuralConfig {
    V1 {
        /// Layer widths, input first.
        architecture: Vec<u32>,
        activation: Activation,
        learning_rate: f64,
    },
}

impl NeuralConfig {
    pub fn v1(architecture: Vec<u32>, activation: Activation, learning_rate: f64) -> Self {
        NeuralConfig::V1 {
            architecture,
            activation,
            learning_rate,
        }
    }

    pub fn architecture(&self) -> &[u32] {
        match self {
            NeuralConfig::V1 { architecture, .. } => architecture,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            NeuralConfig::V1 { learning_rate, .. } => *learning_rate,
        }
    }

    pub fn activation(&self) -> Activation {
        match self {
            NeuralConfig::V1 { activation, .. } => *activation,
        }
    }

    /// Number of weight and bias parameters implied by the architecture.
    pub fn parameter_counts(&self) -> (usize, usize) {
        let layers = self.architecture();
        let weights = layers
            .windows(2)
            .map(|pair| pair[0] as usize * pair[1] as usize)
            .sum();
        let biases = layers.iter().skip(1).map(|w| *w as usize).sum();
        (weights, biases)
    }

    pub fn validate(&self) -> Result<(), CoordinationError> {
        let architecture = self.architecture();
        if architecture.is_empty() {
            return Err(CoordinationError::Validation(
                "neural architecture must not be empty".to_string(),
            ));
        }
        if architecture.iter().any(|width| *width == 0) {
            return Err(CoordinationError::Validation(
                "neural architecture layers must have a non-zero width".to_string(),
            ));
        }
        let rate = self.learning_rate();
        if !(rate.is_finite() && rate > 0.0) {
            return Err(CoordinationError::Validation(format!(
                "learning rate must be > 0, got {}",
                rate
            )));
        }
        Ok(())
    }
}

/// Learned parameters with a checksum over both blobs.
///
/// The checksum is recomputed by the storage codec on every save and verified
/// on every load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnedState {
    #[serde(with = "base64_bytes")]
    pub weights: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub biases: Vec<u8>,
    pub checksum: String,
}

impl LearnedState {
    pub fn new(weights: Vec<u8>, biases: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(&weights, &biases);
        Self {
            weights,
            biases,
            checksum,
        }
    }

    pub fn from_parameters(weights: &[f32], biases: &[f32]) -> Self {
        Self::new(blob::encode_f32s(weights), blob::encode_f32s(biases))
    }

    /// Deterministic small initial parameters for a configuration.
    pub fn initial(config: &NeuralConfig, seed: u64) -> Self {
        let (weight_count, bias_count) = config.parameter_counts();
        let mut rng = StdRng::seed_from_u64(seed);
        let weights: Vec<f32> = (0..weight_count)
            .map(|_| rng.random_range(-INITIAL_WEIGHT_SPREAD..INITIAL_WEIGHT_SPREAD))
            .collect();
        let biases = vec![0.0f32; bias_count];
        Self::from_parameters(&weights, &biases)
    }

    /// `sha256:<hex>` over the length-prefixed weight and bias blobs.
    pub fn compute_checksum(weights: &[u8], biases: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update((weights.len() as u64).to_le_bytes());
        hasher.update(weights);
        hasher.update((biases.len() as u64).to_le_bytes());
        hasher.update(biases);
        format!("{}{}", CHECKSUM_PREFIX, hex::encode(hasher.finalize()))
    }

    /// Recompute the checksum after the blobs were changed in memory.
    pub fn reseal(&mut self) {
        self.checksum = Self::compute_checksum(&self.weights, &self.biases);
    }

    /// Returns the freshly computed checksum when it does not match.
    pub fn verify(&self) -> Result<(), String> {
        let actual = Self::compute_checksum(&self.weights, &self.biases);
        if actual == self.checksum {
            Ok(())
        } else {
            Err(actual)
        }
    }

    pub fn weights_f32(&self) -> Vec<f32> {
        blob::decode_f32s(&self.weights)
    }

    pub fn biases_f32(&self) -> Vec<f32> {
        blob::decode_f32s(&self.biases)
    }

    /// Weights followed by biases, as one parameter vector.
    pub fn parameter_vector(&self) -> Vec<f32> {
        let mut params = self.weights_f32();
        params.extend(self.biases_f32());
        params
    }

    pub fn size_bytes(&self) -> u64 {
        (self.weights.len() + self.biases.len()) as u64
    }
}

/// Everything needed to bring a new agent up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnConfig {
    pub capability_profile: CapabilityProfile,
    pub neural_config: NeuralConfig,
    /// Parameters to start from; generated from the architecture when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learned_state: Option<LearnedState>,
    #[serde(default)]
    pub learning_progress: f64,
}

impl SpawnConfig {
    pub fn new(capability_profile: CapabilityProfile, neural_config: NeuralConfig) -> Self {
        Self {
            capability_profile,
            neural_config,
            learned_state: None,
            learning_progress: 0.0,
        }
    }

    pub fn with_learned_state(mut self, learned_state: LearnedState) -> Self {
        self.learned_state = Some(learned_state);
        self
    }

    pub fn with_learning_progress(mut self, progress: f64) -> Self {
        self.learning_progress = progress;
        self
    }

    pub fn validate(&self) -> Result<(), CoordinationError> {
        self.neural_config.validate()?;
        if self.capability_profile.agent_type.trim().is_empty() {
            return Err(CoordinationError::Validation(
                "agent type must not be empty".to_string(),
            ));
        }
        if self.capability_profile.specialization_tags.is_empty() {
            return Err(CoordinationError::Validation(
                "at least one specialization tag is required".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.learning_progress) {
            return Err(CoordinationError::Validation(format!(
                "learning progress must be within [0, 1], got {}",
                self.learning_progress
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub capability_profile: CapabilityProfile,
    pub state: AgentState,
    pub neural_config: NeuralConfig,
    pub learned_state: LearnedState,
    pub learning_progress: f64,
    pub memory_usage_bytes: u64,
    pub last_active_at: DateTime<Utc>,
    pub total_inferences: u64,
    /// Set once recovery of this agent has failed; no further retries.
    #[serde(default)]
    pub recovery_exhausted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Build the initial `Spawning` record for a validated configuration.
    pub fn spawning(id: AgentId, config: SpawnConfig, now: DateTime<Utc>) -> Self {
        let learned_state = config
            .learned_state
            .unwrap_or_else(|| LearnedState::initial(&config.neural_config, seed_for(&id)));
        let memory_usage_bytes = learned_state.size_bytes();
        Self {
            id,
            capability_profile: config.capability_profile,
            state: AgentState::Spawning,
            neural_config: config.neural_config,
            learned_state,
            learning_progress: config.learning_progress,
            memory_usage_bytes,
            last_active_at: now,
            total_inferences: 0,
            recovery_exhausted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a lifecycle transition, returning the previous state.
    pub fn transition_to(
        &mut self,
        to: AgentState,
        now: DateTime<Utc>,
    ) -> Result<AgentState, CoordinationError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(CoordinationError::InvalidStateTransition {
                agent_id: self.id.clone(),
                from,
                to,
            });
        }
        self.state = to;
        self.updated_at = now;
        if to != AgentState::Failed {
            self.last_active_at = now;
        }
        Ok(from)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_active_at = now;
        self.updated_at = now;
    }

    /// Replace the learned parameters and keep the memory figure in step.
    pub fn replace_learned_state(&mut self, learned_state: LearnedState) {
        self.memory_usage_bytes = learned_state.size_bytes();
        self.learned_state = learned_state;
    }

    /// The configuration that would rebuild this agent with its current
    /// parameters and progress.
    pub fn respawn_config(&self) -> SpawnConfig {
        SpawnConfig::new(self.capability_profile.clone(), self.neural_config.clone())
            .with_learned_state(self.learned_state.clone())
            .with_learning_progress(self.learning_progress)
    }
}

/// First eight bytes of the id's SHA-256 digest.
fn seed_for(id: &AgentId) -> u64 {
    let digest = Sha256::digest(id.as_str().as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(seed)
}
