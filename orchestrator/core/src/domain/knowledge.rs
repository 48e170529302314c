// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Knowledge Sharing
//!
//! Payloads exchanged over the mesh and the append-only audit record written
//! once per delivery attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::{Agent, AgentId};
use crate::domain::blob::{self, base64_bytes};
use crate::domain::error::CoordinationError;

/// Payload schema understood by this build.
pub const KNOWLEDGE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KnowledgeEventId(pub Uuid);

impl KnowledgeEventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for KnowledgeEventId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KnowledgeType {
    Weights,
    Biases,
    LearningProgress,
    Pattern,
}

impl KnowledgeType {
    pub fn as_str(self) -> &'static str {
        match self {
            KnowledgeType::Weights => "weights",
            KnowledgeType::Biases => "biases",
            KnowledgeType::LearningProgress => "learning-progress",
            KnowledgeType::Pattern => "pattern",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgePayload {
    pub schema_version: u32,
    pub knowledge_type: KnowledgeType,
    /// Fraction of the distance towards the shared value a target moves.
    pub blend_factor: f64,
    /// Inline parameter lanes. When absent the sender's current parameters
    /// are used.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "optional_base64")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl KnowledgePayload {
    pub fn new(knowledge_type: KnowledgeType, blend_factor: f64) -> Self {
        Self {
            schema_version: KNOWLEDGE_SCHEMA_VERSION,
            knowledge_type,
            blend_factor,
            data: None,
            progress: None,
        }
    }

    pub fn weights(blend_factor: f64) -> Self {
        Self::new(KnowledgeType::Weights, blend_factor)
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn validate(&self) -> Result<(), CoordinationError> {
        if self.schema_version != KNOWLEDGE_SCHEMA_VERSION {
            return Err(CoordinationError::Validation(format!(
                "unsupported knowledge schema version {}",
                self.schema_version
            )));
        }
        if !(self.blend_factor > 0.0 && self.blend_factor <= 1.0) {
            return Err(CoordinationError::Validation(format!(
                "blend factor must be within (0, 1], got {}",
                self.blend_factor
            )));
        }
        if let Some(progress) = self.progress {
            if !(0.0..=1.0).contains(&progress) {
                return Err(CoordinationError::Validation(format!(
                    "learning progress must be within [0, 1], got {}",
                    progress
                )));
            }
        }
        Ok(())
    }

    /// Fill absent data from the sending agent so every target receives the
    /// same values.
    pub fn resolve_against(&self, source: &Agent) -> Self {
        let mut resolved = self.clone();
        match self.knowledge_type {
            KnowledgeType::Weights if resolved.data.is_none() => {
                resolved.data = Some(source.learned_state.weights.clone());
            }
            KnowledgeType::Biases if resolved.data.is_none() => {
                resolved.data = Some(source.learned_state.biases.clone());
            }
            KnowledgeType::LearningProgress if resolved.progress.is_none() => {
                resolved.progress = Some(source.learning_progress);
            }
            _ => {}
        }
        resolved
    }

    /// Blend this payload into `target`. Lanes beyond the shorter of the two
    /// buffers are left as they are.
    pub fn apply_to(&self, target: &mut Agent) {
        let blend = self.blend_factor as f32;
        match self.knowledge_type {
            KnowledgeType::Weights => {
                if let Some(data) = &self.data {
                    let mut state = target.learned_state.clone();
                    state.weights = blend_lanes(&state.weights, data, blend);
                    state.reseal();
                    target.replace_learned_state(state);
                }
            }
            KnowledgeType::Biases => {
                if let Some(data) = &self.data {
                    let mut state = target.learned_state.clone();
                    state.biases = blend_lanes(&state.biases, data, blend);
                    state.reseal();
                    target.replace_learned_state(state);
                }
            }
            KnowledgeType::LearningProgress => {
                if let Some(progress) = self.progress {
                    let current = target.learning_progress;
                    target.learning_progress =
                        (current + self.blend_factor * (progress - current)).clamp(0.0, 1.0);
                }
            }
            KnowledgeType::Pattern => {}
        }
    }
}

fn blend_lanes(current: &[u8], incoming: &[u8], blend: f32) -> Vec<u8> {
    let mut mine = blob::decode_f32s(current);
    let theirs = blob::decode_f32s(incoming);
    for (value, shared) in mine.iter_mut().zip(theirs.iter()) {
        *value += blend * (shared - *value);
    }
    blob::encode_f32s(&mine)
}

mod optional_base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::base64_bytes;

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => base64_bytes::serialize(bytes, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "base64_bytes")] Vec<u8>);

        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(bytes)| bytes))
    }
}

/// Append-only audit record of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeShareEvent {
    pub id: KnowledgeEventId,
    pub source_agent_id: AgentId,
    pub target_agent_id: AgentId,
    pub shared_at: DateTime<Utc>,
    pub knowledge_type: KnowledgeType,
    pub payload: KnowledgePayload,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{Activation, CapabilityProfile, LearnedState, NeuralConfig, SpawnConfig};

    fn agent(id: &str, weights: &[f32], progress: f64) -> Agent {
        let config = SpawnConfig::new(
            CapabilityProfile::new("worker", ["x"]),
            NeuralConfig::v1(vec![2, 1], Activation::Tanh, 0.1),
        )
        .with_learned_state(LearnedState::from_parameters(weights, &[0.0]))
        .with_learning_progress(progress);
        Agent::spawning(AgentId::from(id), config, Utc::now())
    }

    #[test]
    fn test_payload_validation() {
        assert!(KnowledgePayload::weights(0.5).validate().is_ok());
        assert!(KnowledgePayload::weights(0.0).validate().is_err());
        assert!(KnowledgePayload::weights(1.5).validate().is_err());

        let mut future = KnowledgePayload::weights(0.5);
        future.schema_version = 2;
        assert!(matches!(future.validate(), Err(CoordinationError::Validation(_))));
    }

    #[test]
    fn test_full_blend_copies_source_weights() {
        let source = agent("s", &[1.0, -1.0], 0.8);
        let mut target = agent("t", &[0.0, 0.0], 0.2);

        let payload = KnowledgePayload::weights(1.0).resolve_against(&source);
        payload.apply_to(&mut target);

        assert_eq!(target.learned_state.weights_f32(), vec![1.0, -1.0]);
        assert!(target.learned_state.verify().is_ok());
    }

    #[test]
    fn test_progress_blend() {
        let source = agent("s", &[0.0, 0.0], 1.0);
        let mut target = agent("t", &[0.0, 0.0], 0.0);

        KnowledgePayload::new(KnowledgeType::LearningProgress, 0.5)
            .resolve_against(&source)
            .apply_to(&mut target);

        assert!((target.learning_progress - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = KnowledgePayload::weights(0.25).with_data(vec![1, 2, 3]);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["schemaVersion"], 1);
        assert_eq!(json["knowledgeType"], "weights");
        assert_eq!(json["data"], "AQID");

        let back: KnowledgePayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
