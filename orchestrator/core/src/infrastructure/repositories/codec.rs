// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Record codec shared by every storage engine.
//!
//! A stored record is a frame:
//!
//! ```text
//! sha256:<hex of body>\n
//! <JSON body>
//! ```
//!
//! The frame digest covers the raw body bytes, so any change to a stored
//! record is caught before it is parsed. Agent records additionally carry the
//! learned-state checksum, which is recomputed on encode and verified on
//! decode. Engines only ever hand bytes to this module; there is no read path
//! that skips verification.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::agent::{Agent, LearnedState};
use crate::domain::repository::RepositoryError;
use crate::domain::snapshot::SessionSnapshot;

const DIGEST_PREFIX: &str = "sha256:";

fn digest(body: &[u8]) -> String {
    format!("{}{}", DIGEST_PREFIX, hex::encode(Sha256::digest(body)))
}

/// Frame any serializable record.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, RepositoryError> {
    let body = serde_json::to_vec(record)?;
    let mut framed = digest(&body).into_bytes();
    framed.push(b'\n');
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Verify the frame digest, then parse the body.
pub fn decode<T: DeserializeOwned>(record: &str, bytes: &[u8]) -> Result<T, RepositoryError> {
    let split = bytes.iter().position(|b| *b == b'\n');
    let (header, body) = match split {
        Some(at) => (&bytes[..at], &bytes[at + 1..]),
        None => (bytes, &[][..]),
    };
    let expected = String::from_utf8_lossy(header).into_owned();
    let actual = digest(body);
    if expected != actual {
        return Err(RepositoryError::Integrity {
            record: record.to_string(),
            expected,
            actual,
        });
    }
    Ok(serde_json::from_slice(body)?)
}

fn verify_learned_state(record: &str, state: &LearnedState) -> Result<(), RepositoryError> {
    state.verify().map_err(|actual| RepositoryError::Integrity {
        record: record.to_string(),
        expected: state.checksum.clone(),
        actual,
    })
}

/// Seal the learned-state checksum at save time and frame the record.
pub fn encode_agent(agent: &Agent) -> Result<Vec<u8>, RepositoryError> {
    let mut sealed = agent.clone();
    sealed.learned_state.reseal();
    encode(&sealed)
}

pub fn decode_agent(record: &str, bytes: &[u8]) -> Result<Agent, RepositoryError> {
    let agent: Agent = decode(record, bytes)?;
    verify_learned_state(record, &agent.learned_state)?;
    Ok(agent)
}

pub fn encode_snapshot(snapshot: &SessionSnapshot) -> Result<Vec<u8>, RepositoryError> {
    let mut sealed = snapshot.clone();
    for agent in &mut sealed.agent_states {
        agent.learned_state.reseal();
    }
    encode(&sealed)
}

pub fn decode_snapshot(record: &str, bytes: &[u8]) -> Result<SessionSnapshot, RepositoryError> {
    let snapshot: SessionSnapshot = decode(record, bytes)?;
    for agent in &snapshot.agent_states {
        verify_learned_state(&format!("{}#{}", record, agent.id), &agent.learned_state)?;
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{Activation, AgentId, CapabilityProfile, NeuralConfig, SpawnConfig};
    use chrono::Utc;

    fn agent() -> Agent {
        let config = SpawnConfig::new(
            CapabilityProfile::new("worker", ["x"]),
            NeuralConfig::v1(vec![3, 2], Activation::Relu, 0.1),
        );
        Agent::spawning(AgentId::from("agent-1"), config, Utc::now())
    }

    #[test]
    fn test_agent_round_trip_is_byte_identical() {
        let original = agent();
        let bytes = encode_agent(&original).unwrap();
        let decoded = decode_agent("agent_states/agent-1", &bytes).unwrap();
        assert_eq!(decoded.learned_state.weights, original.learned_state.weights);
        assert_eq!(decoded.learned_state.biases, original.learned_state.biases);
        assert!(decoded.learned_state.verify().is_ok());
    }

    #[test]
    fn test_encode_seals_stale_checksum() {
        let mut stale = agent();
        stale.learned_state.weights[0] ^= 0xff;
        let decoded = decode_agent("a", &encode_agent(&stale).unwrap()).unwrap();
        assert!(decoded.learned_state.verify().is_ok());
    }

    #[test]
    fn test_any_body_byte_flip_is_integrity_error() {
        let bytes = encode_agent(&agent()).unwrap();
        let body_start = bytes.iter().position(|b| *b == b'\n').unwrap() + 1;
        for at in [body_start, body_start + 10, bytes.len() - 1] {
            let mut corrupted = bytes.clone();
            corrupted[at] ^= 0x01;
            assert!(matches!(
                decode_agent("a", &corrupted),
                Err(RepositoryError::Integrity { .. })
            ));
        }
    }

    #[test]
    fn test_reframed_weight_flip_is_caught_by_learned_state_checksum() {
        let mut tampered = agent();
        let bytes = encode_agent(&tampered).unwrap();
        let stored: Agent = decode("a", &bytes).unwrap();
        tampered.learned_state = stored.learned_state;
        tampered.learned_state.weights[1] ^= 0x08;
        // Frame is rebuilt around the tampered body; only the inner checksum is stale.
        let reframed = encode(&tampered).unwrap();
        assert!(matches!(
            decode_agent("a", &reframed),
            Err(RepositoryError::Integrity { .. })
        ));
    }
}
