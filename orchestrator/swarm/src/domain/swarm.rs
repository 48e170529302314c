// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Mesh Topology Math
//!
//! Pure functions behind the mesh manager:
//!
//! - [`connection_strength`]: Jaccard overlap of two capability tag sets.
//! - [`build_connections`]: the connection set a [`Topology`] implies.
//! - [`coordination_efficiency`]: mean strength times mean learning progress.
//! - [`state_divergence`] / [`convergence_score`]: how far targets sit from
//!   the source after a propagation.
//!
//! No I/O, no clocks. Everything here is deterministic for a given input.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use synapse_core::domain::agent::{Agent, AgentId, CapabilityProfile};
use synapse_core::domain::error::CoordinationError;
use synapse_core::domain::swarm::{Connection, SwarmId, SwarmSession, Topology};

/// Jaccard index of the two tag sets, in [0, 1].
pub fn connection_strength(a: &CapabilityProfile, b: &CapabilityProfile) -> f64 {
    let union = a.specialization_tags.union(&b.specialization_tags).count();
    if union == 0 {
        return 0.0;
    }
    let shared = a
        .specialization_tags
        .intersection(&b.specialization_tags)
        .count();
    (shared as f64 / union as f64).clamp(0.0, 1.0)
}

/// Connections for `members` (in the order the caller listed them).
pub fn build_connections(topology: &Topology, members: &[Agent]) -> Result<Vec<Connection>, CoordinationError> {
    let link = |x: &Agent, y: &Agent| {
        Connection::new(
            x.id.clone(),
            y.id.clone(),
            connection_strength(&x.capability_profile, &y.capability_profile),
        )
    };

    let hub = match topology {
        Topology::Mesh => {
            let mut connections = Vec::new();
            for (i, x) in members.iter().enumerate() {
                for y in &members[i + 1..] {
                    connections.push(link(x, y));
                }
            }
            return Ok(connections);
        }
        Topology::Star => members.first(),
        Topology::Hierarchical { coordinator } => {
            let found = members.iter().find(|agent| &agent.id == coordinator);
            if found.is_none() {
                return Err(CoordinationError::Validation(format!(
                    "coordinator {} is not a member of the swarm",
                    coordinator
                )));
            }
            found
        }
    };

    Ok(match hub {
        Some(hub) => members
            .iter()
            .filter(|agent| agent.id != hub.id)
            .map(|agent| link(hub, agent))
            .collect(),
        None => Vec::new(),
    })
}

/// Mean connection strength times mean member learning progress.
pub fn coordination_efficiency(connections: &[Connection], members: &[Agent]) -> f64 {
    if connections.is_empty() || members.is_empty() {
        return 0.0;
    }
    let strength = connections.iter().map(|c| c.strength).sum::<f64>() / connections.len() as f64;
    let progress = members.iter().map(|a| a.learning_progress).sum::<f64>() / members.len() as f64;
    (strength * progress).clamp(0.0, 1.0)
}

pub fn establish_session(
    swarm_id: SwarmId,
    topology: Topology,
    members: &[Agent],
    now: DateTime<Utc>,
) -> Result<SwarmSession, CoordinationError> {
    let connections = build_connections(&topology, members)?;
    let coordination_efficiency = coordination_efficiency(&connections, members);
    Ok(SwarmSession {
        swarm_id,
        topology,
        member_agent_ids: members.iter().map(|a| a.id.clone()).collect(),
        connections,
        coordination_efficiency,
        created_at: now,
    })
}

/// Swap `old` for `replacement` in the session, re-scoring the connections
/// that touch it. `profiles` must hold every peer of `old`.
pub fn substitute_member(
    session: &mut SwarmSession,
    old: &AgentId,
    replacement: &Agent,
    profiles: &HashMap<AgentId, CapabilityProfile>,
) {
    if !session.member_agent_ids.remove(old) {
        return;
    }
    session.member_agent_ids.insert(replacement.id.clone());

    if let Topology::Hierarchical { coordinator } = &mut session.topology {
        if coordinator == old {
            *coordinator = replacement.id.clone();
        }
    }

    for connection in session.connections.iter_mut() {
        let Some(peer) = connection.peer_of(old).cloned() else {
            continue;
        };
        let strength = profiles
            .get(&peer)
            .map(|profile| connection_strength(&replacement.capability_profile, profile))
            .unwrap_or(connection.strength);
        *connection = Connection::new(peer, replacement.id.clone(), strength);
    }
}

/// Normalized L1 distance between the two parameter vectors, in [0, 1].
/// The shorter vector is zero-extended.
pub fn state_divergence(a: &Agent, b: &Agent) -> f64 {
    let x = a.learned_state.parameter_vector();
    let y = b.learned_state.parameter_vector();
    let len = x.len().max(y.len());

    let mut distance = 0.0f64;
    let mut magnitude = 0.0f64;
    for i in 0..len {
        let xi = x.get(i).copied().unwrap_or(0.0) as f64;
        let yi = y.get(i).copied().unwrap_or(0.0) as f64;
        distance += (xi - yi).abs();
        magnitude += xi.abs() + yi.abs();
    }
    if magnitude == 0.0 {
        return 0.0;
    }
    (distance / magnitude).clamp(0.0, 1.0)
}

/// `1 - mean divergence` over the targets. Unreachable targets (`None`)
/// count as fully divergent. No targets means nothing to converge.
pub fn convergence_score(source: &Agent, targets: &[Option<Agent>]) -> f64 {
    if targets.is_empty() {
        return 1.0;
    }
    let total: f64 = targets
        .iter()
        .map(|target| match target {
            Some(agent) => state_divergence(source, agent),
            None => 1.0,
        })
        .sum();
    (1.0 - total / targets.len() as f64).clamp(0.0, 1.0)
}

/// Reject empty or duplicated member lists.
pub fn validate_members(agent_ids: &[AgentId]) -> Result<(), CoordinationError> {
    if agent_ids.is_empty() {
        return Err(CoordinationError::Validation(
            "a mesh needs at least one member".to_string(),
        ));
    }
    let mut seen = BTreeSet::new();
    for id in agent_ids {
        if !seen.insert(id) {
            return Err(CoordinationError::Validation(format!(
                "agent {} listed twice",
                id
            )));
        }
    }
    Ok(())
}
