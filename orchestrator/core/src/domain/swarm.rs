// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Session
//!
//! - [`SwarmId`] identifies a group of agents joined into one mesh.
//! - [`Topology`] decides which pairs get a connection.
//! - [`SwarmSession`] is the live record of a mesh, created by the mesh
//!   manager and destroyed only by an explicit teardown.
//!
//! Connection construction and scoring live with the mesh manager; this module
//! only holds the shared data so persistence can snapshot by swarm.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwarmId(pub Uuid);

impl SwarmId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SwarmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topology {
    /// Every pair of members is connected.
    Mesh,
    /// Star around the first listed member.
    Star,
    /// Star around a designated coordinator, which must be a member.
    Hierarchical { coordinator: AgentId },
}

/// Undirected, weighted link between two members. `a < b` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub a: AgentId,
    pub b: AgentId,
    pub strength: f64,
}

impl Connection {
    pub fn new(x: AgentId, y: AgentId, strength: f64) -> Self {
        let (a, b) = if x <= y { (x, y) } else { (y, x) };
        Self {
            a,
            b,
            strength: strength.clamp(0.0, 1.0),
        }
    }

    pub fn touches(&self, agent_id: &AgentId) -> bool {
        &self.a == agent_id || &self.b == agent_id
    }

    pub fn peer_of(&self, agent_id: &AgentId) -> Option<&AgentId> {
        if &self.a == agent_id {
            Some(&self.b)
        } else if &self.b == agent_id {
            Some(&self.a)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmSession {
    pub swarm_id: SwarmId,
    pub topology: Topology,
    pub member_agent_ids: BTreeSet<AgentId>,
    pub connections: Vec<Connection>,
    /// Derived: mean connection strength times mean member learning progress.
    pub coordination_efficiency: f64,
    pub created_at: DateTime<Utc>,
}

impl SwarmSession {
    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.member_agent_ids.contains(agent_id)
    }

    pub fn peers_of(&self, agent_id: &AgentId) -> Vec<AgentId> {
        self.connections
            .iter()
            .filter_map(|c| c.peer_of(agent_id).cloned())
            .collect()
    }

    pub fn mean_connection_strength(&self) -> f64 {
        if self.connections.is_empty() {
            return 0.0;
        }
        self.connections.iter().map(|c| c.strength).sum::<f64>() / self.connections.len() as f64
    }
}
