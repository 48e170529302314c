// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `synapse-swarm`: Mesh, Recovery and the Coordinator Facade
//!
//! Connects agents into swarm sessions, moves learned state between them, and
//! rebuilds agents that stop responding.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | connection strength, topology construction, divergence and convergence math |
//! | [`application`] | Application | `MeshTopologyManager`, `FailureDetector`, `RecoveryController`, `SwarmCoordinator` |
//!
//! ## Key Concepts
//!
//! - **Swarm session**: a set of member agents plus the weighted connections
//!   its topology (mesh, star, hierarchical) implies.
//! - **Propagation**: fan-out of a knowledge payload from one source to many
//!   targets, recorded per target and scored by convergence.
//! - **Recovery**: a failed agent is rebuilt as `recovery-<id>` from its most
//!   recent persisted state and takes its place in every session.
//!
//! Agent lifecycle, tasks, persistence and performance tracking live in
//! `synapse_core`; [`application::SwarmCoordinator`] binds the two crates.

pub mod application;
pub mod domain;

pub use application::SwarmCoordinator;
pub use domain::*;
