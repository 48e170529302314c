// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Domain Layer
//!
//! Pure mesh math. No I/O dependencies.
//!
//! | Module | Key Items |
//! |--------|-----------|
//! | [`swarm`] | connection strength, topology construction, divergence, convergence |

pub mod swarm;

pub use swarm::*;
