// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain model for swarm coordination.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Aggregates, value objects and the contracts implemented by
//!   infrastructure (storage engine, compute engine, clock)

pub mod agent;
pub mod blob;
pub mod clock;
pub mod compute;
pub mod config;
pub mod error;
pub mod events;
pub mod knowledge;
pub mod metrics;
pub mod repository;
pub mod snapshot;
pub mod swarm;
pub mod task;
