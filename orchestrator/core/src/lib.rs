// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Synapse coordination core.
//!
//! Agent lifecycle, task orchestration, persistence and performance
//! governance for a swarm of learning agents.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model plus the application services and
//!   infrastructure adapters that the swarm crate composes

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
