// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod coordinator;
pub mod mesh_manager;
pub mod recovery;

pub use coordinator::SwarmCoordinator;
pub use mesh_manager::{KnowledgeTransport, LifecycleTransport, MeshTopologyManager, PropagationReport, SyncReport};
pub use recovery::{
    ContinuityWindow, FailureDetector, RecoveryController, RecoveryOutcome, RecoveryReport,
    ServiceContinuityTracker,
};
