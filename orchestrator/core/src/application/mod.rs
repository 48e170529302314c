// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent;
pub mod deadline;
pub mod governor;
pub mod lifecycle;
pub mod orchestrator;
pub mod persistence;

// Re-export services for convenience
pub use agent::{AgentLifecycleService, SyncResolution};
pub use deadline::{run_with_deadline, Deadline};
pub use governor::{Observation, PerformanceGovernor, RegressionSignal};
pub use lifecycle::StandardAgentLifecycleService;
pub use orchestrator::{CancelOutcome, InferenceExecutor, OrchestrationReport, TaskExecutor, TaskOrchestrator};
pub use persistence::{PersistenceService, RestoreReport, RestoredSession};
