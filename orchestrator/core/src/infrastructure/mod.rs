// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod clock;
pub mod compute;
pub mod event_bus;
pub mod repositories;
pub mod telemetry;

pub use clock::{ManualClock, SystemClock};
pub use compute::ActivationComputeEngine;
pub use event_bus::{DomainEvent, EventBus, EventBusError, EventReceiver};
pub use repositories::{create_persistence_store, FileSystemPersistenceStore, InMemoryPersistenceStore};
