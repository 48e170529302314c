// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Deadlines for externally visible operations.
//!
//! Two flavours:
//!
//! - [`run_with_deadline`] for idempotent work (propagate, restore, recover).
//!   The work runs as its own task; when the deadline passes the caller gets
//!   `Timeout` and the task keeps going in the background.
//! - [`Deadline`] for non-idempotent work (spawn), which checks it at
//!   cooperative checkpoints and abandons the operation there. Nothing is
//!   interrupted mid-write.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::domain::error::CoordinationError;

pub async fn run_with_deadline<T, F>(
    operation: &'static str,
    deadline: Option<Duration>,
    work: F,
) -> Result<T, CoordinationError>
where
    F: Future<Output = Result<T, CoordinationError>> + Send + 'static,
    T: Send + 'static,
{
    let Some(limit) = deadline else {
        return work.await;
    };

    let handle = tokio::spawn(work);
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(CoordinationError::Internal(format!(
            "{} task aborted: {}",
            operation, join_error
        ))),
        Err(_) => {
            warn!(operation, deadline_ms = limit.as_millis() as u64, "Deadline exceeded; completing in background");
            Err(CoordinationError::Timeout {
                operation,
                deadline: limit,
            })
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    operation: &'static str,
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub fn new(operation: &'static str, limit: Option<Duration>) -> Self {
        Self {
            operation,
            started: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.limit, Some(limit) if self.started.elapsed() >= limit)
    }

    /// Checkpoint: `Err(Timeout)` once the limit has passed.
    pub fn check(&self) -> Result<(), CoordinationError> {
        match self.limit {
            Some(limit) if self.started.elapsed() >= limit => Err(CoordinationError::Timeout {
                operation: self.operation,
                deadline: limit,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_work_finishes_in_background() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();

        let result = run_with_deadline("propagate", Some(Duration::from_millis(10)), async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(CoordinationError::Timeout { operation: "propagate", .. })));
        assert!(!done.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_no_deadline_runs_inline() {
        let value = run_with_deadline("restore", None, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_checkpoint() {
        let deadline = Deadline::new("spawn", Some(Duration::from_millis(5)));
        assert!(deadline.check().is_ok());
        tokio::time::advance(Duration::from_millis(6)).await;
        assert!(deadline.is_expired());
        assert!(deadline.check().unwrap_err().is_timeout());

        let unbounded = Deadline::new("spawn", None);
        assert!(unbounded.check().is_ok());
    }
}
