// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Performance Governor
//!
//! Observes the latency of every coordinated operation, keeps a rolling window
//! and a baseline per [`OperationCategory`], and raises two kinds of soft
//! signal:
//!
//! - **budget exceeded**: a single observation took longer than the
//!   category's configured budget;
//! - **regression**: the rolling average rose above the baseline by more
//!   than the regression threshold.
//!
//! Signals are logged, counted through the `metrics` facade and published on
//! the event bus. They are never returned as errors.
//!
//! The first observation of a category bootstraps its baseline at
//! `bootstrap_multiplier` times that observation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::clock::Clock;
use crate::domain::config::GovernorConfig;
use crate::domain::error::CoordinationError;
use crate::domain::events::PerformanceEvent;
use crate::domain::metrics::{CategoryReport, OperationCategory, PerformanceMetric, PerformanceReport};
use crate::domain::repository::PersistenceStore;
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Default)]
struct CategoryWindow {
    samples: VecDeque<f64>,
    baseline_ms: Option<f64>,
    regressed: bool,
}

impl CategoryWindow {
    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionSignal {
    pub category: OperationCategory,
    pub rolling_average_ms: f64,
    pub baseline_ms: f64,
}

/// Outcome of one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub category: OperationCategory,
    pub elapsed_ms: f64,
    pub budget_exceeded: bool,
    /// Present only on the observation that tipped the category into
    /// regression.
    pub regression: Option<RegressionSignal>,
}

pub struct PerformanceGovernor {
    config: GovernorConfig,
    windows: Mutex<BTreeMap<OperationCategory, CategoryWindow>>,
    budgets: RwLock<HashMap<OperationCategory, Duration>>,
    store: Arc<dyn PersistenceStore>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl PerformanceGovernor {
    pub fn new(
        config: GovernorConfig,
        store: Arc<dyn PersistenceStore>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            windows: Mutex::new(BTreeMap::new()),
            budgets: RwLock::new(HashMap::new()),
            store,
            event_bus,
            clock,
        }
    }

    pub fn set_budget(&self, category: OperationCategory, budget: Duration) {
        self.budgets.write().insert(category, budget);
    }

    pub fn budget(&self, category: OperationCategory) -> Option<Duration> {
        self.budgets.read().get(&category).copied()
    }

    pub fn baseline(&self, category: OperationCategory) -> Option<f64> {
        self.windows.lock().get(&category).and_then(|w| w.baseline_ms)
    }

    pub fn is_regressed(&self, category: OperationCategory) -> bool {
        self.windows
            .lock()
            .get(&category)
            .map(|w| w.regressed)
            .unwrap_or(false)
    }

    /// Record one latency observation.
    pub fn observe(&self, category: OperationCategory, elapsed: Duration) -> Observation {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        metrics::histogram!("synapse_operation_duration_ms", "category" => category.as_str())
            .record(elapsed_ms);

        let regression = {
            let mut windows = self.windows.lock();
            let window = windows.entry(category).or_default();
            window.samples.push_back(elapsed_ms);
            while window.samples.len() > self.config.window {
                window.samples.pop_front();
            }
            let baseline_ms = *window
                .baseline_ms
                .get_or_insert(elapsed_ms * self.config.bootstrap_multiplier);
            let rolling_average_ms = window.average();
            let regressed_now = rolling_average_ms > baseline_ms * (1.0 + self.config.regression_threshold);
            let tipped = regressed_now && !window.regressed;
            window.regressed = regressed_now;
            tipped.then_some(RegressionSignal {
                category,
                rolling_average_ms,
                baseline_ms,
            })
        };

        let budget_exceeded = match self.budget(category) {
            Some(budget) if elapsed > budget => {
                let budget_ms = budget.as_secs_f64() * 1000.0;
                warn!(category = %category, elapsed_ms, budget_ms, "Operation exceeded its latency budget");
                metrics::counter!("synapse_budget_exceeded_total", "category" => category.as_str())
                    .increment(1);
                self.event_bus
                    .publish_performance_event(PerformanceEvent::BudgetExceeded {
                        category,
                        elapsed_ms,
                        budget_ms,
                        observed_at: self.clock.now(),
                    });
                true
            }
            _ => false,
        };

        if let Some(signal) = &regression {
            warn!(
                category = %category,
                rolling_average_ms = signal.rolling_average_ms,
                baseline_ms = signal.baseline_ms,
                "Performance regression detected"
            );
            metrics::counter!("synapse_regressions_total", "category" => category.as_str()).increment(1);
            self.event_bus
                .publish_performance_event(PerformanceEvent::RegressionDetected {
                    category,
                    rolling_average_ms: signal.rolling_average_ms,
                    baseline_ms: signal.baseline_ms,
                    detected_at: self.clock.now(),
                });
        }

        Observation {
            category,
            elapsed_ms,
            budget_exceeded,
            regression,
        }
    }

    /// Await `work` and observe how long it took.
    pub async fn timed<T, F>(&self, category: OperationCategory, work: F) -> (T, Observation)
    where
        F: Future<Output = T>,
    {
        let started = Instant::now();
        let output = work.await;
        let observation = self.observe(category, started.elapsed());
        (output, observation)
    }

    /// Append a metric. Latency metrics (`latency_ms.<category>`) also feed
    /// the rolling statistics.
    pub async fn record_metric(&self, metric: PerformanceMetric) -> Result<(), CoordinationError> {
        if !metric.value.is_finite() {
            return Err(CoordinationError::Validation(format!(
                "metric {} has a non-finite value",
                metric.metric_type
            )));
        }
        let latency = match metric.latency_category() {
            Some(category) => {
                let elapsed = Duration::try_from_secs_f64(metric.value / 1000.0).map_err(|_| {
                    CoordinationError::Validation(format!(
                        "latency metric {} must be a non-negative duration, got {}",
                        metric.metric_type, metric.value
                    ))
                })?;
                Some((category, elapsed))
            }
            None => None,
        };

        self.store.append_metric(&metric).await?;
        debug!(metric_type = %metric.metric_type, value = metric.value, "Recorded metric");

        if let Some((category, elapsed)) = latency {
            self.observe(category, elapsed);
        }
        Ok(())
    }

    /// Reset a category's baseline to its current rolling average.
    pub fn rebaseline(&self, category: OperationCategory) -> Option<f64> {
        let mut windows = self.windows.lock();
        let window = windows.get_mut(&category)?;
        if window.samples.is_empty() {
            return None;
        }
        let average = window.average();
        window.baseline_ms = Some(average);
        window.regressed = false;
        Some(average)
    }

    pub fn report(&self) -> PerformanceReport {
        let windows = self.windows.lock();
        let budgets = self.budgets.read();
        let categories = windows
            .iter()
            .filter(|(_, window)| !window.samples.is_empty())
            .map(|(category, window)| {
                let mut sorted: Vec<f64> = window.samples.iter().copied().collect();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let report = CategoryReport {
                    category: *category,
                    samples: sorted.len(),
                    average_ms: window.average(),
                    p50_ms: percentile(&sorted, 50.0),
                    p95_ms: percentile(&sorted, 95.0),
                    p99_ms: percentile(&sorted, 99.0),
                    min_ms: sorted[0],
                    max_ms: sorted[sorted.len() - 1],
                    baseline_ms: window.baseline_ms,
                    regressed: window.regressed,
                    budget_ms: budgets.get(category).map(|b| b.as_secs_f64() * 1000.0),
                };
                (*category, report)
            })
            .collect();

        PerformanceReport {
            generated_at: Some(self.clock.now()),
            categories,
        }
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::PerformanceEvent;
    use crate::infrastructure::clock::SystemClock;
    use crate::infrastructure::event_bus::DomainEvent;
    use crate::infrastructure::repositories::InMemoryPersistenceStore;

    fn governor(bus: EventBus) -> PerformanceGovernor {
        PerformanceGovernor::new(
            GovernorConfig::default(),
            Arc::new(InMemoryPersistenceStore::new()),
            bus,
            Arc::new(SystemClock),
        )
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_first_observation_bootstraps_baseline() {
        let governor = governor(EventBus::new(16));
        governor.observe(OperationCategory::Spawn, ms(10));
        assert_eq!(governor.baseline(OperationCategory::Spawn), Some(20.0));
    }

    #[test]
    fn test_regression_is_flagged_once_and_published() {
        let bus = EventBus::new(64);
        let mut receiver = bus.subscribe();
        let governor = governor(bus);

        // baseline 20ms, regression above 24ms average
        governor.observe(OperationCategory::Save, ms(10));
        assert!(governor.observe(OperationCategory::Save, ms(30)).regression.is_none());
        let tipped = governor.observe(OperationCategory::Save, ms(50));
        assert!(tipped.regression.is_some());
        assert!(governor.observe(OperationCategory::Save, ms(60)).regression.is_none());
        assert!(governor.is_regressed(OperationCategory::Save));

        let regressions = receiver
            .drain()
            .into_iter()
            .filter(|e| matches!(e, DomainEvent::Performance(PerformanceEvent::RegressionDetected { .. })))
            .count();
        assert_eq!(regressions, 1);
    }

    #[test]
    fn test_budget_overrun_is_soft() {
        let governor = governor(EventBus::new(16));
        governor.set_budget(OperationCategory::Spawn, ms(75));
        assert!(!governor.observe(OperationCategory::Spawn, ms(40)).budget_exceeded);
        assert!(governor.observe(OperationCategory::Spawn, ms(90)).budget_exceeded);
    }

    #[test]
    fn test_rolling_window_is_bounded() {
        let mut config = GovernorConfig::default();
        config.window = 3;
        let governor = PerformanceGovernor::new(
            config,
            Arc::new(InMemoryPersistenceStore::new()),
            EventBus::new(16),
            Arc::new(SystemClock),
        );
        for v in [1, 2, 3, 4, 5] {
            governor.observe(OperationCategory::Load, ms(v));
        }
        let report = governor.report();
        let load = report.category(OperationCategory::Load).unwrap();
        assert_eq!(load.samples, 3);
        assert_eq!(load.min_ms, 3.0);
        assert_eq!(load.max_ms, 5.0);
    }

    #[test]
    fn test_percentiles_nearest_rank() {
        let governor = governor(EventBus::new(16));
        for v in 1..=100 {
            governor.observe(OperationCategory::Assign, ms(v));
        }
        let report = governor.report();
        let assign = report.category(OperationCategory::Assign).unwrap();
        assert_eq!(assign.p50_ms, 50.0);
        assert_eq!(assign.p95_ms, 95.0);
        assert_eq!(assign.p99_ms, 99.0);
        assert!((assign.average_ms - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_rebaseline_clears_regression() {
        let governor = governor(EventBus::new(16));
        governor.observe(OperationCategory::Propagate, ms(1));
        governor.observe(OperationCategory::Propagate, ms(100));
        assert!(governor.is_regressed(OperationCategory::Propagate));
        let baseline = governor.rebaseline(OperationCategory::Propagate).unwrap();
        assert!((baseline - 50.5).abs() < 1e-9);
        assert!(!governor.is_regressed(OperationCategory::Propagate));
        assert_eq!(governor.rebaseline(OperationCategory::Recover), None);
    }

    #[tokio::test]
    async fn test_latency_metric_feeds_statistics() {
        let governor = governor(EventBus::new(16));
        governor
            .record_metric(PerformanceMetric::new("latency_ms.restore", 12.0))
            .await
            .unwrap();
        governor
            .record_metric(PerformanceMetric::new("accuracy", 0.9))
            .await
            .unwrap();
        assert_eq!(governor.baseline(OperationCategory::Restore), Some(24.0));
        assert_eq!(governor.report().categories.len(), 1);
        assert!(governor
            .record_metric(PerformanceMetric::new("latency_ms.restore", f64::NAN))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_oversized_latency_is_rejected() {
        let governor = governor(EventBus::new(16));
        let err = governor
            .record_metric(PerformanceMetric::new("latency_ms.spawn", 1e300))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(_)));
        assert!(governor
            .record_metric(PerformanceMetric::new("latency_ms.spawn", -1.0))
            .await
            .is_err());
        assert!(governor.report().category(OperationCategory::Spawn).is_none());

        // Non-latency metrics carry arbitrary finite values.
        governor
            .record_metric(PerformanceMetric::new("throughput", 1e300))
            .await
            .unwrap();
    }
}
