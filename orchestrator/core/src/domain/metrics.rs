// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Performance Metrics
//!
//! Value types owned by the performance governor: appended metric records,
//! operation categories with their latency budgets, and the per-category
//! report returned by the Metrics API.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;

/// Metric type prefix for latency observations that also feed the rolling
/// statistics, e.g. `latency_ms.spawn`.
pub const LATENCY_METRIC_PREFIX: &str = "latency_ms.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricId(pub Uuid);

impl MetricId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MetricId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    Spawn,
    Assign,
    Save,
    Load,
    Propagate,
    Restore,
    Recover,
}

impl OperationCategory {
    pub const ALL: [OperationCategory; 7] = [
        OperationCategory::Spawn,
        OperationCategory::Assign,
        OperationCategory::Save,
        OperationCategory::Load,
        OperationCategory::Propagate,
        OperationCategory::Restore,
        OperationCategory::Recover,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationCategory::Spawn => "spawn",
            OperationCategory::Assign => "assign",
            OperationCategory::Save => "save",
            OperationCategory::Load => "load",
            OperationCategory::Propagate => "propagate",
            OperationCategory::Restore => "restore",
            OperationCategory::Recover => "recover",
        }
    }

    pub fn latency_metric_type(self) -> String {
        format!("{}{}", LATENCY_METRIC_PREFIX, self.as_str())
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationCategory::ALL
            .iter()
            .copied()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| format!("unknown operation category: {}", s))
    }
}

/// Append-only metric record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub id: MetricId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub metric_type: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PerformanceMetric {
    pub fn new(metric_type: impl Into<String>, value: f64) -> Self {
        Self {
            id: MetricId::new(),
            agent_id: None,
            metric_type: metric_type.into(),
            value,
            recorded_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn latency(category: OperationCategory, elapsed: Duration) -> Self {
        Self::new(category.latency_metric_type(), elapsed.as_secs_f64() * 1000.0)
    }

    pub fn for_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The category fed by this metric, if it is a latency observation.
    pub fn latency_category(&self) -> Option<OperationCategory> {
        self.metric_type
            .strip_prefix(LATENCY_METRIC_PREFIX)
            .and_then(|name| name.parse().ok())
    }
}

/// Latency distribution for one category, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryReport {
    pub category: OperationCategory,
    pub samples: usize,
    pub average_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub baseline_ms: Option<f64>,
    pub regressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: Option<DateTime<Utc>>,
    pub categories: BTreeMap<OperationCategory, CategoryReport>,
}

impl PerformanceReport {
    pub fn category(&self, category: OperationCategory) -> Option<&CategoryReport> {
        self.categories.get(&category)
    }

    pub fn regressed_categories(&self) -> Vec<OperationCategory> {
        self.categories
            .values()
            .filter(|report| report.regressed)
            .map(|report| report.category)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_metric_category_round_trip() {
        let metric = PerformanceMetric::latency(OperationCategory::Propagate, Duration::from_millis(12));
        assert_eq!(metric.metric_type, "latency_ms.propagate");
        assert_eq!(metric.latency_category(), Some(OperationCategory::Propagate));
        assert!((metric.value - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_latency_metric_has_no_category() {
        assert_eq!(PerformanceMetric::new("accuracy", 0.9).latency_category(), None);
        assert_eq!(PerformanceMetric::new("latency_ms.bogus", 1.0).latency_category(), None);
    }
}
