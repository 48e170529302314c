// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Coordinator Configuration - Kubernetes-style manifest
//
// Defines the configuration schema for a Synapse coordinator:
// - apiVersion/kind/metadata/spec manifest envelope
// - Latency budgets and timeouts (human-readable durations)
// - Orchestration, mesh, persistence and failure detection tuning
// - Performance governor and event bus sizing

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::domain::repository::StorageBackend;
use crate::domain::task::OrchestrationStrategy;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "CoordinatorConfig";
pub const CONFIG_PATH_ENV: &str = "SYNAPSE_CONFIG_PATH";
const DEFAULT_CONFIG_FILE: &str = "./synapse-config.yaml";

/// Top-level coordinator configuration manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "CoordinatorConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: CoordinatorConfigSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfigSpec {
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub failure_detector: FailureDetectorConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Soft latency budget for a full spawn (SPAWNING -> ACTIVE, persisted)
    #[serde(default = "default_spawn_budget", with = "humantime_serde")]
    pub spawn_budget: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            spawn_budget: default_spawn_budget(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub strategy: OrchestrationStrategy,

    /// Upper bound on concurrently running tasks in parallel mode
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: OrchestrationStrategy::default(),
            concurrency_limit: default_concurrency_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Mesh-wide wait for target acknowledgements
    #[serde(default = "default_propagation_timeout", with = "humantime_serde")]
    pub propagation_timeout: Duration,

    /// Convergence below this is reported as degraded propagation
    #[serde(default = "default_min_convergence")]
    pub min_convergence: f64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            propagation_timeout: default_propagation_timeout(),
            min_convergence: default_min_convergence(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[default]
    InMemory,
    Filesystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,

    /// Root directory for the filesystem backend
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl PersistenceConfig {
    pub fn storage_backend(&self) -> StorageBackend {
        match self.backend {
            StorageBackendKind::InMemory => StorageBackend::InMemory,
            StorageBackendKind::Filesystem => StorageBackend::FileSystem {
                data_dir: self.data_dir.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetectorConfig {
    /// Agents silent for longer than this are marked FAILED
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    #[serde(default = "default_scan_interval", with = "humantime_serde")]
    pub scan_interval: Duration,

    /// Recover newly failed agents from the liveness monitor
    #[serde(default)]
    pub auto_recover: bool,

    /// Recovery must finish within this multiple of the spawn budget
    #[serde(default = "default_recovery_budget_multiplier")]
    pub recovery_budget_multiplier: f64,

    /// Restores scoring below this are flagged degraded
    #[serde(default = "default_restore_continuity_threshold")]
    pub restore_continuity_threshold: f64,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: default_heartbeat_timeout(),
            scan_interval: default_scan_interval(),
            auto_recover: false,
            recovery_budget_multiplier: default_recovery_budget_multiplier(),
            restore_continuity_threshold: default_restore_continuity_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Rolling window size per operation category
    #[serde(default = "default_window")]
    pub window: usize,

    #[serde(default = "default_bootstrap_multiplier")]
    pub bootstrap_multiplier: f64,

    /// Fraction above baseline that counts as a regression
    #[serde(default = "default_regression_threshold")]
    pub regression_threshold: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            bootstrap_multiplier: default_bootstrap_multiplier(),
            regression_threshold: default_regression_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_event_bus_capacity")]
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_bus_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Fallback filter when RUST_LOG is unset (e.g., "info", "synapse_core=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// Default value functions
fn default_spawn_budget() -> Duration {
    Duration::from_millis(75)
}

fn default_concurrency_limit() -> usize {
    4
}

fn default_propagation_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_min_convergence() -> f64 {
    0.5
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./synapse-data")
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(5)
}

/// Recovery may take at most this many spawn budgets.
const MAX_RECOVERY_BUDGET_MULTIPLIER: f64 = 100.0;

fn default_recovery_budget_multiplier() -> f64 {
    1.5
}

fn default_restore_continuity_threshold() -> f64 {
    0.9
}

fn default_window() -> usize {
    100
}

fn default_bootstrap_multiplier() -> f64 {
    2.0
}

fn default_regression_threshold() -> f64 {
    0.2
}

fn default_event_bus_capacity() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CoordinatorConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "synapse-coordinator".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: CoordinatorConfigSpec::default(),
        }
    }
}

impl CoordinatorConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {:?}", path))?;
        Self::from_yaml_str(&content).with_context(|| format!("Failed to parse config at {:?}", path))
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. SYNAPSE_CONFIG_PATH environment variable
    /// 2. ./synapse-config.yaml (working directory)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!("{} points at missing file {:?}", CONFIG_PATH_ENV, path);
        }

        let cwd = PathBuf::from(DEFAULT_CONFIG_FILE);
        if cwd.exists() {
            return Some(cwd);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(explicit_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path must exist and parse
        let mut config = if let Some(path) = explicit_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)?
        } else if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            Self::from_yaml_file(config_path)?
        } else {
            tracing::info!("No configuration file found. Using defaults.");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply SYNAPSE_* environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(budget) = env_duration("SYNAPSE_SPAWN_BUDGET") {
            self.spec.lifecycle.spawn_budget = budget;
        }
        if let Some(timeout) = env_duration("SYNAPSE_HEARTBEAT_TIMEOUT") {
            self.spec.failure_detector.heartbeat_timeout = timeout;
        }
        if let Some(timeout) = env_duration("SYNAPSE_PROPAGATION_TIMEOUT") {
            self.spec.mesh.propagation_timeout = timeout;
        }
        if let Ok(val) = std::env::var("SYNAPSE_CONCURRENCY_LIMIT") {
            match val.parse() {
                Ok(limit) => {
                    tracing::info!("Environment override: SYNAPSE_CONCURRENCY_LIMIT={}", limit);
                    self.spec.orchestrator.concurrency_limit = limit;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for SYNAPSE_CONCURRENCY_LIMIT: '{}'. Ignoring.",
                    val
                ),
            }
        }
        if let Ok(val) = std::env::var("SYNAPSE_STORAGE_BACKEND") {
            match val.to_lowercase().as_str() {
                "in_memory" | "memory" => self.spec.persistence.backend = StorageBackendKind::InMemory,
                "filesystem" | "fs" => self.spec.persistence.backend = StorageBackendKind::Filesystem,
                _ => tracing::warn!(
                    "Invalid value for SYNAPSE_STORAGE_BACKEND: '{}'. Expected in_memory/filesystem. Ignoring.",
                    val
                ),
            }
        }
        if let Ok(val) = std::env::var("SYNAPSE_DATA_DIR") {
            tracing::info!("Environment override: SYNAPSE_DATA_DIR={}", val);
            self.spec.persistence.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SYNAPSE_AUTO_RECOVER") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => self.spec.failure_detector.auto_recover = true,
                "false" | "0" | "no" | "off" => self.spec.failure_detector.auto_recover = false,
                _ => tracing::warn!(
                    "Invalid value for SYNAPSE_AUTO_RECOVER: '{}'. Expected true/false. Ignoring.",
                    val
                ),
            }
        }
        if let Ok(val) = std::env::var("SYNAPSE_LOG_LEVEL") {
            self.spec.logging.level = val;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.lifecycle.spawn_budget.is_zero() {
            anyhow::bail!("spec.lifecycle.spawn_budget must be greater than zero");
        }
        if spec.orchestrator.concurrency_limit == 0 {
            anyhow::bail!("spec.orchestrator.concurrency_limit must be at least 1");
        }
        if spec.mesh.propagation_timeout.is_zero() {
            anyhow::bail!("spec.mesh.propagation_timeout must be greater than zero");
        }
        if !(0.0..=1.0).contains(&spec.mesh.min_convergence) {
            anyhow::bail!("spec.mesh.min_convergence must be within [0, 1]");
        }
        if spec.failure_detector.heartbeat_timeout.is_zero() {
            anyhow::bail!("spec.failure_detector.heartbeat_timeout must be greater than zero");
        }
        if spec.failure_detector.scan_interval.is_zero() {
            anyhow::bail!("spec.failure_detector.scan_interval must be greater than zero");
        }
        let multiplier = spec.failure_detector.recovery_budget_multiplier;
        if !multiplier.is_finite() || multiplier <= 0.0 || multiplier > MAX_RECOVERY_BUDGET_MULTIPLIER {
            anyhow::bail!(
                "spec.failure_detector.recovery_budget_multiplier must be within (0, {}]",
                MAX_RECOVERY_BUDGET_MULTIPLIER
            );
        }
        if !(0.0..=1.0).contains(&spec.failure_detector.restore_continuity_threshold) {
            anyhow::bail!("spec.failure_detector.restore_continuity_threshold must be within [0, 1]");
        }
        if spec.governor.window == 0 {
            anyhow::bail!("spec.governor.window must be at least 1");
        }
        if !spec.governor.bootstrap_multiplier.is_finite() || spec.governor.bootstrap_multiplier < 1.0 {
            anyhow::bail!("spec.governor.bootstrap_multiplier must be at least 1.0");
        }
        if !spec.governor.regression_threshold.is_finite() || spec.governor.regression_threshold < 0.0 {
            anyhow::bail!("spec.governor.regression_threshold must be a finite, non-negative number");
        }
        if spec.event_bus.capacity == 0 {
            anyhow::bail!("spec.event_bus.capacity must be at least 1");
        }

        Ok(())
    }

    /// Recovery deadline derived from the spawn budget. An unusable
    /// multiplier (unvalidated manifests) falls back to the default.
    pub fn recovery_budget(&self) -> Duration {
        let spawn_budget = self.spec.lifecycle.spawn_budget;
        let configured = self.spec.failure_detector.recovery_budget_multiplier;
        let multiplier = if configured.is_finite() && configured > 0.0 && configured <= MAX_RECOVERY_BUDGET_MULTIPLIER {
            configured
        } else {
            default_recovery_budget_multiplier()
        };
        Duration::try_from_secs_f64(spawn_budget.as_secs_f64() * multiplier).unwrap_or(spawn_budget)
    }
}

fn env_duration(name: &str) -> Option<Duration> {
    let val = std::env::var(name).ok()?;
    match humantime_serde::re::humantime::parse_duration(&val) {
        Ok(duration) => {
            tracing::info!("Environment override: {}={}", name, val);
            Some(duration)
        }
        Err(e) => {
            tracing::warn!("Invalid duration for {}: '{}' ({}). Ignoring.", name, val, e);
            None
        }
    }
}
