//! Layered configuration: built-in defaults, optional YAML file, then
//! `COLLECTIVE__SECTION__KEY` environment overrides.

use std::path::Path;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Whether spent privacy budget ever returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BudgetPolicy {
    /// Spent epsilon accumulates for the node's lifetime.
    #[default]
    Lifetime,
    /// Spent epsilon resets once `period_secs` have passed since the period began.
    Periodic { period_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    pub default_timeout_secs: u64,
    pub min_participants: usize,
    pub sweep_interval_secs: u64,
}

impl Default for RoundConfig {
    fn default() -> Self { Self { default_timeout_secs: 300, min_participants: 1, sweep_interval_secs: 5 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub trim_fraction: f64,
    pub history_capacity: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self { Self { trim_fraction: 0.1, history_capacity: 100 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub default_max_epsilon: f64,
    pub default_delta: f64,
    /// L2 bound applied to every update; also the sensitivity used for noise calibration.
    pub clip_norm: f64,
    pub budget_policy: BudgetPolicy,
    /// Fixed seed for the noise generator; entropy-seeded when absent.
    pub noise_seed: Option<u64>,
}

impl Default for PrivacyConfig {
    fn default() -> Self { Self { default_max_epsilon: 10.0, default_delta: 1e-5, clip_norm: 1.0, budget_policy: BudgetPolicy::Lifetime, noise_seed: None } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub min_confidence: f64,
    pub transfer_quota: usize,
    pub transfer_window_secs: u64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self { Self { min_confidence: 0.5, transfer_quota: 10, transfer_window_secs: 3600 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectiveConfig {
    pub service_name: String,
    pub log_level: String,
    pub rounds: RoundConfig,
    pub aggregation: AggregationConfig,
    pub privacy: PrivacyConfig,
    pub knowledge: KnowledgeConfig,
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            service_name: "collective".into(),
            log_level: "info".into(),
            rounds: RoundConfig::default(),
            aggregation: AggregationConfig::default(),
            privacy: PrivacyConfig::default(),
            knowledge: KnowledgeConfig::default(),
        }
    }
}

impl CollectiveConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.rounds.default_timeout_secs > 0, "rounds.default_timeout_secs must be positive");
        ensure!(self.rounds.sweep_interval_secs > 0, "rounds.sweep_interval_secs must be positive");
        ensure!((0.0..=0.5).contains(&self.aggregation.trim_fraction), "aggregation.trim_fraction must lie in [0, 0.5]");
        ensure!(self.aggregation.history_capacity > 0, "aggregation.history_capacity must be positive");
        ensure!(self.privacy.default_max_epsilon > 0.0 && self.privacy.default_max_epsilon.is_finite(), "privacy.default_max_epsilon must be positive");
        ensure!(self.privacy.default_delta > 0.0 && self.privacy.default_delta < 1.0, "privacy.default_delta must lie in (0, 1)");
        ensure!(self.privacy.clip_norm > 0.0 && self.privacy.clip_norm.is_finite(), "privacy.clip_norm must be positive");
        if let BudgetPolicy::Periodic { period_secs } = self.privacy.budget_policy {
            ensure!(period_secs > 0, "privacy.budget_policy.period_secs must be positive");
        }
        ensure!((0.0..=1.0).contains(&self.knowledge.min_confidence), "knowledge.min_confidence must lie in [0, 1]");
        ensure!(self.knowledge.transfer_quota > 0, "knowledge.transfer_quota must be positive");
        ensure!(self.knowledge.transfer_window_secs > 0, "knowledge.transfer_window_secs must be positive");
        Ok(())
    }
}

/// Loads configuration for `service`, reading `COLLECTIVE_CONFIG_FILE` when set.
pub fn load_config(service: &str) -> Result<CollectiveConfig> {
    let file = std::env::var("COLLECTIVE_CONFIG_FILE").ok();
    load_config_from(service, file.as_deref().map(Path::new))
}

pub fn load_config_from(service: &str, file: Option<&Path>) -> Result<CollectiveConfig> {
    let mut builder = config::Config::builder().set_default("service_name", service)?;
    if let Some(path) = file {
        builder = builder.add_source(config::File::with_name(&path.to_string_lossy()).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("COLLECTIVE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );
    let cfg: CollectiveConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    info!(service = %cfg.service_name, file = ?file, "configuration loaded");
    Ok(cfg)
}
