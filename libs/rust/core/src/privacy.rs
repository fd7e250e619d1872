//! Differential privacy: L2 clipping, Gaussian noise calibration and
//! per-node epsilon accounting.
//!
//! Every budget entry owns its own mutex, so charges against one node are
//! serialized while charges against different nodes never contend. Charges
//! are irreversible: once a node has paid for a noised release, the cost
//! stays spent even if the aggregation that requested it later fails.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::BudgetPolicy;
use crate::error::{CollectiveError, Result};
use crate::metrics::COLLECTIVE_METRICS;
use crate::types::{NodeId, WeightMap};

// A few ulps of the ceiling: enough for `0.1 + 0.2` to land on a 0.3 budget, no more.
const ROUNDING_ULPS: f64 = 4.0;

fn rounding_slack(max_epsilon: f64) -> f64 { max_epsilon * f64::EPSILON * ROUNDING_ULPS }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudgetEntry {
    pub node_id: NodeId,
    pub max_epsilon: f64,
    pub spent_epsilon: f64,
    pub delta: f64,
    pub period_started_at: i64,
}

impl PrivacyBudgetEntry {
    pub fn remaining(&self) -> f64 { (self.max_epsilon - self.spent_epsilon).max(0.0) }
}

pub fn l2_norm(values: &[f64]) -> f64 { values.iter().map(|v| v * v).sum::<f64>().sqrt() }

/// Rescales `values` so their L2 norm does not exceed `max_norm`.
pub fn clip(values: &[f64], max_norm: f64) -> Result<Vec<f64>> {
    if !(max_norm.is_finite() && max_norm > 0.0) {
        return Err(CollectiveError::InvalidPrivacyParameters(format!("max_norm must be positive, got {max_norm}")));
    }
    let norm = l2_norm(values);
    if norm <= max_norm {
        return Ok(values.to_vec());
    }
    let scale = max_norm / norm;
    Ok(values.iter().map(|v| v * scale).collect())
}

/// [`clip`] applied to a weight map treated as one vector.
pub fn clip_weights(weights: &WeightMap, max_norm: f64) -> Result<WeightMap> {
    let values: Vec<f64> = weights.values().copied().collect();
    let clipped = clip(&values, max_norm)?;
    Ok(weights.keys().cloned().zip(clipped).collect())
}

/// Gaussian mechanism: σ = sensitivity · √(2 ln(1.25/δ)) / ε.
pub fn gaussian_sigma(sensitivity: f64, epsilon: f64, delta: f64) -> Result<f64> {
    if !(epsilon.is_finite() && epsilon > 0.0) {
        return Err(CollectiveError::InvalidPrivacyParameters(format!("epsilon must be positive, got {epsilon}")));
    }
    if !(delta > 0.0 && delta < 1.0) {
        return Err(CollectiveError::InvalidPrivacyParameters(format!("delta must lie in (0, 1), got {delta}")));
    }
    if !(sensitivity.is_finite() && sensitivity >= 0.0) {
        return Err(CollectiveError::InvalidPrivacyParameters(format!("sensitivity must be non-negative, got {sensitivity}")));
    }
    Ok(sensitivity * (2.0 * (1.25 / delta).ln()).sqrt() / epsilon)
}

pub fn add_gaussian_noise<R: Rng + ?Sized>(values: &[f64], sensitivity: f64, epsilon: f64, delta: f64, rng: &mut R) -> Result<Vec<f64>> {
    let sigma = gaussian_sigma(sensitivity, epsilon, delta)?;
    let normal = Normal::new(0.0, sigma).map_err(|e| CollectiveError::InvalidPrivacyParameters(e.to_string()))?;
    Ok(values.iter().map(|v| v + normal.sample(rng)).collect())
}

pub fn add_gaussian_noise_to_weights<R: Rng + ?Sized>(weights: &WeightMap, sensitivity: f64, epsilon: f64, delta: f64, rng: &mut R) -> Result<WeightMap> {
    let values: Vec<f64> = weights.values().copied().collect();
    let noisy = add_gaussian_noise(&values, sensitivity, epsilon, delta, rng)?;
    Ok(weights.keys().cloned().zip(noisy).collect())
}

pub struct PrivacyLedger {
    policy: BudgetPolicy,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<NodeId, Arc<Mutex<PrivacyBudgetEntry>>>>,
}

impl PrivacyLedger {
    pub fn new(policy: BudgetPolicy, clock: Arc<dyn Clock>) -> Self { Self { policy, clock, entries: RwLock::new(HashMap::new()) } }

    /// Creates a budget entry. Returns `false` and leaves the existing entry
    /// untouched when the node already has one.
    pub fn register_node(&self, node_id: &str, max_epsilon: f64, delta: f64) -> Result<bool> {
        if !(max_epsilon.is_finite() && max_epsilon > 0.0) {
            return Err(CollectiveError::InvalidPrivacyParameters(format!("max_epsilon must be positive, got {max_epsilon}")));
        }
        if !(delta > 0.0 && delta < 1.0) {
            return Err(CollectiveError::InvalidPrivacyParameters(format!("delta must lie in (0, 1), got {delta}")));
        }
        let mut entries = self.entries.write();
        if entries.contains_key(node_id) {
            debug!(node_id, "privacy budget already present, keeping spent epsilon");
            return Ok(false);
        }
        let entry = PrivacyBudgetEntry { node_id: node_id.to_string(), max_epsilon, spent_epsilon: 0.0, delta, period_started_at: self.clock.now_ms() };
        entries.insert(node_id.to_string(), Arc::new(Mutex::new(entry)));
        info!(node_id, max_epsilon, delta, "privacy budget registered");
        Ok(true)
    }

    /// Spends `epsilon` from the node's budget. No refunds.
    ///
    /// A charge that overshoots the ceiling only by float rounding (a few ulps
    /// of `max_epsilon`) is accepted and recorded as exactly `max_epsilon`. Any
    /// larger overshoot is rejected, so `spent_epsilon` never exceeds the maximum.
    pub fn charge(&self, node_id: &str, epsilon: f64) -> Result<f64> {
        validate_epsilon(epsilon)?;
        let handle = self.handle(node_id)?;
        let mut entry = handle.lock();
        self.roll_period(&mut entry);
        let next = entry.spent_epsilon + epsilon;
        let slack = rounding_slack(entry.max_epsilon);
        if next > entry.max_epsilon + slack {
            COLLECTIVE_METRICS.privacy.budget_rejections_total.add(1, &[]);
            warn!(node_id, requested = epsilon, remaining = entry.remaining(), "privacy budget exceeded");
            return Err(exceeded(&entry, epsilon));
        }
        entry.spent_epsilon = if entry.max_epsilon - next <= slack { entry.max_epsilon } else { next };
        COLLECTIVE_METRICS.privacy.charges_total.add(1, &[]);
        COLLECTIVE_METRICS.privacy.epsilon_spent_total.add(epsilon, &[]);
        debug!(node_id, epsilon, spent = entry.spent_epsilon, "privacy budget charged");
        Ok(entry.remaining())
    }

    /// Checks that `epsilon` is affordable right now without spending it.
    pub fn ensure_affordable(&self, node_id: &str, epsilon: f64) -> Result<()> {
        validate_epsilon(epsilon)?;
        let handle = self.handle(node_id)?;
        let mut entry = handle.lock();
        self.roll_period(&mut entry);
        if entry.spent_epsilon + epsilon > entry.max_epsilon + rounding_slack(entry.max_epsilon) {
            return Err(exceeded(&entry, epsilon));
        }
        Ok(())
    }

    pub fn remaining(&self, node_id: &str) -> Result<f64> { self.entry(node_id).map(|e| e.remaining()) }

    pub fn entry(&self, node_id: &str) -> Result<PrivacyBudgetEntry> {
        let handle = self.handle(node_id)?;
        let mut entry = handle.lock();
        self.roll_period(&mut entry);
        Ok(entry.clone())
    }

    pub fn budgets(&self) -> BTreeMap<NodeId, PrivacyBudgetEntry> {
        let handles: Vec<Arc<Mutex<PrivacyBudgetEntry>>> = self.entries.read().values().cloned().collect();
        handles
            .into_iter()
            .map(|h| {
                let mut entry = h.lock();
                self.roll_period(&mut entry);
                (entry.node_id.clone(), entry.clone())
            })
            .collect()
    }

    fn handle(&self, node_id: &str) -> Result<Arc<Mutex<PrivacyBudgetEntry>>> {
        self.entries.read().get(node_id).cloned().ok_or_else(|| CollectiveError::UnknownParticipant(node_id.to_string()))
    }

    fn roll_period(&self, entry: &mut PrivacyBudgetEntry) {
        if let BudgetPolicy::Periodic { period_secs } = self.policy {
            let now = self.clock.now_ms();
            if now - entry.period_started_at >= (period_secs as i64).saturating_mul(1000) {
                if entry.spent_epsilon > 0.0 {
                    info!(node_id = %entry.node_id, spent = entry.spent_epsilon, "privacy budget period rolled over");
                }
                entry.spent_epsilon = 0.0;
                entry.period_started_at = now;
            }
        }
    }
}

fn validate_epsilon(epsilon: f64) -> Result<()> {
    if epsilon.is_finite() && epsilon > 0.0 {
        Ok(())
    } else {
        Err(CollectiveError::InvalidPrivacyParameters(format!("epsilon must be positive, got {epsilon}")))
    }
}

fn exceeded(entry: &PrivacyBudgetEntry, requested: f64) -> CollectiveError {
    CollectiveError::PrivacyBudgetExceeded { node_id: entry.node_id.clone(), requested, remaining: entry.remaining() }
}
