//! Model aggregation strategies, versioning and bounded model history.
//!
//! Combination is a pure function of the ordered update list; only version
//! assignment and history bookkeeping happen under the history lock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{CollectiveError, Result};
use crate::metrics::COLLECTIVE_METRICS;
use crate::types::{ModelUpdate, NodeId, RoundId, WeightMap};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    #[default]
    FederatedAveraging,
    FederatedMedian,
    FederatedTrimmedMean,
    WeightedAverage,
}

impl AggregationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FederatedAveraging => "federated_averaging",
            Self::FederatedMedian => "federated_median",
            Self::FederatedTrimmedMean => "federated_trimmed_mean",
            Self::WeightedAverage => "weighted_average",
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for AggregationMethod {
    type Err = CollectiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "federated_averaging" | "fedavg" => Ok(Self::FederatedAveraging),
            "federated_median" | "median" => Ok(Self::FederatedMedian),
            "federated_trimmed_mean" | "trimmed_mean" => Ok(Self::FederatedTrimmedMean),
            "weighted_average" | "weighted" => Ok(Self::WeightedAverage),
            other => Err(CollectiveError::InvalidPayload(format!("unknown aggregation method: {other}"))),
        }
    }
}

/// Globally unique, totally ordered model version.
///
/// Ordering follows `(timestamp_ms, sequence)`; the sequence is unique per
/// aggregator so two versions never compare equal unless they are the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelVersion {
    pub timestamp_ms: i64,
    pub sequence: u64,
    pub method: AggregationMethod,
    /// Quality score in basis points (0..=10000).
    pub quality_bp: u16,
}

impl ModelVersion {
    fn new(timestamp_ms: i64, sequence: u64, method: AggregationMethod, quality: f64) -> Self {
        Self { timestamp_ms, sequence, method, quality_bp: (quality.clamp(0.0, 1.0) * 10_000.0).round() as u16 }
    }
}

impl PartialOrd for ModelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}

impl Ord for ModelVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp_ms
            .cmp(&other.timestamp_ms)
            .then(self.sequence.cmp(&other.sequence))
            .then(self.method.cmp(&other.method))
            .then(self.quality_bp.cmp(&other.quality_bp))
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-q{}", self.timestamp_ms, self.sequence, self.method, self.quality_bp)
    }
}

impl FromStr for ModelVersion {
    type Err = CollectiveError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || CollectiveError::UnknownVersion(s.to_string());
        let mut parts = s.split('-');
        let (Some(ts), Some(seq), Some(method), Some(quality), None) = (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) else {
            return Err(bad());
        };
        Ok(Self {
            timestamp_ms: ts.parse().map_err(|_| bad())?,
            sequence: seq.parse().map_err(|_| bad())?,
            method: method.parse().map_err(|_| bad())?,
            quality_bp: quality.strip_prefix('q').and_then(|q| q.parse().ok()).filter(|q| *q <= 10_000).ok_or_else(bad)?,
        })
    }
}

impl TryFrom<String> for ModelVersion {
    type Error = CollectiveError;
    fn try_from(s: String) -> Result<Self> { s.parse() }
}

impl From<ModelVersion> for String {
    fn from(v: ModelVersion) -> Self { v.to_string() }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedModel {
    pub model_version: ModelVersion,
    pub weights: WeightMap,
    pub aggregation_method: AggregationMethod,
    pub participants: Vec<NodeId>,
    pub metrics: WeightMap,
    pub quality_score: f64,
    pub created_at: i64,
    pub round_id: Option<RoundId>,
}

/// Per-key combination of weights and metrics. Fails only on an empty update
/// list or when trimming would leave no value for some key.
pub fn combine(updates: &[ModelUpdate], method: AggregationMethod, trim_fraction: f64) -> Result<(WeightMap, WeightMap)> {
    if updates.is_empty() {
        return Err(CollectiveError::InsufficientParticipants { required: 1, available: 0 });
    }
    let factors = contribution_factors(updates, method);
    let weights = combine_columns(updates, &factors, |u| &u.weights, method, trim_fraction)?;
    let metrics = combine_columns(updates, &factors, |u| &u.metrics, method, trim_fraction)?;
    Ok((weights, metrics))
}

// Equal factors unless every update declares a sample count and they differ.
fn contribution_factors(updates: &[ModelUpdate], method: AggregationMethod) -> Vec<f64> {
    if method != AggregationMethod::WeightedAverage {
        return vec![1.0; updates.len()];
    }
    let counts: Option<Vec<f64>> = updates.iter().map(ModelUpdate::sample_count).collect();
    match counts {
        Some(counts) if counts.windows(2).any(|w| w[0] != w[1]) => counts,
        _ => vec![1.0; updates.len()],
    }
}

fn combine_columns<'a>(
    updates: &'a [ModelUpdate],
    factors: &[f64],
    select: impl Fn(&'a ModelUpdate) -> &'a WeightMap,
    method: AggregationMethod,
    trim_fraction: f64,
) -> Result<WeightMap> {
    // Columns keep submission order for stable tie-breaking.
    let mut columns: BTreeMap<&str, Vec<(f64, f64)>> = BTreeMap::new();
    for (update, factor) in updates.iter().zip(factors) {
        for (key, value) in select(update) {
            columns.entry(key.as_str()).or_default().push((*value, *factor));
        }
    }
    columns
        .into_iter()
        .map(|(key, column)| Ok((key.to_string(), reduce(&column, method, trim_fraction)?)))
        .collect()
}

fn reduce(column: &[(f64, f64)], method: AggregationMethod, trim_fraction: f64) -> Result<f64> {
    match method {
        AggregationMethod::FederatedAveraging => Ok(mean(column.iter().map(|(v, _)| *v))),
        AggregationMethod::FederatedMedian => {
            let sorted = sorted_values(column);
            Ok(sorted[(sorted.len() - 1) / 2])
        }
        AggregationMethod::FederatedTrimmedMean => {
            let n = column.len();
            let k = (n as f64 * trim_fraction).floor() as usize;
            if n <= 2 * k {
                return Err(CollectiveError::InsufficientParticipants { required: 2 * k + 1, available: n });
            }
            let sorted = sorted_values(column);
            Ok(mean(sorted[k..n - k].iter().copied()))
        }
        AggregationMethod::WeightedAverage => {
            let total: f64 = column.iter().map(|(_, w)| *w).sum();
            if column.iter().all(|(_, w)| *w == 1.0) {
                return Ok(mean(column.iter().map(|(v, _)| *v)));
            }
            Ok(column.iter().map(|(v, w)| v * w).sum::<f64>() / total)
        }
    }
}

fn sorted_values(column: &[(f64, f64)]) -> Vec<f64> {
    let mut values: Vec<f64> = column.iter().map(|(v, _)| *v).collect();
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    sum / n as f64
}

/// Deterministic, monotone score in [0, 1]: higher accuracy and lower loss score higher.
pub fn quality_score(metrics: &WeightMap) -> f64 {
    let mut parts = Vec::with_capacity(2);
    if let Some(accuracy) = metrics.get("accuracy") {
        parts.push(accuracy.clamp(0.0, 1.0));
    }
    if let Some(loss) = metrics.get("loss") {
        parts.push(1.0 / (1.0 + loss.max(0.0)));
    }
    if parts.is_empty() {
        return 0.0;
    }
    (parts.iter().sum::<f64>() / parts.len() as f64).clamp(0.0, 1.0)
}

struct ModelHistory {
    capacity: usize,
    order: VecDeque<ModelVersion>,
    by_version: HashMap<ModelVersion, AggregatedModel>,
    next_sequence: u64,
    last_timestamp: i64,
}

impl ModelHistory {
    fn push(&mut self, model: AggregatedModel) {
        self.order.push_back(model.model_version.clone());
        self.by_version.insert(model.model_version.clone(), model);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.by_version.remove(&evicted);
                debug!(version = %evicted, "model evicted from history");
            }
        }
    }
}

pub struct ModelAggregator {
    trim_fraction: f64,
    clock: Arc<dyn Clock>,
    history: RwLock<ModelHistory>,
}

impl ModelAggregator {
    pub fn new(trim_fraction: f64, history_capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            trim_fraction,
            clock,
            history: RwLock::new(ModelHistory {
                capacity: history_capacity.max(1),
                order: VecDeque::new(),
                by_version: HashMap::new(),
                next_sequence: 0,
                last_timestamp: i64::MIN,
            }),
        }
    }

    /// Combines `updates` into a new versioned model and appends it to history.
    pub fn aggregate(&self, updates: &[ModelUpdate], method: AggregationMethod, round_id: Option<RoundId>) -> Result<AggregatedModel> {
        let started = Instant::now();
        let (weights, metrics) = combine(updates, method, self.trim_fraction)?;
        let quality = quality_score(&metrics);
        let participants = updates.iter().map(|u| u.node_id.clone()).collect();

        let mut history = self.history.write();
        let timestamp_ms = self.clock.now_ms().max(history.last_timestamp);
        history.next_sequence += 1;
        history.last_timestamp = timestamp_ms;
        let model = AggregatedModel {
            model_version: ModelVersion::new(timestamp_ms, history.next_sequence, method, quality),
            weights,
            aggregation_method: method,
            participants,
            metrics,
            quality_score: quality,
            created_at: timestamp_ms,
            round_id,
        };
        history.push(model.clone());
        drop(history);

        COLLECTIVE_METRICS.rounds.aggregation_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        info!(version = %model.model_version, %method, participants = model.participants.len(), quality, "model aggregated");
        Ok(model)
    }

    pub fn restore(&self, version: &ModelVersion) -> Result<AggregatedModel> {
        self.history.read().by_version.get(version).cloned().ok_or_else(|| CollectiveError::UnknownVersion(version.to_string()))
    }

    pub fn latest(&self) -> Option<AggregatedModel> {
        let history = self.history.read();
        history.order.back().and_then(|v| history.by_version.get(v)).cloned()
    }

    pub fn latest_version(&self) -> Option<ModelVersion> { self.history.read().order.back().cloned() }

    /// Highest-quality retained model; ties go to the earliest one.
    pub fn best(&self) -> Option<AggregatedModel> {
        let history = self.history.read();
        history
            .order
            .iter()
            .filter_map(|v| history.by_version.get(v))
            .fold(None::<&AggregatedModel>, |best, m| match best {
                Some(b) if b.quality_score >= m.quality_score => Some(b),
                _ => Some(m),
            })
            .cloned()
    }

    pub fn history(&self) -> Vec<AggregatedModel> {
        let history = self.history.read();
        history.order.iter().filter_map(|v| history.by_version.get(v)).cloned().collect()
    }

    pub fn len(&self) -> usize { self.history.read().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::SAMPLE_COUNT_METRIC;

    fn update(node: &str, weights: &[(&str, f64)], metrics: &[(&str, f64)]) -> ModelUpdate {
        ModelUpdate {
            node_id: node.into(),
            model_version: None,
            weights: weights.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            metrics: metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            timestamp: 0,
            privacy_budget: 0.1,
        }
    }

    fn scalar_updates(values: &[f64]) -> Vec<ModelUpdate> {
        values.iter().enumerate().map(|(i, v)| update(&format!("n{i}"), &[("w", *v)], &[])).collect()
    }

    #[test]
    fn fedavg_matches_reference_values() {
        let updates = vec![update("a", &[("w1", 0.5), ("w2", 0.3)], &[]), update("b", &[("w1", 0.4), ("w2", 0.2)], &[])];
        let (weights, _) = combine(&updates, AggregationMethod::FederatedAveraging, 0.1).unwrap();
        assert_eq!(weights["w1"], 0.45);
        assert_eq!(weights["w2"], 0.25);
    }

    #[test]
    fn missing_keys_average_over_defining_updates() {
        let updates = vec![update("a", &[("w1", 1.0), ("bias", 4.0)], &[]), update("b", &[("w1", 3.0)], &[])];
        let (weights, _) = combine(&updates, AggregationMethod::FederatedAveraging, 0.1).unwrap();
        assert_eq!(weights["w1"], 2.0);
        assert_eq!(weights["bias"], 4.0);
    }

    #[test]
    fn median_takes_lower_middle_on_even_counts() {
        let (weights, _) = combine(&scalar_updates(&[4.0, 1.0, 3.0, 2.0]), AggregationMethod::FederatedMedian, 0.1).unwrap();
        assert_eq!(weights["w"], 2.0);
        let (weights, _) = combine(&scalar_updates(&[9.0, 1.0, 5.0]), AggregationMethod::FederatedMedian, 0.1).unwrap();
        assert_eq!(weights["w"], 5.0);
    }

    #[test]
    fn trimmed_mean_below_granularity_is_plain_mean() {
        let (weights, _) = combine(&scalar_updates(&[1.0, 5.0, 9.0]), AggregationMethod::FederatedTrimmedMean, 0.1).unwrap();
        assert_eq!(weights["w"], 5.0);
    }

    #[test]
    fn trimmed_mean_drops_extremes() {
        let (weights, _) = combine(&scalar_updates(&[1.0, 2.0, 5.0, 8.0, 9.0]), AggregationMethod::FederatedTrimmedMean, 0.2).unwrap();
        assert_eq!(weights["w"], 5.0);
    }

    #[test]
    fn trimmed_mean_fails_when_nothing_remains() {
        let err = combine(&scalar_updates(&[1.0, 2.0]), AggregationMethod::FederatedTrimmedMean, 0.5).unwrap_err();
        assert!(matches!(err, CollectiveError::InsufficientParticipants { available: 2, .. }));
    }

    #[test]
    fn weighted_average_uses_sample_counts() {
        let updates = vec![
            update("a", &[("w", 0.1)], &[(SAMPLE_COUNT_METRIC, 10.0)]),
            update("b", &[("w", 0.2)], &[(SAMPLE_COUNT_METRIC, 30.0)]),
        ];
        let (weights, _) = combine(&updates, AggregationMethod::WeightedAverage, 0.1).unwrap();
        assert!((weights["w"] - 0.175).abs() < 1e-12);
    }

    #[test]
    fn weighted_average_falls_back_to_equal_weights() {
        let updates = vec![update("a", &[("w", 0.1)], &[(SAMPLE_COUNT_METRIC, 10.0)]), update("b", &[("w", 0.3)], &[])];
        let (weights, _) = combine(&updates, AggregationMethod::WeightedAverage, 0.1).unwrap();
        assert!((weights["w"] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn empty_update_set_is_rejected() {
        assert!(matches!(combine(&[], AggregationMethod::FederatedMedian, 0.1), Err(CollectiveError::InsufficientParticipants { .. })));
    }

    #[test]
    fn quality_is_monotone_and_clamped() {
        let mut m = WeightMap::new();
        assert_eq!(quality_score(&m), 0.0);
        m.insert("accuracy".into(), 1.7);
        assert_eq!(quality_score(&m), 1.0);
        m.insert("loss".into(), 1.0);
        let with_loss = quality_score(&m);
        m.insert("loss".into(), 0.5);
        assert!(quality_score(&m) > with_loss);
    }

    #[test]
    fn versions_increase_even_when_clock_stalls() {
        let clock = Arc::new(ManualClock::new(5_000));
        let agg = ModelAggregator::new(0.1, 10, clock.clone());
        let first = agg.aggregate(&scalar_updates(&[1.0]), AggregationMethod::FederatedAveraging, None).unwrap();
        clock.set(4_000);
        let second = agg.aggregate(&scalar_updates(&[2.0]), AggregationMethod::FederatedAveraging, None).unwrap();
        assert!(second.model_version > first.model_version);
        assert_eq!(second.model_version.timestamp_ms, 5_000);
    }

    #[test]
    fn version_text_round_trips() {
        let v = ModelVersion::new(1_700_000_000_000, 7, AggregationMethod::FederatedTrimmedMean, 0.8123);
        assert_eq!(v.to_string(), "1700000000000-7-federated_trimmed_mean-q8123");
        assert_eq!(v.to_string().parse::<ModelVersion>().unwrap(), v);
        assert!("not-a-version".parse::<ModelVersion>().is_err());
    }

    #[test]
    fn history_is_bounded_and_restorable() {
        let agg = ModelAggregator::new(0.1, 2, Arc::new(ManualClock::new(0)));
        let v1 = agg.aggregate(&scalar_updates(&[1.0]), AggregationMethod::FederatedAveraging, None).unwrap().model_version;
        let v2 = agg.aggregate(&scalar_updates(&[2.0]), AggregationMethod::FederatedAveraging, None).unwrap().model_version;
        let v3 = agg.aggregate(&scalar_updates(&[3.0]), AggregationMethod::FederatedAveraging, None).unwrap().model_version;
        assert_eq!(agg.len(), 2);
        assert!(matches!(agg.restore(&v1), Err(CollectiveError::UnknownVersion(_))));
        assert_eq!(agg.restore(&v2).unwrap().weights["w"], 2.0);
        assert_eq!(agg.latest_version(), Some(v3));
    }

    #[test]
    fn best_breaks_ties_by_earliest() {
        let clock = Arc::new(ManualClock::new(0));
        let agg = ModelAggregator::new(0.1, 10, clock.clone());
        let first = agg.aggregate(&[update("a", &[("w", 1.0)], &[("accuracy", 0.9)])], AggregationMethod::FederatedAveraging, None).unwrap();
        clock.advance(std::time::Duration::from_secs(1));
        agg.aggregate(&[update("b", &[("w", 2.0)], &[("accuracy", 0.9)])], AggregationMethod::FederatedAveraging, None).unwrap();
        agg.aggregate(&[update("c", &[("w", 3.0)], &[("accuracy", 0.4)])], AggregationMethod::FederatedAveraging, None).unwrap();
        assert_eq!(agg.best().unwrap().model_version, first.model_version);
    }
}
