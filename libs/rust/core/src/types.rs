//! Shared data model: identifiers, numeric maps and model updates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::federated_learning::ModelVersion;
use crate::error::{CollectiveError, Result};

pub type NodeId = String;
pub type RoundId = u64;

/// Named scalar coefficients (model weights or metrics).
pub type WeightMap = BTreeMap<String, f64>;

/// Metric key carrying the number of local training samples behind an update.
pub const SAMPLE_COUNT_METRIC: &str = "sample_count";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub node_id: NodeId,
    /// Global model the update was trained against; `None` before the first aggregation.
    pub model_version: Option<ModelVersion>,
    pub weights: WeightMap,
    pub metrics: WeightMap,
    pub timestamp: i64,
    pub privacy_budget: f64,
}

impl ModelUpdate {
    pub fn sample_count(&self) -> Option<f64> {
        self.metrics.get(SAMPLE_COUNT_METRIC).copied().filter(|n| n.is_finite() && *n > 0.0)
    }
}

/// Converts a JSON object of numbers into a [`WeightMap`].
///
/// Strings, booleans, nested values and non-finite numbers are rejected rather than coerced.
pub fn numeric_map_from_json(field: &str, value: &Value) -> Result<WeightMap> {
    let obj = value
        .as_object()
        .ok_or_else(|| CollectiveError::InvalidPayload(format!("{field} must be an object of numbers")))?;
    let mut out = WeightMap::new();
    for (key, v) in obj {
        let n = v
            .as_f64()
            .ok_or_else(|| CollectiveError::InvalidPayload(format!("{field}.{key} is not a number")))?;
        out.insert(key.clone(), n);
    }
    ensure_finite(field, &out)?;
    Ok(out)
}

pub fn ensure_finite(field: &str, map: &WeightMap) -> Result<()> {
    match map.iter().find(|(_, v)| !v.is_finite()) {
        Some((key, v)) => Err(CollectiveError::InvalidPayload(format!("{field}.{key} is not finite ({v})"))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_non_numeric_values() {
        let err = numeric_map_from_json("weights", &json!({"w1": 0.5, "w2": "0.3"})).unwrap_err();
        assert!(matches!(err, CollectiveError::InvalidPayload(msg) if msg.contains("w2")));
        assert!(numeric_map_from_json("weights", &json!([1.0, 2.0])).is_err());
    }

    #[test]
    fn accepts_integers_and_floats() {
        let map = numeric_map_from_json("metrics", &json!({"sample_count": 120, "loss": 0.25})).unwrap();
        assert_eq!(map["sample_count"], 120.0);
        assert_eq!(map["loss"], 0.25);
    }

    #[test]
    fn sample_count_ignores_non_positive() {
        let mut metrics = WeightMap::new();
        metrics.insert(SAMPLE_COUNT_METRIC.into(), 0.0);
        let update = ModelUpdate { node_id: "n1".into(), model_version: None, weights: WeightMap::new(), metrics, timestamp: 0, privacy_budget: 0.1 };
        assert_eq!(update.sample_count(), None);
    }
}
