//! Knowledge exchange between nodes: confidence-gated extraction and
//! rate-limited transfer of derived insights.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{CollectiveError, Result};
use crate::metrics::COLLECTIVE_METRICS;
use crate::registry::Membership;
use crate::types::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeType { BehavioralPattern, Recommendation, Anomaly, Preference, Custom(String) }

impl fmt::Display for KnowledgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BehavioralPattern => f.write_str("behavioral_pattern"),
            Self::Recommendation => f.write_str("recommendation"),
            Self::Anomaly => f.write_str("anomaly"),
            Self::Preference => f.write_str("preference"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub target_node_id: NodeId,
    pub transferred_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub knowledge_id: String,
    pub source_node_id: NodeId,
    pub knowledge_type: KnowledgeType,
    pub payload: Value,
    pub confidence: f64,
    pub created_at: i64,
    pub transfers: Vec<TransferRecord>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnowledgeQuery {
    pub knowledge_type: Option<KnowledgeType>,
    pub source_node_id: Option<NodeId>,
    pub min_confidence: Option<f64>,
}

impl KnowledgeQuery {
    fn matches(&self, item: &KnowledgeItem) -> bool {
        self.knowledge_type.as_ref().map_or(true, |t| *t == item.knowledge_type)
            && self.source_node_id.as_deref().map_or(true, |s| s == item.source_node_id)
            && self.min_confidence.map_or(true, |c| item.confidence >= c)
    }
}

/// Content address: SHA-256 over source, type and the canonical payload JSON.
pub fn knowledge_id(source_node_id: &str, knowledge_type: &KnowledgeType, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_node_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(knowledge_type.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[derive(Default)]
struct KnowledgeIndex {
    by_id: HashMap<String, KnowledgeItem>,
    order: Vec<String>,
}

pub struct KnowledgeStore {
    membership: Arc<dyn Membership>,
    clock: Arc<dyn Clock>,
    min_confidence: f64,
    transfer_quota: usize,
    transfer_window: Duration,
    items: RwLock<KnowledgeIndex>,
    // Sliding window of transfer timestamps per ordered (source, target) pair.
    windows: Mutex<HashMap<(NodeId, NodeId), VecDeque<i64>>>,
}

impl KnowledgeStore {
    pub fn new(membership: Arc<dyn Membership>, clock: Arc<dyn Clock>, min_confidence: f64, transfer_quota: usize, transfer_window: Duration) -> Self {
        Self {
            membership,
            clock,
            min_confidence,
            transfer_quota,
            transfer_window,
            items: RwLock::new(KnowledgeIndex::default()),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Records a knowledge item, or returns `None` when `confidence` is below
    /// the store's minimum. Identical content yields the already stored item.
    pub fn extract(&self, source_node_id: &str, knowledge_type: KnowledgeType, payload: Value, confidence: f64) -> Result<Option<KnowledgeItem>> {
        self.membership.ensure_active(source_node_id)?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(CollectiveError::InvalidConfidence(confidence));
        }
        if confidence < self.min_confidence {
            COLLECTIVE_METRICS.knowledge.filtered_total.add(1, &[]);
            debug!(source_node_id, confidence, threshold = self.min_confidence, "knowledge below confidence gate");
            return Ok(None);
        }
        let id = knowledge_id(source_node_id, &knowledge_type, &payload);
        let mut index = self.items.write();
        if let Some(existing) = index.by_id.get(&id) {
            debug!(knowledge_id = %id, "knowledge already stored");
            return Ok(Some(existing.clone()));
        }
        let item = KnowledgeItem {
            knowledge_id: id.clone(),
            source_node_id: source_node_id.to_string(),
            knowledge_type,
            payload,
            confidence,
            created_at: self.clock.now_ms(),
            transfers: Vec::new(),
        };
        index.by_id.insert(id.clone(), item.clone());
        index.order.push(id);
        COLLECTIVE_METRICS.knowledge.extracted_total.add(1, &[]);
        info!(knowledge_id = %item.knowledge_id, source_node_id, knowledge_type = %item.knowledge_type, confidence, "knowledge extracted");
        Ok(Some(item))
    }

    pub fn transfer(&self, knowledge_id: &str, target_node_id: &str) -> Result<TransferRecord> {
        let source = self
            .items
            .read()
            .by_id
            .get(knowledge_id)
            .map(|item| item.source_node_id.clone())
            .ok_or_else(|| CollectiveError::UnknownKnowledge(knowledge_id.to_string()))?;
        self.membership.ensure_active(target_node_id)?;

        let now = self.clock.now_ms();
        self.admit(&source, target_node_id, now)?;

        let record = TransferRecord { target_node_id: target_node_id.to_string(), transferred_at: now };
        if let Some(item) = self.items.write().by_id.get_mut(knowledge_id) {
            item.transfers.push(record.clone());
        }
        COLLECTIVE_METRICS.knowledge.transfers_total.add(1, &[]);
        info!(knowledge_id, source = %source, target = target_node_id, "knowledge transferred");
        Ok(record)
    }

    // Counts the transfer against the pair's window, or rejects it when the quota is used up.
    fn admit(&self, source: &str, target: &str, now: i64) -> Result<()> {
        let window_ms = self.transfer_window.as_millis() as i64;
        let mut windows = self.windows.lock();
        let stamps = windows.entry((source.to_string(), target.to_string())).or_default();
        while stamps.front().is_some_and(|t| now - *t >= window_ms) {
            stamps.pop_front();
        }
        if stamps.len() >= self.transfer_quota {
            COLLECTIVE_METRICS.knowledge.rate_limited_total.add(1, &[]);
            warn!(source, target, quota = self.transfer_quota, "knowledge transfer rate limited");
            return Err(CollectiveError::TransferRateLimited { source_node: source.to_string(), target_node: target.to_string() });
        }
        stamps.push_back(now);
        Ok(())
    }

    pub fn query(&self, query: &KnowledgeQuery) -> Vec<KnowledgeItem> {
        let index = self.items.read();
        index.order.iter().filter_map(|id| index.by_id.get(id)).filter(|item| query.matches(item)).cloned().collect()
    }

    pub fn get(&self, knowledge_id: &str) -> Result<KnowledgeItem> {
        self.items.read().by_id.get(knowledge_id).cloned().ok_or_else(|| CollectiveError::UnknownKnowledge(knowledge_id.to_string()))
    }

    /// Items that have been transferred to `node_id` at least once.
    pub fn received_by(&self, node_id: &str) -> Vec<KnowledgeItem> {
        let index = self.items.read();
        index
            .order
            .iter()
            .filter_map(|id| index.by_id.get(id))
            .filter(|item| item.transfers.iter().any(|t| t.target_node_id == node_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize { self.items.read().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn transfer_count(&self) -> usize { self.items.read().by_id.values().map(|i| i.transfers.len()).sum() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::ParticipantRegistry;
    use serde_json::json;

    fn store(quota: usize) -> (Arc<ManualClock>, Arc<ParticipantRegistry>, KnowledgeStore) {
        let clock = Arc::new(ManualClock::new(0));
        let registry = Arc::new(ParticipantRegistry::new(clock.clone()));
        for n in ["kitchen", "garage", "attic"] {
            registry.register(n).unwrap();
        }
        let store = KnowledgeStore::new(registry.clone(), clock.clone(), 0.5, quota, Duration::from_secs(3600));
        (clock, registry, store)
    }

    #[test]
    fn confidence_gate_filters_without_error() {
        let (_, _, store) = store(10);
        assert_eq!(store.extract("kitchen", KnowledgeType::BehavioralPattern, json!({"wake": "06:30"}), 0.1).unwrap(), None);
        let item = store.extract("kitchen", KnowledgeType::BehavioralPattern, json!({"wake": "06:30"}), 0.6).unwrap().unwrap();
        let found = store.query(&KnowledgeQuery::default());
        assert_eq!(found, vec![item]);
    }

    #[test]
    fn invalid_confidence_and_unknown_source() {
        let (_, _, store) = store(10);
        assert!(matches!(store.extract("kitchen", KnowledgeType::Anomaly, json!(1), 1.2), Err(CollectiveError::InvalidConfidence(_))));
        assert!(matches!(store.extract("kitchen", KnowledgeType::Anomaly, json!(1), f64::NAN), Err(CollectiveError::InvalidConfidence(_))));
        assert!(matches!(store.extract("cellar", KnowledgeType::Anomaly, json!(1), 0.9), Err(CollectiveError::UnknownParticipant(_))));
    }

    #[test]
    fn identical_content_is_deduplicated() {
        let (_, _, store) = store(10);
        let a = store.extract("kitchen", KnowledgeType::Recommendation, json!({"b": 1, "a": 2}), 0.7).unwrap().unwrap();
        let b = store.extract("kitchen", KnowledgeType::Recommendation, json!({"a": 2, "b": 1}), 0.9).unwrap().unwrap();
        assert_eq!(a.knowledge_id, b.knowledge_id);
        assert_eq!(store.len(), 1);
        let other = store.extract("garage", KnowledgeType::Recommendation, json!({"a": 2, "b": 1}), 0.9).unwrap().unwrap();
        assert_ne!(other.knowledge_id, a.knowledge_id);
    }

    #[test]
    fn transfer_appends_history_only() {
        let (clock, _, store) = store(10);
        let item = store.extract("kitchen", KnowledgeType::Preference, json!({"temp": 21.5}), 0.8).unwrap().unwrap();
        clock.advance(Duration::from_secs(5));
        store.transfer(&item.knowledge_id, "garage").unwrap();
        let after = store.get(&item.knowledge_id).unwrap();
        assert_eq!(after.payload, item.payload);
        assert_eq!(after.confidence, item.confidence);
        assert_eq!(after.transfers, vec![TransferRecord { target_node_id: "garage".into(), transferred_at: 5_000 }]);
        assert_eq!(store.received_by("garage").len(), 1);
        assert!(store.received_by("attic").is_empty());
    }

    #[test]
    fn transfer_errors() {
        let (_, registry, store) = store(10);
        assert!(matches!(store.transfer("missing", "garage"), Err(CollectiveError::UnknownKnowledge(_))));
        let item = store.extract("kitchen", KnowledgeType::Anomaly, json!("door"), 0.9).unwrap().unwrap();
        registry.unregister("attic").unwrap();
        assert!(matches!(store.transfer(&item.knowledge_id, "attic"), Err(CollectiveError::UnknownParticipant(_))));
    }

    #[test]
    fn sliding_window_limits_each_ordered_pair() {
        let (clock, _, store) = store(2);
        let item = store.extract("kitchen", KnowledgeType::Anomaly, json!("leak"), 0.9).unwrap().unwrap();
        store.transfer(&item.knowledge_id, "garage").unwrap();
        clock.advance(Duration::from_secs(1800));
        store.transfer(&item.knowledge_id, "garage").unwrap();
        assert!(matches!(store.transfer(&item.knowledge_id, "garage"), Err(CollectiveError::TransferRateLimited { .. })));
        store.transfer(&item.knowledge_id, "attic").unwrap();
        clock.advance(Duration::from_secs(1800));
        store.transfer(&item.knowledge_id, "garage").unwrap();
        assert_eq!(store.transfer_count(), 4);
    }

    #[test]
    fn query_filters_compose() {
        let (_, _, store) = store(10);
        store.extract("kitchen", KnowledgeType::Anomaly, json!(1), 0.55).unwrap();
        store.extract("kitchen", KnowledgeType::Recommendation, json!(2), 0.95).unwrap();
        store.extract("garage", KnowledgeType::Custom("energy".into()), json!(3), 0.75).unwrap();
        let q = KnowledgeQuery { source_node_id: Some("kitchen".into()), min_confidence: Some(0.6), ..Default::default() };
        let hits = store.query(&q);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].knowledge_type, KnowledgeType::Recommendation);
        let custom = store.query(&KnowledgeQuery { knowledge_type: Some(KnowledgeType::Custom("energy".into())), ..Default::default() });
        assert_eq!(custom[0].source_node_id, "garage");
    }
}
