//! Collective intelligence service: the single owner of registry, privacy
//! ledger, aggregator, round coordinator and knowledge store for a process.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CollectiveConfig;
use crate::error::{CollectiveError, Result};
use crate::federated_learning::{AggregatedModel, AggregationMethod, FederatedLearningCoordinator, ModelAggregator, ModelVersion, RoundCounts, RoundSnapshot};
use crate::knowledge::{KnowledgeItem, KnowledgeQuery, KnowledgeStore, KnowledgeType, TransferRecord};
use crate::metrics::COLLECTIVE_METRICS;
use crate::privacy::{add_gaussian_noise_to_weights, clip_weights, PrivacyBudgetEntry, PrivacyLedger};
use crate::registry::{Membership, Participant, ParticipantRegistry};
use crate::types::{numeric_map_from_json, ModelUpdate, NodeId, RoundId, WeightMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service_name: String,
    pub uptime_ms: i64,
    pub registered_nodes: usize,
    pub active_nodes: usize,
    pub rounds_in_progress: usize,
    pub latest_model_version: Option<ModelVersion>,
    pub knowledge_items: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatistics {
    pub registered_nodes: usize,
    pub active_nodes: usize,
    pub rounds: RoundCounts,
    pub completed_rounds: usize,
    pub aborted_rounds: usize,
    pub models_in_history: usize,
    pub knowledge_items: usize,
    pub knowledge_transfers: usize,
    pub remaining_budget: BTreeMap<NodeId, f64>,
}

pub struct CollectiveIntelligenceService {
    config: CollectiveConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<ParticipantRegistry>,
    ledger: PrivacyLedger,
    aggregator: Arc<ModelAggregator>,
    coordinator: FederatedLearningCoordinator,
    knowledge: KnowledgeStore,
    noise_rng: Mutex<StdRng>,
    started_at: i64,
}

impl CollectiveIntelligenceService {
    pub fn new(config: CollectiveConfig) -> Self { Self::with_clock(config, Arc::new(SystemClock::new())) }

    pub fn with_clock(config: CollectiveConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(ParticipantRegistry::new(clock.clone()));
        let membership: Arc<dyn Membership> = registry.clone();
        let aggregator = Arc::new(ModelAggregator::new(config.aggregation.trim_fraction, config.aggregation.history_capacity, clock.clone()));
        let coordinator = FederatedLearningCoordinator::new(
            membership.clone(),
            aggregator.clone(),
            clock.clone(),
            Duration::from_secs(config.rounds.default_timeout_secs),
            config.rounds.min_participants,
        );
        let knowledge = KnowledgeStore::new(
            membership,
            clock.clone(),
            config.knowledge.min_confidence,
            config.knowledge.transfer_quota,
            Duration::from_secs(config.knowledge.transfer_window_secs),
        );
        let ledger = PrivacyLedger::new(config.privacy.budget_policy, clock.clone());
        let noise_rng = match config.privacy.noise_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let started_at = clock.now_ms();
        info!(service = %config.service_name, "collective intelligence service created");
        Self { config, clock, registry, ledger, aggregator, coordinator, knowledge, noise_rng: Mutex::new(noise_rng), started_at }
    }

    pub fn config(&self) -> &CollectiveConfig { &self.config }

    // --- node lifecycle ---

    /// Registers a node with the configured default privacy budget.
    pub fn register_node(&self, node_id: &str) -> Result<Participant> {
        self.register_node_with_budget(node_id, self.config.privacy.default_max_epsilon, self.config.privacy.default_delta)
    }

    /// Registers a node with an explicit budget. A node that already has a
    /// budget entry (e.g. after unregistering) keeps its existing entry.
    pub fn register_node_with_budget(&self, node_id: &str, max_epsilon: f64, delta: f64) -> Result<Participant> {
        if node_id.trim().is_empty() {
            return Err(CollectiveError::InvalidPayload("node_id must not be empty".into()));
        }
        if self.registry.is_active(node_id) {
            return Err(CollectiveError::DuplicateParticipant(node_id.to_string()));
        }
        self.ledger.register_node(node_id, max_epsilon, delta)?;
        self.registry.register(node_id)
    }

    pub fn unregister_node(&self, node_id: &str) -> Result<()> { self.registry.unregister(node_id).map(|_| ()) }

    pub fn suspend_node(&self, node_id: &str) -> Result<()> { self.registry.suspend(node_id) }

    pub fn reactivate_node(&self, node_id: &str) -> Result<()> { self.registry.reactivate(node_id) }

    pub fn participants(&self) -> Vec<Participant> { self.registry.list() }

    pub fn privacy_budget(&self, node_id: &str) -> Result<PrivacyBudgetEntry> { self.ledger.entry(node_id) }

    // --- rounds ---

    pub fn start_federated_round(&self, expected_participants: Option<Vec<NodeId>>) -> Result<RoundId> {
        self.coordinator.start_round(expected_participants, None)
    }

    pub fn start_federated_round_with_timeout(&self, expected_participants: Option<Vec<NodeId>>, timeout: Duration) -> Result<RoundId> {
        self.coordinator.start_round(expected_participants, Some(timeout))
    }

    /// Submits a local update. The requested epsilon must be affordable now;
    /// it is only charged when the round is aggregated. Round, membership and
    /// duplicate errors take precedence over the budget check.
    pub fn submit_local_update(&self, node_id: &str, round_id: RoundId, weights: WeightMap, metrics: WeightMap, privacy_budget: f64) -> Result<()> {
        self.coordinator.submit_update_with(node_id, round_id, weights, metrics, privacy_budget, |update| {
            self.ledger.ensure_affordable(&update.node_id, update.privacy_budget)
        })
    }

    /// [`submit_local_update`](Self::submit_local_update) for untyped JSON objects.
    pub fn submit_local_update_json(&self, node_id: &str, round_id: RoundId, weights: &Value, metrics: &Value, privacy_budget: f64) -> Result<()> {
        let weights = numeric_map_from_json("weights", weights)?;
        let metrics = if metrics.is_null() { WeightMap::new() } else { numeric_map_from_json("metrics", metrics)? };
        self.submit_local_update(node_id, round_id, weights, metrics, privacy_budget)
    }

    /// Clips, charges and noises every captured update, then aggregates.
    pub fn execute_aggregation(&self, round_id: RoundId, method: Option<AggregationMethod>) -> Result<AggregatedModel> {
        let method = method.unwrap_or_default();
        self.coordinator.aggregate_with(round_id, method, |updates| self.privatize(round_id, updates))
    }

    fn privatize(&self, round_id: RoundId, updates: Vec<ModelUpdate>) -> Result<Vec<ModelUpdate>> {
        let clip_norm = self.config.privacy.clip_norm;
        let mut admitted = Vec::with_capacity(updates.len());
        for mut update in updates {
            let clipped = clip_weights(&update.weights, clip_norm)?;
            match self.ledger.charge(&update.node_id, update.privacy_budget) {
                Ok(_) => {}
                Err(e @ CollectiveError::PrivacyBudgetExceeded { .. }) => {
                    COLLECTIVE_METRICS.privacy.excluded_updates_total.add(1, &[]);
                    warn!(round_id, node_id = %update.node_id, error = %e, "update excluded from aggregation");
                    continue;
                }
                Err(e) => return Err(e),
            }
            let delta = self.ledger.entry(&update.node_id)?.delta;
            let noisy = {
                let mut rng = self.noise_rng.lock();
                add_gaussian_noise_to_weights(&clipped, clip_norm, update.privacy_budget, delta, &mut *rng)?
            };
            update.weights = noisy;
            admitted.push(update);
        }
        Ok(admitted)
    }

    pub fn abort_round(&self, round_id: RoundId) -> Result<()> { self.coordinator.abort_round(round_id) }

    pub fn expire_overdue_rounds(&self) -> Vec<RoundId> { self.coordinator.expire_overdue() }

    pub fn round(&self, round_id: RoundId) -> Result<RoundSnapshot> { self.coordinator.round(round_id) }

    pub fn rounds(&self) -> Vec<RoundSnapshot> { self.coordinator.rounds() }

    // --- models ---

    pub fn restore_model(&self, model_version: &str) -> Result<AggregatedModel> {
        let version: ModelVersion = model_version.parse()?;
        self.aggregator.restore(&version)
    }

    pub fn latest_model(&self) -> Option<AggregatedModel> { self.aggregator.latest() }

    pub fn best_model(&self) -> Option<AggregatedModel> { self.aggregator.best() }

    pub fn model_history(&self) -> Vec<AggregatedModel> { self.aggregator.history() }

    // --- knowledge ---

    pub fn extract_knowledge(&self, node_id: &str, knowledge_type: KnowledgeType, payload: Value, confidence: f64) -> Result<Option<KnowledgeItem>> {
        self.knowledge.extract(node_id, knowledge_type, payload, confidence)
    }

    pub fn transfer_knowledge(&self, knowledge_id: &str, target_node_id: &str) -> Result<TransferRecord> {
        self.knowledge.transfer(knowledge_id, target_node_id)
    }

    pub fn knowledge_base(&self, query: &KnowledgeQuery) -> Vec<KnowledgeItem> { self.knowledge.query(query) }

    pub fn received_knowledge(&self, node_id: &str) -> Vec<KnowledgeItem> { self.knowledge.received_by(node_id) }

    // --- introspection ---

    pub fn get_status(&self) -> ServiceStatus {
        ServiceStatus {
            service_name: self.config.service_name.clone(),
            uptime_ms: self.clock.now_ms() - self.started_at,
            registered_nodes: self.registry.count(),
            active_nodes: self.registry.active_count(),
            rounds_in_progress: self.coordinator.counts().in_progress(),
            latest_model_version: self.aggregator.latest_version(),
            knowledge_items: self.knowledge.len(),
        }
    }

    pub fn get_statistics(&self) -> ServiceStatistics {
        let rounds = self.coordinator.counts();
        ServiceStatistics {
            registered_nodes: self.registry.count(),
            active_nodes: self.registry.active_count(),
            rounds,
            completed_rounds: rounds.closed,
            aborted_rounds: rounds.aborted,
            models_in_history: self.aggregator.len(),
            knowledge_items: self.knowledge.len(),
            knowledge_transfers: self.knowledge.transfer_count(),
            remaining_budget: self.ledger.budgets().into_iter().map(|(id, entry)| (id, entry.remaining())).collect(),
        }
    }
}
