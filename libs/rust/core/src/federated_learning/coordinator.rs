use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{CollectiveError, Result};
use crate::federated_learning::aggregator::{AggregatedModel, AggregationMethod, ModelAggregator};
use crate::federated_learning::round::{Round, RoundSnapshot, RoundStatus};
use crate::metrics::COLLECTIVE_METRICS;
use crate::registry::Membership;
use crate::types::{ensure_finite, ModelUpdate, NodeId, RoundId, WeightMap};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundCounts {
    pub open: usize,
    pub collecting: usize,
    pub aggregating: usize,
    pub closed: usize,
    pub aborted: usize,
}

impl RoundCounts {
    pub fn total(&self) -> usize { self.open + self.collecting + self.aggregating + self.closed + self.aborted }
    pub fn in_progress(&self) -> usize { self.open + self.collecting + self.aggregating }
}

/// Owns every round. The index lock is held only to look up, insert or
/// retire a slot; all mutation of a live round happens under its own mutex.
pub struct FederatedLearningCoordinator {
    membership: Arc<dyn Membership>,
    aggregator: Arc<ModelAggregator>,
    clock: Arc<dyn Clock>,
    round_timeout: Duration,
    min_participants: usize,
    next_round: AtomicU64,
    rounds: RwLock<HashMap<RoundId, RoundSlot>>,
}

// Closed and aborted rounds keep only their snapshot; the captured updates go with the handle.
#[derive(Clone)]
enum RoundSlot {
    Live(Arc<Mutex<Round>>),
    Finished(RoundSnapshot),
}

impl FederatedLearningCoordinator {
    pub fn new(
        membership: Arc<dyn Membership>,
        aggregator: Arc<ModelAggregator>,
        clock: Arc<dyn Clock>,
        round_timeout: Duration,
        min_participants: usize,
    ) -> Self {
        Self { membership, aggregator, clock, round_timeout, min_participants, next_round: AtomicU64::new(1), rounds: RwLock::new(HashMap::new()) }
    }

    pub fn start_round(&self, expected: Option<Vec<NodeId>>, timeout: Option<Duration>) -> Result<RoundId> {
        let expected: Option<BTreeSet<NodeId>> = match expected {
            Some(ids) => {
                for id in &ids {
                    self.membership.ensure_active(id)?;
                }
                Some(ids.into_iter().collect())
            }
            None => None,
        };
        let now = self.clock.now_ms();
        let deadline = now.saturating_add(timeout.unwrap_or(self.round_timeout).as_millis() as i64);
        let round_id = self.next_round.fetch_add(1, Ordering::SeqCst);
        let expected_count = expected.as_ref().map(BTreeSet::len);
        let round = Arc::new(Mutex::new(Round::new(round_id, now, deadline, expected)));
        self.rounds.write().insert(round_id, RoundSlot::Live(round));
        COLLECTIVE_METRICS.rounds.started_total.add(1, &[]);
        info!(round_id, deadline, ?expected_count, "federated round started");
        Ok(round_id)
    }

    pub fn submit_update(&self, node_id: &str, round_id: RoundId, weights: WeightMap, metrics: WeightMap, privacy_budget: f64) -> Result<()> {
        self.submit_update_with(node_id, round_id, weights, metrics, privacy_budget, |_| Ok(()))
    }

    /// Like [`submit_update`](Self::submit_update), running `check` under the
    /// round lock once the round has admitted the node and before the update
    /// is recorded.
    pub fn submit_update_with<F>(&self, node_id: &str, round_id: RoundId, weights: WeightMap, metrics: WeightMap, privacy_budget: f64, check: F) -> Result<()>
    where
        F: FnOnce(&ModelUpdate) -> Result<()>,
    {
        let result = self.try_submit(node_id, round_id, weights, metrics, privacy_budget, check);
        match &result {
            Ok(()) => {
                COLLECTIVE_METRICS.rounds.updates_total.add(1, &[]);
                debug!(node_id, round_id, "update accepted");
            }
            Err(e) => {
                COLLECTIVE_METRICS.rounds.rejected_updates_total.add(1, &[]);
                warn!(node_id, round_id, error = %e, "update rejected");
            }
        }
        result
    }

    fn try_submit<F>(&self, node_id: &str, round_id: RoundId, weights: WeightMap, metrics: WeightMap, privacy_budget: f64, check: F) -> Result<()>
    where
        F: FnOnce(&ModelUpdate) -> Result<()>,
    {
        self.membership.ensure_active(node_id)?;
        let handle = match self.slot(round_id)? {
            RoundSlot::Live(handle) => handle,
            RoundSlot::Finished(snapshot) => return Err(CollectiveError::RoundNotOpen { round_id, status: snapshot.status.to_string() }),
        };
        if weights.is_empty() {
            return Err(CollectiveError::InvalidPayload("weights must not be empty".into()));
        }
        ensure_finite("weights", &weights)?;
        ensure_finite("metrics", &metrics)?;
        if !(privacy_budget.is_finite() && privacy_budget > 0.0) {
            return Err(CollectiveError::InvalidPrivacyParameters(format!("privacy budget must be positive, got {privacy_budget}")));
        }
        let now = self.clock.now_ms();
        let update = ModelUpdate {
            node_id: node_id.to_string(),
            model_version: self.aggregator.latest_version(),
            weights,
            metrics,
            timestamp: now,
            privacy_budget,
        };
        let mut round = handle.lock();
        self.expire_locked(&mut round, now);
        round.admit(node_id)?;
        check(&update)?;
        round.accept(update)
    }

    /// Aggregates the round's updates with `method`.
    pub fn aggregate(&self, round_id: RoundId, method: AggregationMethod) -> Result<AggregatedModel> {
        self.aggregate_with(round_id, method, Ok)
    }

    /// Like [`aggregate`](Self::aggregate), running `prepare` over the captured
    /// updates first. The participant minimum applies again to what `prepare`
    /// returns. Any failure after capture aborts the round.
    pub fn aggregate_with<F>(&self, round_id: RoundId, method: AggregationMethod, prepare: F) -> Result<AggregatedModel>
    where
        F: FnOnce(Vec<ModelUpdate>) -> Result<Vec<ModelUpdate>>,
    {
        let handle = match self.slot(round_id)? {
            RoundSlot::Live(handle) => handle,
            RoundSlot::Finished(snapshot) => return Err(finished_error(&snapshot)),
        };
        let captured = {
            let mut round = handle.lock();
            self.expire_locked(&mut round, self.clock.now_ms());
            round.begin_aggregation(self.min_participants)?
        };
        info!(round_id, %method, updates = captured.len(), "round aggregating");

        let required = self.min_participants.max(1);
        let outcome = prepare(captured).and_then(|prepared| {
            if prepared.len() < required {
                return Err(CollectiveError::InsufficientParticipants { required, available: prepared.len() });
            }
            self.aggregator.aggregate(&prepared, method, Some(round_id))
        });

        let mut round = handle.lock();
        match outcome {
            Ok(model) => {
                round.close(model.model_version.clone())?;
                self.retire(&round);
                COLLECTIVE_METRICS.rounds.closed_total.add(1, &[]);
                info!(round_id, version = %model.model_version, "round closed");
                Ok(model)
            }
            Err(e) => {
                round.fail(e.to_string())?;
                self.retire(&round);
                COLLECTIVE_METRICS.rounds.aborted_total.add(1, &[]);
                warn!(round_id, error = %e, "aggregation failed, round aborted");
                Err(e)
            }
        }
    }

    /// Cancels an open or collecting round. Aborting an aborted round is a no-op.
    pub fn abort_round(&self, round_id: RoundId) -> Result<()> {
        let handle = match self.slot(round_id)? {
            RoundSlot::Live(handle) => handle,
            RoundSlot::Finished(snapshot) if snapshot.status == RoundStatus::Aborted => return Ok(()),
            RoundSlot::Finished(snapshot) => return Err(finished_error(&snapshot)),
        };
        let mut round = handle.lock();
        self.expire_locked(&mut round, self.clock.now_ms());
        if round.cancel()? {
            self.retire(&round);
            COLLECTIVE_METRICS.rounds.aborted_total.add(1, &[]);
            info!(round_id, "round cancelled");
        }
        Ok(())
    }

    /// Aborts every round still accepting updates past its deadline.
    pub fn expire_overdue(&self) -> Vec<RoundId> {
        let now = self.clock.now_ms();
        let mut expired: Vec<RoundId> = self
            .live_handles()
            .into_iter()
            .filter(|(_, handle)| self.expire_locked(&mut handle.lock(), now))
            .map(|(id, _)| id)
            .collect();
        expired.sort_unstable();
        expired
    }

    pub fn round(&self, round_id: RoundId) -> Result<RoundSnapshot> {
        let slot = self.slot(round_id)?;
        Ok(self.snapshot_of(slot, self.clock.now_ms()))
    }

    pub fn rounds(&self) -> Vec<RoundSnapshot> {
        let now = self.clock.now_ms();
        let slots: Vec<RoundSlot> = self.rounds.read().values().cloned().collect();
        let mut all: Vec<RoundSnapshot> = slots.into_iter().map(|slot| self.snapshot_of(slot, now)).collect();
        all.sort_by_key(|r| r.round_id);
        all
    }

    /// Per-status totals. Only rounds still in progress are locked.
    pub fn counts(&self) -> RoundCounts {
        self.rounds().iter().fold(RoundCounts::default(), |mut c, r| {
            match r.status {
                RoundStatus::Open => c.open += 1,
                RoundStatus::Collecting => c.collecting += 1,
                RoundStatus::Aggregating => c.aggregating += 1,
                RoundStatus::Closed => c.closed += 1,
                RoundStatus::Aborted => c.aborted += 1,
            }
            c
        })
    }

    fn slot(&self, round_id: RoundId) -> Result<RoundSlot> {
        self.rounds.read().get(&round_id).cloned().ok_or(CollectiveError::UnknownRound(round_id))
    }

    fn live_handles(&self) -> Vec<(RoundId, Arc<Mutex<Round>>)> {
        self.rounds
            .read()
            .iter()
            .filter_map(|(id, slot)| match slot {
                RoundSlot::Live(handle) => Some((*id, handle.clone())),
                RoundSlot::Finished(_) => None,
            })
            .collect()
    }

    fn snapshot_of(&self, slot: RoundSlot, now: i64) -> RoundSnapshot {
        match slot {
            RoundSlot::Live(handle) => {
                let mut round = handle.lock();
                self.expire_locked(&mut round, now);
                round.snapshot()
            }
            RoundSlot::Finished(snapshot) => snapshot,
        }
    }

    // Called with the round lock held; never take a round lock while holding the index lock.
    fn retire(&self, round: &Round) {
        self.rounds.write().insert(round.id(), RoundSlot::Finished(round.snapshot()));
        debug!(round_id = round.id(), "round retired");
    }

    fn expire_locked(&self, round: &mut Round, now: i64) -> bool {
        let expired = round.expire_if_due(now);
        if expired {
            self.retire(round);
            COLLECTIVE_METRICS.rounds.aborted_total.add(1, &[]);
            warn!(round_id = round.id(), "round deadline elapsed, aborted");
        }
        expired
    }
}

fn finished_error(snapshot: &RoundSnapshot) -> CollectiveError {
    match snapshot.status {
        RoundStatus::Aborted => CollectiveError::RoundAborted(snapshot.round_id),
        _ => CollectiveError::RoundAlreadyAggregated(snapshot.round_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::ParticipantRegistry;

    struct Fixture {
        clock: Arc<ManualClock>,
        registry: Arc<ParticipantRegistry>,
        coordinator: FederatedLearningCoordinator,
    }

    fn fixture(min_participants: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new(10_000));
        let registry = Arc::new(ParticipantRegistry::new(clock.clone()));
        let aggregator = Arc::new(ModelAggregator::new(0.1, 16, clock.clone()));
        let coordinator = FederatedLearningCoordinator::new(registry.clone(), aggregator, clock.clone(), Duration::from_secs(60), min_participants);
        for n in ["a", "b", "c"] {
            registry.register(n).unwrap();
        }
        Fixture { clock, registry, coordinator }
    }

    fn weights(v: f64) -> WeightMap { WeightMap::from([("w".to_string(), v)]) }

    #[test]
    fn round_ids_are_monotonic() {
        let f = fixture(1);
        let r1 = f.coordinator.start_round(None, None).unwrap();
        let r2 = f.coordinator.start_round(None, None).unwrap();
        assert!(r2 > r1);
    }

    #[test]
    fn submit_checks_in_order() {
        let f = fixture(1);
        let round = f.coordinator.start_round(None, None).unwrap();
        assert!(matches!(f.coordinator.submit_update("ghost", round, weights(1.0), WeightMap::new(), 0.1), Err(CollectiveError::UnknownParticipant(_))));
        assert_eq!(f.coordinator.submit_update("a", 99, weights(1.0), WeightMap::new(), 0.1), Err(CollectiveError::UnknownRound(99)));
        f.coordinator.submit_update("a", round, weights(1.0), WeightMap::new(), 0.1).unwrap();
        assert!(matches!(f.coordinator.submit_update("a", round, weights(2.0), WeightMap::new(), 0.1), Err(CollectiveError::DuplicateSubmission { .. })));
        assert_eq!(f.coordinator.round(round).unwrap().status, RoundStatus::Collecting);
    }

    #[test]
    fn aggregate_closes_round() {
        let f = fixture(1);
        let round = f.coordinator.start_round(None, None).unwrap();
        f.coordinator.submit_update("a", round, weights(1.0), WeightMap::new(), 0.1).unwrap();
        f.coordinator.submit_update("b", round, weights(3.0), WeightMap::new(), 0.1).unwrap();
        let model = f.coordinator.aggregate(round, AggregationMethod::FederatedAveraging).unwrap();
        assert_eq!(model.weights["w"], 2.0);
        assert_eq!(model.participants, vec!["a".to_string(), "b".to_string()]);
        let snap = f.coordinator.round(round).unwrap();
        assert_eq!(snap.status, RoundStatus::Closed);
        assert_eq!(snap.model_version, Some(model.model_version));
        assert_eq!(f.coordinator.aggregate(round, AggregationMethod::FederatedAveraging), Err(CollectiveError::RoundAlreadyAggregated(round)));
    }

    #[test]
    fn min_participants_leaves_round_open() {
        let f = fixture(2);
        let round = f.coordinator.start_round(None, None).unwrap();
        f.coordinator.submit_update("a", round, weights(1.0), WeightMap::new(), 0.1).unwrap();
        assert!(matches!(f.coordinator.aggregate(round, AggregationMethod::FederatedAveraging), Err(CollectiveError::InsufficientParticipants { required: 2, available: 1 })));
        f.coordinator.submit_update("b", round, weights(1.0), WeightMap::new(), 0.1).unwrap();
        assert!(f.coordinator.aggregate(round, AggregationMethod::FederatedAveraging).is_ok());
    }

    #[test]
    fn failed_preparation_aborts_round() {
        let f = fixture(1);
        let round = f.coordinator.start_round(None, None).unwrap();
        f.coordinator.submit_update("a", round, weights(1.0), WeightMap::new(), 0.1).unwrap();
        let err = f.coordinator.aggregate_with(round, AggregationMethod::FederatedAveraging, |_| Ok(Vec::new())).unwrap_err();
        assert!(matches!(err, CollectiveError::InsufficientParticipants { .. }));
        assert_eq!(f.coordinator.round(round).unwrap().status, RoundStatus::Aborted);
        assert_eq!(f.coordinator.aggregate(round, AggregationMethod::FederatedAveraging), Err(CollectiveError::RoundAborted(round)));
    }

    #[test]
    fn minimum_applies_to_prepared_updates() {
        let f = fixture(2);
        let round = f.coordinator.start_round(None, None).unwrap();
        f.coordinator.submit_update("a", round, weights(1.0), WeightMap::new(), 0.1).unwrap();
        f.coordinator.submit_update("b", round, weights(3.0), WeightMap::new(), 0.1).unwrap();
        let err = f
            .coordinator
            .aggregate_with(round, AggregationMethod::FederatedAveraging, |updates| Ok(updates.into_iter().filter(|u| u.node_id == "b").collect()))
            .unwrap_err();
        assert_eq!(err, CollectiveError::InsufficientParticipants { required: 2, available: 1 });
        assert_eq!(f.coordinator.round(round).unwrap().status, RoundStatus::Aborted);
    }

    #[test]
    fn submit_check_runs_after_admission() {
        let f = fixture(1);
        let round = f.coordinator.start_round(Some(vec!["a".into(), "b".into()]), None).unwrap();
        let refuse = |_: &ModelUpdate| Err(CollectiveError::InvalidPayload("refused".into()));
        assert_eq!(f.coordinator.submit_update_with("a", 99, weights(1.0), WeightMap::new(), 0.1, refuse), Err(CollectiveError::UnknownRound(99)));
        assert!(matches!(f.coordinator.submit_update_with("c", round, weights(1.0), WeightMap::new(), 0.1, refuse), Err(CollectiveError::UnexpectedParticipant { .. })));
        assert_eq!(f.coordinator.submit_update_with("a", round, weights(1.0), WeightMap::new(), 0.1, refuse), Err(CollectiveError::InvalidPayload("refused".into())));
        assert_eq!(f.coordinator.round(round).unwrap().status, RoundStatus::Open);

        let seen = std::cell::Cell::new(0.0);
        f.coordinator
            .submit_update_with("a", round, weights(1.0), WeightMap::new(), 0.25, |u| {
                seen.set(u.privacy_budget);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.get(), 0.25);
        assert!(matches!(f.coordinator.submit_update_with("a", round, weights(2.0), WeightMap::new(), 0.1, refuse), Err(CollectiveError::DuplicateSubmission { .. })));
    }

    #[test]
    fn terminal_rounds_are_retired_to_snapshots() {
        let f = fixture(1);
        let closed = f.coordinator.start_round(None, None).unwrap();
        f.coordinator.submit_update("a", closed, weights(1.0), WeightMap::new(), 0.1).unwrap();
        let model = f.coordinator.aggregate(closed, AggregationMethod::FederatedAveraging).unwrap();
        let cancelled = f.coordinator.start_round(None, None).unwrap();
        f.coordinator.abort_round(cancelled).unwrap();
        let expired = f.coordinator.start_round(None, Some(Duration::from_secs(1))).unwrap();
        let live = f.coordinator.start_round(None, None).unwrap();
        f.clock.advance(Duration::from_secs(2));
        assert_eq!(f.coordinator.expire_overdue(), vec![expired]);

        {
            let index = f.coordinator.rounds.read();
            for id in [closed, cancelled, expired] {
                assert!(matches!(index.get(&id), Some(RoundSlot::Finished(_))), "round {id} still live");
            }
            assert!(matches!(index.get(&live), Some(RoundSlot::Live(_))));
        }

        let snap = f.coordinator.round(closed).unwrap();
        assert_eq!((snap.status, snap.model_version, snap.submitted), (RoundStatus::Closed, Some(model.model_version), vec!["a".to_string()]));
        assert!(matches!(f.coordinator.submit_update("b", closed, weights(1.0), WeightMap::new(), 0.1), Err(CollectiveError::RoundNotOpen { .. })));
        assert_eq!(f.coordinator.aggregate(closed, AggregationMethod::FederatedAveraging), Err(CollectiveError::RoundAlreadyAggregated(closed)));
        assert_eq!(f.coordinator.abort_round(closed), Err(CollectiveError::RoundAlreadyAggregated(closed)));
        assert_eq!(f.coordinator.aggregate(expired, AggregationMethod::FederatedAveraging), Err(CollectiveError::RoundAborted(expired)));
        f.coordinator.abort_round(cancelled).unwrap();
        assert_eq!(f.coordinator.live_handles().len(), 1);

        let counts = f.coordinator.counts();
        assert_eq!((counts.closed, counts.aborted, counts.open), (1, 2, 1));
    }

    #[test]
    fn deadline_expiry_and_sweep() {
        let f = fixture(1);
        let short = f.coordinator.start_round(None, Some(Duration::from_secs(5))).unwrap();
        let long = f.coordinator.start_round(None, None).unwrap();
        f.clock.advance(Duration::from_secs(6));
        assert_eq!(f.coordinator.expire_overdue(), vec![short]);
        assert!(f.coordinator.expire_overdue().is_empty());
        assert!(matches!(f.coordinator.submit_update("a", short, weights(1.0), WeightMap::new(), 0.1), Err(CollectiveError::RoundNotOpen { .. })));
        f.coordinator.submit_update("a", long, weights(1.0), WeightMap::new(), 0.1).unwrap();
        let counts = f.coordinator.counts();
        assert_eq!((counts.aborted, counts.collecting), (1, 1));
    }

    #[test]
    fn abort_is_idempotent_but_not_for_closed_rounds() {
        let f = fixture(1);
        let round = f.coordinator.start_round(None, None).unwrap();
        f.coordinator.abort_round(round).unwrap();
        f.coordinator.abort_round(round).unwrap();
        let done = f.coordinator.start_round(None, None).unwrap();
        f.coordinator.submit_update("a", done, weights(1.0), WeightMap::new(), 0.1).unwrap();
        f.coordinator.aggregate(done, AggregationMethod::FederatedMedian).unwrap();
        assert_eq!(f.coordinator.abort_round(done), Err(CollectiveError::RoundAlreadyAggregated(done)));
    }

    #[test]
    fn expected_participants_must_be_registered() {
        let f = fixture(1);
        assert!(matches!(f.coordinator.start_round(Some(vec!["a".into(), "zed".into()]), None), Err(CollectiveError::UnknownParticipant(_))));
        f.registry.unregister("c").unwrap();
        assert!(f.coordinator.start_round(Some(vec!["c".into()]), None).is_err());
    }

    #[test]
    fn updates_record_base_version() {
        let f = fixture(1);
        let r1 = f.coordinator.start_round(None, None).unwrap();
        f.coordinator.submit_update("a", r1, weights(1.0), WeightMap::new(), 0.1).unwrap();
        let first = f.coordinator.aggregate(r1, AggregationMethod::FederatedAveraging).unwrap();
        let r2 = f.coordinator.start_round(None, None).unwrap();
        let captured = std::cell::RefCell::new(None);
        f.coordinator.submit_update("b", r2, weights(2.0), WeightMap::new(), 0.1).unwrap();
        let second = f
            .coordinator
            .aggregate_with(r2, AggregationMethod::FederatedAveraging, |updates| {
                *captured.borrow_mut() = updates[0].model_version.clone();
                Ok(updates)
            })
            .unwrap();
        assert_eq!(captured.into_inner(), Some(first.model_version.clone()));
        assert!(second.model_version > first.model_version);
    }
}
