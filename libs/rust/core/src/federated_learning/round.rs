//! Round lifecycle: `open -> collecting -> aggregating -> closed`, with
//! `open | collecting -> aborted` on timeout or cancellation.
//!
//! Each transition is a method that matches exhaustively on the current
//! phase, so an update can never land in a closed round and a round can
//! never be aggregated twice.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CollectiveError, Result};
use crate::federated_learning::ModelVersion;
use crate::types::{ModelUpdate, NodeId, RoundId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus { Open, Collecting, Aggregating, Closed, Aborted }

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Collecting => "collecting",
            Self::Aggregating => "aggregating",
            Self::Closed => "closed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AbortReason { Timeout, Cancelled, AggregationFailed(String) }

#[derive(Debug, Clone, PartialEq)]
enum RoundPhase {
    Open,
    Collecting,
    Aggregating,
    Closed { model_version: ModelVersion },
    Aborted { reason: AbortReason },
}

#[derive(Debug)]
pub struct Round {
    id: RoundId,
    created_at: i64,
    deadline: i64,
    expected: Option<BTreeSet<NodeId>>,
    phase: RoundPhase,
    updates: Vec<ModelUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub round_id: RoundId,
    pub status: RoundStatus,
    pub created_at: i64,
    pub deadline: i64,
    pub expected_participants: Option<Vec<NodeId>>,
    pub submitted: Vec<NodeId>,
    pub model_version: Option<ModelVersion>,
    pub abort_reason: Option<AbortReason>,
}

impl Round {
    pub fn new(id: RoundId, created_at: i64, deadline: i64, expected: Option<BTreeSet<NodeId>>) -> Self {
        Self { id, created_at, deadline, expected, phase: RoundPhase::Open, updates: Vec::new() }
    }

    pub fn id(&self) -> RoundId { self.id }

    pub fn status(&self) -> RoundStatus {
        match self.phase {
            RoundPhase::Open => RoundStatus::Open,
            RoundPhase::Collecting => RoundStatus::Collecting,
            RoundPhase::Aggregating => RoundStatus::Aggregating,
            RoundPhase::Closed { .. } => RoundStatus::Closed,
            RoundPhase::Aborted { .. } => RoundStatus::Aborted,
        }
    }

    pub fn updates(&self) -> &[ModelUpdate] { &self.updates }

    /// Aborts with [`AbortReason::Timeout`] if still accepting updates past the deadline.
    pub fn expire_if_due(&mut self, now: i64) -> bool {
        match self.phase {
            RoundPhase::Open | RoundPhase::Collecting if now >= self.deadline => {
                self.phase = RoundPhase::Aborted { reason: AbortReason::Timeout };
                true
            }
            _ => false,
        }
    }

    /// Checks whether `node_id` may submit right now, without recording anything.
    pub fn admit(&self, node_id: &str) -> Result<()> {
        match self.phase {
            RoundPhase::Open | RoundPhase::Collecting => {}
            _ => return Err(CollectiveError::RoundNotOpen { round_id: self.id, status: self.status().to_string() }),
        }
        if let Some(expected) = &self.expected {
            if !expected.contains(node_id) {
                return Err(CollectiveError::UnexpectedParticipant { node_id: node_id.to_string(), round_id: self.id });
            }
        }
        if self.updates.iter().any(|u| u.node_id == node_id) {
            return Err(CollectiveError::DuplicateSubmission { node_id: node_id.to_string(), round_id: self.id });
        }
        Ok(())
    }

    pub fn accept(&mut self, update: ModelUpdate) -> Result<()> {
        self.admit(&update.node_id)?;
        self.updates.push(update);
        self.phase = RoundPhase::Collecting;
        Ok(())
    }

    /// Moves to `aggregating` and hands out the captured updates in submission order.
    pub fn begin_aggregation(&mut self, min_participants: usize) -> Result<Vec<ModelUpdate>> {
        let required = min_participants.max(1);
        match self.phase {
            RoundPhase::Aborted { .. } => Err(CollectiveError::RoundAborted(self.id)),
            RoundPhase::Aggregating | RoundPhase::Closed { .. } => Err(CollectiveError::RoundAlreadyAggregated(self.id)),
            RoundPhase::Open | RoundPhase::Collecting if self.updates.len() < required => {
                Err(CollectiveError::InsufficientParticipants { required, available: self.updates.len() })
            }
            RoundPhase::Open | RoundPhase::Collecting => {
                self.phase = RoundPhase::Aggregating;
                Ok(self.updates.clone())
            }
        }
    }

    pub fn close(&mut self, model_version: ModelVersion) -> Result<()> {
        self.finish(RoundPhase::Closed { model_version })
    }

    pub fn fail(&mut self, message: String) -> Result<()> {
        self.finish(RoundPhase::Aborted { reason: AbortReason::AggregationFailed(message) })
    }

    fn finish(&mut self, next: RoundPhase) -> Result<()> {
        match self.phase {
            RoundPhase::Aggregating => {
                self.phase = next;
                Ok(())
            }
            RoundPhase::Aborted { .. } => Err(CollectiveError::RoundAborted(self.id)),
            RoundPhase::Closed { .. } => Err(CollectiveError::RoundAlreadyAggregated(self.id)),
            RoundPhase::Open | RoundPhase::Collecting => Err(CollectiveError::RoundNotOpen { round_id: self.id, status: self.status().to_string() }),
        }
    }

    /// Explicit cancellation. Returns `false` when the round was already aborted.
    pub fn cancel(&mut self) -> Result<bool> {
        match self.phase {
            RoundPhase::Open | RoundPhase::Collecting => {
                self.phase = RoundPhase::Aborted { reason: AbortReason::Cancelled };
                Ok(true)
            }
            RoundPhase::Aborted { .. } => Ok(false),
            RoundPhase::Aggregating | RoundPhase::Closed { .. } => Err(CollectiveError::RoundAlreadyAggregated(self.id)),
        }
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        let (model_version, abort_reason) = match &self.phase {
            RoundPhase::Closed { model_version } => (Some(model_version.clone()), None),
            RoundPhase::Aborted { reason } => (None, Some(reason.clone())),
            _ => (None, None),
        };
        RoundSnapshot {
            round_id: self.id,
            status: self.status(),
            created_at: self.created_at,
            deadline: self.deadline,
            expected_participants: self.expected.as_ref().map(|e| e.iter().cloned().collect()),
            submitted: self.updates.iter().map(|u| u.node_id.clone()).collect(),
            model_version,
            abort_reason,
        }
    }
}
