//! Participant registry: which nodes are known and eligible to take part.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{CollectiveError, Result};
use crate::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus { Active, Suspended }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub node_id: NodeId,
    pub registered_at: i64,
    pub status: ParticipantStatus,
}

/// Eligibility check consumed by the round coordinator and the knowledge store.
pub trait Membership: Send + Sync {
    fn is_active(&self, node_id: &str) -> bool;

    fn ensure_active(&self, node_id: &str) -> Result<()> {
        if self.is_active(node_id) { Ok(()) } else { Err(CollectiveError::UnknownParticipant(node_id.to_string())) }
    }
}

pub struct ParticipantRegistry {
    clock: Arc<dyn Clock>,
    participants: RwLock<HashMap<NodeId, Participant>>,
}

impl ParticipantRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self { Self { clock, participants: RwLock::new(HashMap::new()) } }

    /// Registers `node_id`, re-activating it if it was suspended.
    pub fn register(&self, node_id: &str) -> Result<Participant> {
        let mut map = self.participants.write();
        if let Some(existing) = map.get_mut(node_id) {
            if existing.status == ParticipantStatus::Active {
                return Err(CollectiveError::DuplicateParticipant(node_id.to_string()));
            }
            existing.status = ParticipantStatus::Active;
            info!(node_id, "participant reactivated via register");
            return Ok(existing.clone());
        }
        let participant = Participant { node_id: node_id.to_string(), registered_at: self.clock.now_ms(), status: ParticipantStatus::Active };
        map.insert(node_id.to_string(), participant.clone());
        info!(node_id, total = map.len(), "participant registered");
        Ok(participant)
    }

    /// Removes `node_id`. Updates it already submitted to open rounds stay valid.
    pub fn unregister(&self, node_id: &str) -> Result<Participant> {
        let removed = self.participants.write().remove(node_id).ok_or_else(|| CollectiveError::UnknownParticipant(node_id.to_string()))?;
        info!(node_id, "participant unregistered");
        Ok(removed)
    }

    pub fn suspend(&self, node_id: &str) -> Result<()> { self.set_status(node_id, ParticipantStatus::Suspended) }

    pub fn reactivate(&self, node_id: &str) -> Result<()> { self.set_status(node_id, ParticipantStatus::Active) }

    fn set_status(&self, node_id: &str, status: ParticipantStatus) -> Result<()> {
        let mut map = self.participants.write();
        let participant = map.get_mut(node_id).ok_or_else(|| CollectiveError::UnknownParticipant(node_id.to_string()))?;
        if participant.status != status {
            warn!(node_id, ?status, "participant status changed");
            participant.status = status;
        }
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Option<Participant> { self.participants.read().get(node_id).cloned() }

    pub fn list(&self) -> Vec<Participant> {
        let mut all: Vec<Participant> = self.participants.read().values().cloned().collect();
        all.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then_with(|| a.node_id.cmp(&b.node_id)));
        all
    }

    pub fn count(&self) -> usize { self.participants.read().len() }

    pub fn active_count(&self) -> usize {
        self.participants.read().values().filter(|p| p.status == ParticipantStatus::Active).count()
    }
}

impl Membership for ParticipantRegistry {
    fn is_active(&self, node_id: &str) -> bool {
        self.participants.read().get(node_id).map(|p| p.status == ParticipantStatus::Active).unwrap_or(false)
    }
}
