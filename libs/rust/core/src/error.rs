//! Error taxonomy shared by every collective component.
//!
//! All variants are recoverable, caller-visible outcomes. A routing layer maps
//! them onto responses through [`CollectiveError::kind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{NodeId, RoundId};

pub type Result<T, E = CollectiveError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollectiveError {
    #[error("unknown participant: {0}")]
    UnknownParticipant(NodeId),
    #[error("participant already registered: {0}")]
    DuplicateParticipant(NodeId),
    #[error("unknown round: {0}")]
    UnknownRound(RoundId),
    #[error("round {round_id} is not accepting updates (status: {status})")]
    RoundNotOpen { round_id: RoundId, status: String },
    #[error("round {0} was aborted")]
    RoundAborted(RoundId),
    #[error("round {0} is already aggregated or aggregating")]
    RoundAlreadyAggregated(RoundId),
    #[error("node {node_id} already submitted to round {round_id}")]
    DuplicateSubmission { node_id: NodeId, round_id: RoundId },
    #[error("node {node_id} is not an expected participant of round {round_id}")]
    UnexpectedParticipant { node_id: NodeId, round_id: RoundId },
    #[error("insufficient participants: required {required}, available {available}")]
    InsufficientParticipants { required: usize, available: usize },
    #[error("invalid privacy parameters: {0}")]
    InvalidPrivacyParameters(String),
    #[error("privacy budget exceeded for {node_id}: requested {requested}, remaining {remaining}")]
    PrivacyBudgetExceeded { node_id: NodeId, requested: f64, remaining: f64 },
    #[error("confidence {0} outside [0, 1]")]
    InvalidConfidence(f64),
    #[error("unknown knowledge item: {0}")]
    UnknownKnowledge(String),
    #[error("transfer rate limited for {source_node} -> {target_node}")]
    TransferRateLimited { source_node: NodeId, target_node: NodeId },
    #[error("unknown model version: {0}")]
    UnknownVersion(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Flat error discriminant exposed at the request/response boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownParticipant,
    DuplicateParticipant,
    UnknownRound,
    RoundNotOpen,
    RoundAborted,
    RoundAlreadyAggregated,
    DuplicateSubmission,
    UnexpectedParticipant,
    InsufficientParticipants,
    InvalidPrivacyParameters,
    PrivacyBudgetExceeded,
    InvalidConfidence,
    UnknownKnowledge,
    TransferRateLimited,
    UnknownVersion,
    InvalidPayload,
}

impl CollectiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownParticipant(_) => ErrorKind::UnknownParticipant,
            Self::DuplicateParticipant(_) => ErrorKind::DuplicateParticipant,
            Self::UnknownRound(_) => ErrorKind::UnknownRound,
            Self::RoundNotOpen { .. } => ErrorKind::RoundNotOpen,
            Self::RoundAborted(_) => ErrorKind::RoundAborted,
            Self::RoundAlreadyAggregated(_) => ErrorKind::RoundAlreadyAggregated,
            Self::DuplicateSubmission { .. } => ErrorKind::DuplicateSubmission,
            Self::UnexpectedParticipant { .. } => ErrorKind::UnexpectedParticipant,
            Self::InsufficientParticipants { .. } => ErrorKind::InsufficientParticipants,
            Self::InvalidPrivacyParameters(_) => ErrorKind::InvalidPrivacyParameters,
            Self::PrivacyBudgetExceeded { .. } => ErrorKind::PrivacyBudgetExceeded,
            Self::InvalidConfidence(_) => ErrorKind::InvalidConfidence,
            Self::UnknownKnowledge(_) => ErrorKind::UnknownKnowledge,
            Self::TransferRateLimited { .. } => ErrorKind::TransferRateLimited,
            Self::UnknownVersion(_) => ErrorKind::UnknownVersion,
            Self::InvalidPayload(_) => ErrorKind::InvalidPayload,
        }
    }
}
