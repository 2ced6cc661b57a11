#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::reclaim::ReclaimStep;
use crate::MonotonicTimeNs;

/// Externally visible lease status.
///
/// `Ready` is never stored: a stored `Resetting` reads as `Ready` once the
/// readiness probe confirms the reclaimed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseStatus {
    ResetPending,
    Resetting,
    Ready,
    InUse,
    Down,
}

impl LeaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseStatus::ResetPending => "RESET_PENDING",
            LeaseStatus::Resetting => "RESETTING",
            LeaseStatus::Ready => "READY",
            LeaseStatus::InUse => "IN_USE",
            LeaseStatus::Down => "DOWN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RESET_PENDING" => Some(LeaseStatus::ResetPending),
            "RESETTING" => Some(LeaseStatus::Resetting),
            "READY" => Some(LeaseStatus::Ready),
            "IN_USE" => Some(LeaseStatus::InUse),
            "DOWN" => Some(LeaseStatus::Down),
            _ => None,
        }
    }

    /// Statuses from which a later acquire can succeed without operator action.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, LeaseStatus::Down)
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseOperation {
    Acquire,
    Release,
    Heartbeat,
    Status,
}

impl LeaseOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseOperation::Acquire => "ACQUIRE",
            LeaseOperation::Release => "RELEASE",
            LeaseOperation::Heartbeat => "HEARTBEAT",
            LeaseOperation::Status => "STATUS",
        }
    }
}

/// A transition that is not legal from the status the caller observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot move lease to {requested} while it is {current}")]
pub struct InvalidTransition {
    pub current: LeaseStatus,
    pub requested: LeaseStatus,
}

/// Reclaim failed somewhere in its sequence. There is no partial success.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("{step} of {target} failed: {detail}")]
    StepFailed {
        target: String,
        step: ReclaimStep,
        detail: String,
    },
    #[error("reclaim aborted: {0}")]
    Aborted(String),
}

/// Point-in-time view of the lease for status detail and health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSnapshot {
    pub status: LeaseStatus,
    pub lease_epoch: u64,
    pub last_heartbeat: MonotonicTimeNs,
    pub status_since: MonotonicTimeNs,
}
