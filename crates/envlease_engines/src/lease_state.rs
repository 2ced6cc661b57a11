#![forbid(unsafe_code)]

//! Deterministic lease transition machine.
//!
//! Holds no lock and reads no clock: every method takes `now` and, where the
//! readiness of a reclaimed resource matters, the probe result. The caller is
//! responsible for serializing access.
//!
//! A stored `Resetting` covers two phases. While the reclaim executor is still
//! running the probe answer is ignored; once [`LeaseState::mark_reclaimed`]
//! records its success, a passing probe surfaces `Ready`.

use std::time::Duration;

use envlease_contracts::lease::{InvalidTransition, LeaseOperation, LeaseSnapshot, LeaseStatus};
use envlease_contracts::{MonotonicTimeNs, ReasonCodeId};

pub mod reason_codes {
    use envlease_contracts::ReasonCodeId;

    // LEASE reason-code namespace.
    pub const LEASE_OK_ACQUIRED: ReasonCodeId = ReasonCodeId(0x4C53_0001);
    pub const LEASE_OK_RELEASE_ACCEPTED: ReasonCodeId = ReasonCodeId(0x4C53_0002);
    pub const LEASE_OK_HEARTBEAT: ReasonCodeId = ReasonCodeId(0x4C53_0003);

    pub const LEASE_HELD_BY_OTHER: ReasonCodeId = ReasonCodeId(0x4C53_0010);
    pub const LEASE_NOT_READY: ReasonCodeId = ReasonCodeId(0x4C53_0011);
    pub const LEASE_RECLAIM_IN_PROGRESS: ReasonCodeId = ReasonCodeId(0x4C53_0012);
    pub const LEASE_NOT_HELD: ReasonCodeId = ReasonCodeId(0x4C53_0013);
    pub const LEASE_RESOURCE_DOWN: ReasonCodeId = ReasonCodeId(0x4C53_0014);

    pub const LEASE_HEARTBEAT_EXPIRED: ReasonCodeId = ReasonCodeId(0x4C53_0020);
    pub const LEASE_RECLAIM_FAILED: ReasonCodeId = ReasonCodeId(0x4C53_0021);

    pub const LEASE_INTERNAL_PIPELINE_ERROR: ReasonCodeId = ReasonCodeId(0x4C53_00F1);
}

/// Events that can move the stored status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEvent {
    Acquire { ready: bool },
    Release,
    ReclaimStarted,
    ReclaimFailed,
}

impl LeaseEvent {
    fn requested(self) -> LeaseStatus {
        match self {
            LeaseEvent::Acquire { .. } => LeaseStatus::InUse,
            LeaseEvent::Release => LeaseStatus::ResetPending,
            LeaseEvent::ReclaimStarted => LeaseStatus::Resetting,
            LeaseEvent::ReclaimFailed => LeaseStatus::Down,
        }
    }
}

/// Total transition function over stored statuses. `Ready` is never stored.
pub fn next_status(
    stored: LeaseStatus,
    event: LeaseEvent,
) -> Result<LeaseStatus, InvalidTransition> {
    let reject = |current| InvalidTransition {
        current,
        requested: event.requested(),
    };
    match (stored, event) {
        (LeaseStatus::Resetting, LeaseEvent::Acquire { ready: true }) => Ok(LeaseStatus::InUse),
        (LeaseStatus::Resetting, LeaseEvent::Acquire { ready: false }) => {
            Err(reject(LeaseStatus::Resetting))
        }
        (LeaseStatus::InUse, LeaseEvent::Release) => Ok(LeaseStatus::ResetPending),
        (LeaseStatus::ResetPending, LeaseEvent::ReclaimStarted) => Ok(LeaseStatus::Resetting),
        (_, LeaseEvent::ReclaimFailed) => Ok(LeaseStatus::Down),
        (current, _) => Err(reject(current)),
    }
}

/// Reason code and text for a rejected operation, keyed by the observed status.
pub fn rejection_reason(
    operation: LeaseOperation,
    observed: LeaseStatus,
) -> (ReasonCodeId, &'static str) {
    match (operation, observed) {
        (_, LeaseStatus::Down) => (
            reason_codes::LEASE_RESOURCE_DOWN,
            "resource is down after a failed reclaim and needs operator intervention",
        ),
        (LeaseOperation::Acquire, LeaseStatus::InUse) => (
            reason_codes::LEASE_HELD_BY_OTHER,
            "resource is already leased",
        ),
        (LeaseOperation::Acquire, LeaseStatus::Resetting) => (
            reason_codes::LEASE_NOT_READY,
            "resource was reset but is not confirmed ready yet",
        ),
        (LeaseOperation::Acquire, LeaseStatus::ResetPending) => (
            reason_codes::LEASE_RECLAIM_IN_PROGRESS,
            "resource reclaim is in progress",
        ),
        _ => (
            reason_codes::LEASE_NOT_HELD,
            "resource is not currently leased",
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseState {
    status: LeaseStatus,
    last_heartbeat: MonotonicTimeNs,
    lease_epoch: u64,
    status_since: MonotonicTimeNs,
    reclaiming: bool,
}

impl LeaseState {
    /// Starts pessimistic: the resource is not yet proven usable.
    pub fn new(now: MonotonicTimeNs) -> Self {
        Self {
            status: LeaseStatus::Resetting,
            last_heartbeat: now,
            lease_epoch: 0,
            status_since: now,
            reclaiming: false,
        }
    }

    pub fn stored_status(&self) -> LeaseStatus {
        self.status
    }

    pub fn lease_epoch(&self) -> u64 {
        self.lease_epoch
    }

    /// True between `mark_resetting` and the matching `mark_reclaimed`.
    pub fn reclaim_in_flight(&self) -> bool {
        self.reclaiming
    }

    pub fn current_status(&self, ready: bool) -> LeaseStatus {
        observed(self.status, self.effective_ready(ready))
    }

    /// Returns the new lease epoch.
    pub fn mark_in_use(
        &mut self,
        ready: bool,
        now: MonotonicTimeNs,
    ) -> Result<u64, InvalidTransition> {
        let ready = self.effective_ready(ready);
        let next = next_status(self.status, LeaseEvent::Acquire { ready }).map_err(|err| {
            InvalidTransition {
                current: observed(err.current, ready),
                requested: err.requested,
            }
        })?;
        self.set_status(next, now);
        self.lease_epoch = self.lease_epoch.saturating_add(1);
        Ok(self.lease_epoch)
    }

    pub fn mark_reset_pending(&mut self, now: MonotonicTimeNs) -> Result<(), InvalidTransition> {
        let next = next_status(self.status, LeaseEvent::Release)?;
        self.set_status(next, now);
        Ok(())
    }

    pub fn mark_resetting(&mut self, now: MonotonicTimeNs) -> Result<(), InvalidTransition> {
        let next = next_status(self.status, LeaseEvent::ReclaimStarted)?;
        self.set_status(next, now);
        self.reclaiming = true;
        Ok(())
    }

    /// The executor finished; readiness is now up to the probe.
    pub fn mark_reclaimed(&mut self) -> Result<(), InvalidTransition> {
        if self.status != LeaseStatus::Resetting || !self.reclaiming {
            return Err(InvalidTransition {
                current: self.status,
                requested: LeaseStatus::Ready,
            });
        }
        self.reclaiming = false;
        Ok(())
    }

    /// Accepted from every stored status; re-marking `Down` keeps `status_since`.
    pub fn mark_down(&mut self, now: MonotonicTimeNs) {
        if self.status == LeaseStatus::Down {
            return;
        }
        if let Ok(next) = next_status(self.status, LeaseEvent::ReclaimFailed) {
            self.set_status(next, now);
        }
        self.reclaiming = false;
    }

    pub fn record_heartbeat(&mut self, now: MonotonicTimeNs) {
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
    }

    pub fn time_since_heartbeat(&self, now: MonotonicTimeNs) -> Duration {
        now.saturating_elapsed_since(self.last_heartbeat)
    }

    /// `InUse -> ResetPending` when the holder has been silent for longer than
    /// `timeout`. Returns whether the transition fired.
    pub fn expire_if_stale(&mut self, now: MonotonicTimeNs, timeout: Duration) -> bool {
        if self.status != LeaseStatus::InUse || self.time_since_heartbeat(now) <= timeout {
            return false;
        }
        self.mark_reset_pending(now).is_ok()
    }

    pub fn snapshot(&self, ready: bool) -> LeaseSnapshot {
        LeaseSnapshot {
            status: self.current_status(ready),
            lease_epoch: self.lease_epoch,
            last_heartbeat: self.last_heartbeat,
            status_since: self.status_since,
        }
    }

    fn effective_ready(&self, ready: bool) -> bool {
        ready && !self.reclaiming
    }

    fn set_status(&mut self, status: LeaseStatus, now: MonotonicTimeNs) {
        self.status = status;
        self.status_since = now;
    }
}

fn observed(stored: LeaseStatus, ready: bool) -> LeaseStatus {
    if stored == LeaseStatus::Resetting && ready {
        LeaseStatus::Ready
    } else {
        stored
    }
}
