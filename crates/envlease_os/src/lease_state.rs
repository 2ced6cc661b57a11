#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use envlease_contracts::lease::{InvalidTransition, LeaseSnapshot, LeaseStatus};
use envlease_contracts::MonotonicTimeNs;
use envlease_engines::lease_state::LeaseState;

use crate::ports::Clock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error("lease state lock poisoned")]
    StatePoisoned,
    #[error("reclaim worker is not running")]
    PipelineClosed,
}

/// The single authoritative lease record, shared by handle.
///
/// Every operation takes the lock, reads the clock, applies one in-memory
/// transition, and releases the lock. Nothing here performs I/O.
#[derive(Clone)]
pub struct SharedLeaseState {
    inner: Arc<Mutex<LeaseState>>,
    clock: Arc<dyn Clock>,
}

impl SharedLeaseState {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let state = LeaseState::new(clock.now());
        Self {
            inner: Arc::new(Mutex::new(state)),
            clock,
        }
    }

    pub fn stored_status(&self) -> Result<LeaseStatus, LeaseError> {
        self.with_state(|state, _| state.stored_status())
    }

    pub fn current_status(&self, ready: bool) -> Result<LeaseStatus, LeaseError> {
        self.with_state(|state, _| state.current_status(ready))
    }

    /// Enters `InUse` and starts the holder's heartbeat window. Returns the lease epoch.
    pub fn mark_in_use(&self, ready: bool) -> Result<u64, LeaseError> {
        self.with_state(|state, now| -> Result<u64, LeaseError> {
            let epoch = state.mark_in_use(ready, now)?;
            state.record_heartbeat(now);
            Ok(epoch)
        })?
    }

    pub fn mark_reset_pending(&self) -> Result<(), LeaseError> {
        self.with_state(|state, now| state.mark_reset_pending(now))?
            .map_err(LeaseError::from)
    }

    pub fn mark_resetting(&self) -> Result<(), LeaseError> {
        self.with_state(|state, now| state.mark_resetting(now))?
            .map_err(LeaseError::from)
    }

    pub fn mark_reclaimed(&self) -> Result<(), LeaseError> {
        self.with_state(|state, _| state.mark_reclaimed())?
            .map_err(LeaseError::from)
    }

    pub fn reclaim_in_flight(&self) -> Result<bool, LeaseError> {
        self.with_state(|state, _| state.reclaim_in_flight())
    }

    /// Only a finished reclaim waiting on readiness has a use for the probe.
    pub fn awaiting_readiness(&self) -> Result<bool, LeaseError> {
        self.with_state(|state, _| {
            state.stored_status() == LeaseStatus::Resetting && !state.reclaim_in_flight()
        })
    }

    pub fn mark_down(&self) -> Result<(), LeaseError> {
        self.with_state(|state, now| state.mark_down(now))
    }

    pub fn record_heartbeat(&self) -> Result<(), LeaseError> {
        self.with_state(|state, now| state.record_heartbeat(now))
    }

    pub fn time_since_heartbeat(&self) -> Result<Duration, LeaseError> {
        self.with_state(|state, now| state.time_since_heartbeat(now))
    }

    /// Check and transition under one lock acquisition, so an expiry and a
    /// concurrent release cannot both observe `InUse`.
    pub fn expire_if_stale(&self, timeout: Duration) -> Result<bool, LeaseError> {
        self.with_state(|state, now| state.expire_if_stale(now, timeout))
    }

    pub fn snapshot(&self, ready: bool) -> Result<(LeaseSnapshot, MonotonicTimeNs), LeaseError> {
        self.with_state(|state, now| (state.snapshot(ready), now))
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut LeaseState, MonotonicTimeNs) -> T,
    ) -> Result<T, LeaseError> {
        let mut state = self.inner.lock().map_err(|_| LeaseError::StatePoisoned)?;
        let now = self.clock.now();
        Ok(f(&mut state, now))
    }
}
