#![forbid(unsafe_code)]

use std::time::Duration;

use envlease_contracts::{saturating_millis, ContractViolation};
use envlease_engines::lease_state::reason_codes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::lease_state::{LeaseError, SharedLeaseState};
use crate::release_pipeline::{ReclaimTrigger, ReleasePipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatMonitorConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl HeartbeatMonitorConfig {
    pub fn mvp_v1() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn validate(&self) -> Result<(), ContractViolation> {
        if self.interval.is_zero() {
            return Err(ContractViolation::InvalidValue {
                field: "heartbeat_monitor_config.interval",
                reason: "must be > 0",
            });
        }
        if self.timeout.is_zero() {
            return Err(ContractViolation::InvalidValue {
                field: "heartbeat_monitor_config.timeout",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Reclaims the resource from a holder that stopped heartbeating.
///
/// Detection granularity is one `interval`.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    config: HeartbeatMonitorConfig,
    state: SharedLeaseState,
    pipeline: ReleasePipeline,
}

impl HeartbeatMonitor {
    pub fn new(
        config: HeartbeatMonitorConfig,
        state: SharedLeaseState,
        pipeline: ReleasePipeline,
    ) -> Result<Self, ContractViolation> {
        config.validate()?;
        Ok(Self::from_validated(config, state, pipeline))
    }

    pub(crate) fn from_validated(
        config: HeartbeatMonitorConfig,
        state: SharedLeaseState,
        pipeline: ReleasePipeline,
    ) -> Self {
        Self {
            config,
            state,
            pipeline,
        }
    }

    /// One expiry check. Returns whether a reclaim was scheduled.
    pub fn tick(&self) -> Result<bool, LeaseError> {
        if !self.state.expire_if_stale(self.config.timeout)? {
            return Ok(false);
        }
        tracing::warn!(
            reason_code = reason_codes::LEASE_HEARTBEAT_EXPIRED.0,
            timeout_ms = saturating_millis(self.config.timeout),
            "lease holder stopped heartbeating, reclaiming"
        );
        self.pipeline.schedule(ReclaimTrigger::HeartbeatExpired)?;
        Ok(true)
    }

    /// Runs [`Self::tick`] every `interval` until `shutdown` flips to `true`
    /// or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.tick() {
                            tracing::error!(error = %err, "heartbeat monitor tick failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("heartbeat monitor stopped");
        })
    }
}
