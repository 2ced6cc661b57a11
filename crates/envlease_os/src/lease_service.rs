#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use envlease_contracts::lease::{LeaseSnapshot, LeaseStatus};
use envlease_contracts::ContractViolation;

use crate::heartbeat_monitor::{HeartbeatMonitor, HeartbeatMonitorConfig};
use crate::lease_state::{LeaseError, SharedLeaseState};
use crate::ports::{Clock, ReadinessProbe, ResetExecutor};
use crate::release_pipeline::{PipelineCounters, ReclaimTrigger, ReleasePipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseServiceConfig {
    pub heartbeat_timeout: Duration,
    pub monitor_interval: Duration,
}

impl LeaseServiceConfig {
    pub fn mvp_v1() -> Self {
        let monitor = HeartbeatMonitorConfig::mvp_v1();
        Self {
            heartbeat_timeout: monitor.timeout,
            monitor_interval: monitor.interval,
        }
    }

    fn monitor_config(&self) -> HeartbeatMonitorConfig {
        HeartbeatMonitorConfig {
            interval: self.monitor_interval,
            timeout: self.heartbeat_timeout,
        }
    }
}

pub struct LeasePorts {
    pub clock: Arc<dyn Clock>,
    pub executor: Arc<dyn ResetExecutor>,
    pub probe: Arc<dyn ReadinessProbe>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { lease_epoch: u64 },
    Rejected { current: LeaseStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Reclaim is scheduled and will run after this call returns.
    Accepted,
    Rejected { current: LeaseStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseServiceSnapshot {
    pub lease: LeaseSnapshot,
    pub since_heartbeat: Duration,
    pub pipeline: PipelineCounters,
}

/// Caller-facing lease operations.
///
/// Cloning is cheap; all clones drive the same lease.
#[derive(Clone)]
pub struct LeaseService {
    config: LeaseServiceConfig,
    state: SharedLeaseState,
    pipeline: ReleasePipeline,
    probe: Arc<dyn ReadinessProbe>,
}

impl LeaseService {
    /// Starts the reclaim worker. Must be called inside a Tokio runtime.
    pub fn start(config: LeaseServiceConfig, ports: LeasePorts) -> Result<Self, ContractViolation> {
        config.monitor_config().validate()?;
        let state = SharedLeaseState::new(ports.clock);
        let (pipeline, _worker) = ReleasePipeline::spawn(state.clone(), ports.executor);
        Ok(Self {
            config,
            state,
            pipeline,
            probe: ports.probe,
        })
    }

    pub fn heartbeat_monitor(&self) -> HeartbeatMonitor {
        HeartbeatMonitor::from_validated(
            self.config.monitor_config(),
            self.state.clone(),
            self.pipeline.clone(),
        )
    }

    pub fn pipeline(&self) -> &ReleasePipeline {
        &self.pipeline
    }

    pub async fn acquire(&self) -> Result<AcquireOutcome, LeaseError> {
        if self.state.expire_if_stale(self.config.heartbeat_timeout)? {
            tracing::warn!("stale lease expired on acquire, reclaiming");
            self.pipeline.schedule(ReclaimTrigger::HeartbeatExpired)?;
        }
        let ready = self.probe_if_resetting().await?;
        match self.state.mark_in_use(ready) {
            Ok(lease_epoch) => {
                tracing::info!(lease_epoch, "lease acquired");
                Ok(AcquireOutcome::Acquired { lease_epoch })
            }
            Err(LeaseError::Transition(err)) => {
                tracing::debug!(current = %err.current, "acquire rejected");
                Ok(AcquireOutcome::Rejected {
                    current: err.current,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn release(&self) -> Result<ReleaseOutcome, LeaseError> {
        match self.state.mark_reset_pending() {
            Ok(()) => {
                tracing::info!("lease released, reclaim scheduled");
                self.pipeline.schedule(ReclaimTrigger::Release)?;
                Ok(ReleaseOutcome::Accepted)
            }
            Err(LeaseError::Transition(err)) => {
                let current = if err.current == LeaseStatus::Resetting {
                    self.status().await?
                } else {
                    err.current
                };
                tracing::debug!(current = %current, "release rejected");
                Ok(ReleaseOutcome::Rejected { current })
            }
            Err(err) => Err(err),
        }
    }

    pub fn heartbeat(&self) -> Result<(), LeaseError> {
        self.state.record_heartbeat()
    }

    pub async fn status(&self) -> Result<LeaseStatus, LeaseError> {
        let ready = self.probe_if_resetting().await?;
        self.state.current_status(ready)
    }

    pub async fn snapshot(&self) -> Result<LeaseServiceSnapshot, LeaseError> {
        let ready = self.probe_if_resetting().await?;
        let (lease, now) = self.state.snapshot(ready)?;
        Ok(LeaseServiceSnapshot {
            lease,
            since_heartbeat: now.saturating_elapsed_since(lease.last_heartbeat),
            pipeline: self.pipeline.counters(),
        })
    }

    /// Runs the probe on the blocking pool, and only when its answer matters.
    /// The lock is not held while probing; transitions re-check the stored status
    /// and ignore a stale `true` if a new reclaim started meanwhile.
    async fn probe_if_resetting(&self) -> Result<bool, LeaseError> {
        if !self.state.awaiting_readiness()? {
            return Ok(false);
        }
        let probe = Arc::clone(&self.probe);
        match tokio::task::spawn_blocking(move || probe.check()).await {
            Ok(ready) => Ok(ready),
            Err(err) => {
                tracing::warn!(error = %err, "readiness probe did not complete");
                Ok(false)
            }
        }
    }
}
