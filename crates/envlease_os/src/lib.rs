#![forbid(unsafe_code)]

pub mod heartbeat_monitor;
pub mod lease_service;
pub mod lease_state;
pub mod ports;
pub mod release_pipeline;

pub use heartbeat_monitor::{HeartbeatMonitor, HeartbeatMonitorConfig};
pub use lease_service::{
    AcquireOutcome, LeasePorts, LeaseService, LeaseServiceConfig, LeaseServiceSnapshot,
    ReleaseOutcome,
};
pub use lease_state::{LeaseError, SharedLeaseState};
pub use ports::{AlwaysReady, Clock, ManualClock, NoopResetExecutor, ReadinessProbe, ResetExecutor, SystemClock};
pub use release_pipeline::{PipelineCounters, ReclaimTrigger, ReleasePipeline};
