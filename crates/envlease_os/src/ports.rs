#![forbid(unsafe_code)]

//! Collaborators the lease core depends on but does not implement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use envlease_contracts::lease::ExecutionError;
use envlease_contracts::MonotonicTimeNs;

pub trait Clock: Send + Sync {
    fn now(&self) -> MonotonicTimeNs;
}

/// Monotonic nanoseconds since the clock was created, starting at 1.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonotonicTimeNs {
        let nanos = self.origin.elapsed().as_nanos();
        let nanos = u64::try_from(nanos).unwrap_or(u64::MAX);
        MonotonicTimeNs(nanos.saturating_add(1))
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ns: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn starting_at(now: MonotonicTimeNs) -> Self {
        Self {
            now_ns: Arc::new(AtomicU64::new(now.0)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.now_ns.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MonotonicTimeNs {
        MonotonicTimeNs(self.now_ns.load(Ordering::SeqCst))
    }
}

/// Performs the full stop/remove/recreate of the managed resource.
///
/// Called from the blocking pool, never while the lease lock is held.
pub trait ResetExecutor: Send + Sync {
    fn reclaim(&self) -> Result<(), ExecutionError>;
}

/// Trusts that release alone returns the resource to baseline.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResetExecutor;

impl ResetExecutor for NoopResetExecutor {
    fn reclaim(&self) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// Answers whether the reclaimed resource is usable right now.
///
/// Must not touch lease state. May be slow; callers run it off the lock.
pub trait ReadinessProbe: Send + Sync {
    fn check(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReady;

impl ReadinessProbe for AlwaysReady {
    fn check(&self) -> bool {
        true
    }
}
