#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use envlease_contracts::lease::{ExecutionError, LeaseStatus};
use envlease_contracts::reclaim::ReclaimStep;
use envlease_contracts::MonotonicTimeNs;
use envlease_os::{
    AcquireOutcome, LeasePorts, LeaseService, LeaseServiceConfig, ManualClock, NoopResetExecutor,
    ReadinessProbe, ReleaseOutcome, ResetExecutor,
};
use tokio::sync::watch;

struct FlagProbe(Arc<AtomicBool>);

impl ReadinessProbe for FlagProbe {
    fn check(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct BrokenDocker(Arc<AtomicUsize>);

impl ResetExecutor for BrokenDocker {
    fn reclaim(&self) -> Result<(), ExecutionError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(ExecutionError::StepFailed {
            target: "shopping".to_string(),
            step: ReclaimStep::Stop,
            detail: "exit status 1: Error response from daemon: No such container: shopping"
                .to_string(),
        })
    }
}

fn config() -> LeaseServiceConfig {
    LeaseServiceConfig {
        heartbeat_timeout: Duration::from_secs(300),
        monitor_interval: Duration::from_millis(10),
    }
}

fn start(
    executor: Arc<dyn ResetExecutor>,
    ready: bool,
) -> (LeaseService, ManualClock, Arc<AtomicBool>) {
    let clock = ManualClock::starting_at(MonotonicTimeNs(1));
    let flag = Arc::new(AtomicBool::new(ready));
    let service = LeaseService::start(
        config(),
        LeasePorts {
            clock: Arc::new(clock.clone()),
            executor,
            probe: Arc::new(FlagProbe(Arc::clone(&flag))),
        },
    )
    .unwrap();
    (service, clock, flag)
}

#[tokio::test]
async fn at_lease_core_01_fresh_instance_is_acquirable_once_ready() {
    let (service, _clock, _ready) = start(Arc::new(NoopResetExecutor), true);

    assert_eq!(service.status().await.unwrap(), LeaseStatus::Ready);
    assert_eq!(
        service.acquire().await.unwrap(),
        AcquireOutcome::Acquired { lease_epoch: 1 }
    );
    assert_eq!(service.status().await.unwrap(), LeaseStatus::InUse);
    assert_eq!(
        service.acquire().await.unwrap(),
        AcquireOutcome::Rejected {
            current: LeaseStatus::InUse
        }
    );
}

#[tokio::test]
async fn at_lease_core_02_release_reclaims_in_background_then_reacquires() {
    let (service, _clock, ready) = start(Arc::new(NoopResetExecutor), true);
    service.acquire().await.unwrap();

    ready.store(false, Ordering::SeqCst);
    assert_eq!(service.release().await.unwrap(), ReleaseOutcome::Accepted);
    service.pipeline().wait_idle().await;
    assert_eq!(service.status().await.unwrap(), LeaseStatus::Resetting);
    assert_eq!(
        service.acquire().await.unwrap(),
        AcquireOutcome::Rejected {
            current: LeaseStatus::Resetting
        }
    );

    ready.store(true, Ordering::SeqCst);
    assert_eq!(
        service.acquire().await.unwrap(),
        AcquireOutcome::Acquired { lease_epoch: 2 }
    );
}

#[tokio::test]
async fn at_lease_core_03_silent_holder_is_reclaimed_without_release() {
    let (service, clock, ready) = start(Arc::new(NoopResetExecutor), true);
    service.acquire().await.unwrap();
    ready.store(false, Ordering::SeqCst);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = service.heartbeat_monitor().spawn(shutdown_rx);
    clock.advance(Duration::from_secs(301));

    let observed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = service.status().await.unwrap();
            if status != LeaseStatus::InUse {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("monitor must move a stale lease out of InUse");
    assert!(matches!(
        observed,
        LeaseStatus::ResetPending | LeaseStatus::Resetting
    ));

    service.pipeline().wait_idle().await;
    assert_eq!(service.pipeline().counters().succeeded, 1);
    assert_eq!(service.status().await.unwrap(), LeaseStatus::Resetting);

    shutdown_tx.send(true).unwrap();
    monitor.await.unwrap();
}

#[tokio::test]
async fn at_lease_core_04_failed_reclaim_leaves_resource_down() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (service, clock, _ready) = start(Arc::new(BrokenDocker(Arc::clone(&calls))), true);
    service.acquire().await.unwrap();
    assert_eq!(service.release().await.unwrap(), ReleaseOutcome::Accepted);
    service.pipeline().wait_idle().await;

    assert_eq!(service.status().await.unwrap(), LeaseStatus::Down);
    for _ in 0..5 {
        assert_eq!(
            service.acquire().await.unwrap(),
            AcquireOutcome::Rejected {
                current: LeaseStatus::Down
            }
        );
    }

    clock.advance(Duration::from_secs(3_600));
    assert!(!service.heartbeat_monitor().tick().unwrap());
    assert_eq!(service.status().await.unwrap(), LeaseStatus::Down);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn at_lease_core_05_heartbeats_hold_the_lease_past_the_timeout() {
    let (service, clock, _ready) = start(Arc::new(NoopResetExecutor), true);
    service.acquire().await.unwrap();
    let monitor = service.heartbeat_monitor();

    for _ in 0..6 {
        clock.advance(Duration::from_secs(120));
        service.heartbeat().unwrap();
        assert!(!monitor.tick().unwrap());
    }
    let snapshot = service.snapshot().await.unwrap();
    assert_eq!(snapshot.lease.status, LeaseStatus::InUse);
    assert_eq!(snapshot.since_heartbeat, Duration::ZERO);

    clock.advance(Duration::from_secs(301));
    assert!(monitor.tick().unwrap());
    service.pipeline().wait_idle().await;
    assert_eq!(service.status().await.unwrap(), LeaseStatus::Ready);
}

#[tokio::test]
async fn at_lease_core_06_deterministic_probe_fixes_acquire_outcome() {
    for ready in [false, true] {
        let (service, _clock, _flag) = start(Arc::new(NoopResetExecutor), ready);
        let outcome = service.acquire().await.unwrap();
        if ready {
            assert_eq!(outcome, AcquireOutcome::Acquired { lease_epoch: 1 });
        } else {
            assert_eq!(
                outcome,
                AcquireOutcome::Rejected {
                    current: LeaseStatus::Resetting
                }
            );
        }
    }
}
