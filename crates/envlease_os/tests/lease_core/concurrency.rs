#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use envlease_contracts::lease::{ExecutionError, LeaseStatus};
use envlease_contracts::MonotonicTimeNs;
use envlease_os::{
    AcquireOutcome, LeasePorts, LeaseService, LeaseServiceConfig, ManualClock, ReadinessProbe,
    ReleaseOutcome, ResetExecutor, SystemClock,
};

struct FlakyProbe {
    calls: AtomicU64,
}

impl ReadinessProbe for FlakyProbe {
    fn check(&self) -> bool {
        // Not ready on every third check.
        self.calls.fetch_add(1, Ordering::SeqCst) % 3 != 0
    }
}

struct SlowReclaim {
    runs: AtomicUsize,
}

impl ResetExecutor for SlowReclaim {
    fn reclaim(&self) -> Result<(), ExecutionError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(2));
        Ok(())
    }
}

/// Samples the lease on entry and exit. A reclaim must see the same epoch
/// throughout, with the lease reading `Resetting`; anything else means a
/// caller was handed the resource mid-reclaim.
struct ObservedReclaim {
    runs: AtomicUsize,
    violations: Mutex<Vec<String>>,
    service: OnceLock<LeaseService>,
    runtime: tokio::runtime::Handle,
}

impl ObservedReclaim {
    fn sample(&self, service: &LeaseService) -> (LeaseStatus, u64) {
        let snapshot = self.runtime.block_on(service.snapshot()).unwrap();
        (snapshot.lease.status, snapshot.lease.lease_epoch)
    }
}

impl ResetExecutor for ObservedReclaim {
    fn reclaim(&self) -> Result<(), ExecutionError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let Some(service) = self.service.get() else {
            return Ok(());
        };
        let before = self.sample(service);
        std::thread::sleep(Duration::from_millis(2));
        let after = self.sample(service);
        if before.0 != LeaseStatus::Resetting || before != after {
            self.violations
                .lock()
                .unwrap()
                .push(format!("entry={before:?} exit={after:?}"));
        }
        Ok(())
    }
}

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_lease_core_concurrency_01_mixed_callers_never_share_the_resource() {
    let executor = Arc::new(ObservedReclaim {
        runs: AtomicUsize::new(0),
        violations: Mutex::new(Vec::new()),
        service: OnceLock::new(),
        runtime: tokio::runtime::Handle::current(),
    });
    let service = LeaseService::start(
        LeaseServiceConfig::mvp_v1(),
        LeasePorts {
            clock: Arc::new(SystemClock::new()),
            executor: executor.clone(),
            probe: Arc::new(FlakyProbe {
                calls: AtomicU64::new(0),
            }),
        },
    )
    .unwrap();
    assert!(executor.service.set(service.clone()).is_ok());

    let epochs = Arc::new(Mutex::new(Vec::new()));
    let accepted_releases = Arc::new(AtomicU64::new(0));
    let rejected_releases = Arc::new(AtomicU64::new(0));

    let mut tasks = Vec::new();
    for worker in 0..16u64 {
        let service = service.clone();
        let epochs = Arc::clone(&epochs);
        let accepted_releases = Arc::clone(&accepted_releases);
        let rejected_releases = Arc::clone(&rejected_releases);
        tasks.push(tokio::spawn(async move {
            let mut rng = XorShift(0x9E37_79B9_7F4A_7C15 ^ (worker + 1));
            let count_release = |outcome: ReleaseOutcome| {
                let counter = match outcome {
                    ReleaseOutcome::Accepted => &accepted_releases,
                    ReleaseOutcome::Rejected { .. } => &rejected_releases,
                };
                counter.fetch_add(1, Ordering::SeqCst);
            };
            for _ in 0..200 {
                match rng.next() % 5 {
                    0 | 1 => {
                        if let AcquireOutcome::Acquired { lease_epoch } =
                            service.acquire().await.unwrap()
                        {
                            epochs.lock().unwrap().push(lease_epoch);
                            service.heartbeat().unwrap();
                            tokio::task::yield_now().await;
                            count_release(service.release().await.unwrap());
                        }
                    }
                    // Any caller may release, holder or not.
                    2 => count_release(service.release().await.unwrap()),
                    3 => service.heartbeat().unwrap(),
                    _ => {
                        let status = service.status().await.unwrap();
                        assert_ne!(status, LeaseStatus::Down);
                    }
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    if service.release().await.unwrap() == ReleaseOutcome::Accepted {
        accepted_releases.fetch_add(1, Ordering::SeqCst);
    }
    service.pipeline().wait_idle().await;

    let violations = executor.violations.lock().unwrap().clone();
    assert!(violations.is_empty(), "lease changed hands mid-reclaim: {violations:?}");

    let mut epochs = epochs.lock().unwrap().clone();
    epochs.sort_unstable();
    let acquisitions = epochs.len() as u64;
    assert!(acquisitions > 0);
    assert_eq!(epochs, (1..=acquisitions).collect::<Vec<_>>());

    // Every lease handed out ends in exactly one accepted release.
    assert_eq!(accepted_releases.load(Ordering::SeqCst), acquisitions);
    assert!(rejected_releases.load(Ordering::SeqCst) > 0);

    let status = service.status().await.unwrap();
    assert!(matches!(status, LeaseStatus::Ready | LeaseStatus::Resetting));
    let counters = service.pipeline().counters();
    assert_eq!(counters.failed, 0);
    assert_eq!(counters.skipped, 0);
    assert_eq!(counters.scheduled, acquisitions);
    assert_eq!(counters.succeeded, executor.runs.load(Ordering::SeqCst) as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_lease_core_concurrency_02_racing_releases_schedule_one_reclaim() {
    let executor = Arc::new(SlowReclaim {
        runs: AtomicUsize::new(0),
    });
    let clock = ManualClock::starting_at(MonotonicTimeNs(1));
    let service = LeaseService::start(
        LeaseServiceConfig::mvp_v1(),
        LeasePorts {
            clock: Arc::new(clock.clone()),
            executor: executor.clone(),
            probe: Arc::new(envlease_os::AlwaysReady),
        },
    )
    .unwrap();
    service.acquire().await.unwrap();
    clock.advance(Duration::from_secs(301));
    let monitor = service.heartbeat_monitor();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            matches!(service.release().await.unwrap(), ReleaseOutcome::Accepted)
        }));
    }
    let expired = tokio::spawn(async move { monitor.tick().unwrap() });

    let mut winners = usize::from(expired.await.unwrap());
    for task in tasks {
        winners += usize::from(task.await.unwrap());
    }
    assert_eq!(winners, 1);

    service.pipeline().wait_idle().await;
    assert_eq!(service.pipeline().counters().scheduled, 1);
    assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
    assert_eq!(service.status().await.unwrap(), LeaseStatus::Ready);
}
