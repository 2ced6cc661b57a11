#![forbid(unsafe_code)]

//! Background reclaim: `ResetPending -> Resetting -> {Resetting | Down}`.
//!
//! The lease only becomes acquirable again after the executor returns `Ok`
//! and the worker records it with `mark_reclaimed`.
//!
//! Callers that flipped the lease to `ResetPending` hand a ticket to
//! [`ReleasePipeline::schedule`], which returns immediately. A dedicated worker
//! task drains the queue. Only one ticket can ever be outstanding, because
//! only the caller that won the `InUse -> ResetPending` transition schedules.

use std::sync::Arc;

use envlease_contracts::lease::ExecutionError;
use envlease_engines::lease_state::reason_codes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::lease_state::{LeaseError, SharedLeaseState};
use crate::ports::ResetExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimTrigger {
    Release,
    HeartbeatExpired,
}

impl ReclaimTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            ReclaimTrigger::Release => "release",
            ReclaimTrigger::HeartbeatExpired => "heartbeat_expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReclaimTicket {
    trigger: ReclaimTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineCounters {
    pub scheduled: u64,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Tickets dropped because the lease was no longer `ResetPending`.
    pub skipped: u64,
}

impl PipelineCounters {
    pub fn settled(&self) -> u64 {
        self.succeeded + self.failed + self.skipped
    }

    pub fn in_flight(&self) -> bool {
        self.settled() < self.scheduled
    }
}

#[derive(Clone)]
pub struct ReleasePipeline {
    tx: mpsc::UnboundedSender<ReclaimTicket>,
    state: SharedLeaseState,
    counters: Arc<watch::Sender<PipelineCounters>>,
}

impl ReleasePipeline {
    /// Spawns the reclaim worker. Must be called inside a Tokio runtime.
    pub fn spawn(
        state: SharedLeaseState,
        executor: Arc<dyn ResetExecutor>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (counters, _) = watch::channel(PipelineCounters::default());
        let counters = Arc::new(counters);
        let worker = tokio::spawn(run_worker(
            rx,
            state.clone(),
            executor,
            Arc::clone(&counters),
        ));
        (
            Self {
                tx,
                state,
                counters,
            },
            worker,
        )
    }

    /// Hands off a reclaim for a lease that the caller just moved to `ResetPending`.
    ///
    /// If the worker is gone the lease is marked `Down`: a reclaim that can never
    /// run must not leave the resource looking recoverable.
    pub fn schedule(&self, trigger: ReclaimTrigger) -> Result<(), LeaseError> {
        self.counters.send_modify(|c| c.scheduled += 1);
        if self.tx.send(ReclaimTicket { trigger }).is_ok() {
            tracing::debug!(trigger = trigger.as_str(), "reclaim scheduled");
            return Ok(());
        }
        self.counters.send_modify(|c| c.scheduled -= 1);
        tracing::error!(
            trigger = trigger.as_str(),
            "reclaim worker is gone, marking lease down"
        );
        self.state.mark_down()?;
        Err(LeaseError::PipelineClosed)
    }

    pub fn counters(&self) -> PipelineCounters {
        *self.counters.borrow()
    }

    /// Resolves once every scheduled reclaim has settled.
    pub async fn wait_idle(&self) {
        let mut rx = self.counters.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|c| !c.in_flight()).await;
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<ReclaimTicket>,
    state: SharedLeaseState,
    executor: Arc<dyn ResetExecutor>,
    counters: Arc<watch::Sender<PipelineCounters>>,
) {
    while let Some(ticket) = rx.recv().await {
        run_reclaim(ticket, &state, &executor, &counters).await;
    }
    tracing::debug!("reclaim worker stopped");
}

async fn run_reclaim(
    ticket: ReclaimTicket,
    state: &SharedLeaseState,
    executor: &Arc<dyn ResetExecutor>,
    counters: &watch::Sender<PipelineCounters>,
) {
    let trigger = ticket.trigger.as_str();
    if let Err(err) = state.mark_resetting() {
        tracing::warn!(trigger, error = %err, "reclaim ticket dropped");
        counters.send_modify(|c| c.skipped += 1);
        return;
    }
    counters.send_modify(|c| c.started += 1);
    tracing::info!(trigger, "reclaim started");

    let executor = Arc::clone(executor);
    let outcome = match tokio::task::spawn_blocking(move || executor.reclaim()).await {
        Ok(outcome) => outcome,
        Err(join_err) => Err(ExecutionError::Aborted(format!(
            "reclaim task did not complete: {join_err}"
        ))),
    };

    match outcome {
        Ok(()) => match state.mark_reclaimed() {
            Ok(()) => {
                tracing::info!(trigger, "reclaim finished, awaiting readiness");
                counters.send_modify(|c| c.succeeded += 1);
            }
            Err(err) => {
                tracing::error!(trigger, error = %err, "reclaim finished on a lease it no longer owns");
                counters.send_modify(|c| c.failed += 1);
            }
        },
        Err(err) => {
            tracing::error!(
                trigger,
                reason_code = reason_codes::LEASE_RECLAIM_FAILED.0,
                error = %err,
                "reclaim failed, lease is down"
            );
            if let Err(mark_err) = state.mark_down() {
                tracing::error!(error = %mark_err, "failed to mark lease down");
            }
            counters.send_modify(|c| c.failed += 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use envlease_contracts::lease::LeaseStatus;
    use envlease_contracts::reclaim::ReclaimStep;
    use envlease_contracts::MonotonicTimeNs;

    use crate::ports::{ManualClock, NoopResetExecutor};

    struct CountingExecutor {
        calls: AtomicUsize,
        fail: bool,
    }

    impl ResetExecutor for CountingExecutor {
        fn reclaim(&self) -> Result<(), ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ExecutionError::StepFailed {
                    target: "gitlab".to_string(),
                    step: ReclaimStep::Run,
                    detail: "exit status 125".to_string(),
                });
            }
            Ok(())
        }
    }

    struct PanickingExecutor;

    impl ResetExecutor for PanickingExecutor {
        fn reclaim(&self) -> Result<(), ExecutionError> {
            panic!("executor exploded");
        }
    }

    fn in_use_state() -> SharedLeaseState {
        let state = SharedLeaseState::new(Arc::new(ManualClock::starting_at(MonotonicTimeNs(1))));
        state.mark_in_use(true).unwrap();
        state
    }

    #[tokio::test]
    async fn at_pipeline_01_success_leaves_resetting() {
        let state = in_use_state();
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let (pipeline, _worker) = ReleasePipeline::spawn(state.clone(), executor.clone());

        state.mark_reset_pending().unwrap();
        pipeline.schedule(ReclaimTrigger::Release).unwrap();
        pipeline.wait_idle().await;

        assert_eq!(state.stored_status().unwrap(), LeaseStatus::Resetting);
        assert!(!state.reclaim_in_flight().unwrap());
        assert_eq!(state.current_status(true).unwrap(), LeaseStatus::Ready);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        let counters = pipeline.counters();
        assert_eq!((counters.started, counters.succeeded), (1, 1));
    }

    #[tokio::test]
    async fn at_pipeline_02_failure_marks_down() {
        let state = in_use_state();
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let (pipeline, _worker) = ReleasePipeline::spawn(state.clone(), executor);

        state.mark_reset_pending().unwrap();
        pipeline.schedule(ReclaimTrigger::HeartbeatExpired).unwrap();
        pipeline.wait_idle().await;

        assert_eq!(state.current_status(true).unwrap(), LeaseStatus::Down);
        assert_eq!(pipeline.counters().failed, 1);
    }

    #[tokio::test]
    async fn at_pipeline_03_panicking_executor_counts_as_failure() {
        let state = in_use_state();
        let (pipeline, _worker) = ReleasePipeline::spawn(state.clone(), Arc::new(PanickingExecutor));

        state.mark_reset_pending().unwrap();
        pipeline.schedule(ReclaimTrigger::Release).unwrap();
        pipeline.wait_idle().await;

        assert_eq!(state.stored_status().unwrap(), LeaseStatus::Down);
    }

    #[tokio::test]
    async fn at_pipeline_04_ticket_without_reset_pending_is_skipped() {
        let state = in_use_state();
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let (pipeline, _worker) = ReleasePipeline::spawn(state.clone(), executor.clone());

        pipeline.schedule(ReclaimTrigger::Release).unwrap();
        pipeline.wait_idle().await;

        assert_eq!(state.stored_status().unwrap(), LeaseStatus::InUse);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.counters().skipped, 1);
    }

    #[tokio::test]
    async fn at_pipeline_05_closed_worker_fails_closed() {
        let state = in_use_state();
        let (pipeline, worker) = ReleasePipeline::spawn(state.clone(), Arc::new(NoopResetExecutor));
        worker.abort();
        let _ = worker.await;

        state.mark_reset_pending().unwrap();
        assert_eq!(
            pipeline.schedule(ReclaimTrigger::Release),
            Err(LeaseError::PipelineClosed)
        );
        assert_eq!(state.stored_status().unwrap(), LeaseStatus::Down);
        assert!(!pipeline.counters().in_flight());
    }
}
