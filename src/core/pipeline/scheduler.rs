use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    constants::{EVENT_CHANNEL_CAPACITY, SCRATCH_DIR_PREFIX},
    core::{
        commands::CommandSet,
        domain::{
            CaseData, CaseResult, CaseStatus, Limits, LimitsError, PipelineKind, Role, RunEvent,
            RunOutcome,
        },
        pipeline::{
            aggregator::ResultAggregator,
            case::CaseRunner,
            matching::{OutputMatcher, TrailingWhitespaceInsensitive},
            plan::{MissingCommand, PipelinePlan},
        },
        traits::executor::StageExecutor,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("a run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    MissingCommand(#[from] MissingCommand),
    #[error(transparent)]
    InvalidLimits(#[from] LimitsError),
    #[error("failed to prepare scratch directory: {0}")]
    Scratch(#[from] std::io::Error),
    #[error("run task failed: {0}")]
    Join(#[from] JoinError),
}

/// Progress stream and final outcome of one run.
#[derive(Debug)]
pub struct RunHandle {
    pub events: ReceiverStream<RunEvent>,
    pub outcome: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Waits for the run to end, discarding any unread events.
    pub async fn outcome(self) -> Result<RunOutcome, SchedulerError> {
        let RunHandle { events, outcome } = self;
        drop(events);
        Ok(outcome.await?)
    }
}

#[derive(Debug)]
struct ActiveRun {
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

impl ActiveRun {
    fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }
}

/// Runs cases `1..=total` of a pipeline with at most `worker_count` in flight.
#[derive(Debug)]
pub struct Scheduler {
    executor: Arc<dyn StageExecutor>,
    commands: CommandSet,
    matcher: Arc<dyn OutputMatcher>,
    scratch_root: PathBuf,
    event_capacity: usize,
    active: Mutex<Option<ActiveRun>>,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn StageExecutor>, commands: CommandSet) -> Self {
        Self {
            executor,
            commands,
            matcher: Arc::new(TrailingWhitespaceInsensitive),
            scratch_root: std::env::temp_dir(),
            event_capacity: EVENT_CHANNEL_CAPACITY,
            active: Mutex::new(None),
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn OutputMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_scratch_root(mut self, scratch_root: PathBuf) -> Self {
        self.scratch_root = scratch_root;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    #[tracing::instrument(skip(self))]
    pub fn start(
        &self,
        total: u32,
        kind: PipelineKind,
        limits: Limits,
    ) -> Result<RunHandle, SchedulerError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|run| !run.is_finished()) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let plan = PipelinePlan::resolve(kind, &self.commands)?;
        let scratch_dir = match kind {
            PipelineKind::Validation => {
                let dir = self
                    .scratch_root
                    .join(format!("{SCRATCH_DIR_PREFIX}{}", Uuid::new_v4()));
                std::fs::create_dir_all(&dir)?;
                Some(dir)
            }
            _ => None,
        };

        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(self.event_capacity);

        let run = Run {
            runner: CaseRunner::new(
                self.executor.clone(),
                Arc::new(plan),
                limits,
                self.matcher.clone(),
                scratch_dir.clone(),
            ),
            aggregator: ResultAggregator::new(kind),
            events: events_tx,
            cancel: cancel.clone(),
            kind,
        };
        let outcome = tokio::spawn(drive(
            Arc::new(run),
            total,
            limits.worker_count(),
            scratch_dir,
            finished_tx,
        ));

        *active = Some(ActiveRun {
            cancel,
            finished: finished_rx,
        });
        tracing::info!("Run started");

        Ok(RunHandle {
            events: ReceiverStream::new(events_rx),
            outcome,
        })
    }

    /// Cancels the active run and returns once every in-flight case has
    /// terminated. Does nothing when no run is active.
    pub async fn stop(&self) {
        let run = {
            let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            active
                .as_ref()
                .map(|run| (run.cancel.clone(), run.finished.clone()))
        };
        let Some((cancel, mut finished)) = run else {
            return;
        };

        if !cancel.is_cancelled() {
            tracing::info!("Stopping run");
        }
        cancel.cancel();
        // an Err means the run task is gone, which is just as final
        let _ = finished.wait_for(|finished| *finished).await;
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|run| !run.is_finished())
    }
}

/// State shared by the case tasks of one run.
struct Run {
    runner: CaseRunner,
    aggregator: ResultAggregator,
    events: mpsc::Sender<RunEvent>,
    cancel: CancellationToken,
    kind: PipelineKind,
}

impl Run {
    async fn execute(&self, case_number: u32) {
        let result = AssertUnwindSafe(self.runner.run_case(case_number, self.cancel.clone()))
            .catch_unwind()
            .await;

        let result = match result {
            Ok(Some(result)) => result,
            Ok(None) => {
                tracing::debug!(case_number, "Case cancelled");
                return;
            }
            Err(_) => {
                tracing::error!(case_number, "Case worker panicked");
                CaseResult {
                    case_number,
                    passed: false,
                    status: CaseStatus::ExecutionError {
                        role: Role::Test,
                        message: "worker panicked".to_string(),
                    },
                    elapsed_seconds: 0.0,
                    total_seconds: 0.0,
                    peak_memory_mb: 0.0,
                    data: CaseData::empty(self.kind),
                }
            }
        };

        tracing::debug!(case_number, status = ?result.status, "Case completed");
        self.aggregator.record(result.clone());
        self.publish_completed(result);
    }

    /// Never blocks: a full channel drops the event, the aggregator keeps the result.
    fn publish_completed(&self, result: CaseResult) {
        let case_number = result.case_number;
        match self.events.try_send(RunEvent::CaseCompleted(result)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(case_number, "Progress channel full, completion event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn publish_started(&self, case_number: u32, total: u32) {
        match self.events.try_send(RunEvent::CaseStarted { case_number, total }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(case_number, "Progress channel full, start event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

#[tracing::instrument(skip_all, fields(kind = %run.kind, total = total))]
async fn drive(
    run: Arc<Run>,
    total: u32,
    worker_count: usize,
    scratch_dir: Option<PathBuf>,
    finished: watch::Sender<bool>,
) -> RunOutcome {
    let mut in_flight = JoinSet::new();
    let mut next_case = 1;

    loop {
        while in_flight.len() < worker_count && next_case <= total && !run.cancel.is_cancelled() {
            let case_number = next_case;
            next_case += 1;
            run.publish_started(case_number, total);

            let run = run.clone();
            in_flight.spawn(async move { run.execute(case_number).await });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        if let Err(e) = joined {
            tracing::error!("Case task failed: {}", e);
        }
    }

    if let Some(dir) = scratch_dir {
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::warn!("Failed to remove scratch directory {}: {}", dir.display(), e);
        }
    }

    let cancelled = run.cancel.is_cancelled() && run.aggregator.completed() < total;
    let outcome = run.aggregator.finalize(total, cancelled);
    tracing::info!(
        passed = outcome.passed,
        failed = outcome.failed,
        errored = outcome.errored,
        cancelled = outcome.cancelled,
        "Run finished"
    );

    // closes the progress stream before anyone waiting in `stop` resumes
    drop(run);
    let _ = finished.send(true);
    outcome
}
