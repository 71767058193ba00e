// src/scheduler/mod.rs
//
// Hybrid Scheduler (C6, spec.md §4.6). Admission control and concurrency
// orchestration over submitted jobs: at most one detailed job runs at a
// time, quick jobs may run concurrently with each other but never alongside
// a detailed job. Modeled as an actor — one `tokio::task` owns `QueueState`
// and is driven exclusively by `SchedulerCommand`s over an `mpsc` channel,
// the structural replacement for the shared-lock-plus-background-thread
// pattern in `tsim_quick_job_host_pool_service.py`'s
// `_has_running_detailed_jobs` bookkeeping (spec.md §9 design note).

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::SchedulerError;
use crate::pool::RunningDetailedJobsFn;
use crate::tester::DetailedJobSpec;

/// Quick jobs are read-only with respect to namespaces; detailed jobs mutate
/// them. Set once at submission and authoritative for the job's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Quick,
    Detailed,
}

/// One submitted unit of work. The payload is the same shape regardless of
/// `mode` (a quick job still names source/dest/services, it simply never
/// reaches the mutating phases of the tester); `mode` alone governs
/// admission.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub run_id: String,
    pub mode: JobMode,
    pub job: DetailedJobSpec,
}

/// What a submitter is told once its job reaches the front of an admitted
/// batch. Quick jobs are admitted together as a `Vec`; a detailed job is
/// admitted alone.
#[derive(Debug, Clone)]
pub enum Admission {
    Quick(Vec<JobSpec>),
    Detailed(JobSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedOutcome {
    Finished,
    Cancelled,
}

#[derive(Debug, Clone)]
struct CompletedEntry {
    run_id: String,
    outcome: CompletedOutcome,
}

const COMPLETED_RING_CAPACITY: usize = 200;

struct QueueEntry {
    spec: JobSpec,
    admit_tx: Option<oneshot::Sender<Result<Admission, SchedulerError>>>,
}

struct QueueState {
    capacity: usize,
    queued: VecDeque<QueueEntry>,
    running: HashSet<String>,
    running_detailed: bool,
    completed: VecDeque<CompletedEntry>,
}

impl QueueState {
    fn new(capacity: usize) -> Self {
        QueueState {
            capacity,
            queued: VecDeque::new(),
            running: HashSet::new(),
            running_detailed: false,
            completed: VecDeque::new(),
        }
    }

    fn record_completed(&mut self, run_id: String, outcome: CompletedOutcome) {
        if self.completed.len() >= COMPLETED_RING_CAPACITY {
            self.completed.pop_front();
        }
        self.completed.push_back(CompletedEntry { run_id, outcome });
    }
}

/// Snapshot of `QueueState`, analogous to `pool::PoolStatus`.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub queued: Vec<String>,
    pub running: Vec<String>,
    pub recent_completions: Vec<(String, CompletedOutcome)>,
}

enum SchedulerCommand {
    Submit {
        spec: JobSpec,
        reply: oneshot::Sender<Result<oneshot::Receiver<Result<Admission, SchedulerError>>, SchedulerError>>,
    },
    Cancel {
        run_id: String,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    JobFinished {
        run_id: String,
    },
    Status {
        reply: oneshot::Sender<QueueStatus>,
    },
}

/// Handle to the scheduler actor. Cheap to clone (an `mpsc::Sender` inside);
/// every call is a message send plus (for `submit`/`cancel`) a reply
/// round-trip, never a direct lock on `QueueState`. Whether a detailed job
/// is currently running is additionally mirrored into `running_detailed`, a
/// plain `AtomicBool` the actor updates on every admission/drain — the Host
/// Pool needs a synchronous, lock-free read for this (`RunningDetailedJobsFn`
/// is a sync closure, not an async call), so it is kept outside the
/// channel/actor round trip rather than queried through it.
#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::Sender<SchedulerCommand>,
    last_submission: Arc<Mutex<Option<Instant>>>,
    running_detailed: Arc<AtomicBool>,
}

/// Minimum spacing spec.md §4.6 requires between successive submissions, so
/// FIFO arrival order is deterministic even under concurrent callers.
const SUBMISSION_SPACING: Duration = Duration::from_secs(1);

impl Scheduler {
    pub fn new(queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let running_detailed = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_actor(
            QueueState::new(queue_capacity),
            rx,
            running_detailed.clone(),
        ));
        Scheduler {
            commands: tx,
            last_submission: Arc::new(Mutex::new(None)),
            running_detailed,
        }
    }

    /// Enforces the 1-second inter-submission spacing, then enqueues the job
    /// and returns a receiver that resolves once it (or its quick-job batch)
    /// is admitted to run. Returns `QueueFull` immediately, without waiting
    /// out the spacing delay, if the queue was already at capacity.
    pub async fn submit(
        &self,
        spec: JobSpec,
    ) -> Result<oneshot::Receiver<Result<Admission, SchedulerError>>, SchedulerError> {
        {
            let mut last = self.last_submission.lock().await;
            if let Some(prev) = *last {
                let elapsed = prev.elapsed();
                if elapsed < SUBMISSION_SPACING {
                    tokio::time::sleep(SUBMISSION_SPACING - elapsed).await;
                }
            }
            *last = Some(Instant::now());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(SchedulerCommand::Submit {
                spec,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SchedulerError::UnknownJob("scheduler actor stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| SchedulerError::UnknownJob("scheduler actor stopped".to_string()))?
    }

    /// Cancels a queued job outright, or signals a running job to abort
    /// after its current service completes (spec.md §4.6 cancellation
    /// semantics). The caller driving a running job is expected to poll
    /// `has_running_detailed` / its own cancellation token; this call only
    /// removes the bookkeeping entry and records the outcome.
    pub async fn cancel(&self, run_id: &str) -> Result<(), SchedulerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(SchedulerCommand::Cancel {
                run_id: run_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| SchedulerError::UnknownJob(run_id.to_string()))?;
        reply_rx
            .await
            .map_err(|_| SchedulerError::UnknownJob(run_id.to_string()))?
    }

    /// Called by whoever drove the job (quick-job batch runner or detailed
    /// job executor) once it has fully finished, freeing the slot for the
    /// next admission. Idempotent: finishing an unknown id is a no-op.
    pub async fn job_finished(&self, run_id: &str) {
        let _ = self
            .commands
            .send(SchedulerCommand::JobFinished {
                run_id: run_id.to_string(),
            })
            .await;
    }

    /// Queried by the Host Pool before starting its cleanup grace period
    /// (spec.md §4.3): pool cleanup must pause while any detailed job runs.
    pub fn has_running_detailed(&self) -> bool {
        self.running_detailed.load(Ordering::SeqCst)
    }

    /// The sync closure shape `HostPool::new` expects for its
    /// `has_running_detailed_jobs` check.
    pub fn has_running_detailed_jobs_fn(&self) -> RunningDetailedJobsFn {
        let flag = self.running_detailed.clone();
        Arc::new(move || flag.load(Ordering::SeqCst))
    }

    pub async fn status(&self) -> QueueStatus {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(SchedulerCommand::Status { reply: reply_tx })
            .await
            .is_err()
        {
            return QueueStatus {
                queued: vec![],
                running: vec![],
                recent_completions: vec![],
            };
        }
        reply_rx.await.unwrap_or(QueueStatus {
            queued: vec![],
            running: vec![],
            recent_completions: vec![],
        })
    }
}

async fn run_actor(
    mut state: QueueState,
    mut rx: mpsc::Receiver<SchedulerCommand>,
    running_detailed_flag: Arc<AtomicBool>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            SchedulerCommand::Submit { spec, reply } => {
                if state.queued.len() + state.running.len() >= state.capacity {
                    let _ = reply.send(Err(SchedulerError::QueueFull {
                        capacity: state.capacity,
                    }));
                    continue;
                }
                let (admit_tx, admit_rx) = oneshot::channel();
                debug!(run_id = %spec.run_id, mode = ?spec.mode, "job queued");
                state.queued.push_back(QueueEntry {
                    spec,
                    admit_tx: Some(admit_tx),
                });
                let _ = reply.send(Ok(admit_rx));
            }
            SchedulerCommand::Cancel { run_id, reply } => {
                if let Some(pos) = state.queued.iter().position(|e| e.spec.run_id == run_id) {
                    let mut entry = state.queued.remove(pos).unwrap();
                    if let Some(tx) = entry.admit_tx.take() {
                        let _ = tx.send(Err(SchedulerError::JobCancelled(run_id.clone())));
                    }
                    state.record_completed(run_id, CompletedOutcome::Cancelled);
                    let _ = reply.send(Ok(()));
                } else if state.running.contains(&run_id) {
                    // Running jobs cannot be yanked out from under their
                    // executor; record the cancellation so the next
                    // `JobFinished` reports it, and let the caller's own
                    // cancellation token (outside this actor) stop the work.
                    state.record_completed(run_id, CompletedOutcome::Cancelled);
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(SchedulerError::UnknownJob(run_id)));
                }
            }
            SchedulerCommand::JobFinished { run_id } => {
                if state.running.remove(&run_id) {
                    if state.running.is_empty() {
                        state.running_detailed = false;
                    }
                    state.record_completed(run_id.clone(), CompletedOutcome::Finished);
                    info!(run_id = %run_id, "job finished");
                }
            }
            SchedulerCommand::Status { reply } => {
                let _ = reply.send(QueueStatus {
                    queued: state.queued.iter().map(|e| e.spec.run_id.clone()).collect(),
                    running: state.running.iter().cloned().collect(),
                    recent_completions: state
                        .completed
                        .iter()
                        .map(|c| (c.run_id.clone(), c.outcome))
                        .collect(),
                });
            }
        }
        try_advance(&mut state);
        running_detailed_flag.store(state.running_detailed, Ordering::SeqCst);
    }
}

/// Admits as much work as the current state allows: a whole contiguous
/// prefix of quick jobs if the head of the queue is quick and no detailed
/// job is running, or exactly one detailed job once every running quick job
/// has drained (spec.md §4.6 queue discipline).
fn try_advance(state: &mut QueueState) {
    loop {
        let Some(front) = state.queued.front() else {
            return;
        };

        match front.spec.mode {
            JobMode::Detailed => {
                if state.running_detailed || !state.running.is_empty() {
                    return;
                }
                let mut entry = state.queued.pop_front().unwrap();
                let run_id = entry.spec.run_id.clone();
                state.running.insert(run_id.clone());
                state.running_detailed = true;
                if let Some(tx) = entry.admit_tx.take() {
                    let _ = tx.send(Ok(Admission::Detailed(entry.spec)));
                }
                info!(run_id = %run_id, "detailed job admitted");
                return;
            }
            JobMode::Quick => {
                if state.running_detailed {
                    return;
                }
                let mut batch = Vec::new();
                while let Some(front) = state.queued.front() {
                    if front.spec.mode != JobMode::Quick {
                        break;
                    }
                    let mut entry = state.queued.pop_front().unwrap();
                    let run_id = entry.spec.run_id.clone();
                    state.running.insert(run_id.clone());
                    let admit_tx = entry.admit_tx.take();
                    batch.push((entry.spec, admit_tx));
                }
                if batch.is_empty() {
                    return;
                }
                let run_ids: Vec<&str> = batch.iter().map(|(s, _)| s.run_id.as_str()).collect();
                info!(?run_ids, "quick job batch admitted");
                let specs: Vec<JobSpec> = batch.iter().map(|(s, _)| s.clone()).collect();
                for (_, admit_tx) in batch {
                    if let Some(tx) = admit_tx {
                        let _ = tx.send(Ok(Admission::Quick(specs.clone())));
                    }
                }
                return;
            }
        }
    }
}

impl JobSpec {
    pub fn quick(job: DetailedJobSpec) -> Self {
        JobSpec {
            run_id: job.run_id.clone(),
            mode: JobMode::Quick,
            job,
        }
    }

    pub fn detailed(job: DetailedJobSpec) -> Self {
        JobSpec {
            run_id: job.run_id.clone(),
            mode: JobMode::Detailed,
            job,
        }
    }
}
