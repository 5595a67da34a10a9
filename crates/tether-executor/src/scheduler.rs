//! Slot-based admission control for long-running jobs.
//!
//! A job holds one slot token for its whole lifetime. Starts beyond the
//! slot count wait in FIFO order on a semaphore; the token itself comes
//! from a free list so every running job can report which slot it holds.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::StartError;
use thiserror::Error;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, oneshot},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::CommandBuildError;

/// How long a cancelled job may take to wind down before it is dropped.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Slot tokens; one concurrent job per token.
    pub slots: Vec<String>,
}

impl SchedulerConfig {
    /// `count` slots named `"0"`, `"1"`, ...
    #[must_use]
    pub fn with_slot_count(count: usize) -> Self {
        Self {
            slots: (0..count.max(1)).map(|i| i.to_string()).collect(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::with_slot_count(1)
    }
}

/// Failure inside a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid job parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Command(#[from] CommandBuildError),
    #[error("Process error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Process exited with {}", exit_status(.code))]
    Exited { code: Option<i32>, output: Value },
    #[error("Job cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

#[allow(clippy::ref_option)]
fn exit_status(code: &Option<i32>) -> String {
    code.map_or_else(|| "no exit code (terminated by signal)".to_owned(), |code| format!("code {code}"))
}

/// Detail of a failed job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Output tail of a process job.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub output: Value,
}

impl JobFailure {
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            exit_code: None,
            output: Value::Null,
        }
    }
}

impl From<JobError> for JobFailure {
    fn from(error: JobError) -> Self {
        let message = error.to_string();
        match error {
            JobError::Exited { code, output } => Self {
                error: message,
                exit_code: code,
                output,
            },
            _ => Self::new(message),
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded(Value),
    Failed(JobFailure),
    Cancelled,
}

impl JobOutcome {
    fn from_result(result: Result<Value, JobError>) -> Self {
        match result {
            Ok(value) => Self::Succeeded(value),
            Err(JobError::Cancelled) => Self::Cancelled,
            Err(e) => Self::Failed(e.into()),
        }
    }
}

/// What a job is given when it starts.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub slot: String,
    /// Cancelled by `SlotScheduler::cancel` or shutdown.
    pub cancel: CancellationToken,
}

/// Hook invoked after a job has released its slot.
#[async_trait]
pub trait JobListener: Send + Sync {
    async fn on_job_complete(&self, job_id: &str, outcome: &JobOutcome);
}

/// Handle to an admitted job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: String,
    slot: String,
    completion: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Wait for the job to finish.
    pub async fn outcome(self) -> JobOutcome {
        self.completion.await.unwrap_or(JobOutcome::Cancelled)
    }
}

/// Snapshot of one running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningJobInfo {
    pub job_id: String,
    pub slot: String,
    pub started_at: SystemTime,
}

enum Entry {
    Queued {
        cancel: CancellationToken,
    },
    Running {
        slot: String,
        cancel: CancellationToken,
        started_at: SystemTime,
    },
}

impl Entry {
    const fn cancel_token(&self) -> &CancellationToken {
        match self {
            Self::Queued { cancel } | Self::Running { cancel, .. } => cancel,
        }
    }
}

struct State {
    free: VecDeque<String>,
    jobs: HashMap<String, Entry>,
    shutting_down: bool,
}

struct Inner {
    capacity: usize,
    state: Mutex<State>,
    permits: Arc<Semaphore>,
    listener: RwLock<Option<Arc<dyn JobListener>>>,
    root: CancellationToken,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission control over concurrently running jobs.
///
/// Cheap to clone; clones share the same slots.
#[derive(Clone)]
pub struct SlotScheduler {
    inner: Arc<Inner>,
}

impl SlotScheduler {
    /// Create a scheduler. An empty slot list gets one slot `"0"`.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let slots = if config.slots.is_empty() {
            SchedulerConfig::default().slots
        } else {
            config.slots
        };
        let capacity = slots.len();

        Self {
            inner: Arc::new(Inner {
                capacity,
                state: Mutex::new(State {
                    free: slots.into(),
                    jobs: HashMap::new(),
                    shutting_down: false,
                }),
                permits: Arc::new(Semaphore::new(capacity)),
                listener: RwLock::new(None),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Install the completion hook, replacing any previous one.
    pub fn set_listener(&self, listener: Arc<dyn JobListener>) {
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Admit and launch a job, waiting for a free slot if necessary.
    ///
    /// Waiters are admitted in FIFO order. Dropping the returned future
    /// while it waits releases the job id.
    ///
    /// # Errors
    /// Returns `DuplicateJobId` if the id is running or queued, `Cancelled`
    /// if `cancel` was called while waiting, `ShuttingDown` after `shutdown`.
    pub async fn start<F, Fut>(
        &self,
        job_id: impl Into<String>,
        factory: F,
    ) -> Result<JobHandle, StartError>
    where
        F: FnOnce(JobContext) -> Fut + Send,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        let job_id = job_id.into();
        let cancel = self.inner.root.child_token();
        {
            let mut state = self.inner.state();
            if state.shutting_down {
                return Err(StartError::ShuttingDown);
            }
            if state.jobs.contains_key(&job_id) {
                return Err(StartError::DuplicateJobId(job_id));
            }
            state.jobs.insert(
                job_id.clone(),
                Entry::Queued {
                    cancel: cancel.clone(),
                },
            );
        }
        let reservation = Reservation {
            inner: &self.inner,
            job_id: &job_id,
            armed: true,
        };

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(if self.inner.state().shutting_down {
                    StartError::ShuttingDown
                } else {
                    StartError::Cancelled(job_id.clone())
                });
            }
            permit = Arc::clone(&self.inner.permits).acquire_owned() => {
                permit.map_err(|_| StartError::ShuttingDown)?
            }
        };

        let slot = {
            let mut state = self.inner.state();
            // A permit guarantees a free token.
            let Some(slot) = state.free.pop_front() else {
                warn!(job_id = %job_id, "Permit granted without a free slot");
                return Err(StartError::ShuttingDown);
            };
            state.jobs.insert(
                job_id.clone(),
                Entry::Running {
                    slot: slot.clone(),
                    cancel: cancel.clone(),
                    started_at: SystemTime::now(),
                },
            );
            slot
        };
        reservation.disarm();

        let lease = Lease {
            inner: Arc::clone(&self.inner),
            job_id: job_id.clone(),
            slot: Some(slot.clone()),
            permit: Some(permit),
        };
        let job = factory(JobContext {
            job_id: job_id.clone(),
            slot: slot.clone(),
            cancel: cancel.clone(),
        });

        let (done, completion) = oneshot::channel();
        tokio::spawn(run_job(Arc::clone(&self.inner), lease, job, cancel, done));
        info!(job_id = %job_id, slot = %slot, "Job started");

        Ok(JobHandle {
            job_id,
            slot,
            completion,
        })
    }

    /// Request cooperative cancellation of a running or queued job.
    ///
    /// Returns `false` if no such job is registered.
    pub fn cancel(&self, job_id: &str) -> bool {
        let state = self.inner.state();
        let Some(entry) = state.jobs.get(job_id) else {
            debug!(job_id, "Cancel for unknown job ignored");
            return false;
        };
        entry.cancel_token().cancel();
        info!(job_id, "Job cancellation requested");
        true
    }

    /// Ids of running jobs, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.running().into_iter().map(|job| job.job_id).collect()
    }

    /// Running jobs with their slots, sorted by id.
    #[must_use]
    pub fn running(&self) -> Vec<RunningJobInfo> {
        let mut jobs: Vec<RunningJobInfo> = self
            .inner
            .state()
            .jobs
            .iter()
            .filter_map(|(job_id, entry)| match entry {
                Entry::Running {
                    slot, started_at, ..
                } => Some(RunningJobInfo {
                    job_id: job_id.clone(),
                    slot: slot.clone(),
                    started_at: *started_at,
                }),
                Entry::Queued { .. } => None,
            })
            .collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        jobs
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.inner.state().free.len()
    }

    /// Cancel every job and refuse new starts. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.inner.state();
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        drop(state);
        self.inner.root.cancel();
        info!("Scheduler shutting down");
    }
}

impl fmt::Debug for SlotScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotScheduler")
            .field("capacity", &self.inner.capacity)
            .field("free", &self.free_slots())
            .finish_non_exhaustive()
    }
}

/// Releases a queued job id if `start` is abandoned before admission.
struct Reservation<'a> {
    inner: &'a Inner,
    job_id: &'a str,
    armed: bool,
}

impl Reservation<'_> {
    /// The job was admitted; its entry now belongs to the lease.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state();
        if matches!(state.jobs.get(self.job_id), Some(Entry::Queued { .. })) {
            state.jobs.remove(self.job_id);
        }
    }
}

/// Held by a running job; returns its slot when dropped.
struct Lease {
    inner: Arc<Inner>,
    job_id: String,
    slot: Option<String>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        state.jobs.remove(&self.job_id);
        if let Some(slot) = self.slot.take() {
            state.free.push_back(slot);
        }
        drop(state);
        // Token is back before the next waiter wakes.
        drop(self.permit.take());
    }
}

async fn run_job<Fut>(
    inner: Arc<Inner>,
    lease: Lease,
    job: Fut,
    cancel: CancellationToken,
    done: oneshot::Sender<JobOutcome>,
) where
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    let job_id = lease.job_id.clone();
    let mut job = AssertUnwindSafe(job).catch_unwind().boxed();

    let settle = |result: std::thread::Result<Result<Value, JobError>>| match result {
        Ok(result) => JobOutcome::from_result(result),
        Err(_) => JobOutcome::Failed(JobFailure::new("job panicked")),
    };

    let outcome = tokio::select! {
        biased;
        result = &mut job => settle(result),
        () = cancel.cancelled() => {
            if time::timeout(CANCEL_GRACE, &mut job).await.is_err() {
                warn!(job_id = %job_id, "Job ignored cancellation for {CANCEL_GRACE:?}, dropping it");
            }
            JobOutcome::Cancelled
        }
    };
    drop(job);
    drop(lease);

    match &outcome {
        JobOutcome::Succeeded(_) => info!(job_id = %job_id, "Job succeeded"),
        JobOutcome::Failed(failure) => {
            warn!(job_id = %job_id, error = %failure.error, exit_code = ?failure.exit_code, "Job failed");
        }
        JobOutcome::Cancelled => info!(job_id = %job_id, "Job cancelled"),
    }

    let listener = inner
        .listener
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(listener) = listener {
        listener.on_job_complete(&job_id, &outcome).await;
    }
    let _ = done.send(outcome);
}
