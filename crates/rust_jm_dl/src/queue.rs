//! Contains [`JobQueue`], which runs submitted jobs in FIFO order with a
//! concurrency ceiling.
//!
//! Jobs are kept for the life of the queue so their status can be looked up
//! after they finish. Nothing is persisted.

use crate::errors::{JmError, Result, TargetKind};

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.pad(s)
    }
}

/// What to do, and for whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPayload {
    pub kind: TargetKind,
    pub target_id: String,
    /// Opaque context of whoever submitted the job, handed back on delivery.
    pub requester: String,
}

impl JobPayload {
    pub fn new(kind: TargetKind, target_id: impl Into<String>, requester: impl Into<String>) -> Self {
        Self {
            kind,
            target_id: target_id.into(),
            requester: requester.into(),
        }
    }
}

/// A snapshot of one job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Returned by [`JobQueue::add`]; positions are taken at submission time.
#[derive(Debug, Clone)]
pub struct AddResult {
    pub job: Job,
    /// Unfinished jobs submitted before this one.
    pub pending_ahead: usize,
    /// 1-based rank among unfinished jobs.
    pub queue_position: usize,
}

/// Runs one job. An `Err` marks the job failed with the error's text.
pub type Processor = Arc<dyn Fn(JobPayload) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Entry {
    job: Job,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    active: usize,
}

struct Inner {
    state: Mutex<State>,
    processor: Processor,
    concurrency: usize,
    finished: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An in-memory FIFO job queue.
///
/// Cloning is cheap; clones share the same jobs. [`JobQueue::add`] must be
/// called from within a tokio runtime, since promoted jobs are spawned onto it.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("JobQueue")
            .field("concurrency", &self.inner.concurrency)
            .field("jobs", &state.entries.len())
            .field("active", &state.active)
            .finish()
    }
}

impl JobQueue {
    /// A ceiling of 0 is treated as 1.
    pub fn new(processor: Processor, concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                processor,
                concurrency: concurrency.max(1),
                finished: Notify::new(),
            }),
        }
    }

    /// Submits a job and schedules it.
    pub fn add(&self, payload: JobPayload) -> AddResult {
        let job = Job {
            id: Uuid::new_v4(),
            payload,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        };

        let pending_ahead = {
            let mut state = self.inner.lock();
            let ahead = state
                .entries
                .iter()
                .filter(|e| !e.job.status.is_terminal())
                .count();

            state.entries.push(Entry {
                job: job.clone(),
                cancel: CancellationToken::new(),
            });
            ahead
        };

        info!(
            "Queued job {} ({} {}), {pending_ahead} ahead",
            job.id, job.payload.kind, job.payload.target_id
        );

        schedule(&self.inner);

        AddResult {
            job,
            pending_ahead,
            queue_position: pending_ahead + 1,
        }
    }

    pub fn get_job(&self, id: Uuid) -> Option<Job> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|e| e.job.id == id)
            .map(|e| e.job.clone())
    }

    /// Every job ever submitted, in submission order.
    pub fn all_jobs(&self) -> Vec<Job> {
        self.inner.lock().entries.iter().map(|e| e.job.clone()).collect()
    }

    /// Jobs that haven't completed: pending, processing, or failed.
    pub fn unfinished_jobs(&self) -> Vec<Job> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.job.status != JobStatus::Completed)
            .map(|e| e.job.clone())
            .collect()
    }

    /// Cancels a job that hasn't finished yet.
    ///
    /// A pending job fails immediately and never runs. A processing job has
    /// its processor dropped at the next suspension point, then fails.
    /// Returns `false` if the job is unknown or already finished.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut state = self.inner.lock();
        let Some(entry) = state.entries.iter_mut().find(|e| e.job.id == id) else {
            return false;
        };

        match entry.job.status {
            JobStatus::Pending => {
                entry.cancel.cancel();
                entry.job.status = JobStatus::Failed;
                entry.job.finished_at = Some(Utc::now());
                entry.job.error = Some(JmError::Cancelled.to_string());
                drop(state);

                info!("Cancelled pending job {id}");
                self.inner.finished.notify_waiters();
                true
            }
            JobStatus::Processing => {
                info!("Cancelling running job {id}");
                entry.cancel.cancel();
                true
            }
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    /// Waits until the job finishes and returns its final snapshot.
    pub async fn wait(&self, id: Uuid) -> Option<Job> {
        loop {
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let job = self.get_job(id)?;
            if job.status.is_terminal() {
                return Some(job);
            }

            notified.await;
        }
    }

    /// Waits until no job is pending or processing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let busy = self
                .inner
                .lock()
                .entries
                .iter()
                .any(|e| !e.job.status.is_terminal());
            if !busy {
                return;
            }

            notified.await;
        }
    }
}

/// Promotes pending jobs, oldest first, until the ceiling is reached.
fn schedule(inner: &Arc<Inner>) {
    let mut promoted = Vec::new();

    {
        let mut state = inner.lock();

        while state.active < inner.concurrency {
            let Some(entry) = state
                .entries
                .iter_mut()
                .find(|e| e.job.status == JobStatus::Pending)
            else {
                break;
            };

            entry.job.status = JobStatus::Processing;
            promoted.push((entry.job.id, entry.job.payload.clone(), entry.cancel.clone()));
            state.active += 1;
        }
    }

    for (id, payload, cancel) in promoted {
        debug!("Starting job {id} ({} {})", payload.kind, payload.target_id);

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let work = AssertUnwindSafe(async { (inner.processor)(payload).await }).catch_unwind();
            let outcome = tokio::select! {
                () = cancel.cancelled() => Err(JmError::Cancelled),
                r = work => r.unwrap_or_else(|panic| {
                    Err(JmError::Panicked(panic_message(&*panic)))
                }),
            };

            finish(&inner, id, outcome);
            schedule(&inner);
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn finish(inner: &Inner, id: Uuid, outcome: Result<()>) {
    {
        let mut state = inner.lock();
        state.active = state.active.saturating_sub(1);

        if let Some(entry) = state.entries.iter_mut().find(|e| e.job.id == id) {
            entry.job.finished_at = Some(Utc::now());

            match outcome {
                Ok(()) => {
                    info!("Job {id} completed");
                    entry.job.status = JobStatus::Completed;
                }
                Err(e) => {
                    warn!("Job {id} failed: {e}");
                    entry.job.status = JobStatus::Failed;
                    entry.job.error = Some(e.to_string());
                }
            }
        }
    }

    inner.finished.notify_waiters();
}
