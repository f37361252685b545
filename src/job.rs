use crate::error::VellumError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Weak;

/// Routing tag consumed by the dispatcher; never interpreted by the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    Read,
    Write,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Created = 0,
    Executing = 1,
    Completed = 2,
    Aborted = 3,
}

impl JobState {
    fn from_u8(raw: u8) -> JobState {
        match raw {
            0 => JobState::Created,
            1 => JobState::Executing,
            2 => JobState::Completed,
            _ => JobState::Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Aborted)
    }
}

/// Outcome of one `work()` invocation, interpreted by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    Done,
    Requeue,
    Aborted,
    Failed,
}

/// What the handler reports on a normal return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerProgress {
    Done,
    Requeue,
}

/// Cooperative cancellation signal handed to the handler during `execute`.
/// The handler polls it at safe points; there is no preemptive interruption,
/// so long-running stretches between polls are a latency risk the handler
/// owns.
pub struct CancelToken<'a> {
    flag: &'a AtomicBool,
}

impl CancelToken<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Shorthand for the usual checkpoint pattern inside a handler.
    pub fn check(&self) -> Result<(), VellumError> {
        if self.is_cancelled() {
            return Err(VellumError::Cancelled);
        }
        Ok(())
    }
}

/// Request-processing logic run on a worker thread. The job owns the handler
/// exclusively from construction until `cleanup` releases it.
pub trait RequestHandler: Send {
    fn execute(&mut self, cancel: &CancelToken<'_>) -> Result<HandlerProgress, VellumError>;
}

/// The transport-layer object that created a job. Held by the job as a
/// `Weak` back-reference: used only for notification, never for lifetime
/// control.
pub trait TransportTask: Send + Sync {
    /// A handler failure during `work()`, to be turned into a user-visible
    /// failure response by the transport layer.
    fn handle_job_error(&self, error: &VellumError);

    /// An attached job hands its handler back here during cleanup instead of
    /// destroying it.
    fn reclaim_handler(&self, handler: Box<dyn RequestHandler>);

    /// Final-state notification once the dispatcher has finished with the
    /// job.
    fn job_done(&self, state: JobState);
}

/// One unit of asynchronous request-handling work. Created on a transport
/// thread, executed by exactly one worker thread at a time, and possibly
/// cancelled, shut down, or torn down from other threads concurrently.
///
/// Shared as `Arc<Job>`: every execution context holding a live reference
/// keeps the backing storage alive, and it is released when the last clone
/// drops. The cleanup body itself is additionally guarded so it runs at most
/// once no matter how many threads reach it.
pub struct Job {
    kind: JobKind,
    queue: String,
    task: Weak<dyn TransportTask>,
    handler: Mutex<Option<Box<dyn RequestHandler>>>,
    /// Detached jobs destroy their handler in cleanup; attached jobs return
    /// it to the task. Immutable after construction.
    detached: bool,
    state: AtomicU8,
    cancel_requested: AtomicBool,
    shutdown_requested: AtomicBool,
    cleanup_started: AtomicBool,
}

impl Job {
    pub fn new(
        kind: JobKind,
        queue: impl Into<String>,
        task: Weak<dyn TransportTask>,
        handler: Box<dyn RequestHandler>,
        detached: bool,
    ) -> Job {
        Job {
            kind,
            queue: queue.into(),
            task,
            handler: Mutex::new(Some(handler)),
            detached,
            state: AtomicU8::new(JobState::Created as u8),
            cancel_requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            cleanup_started: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Runs the handler. The dispatcher guarantees at most one concurrent
    /// invocation per job; `cancel`, `begin_shutdown` and `cleanup` may still
    /// arrive from other threads at any point during the call.
    ///
    /// A cancel observed before the handler starts aborts the job without
    /// invoking it. A shutdown observed before the handler starts completes
    /// the job gracefully without invoking it.
    pub fn work(&self) -> WorkOutcome {
        if self.cancel_requested.load(Ordering::Acquire) {
            self.store_state(JobState::Aborted);
            return WorkOutcome::Aborted;
        }
        if self.shutdown_requested.load(Ordering::Acquire) {
            self.store_state(JobState::Completed);
            return WorkOutcome::Done;
        }
        if self
            .state
            .compare_exchange(
                JobState::Created as u8,
                JobState::Executing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug_assert!(false, "work() invoked twice on the same job");
            return WorkOutcome::Aborted;
        }

        let token = CancelToken {
            flag: &self.cancel_requested,
        };
        let progress = {
            let mut guard = self.handler.lock();
            match guard.as_mut() {
                Some(handler) => handler.execute(&token),
                // Cleanup already released the handler; nothing left to run.
                None => {
                    self.store_state(JobState::Aborted);
                    return WorkOutcome::Aborted;
                }
            }
        };

        // A cancellation observed mid-execution wins over the handler's own
        // verdict; the job aborts and the error path stays silent.
        if self.cancel_requested.load(Ordering::Acquire) {
            self.store_state(JobState::Aborted);
            return WorkOutcome::Aborted;
        }

        match progress {
            Ok(HandlerProgress::Done) => {
                self.store_state(JobState::Completed);
                WorkOutcome::Done
            }
            Ok(HandlerProgress::Requeue) => {
                self.store_state(JobState::Created);
                WorkOutcome::Requeue
            }
            Err(error) => {
                self.handle_error(&error);
                self.store_state(JobState::Completed);
                WorkOutcome::Failed
            }
        }
    }

    /// Requests cancellation from any thread, any time after construction.
    /// Idempotent. `running` is the caller's belief about whether the job is
    /// currently executing; the flag only affects logging. Returns false if
    /// the job had already reached a terminal state.
    pub fn cancel(&self, running: bool) -> bool {
        let state = self.state();
        if state.is_terminal() {
            return false;
        }
        self.cancel_requested.store(true, Ordering::Release);
        tracing::debug!(queue = %self.queue, running, "job cancel requested");
        true
    }

    /// Graceful-stop request, distinct from `cancel`: a job that has not yet
    /// started meaningful work will not run its handler, while in-flight work
    /// is left to finish normally. Returns true iff the request can still
    /// prevent handler execution.
    pub fn begin_shutdown(&self) -> bool {
        let state = self.state();
        if state.is_terminal() {
            return false;
        }
        self.shutdown_requested.store(true, Ordering::Release);
        state == JobState::Created
    }

    /// Releases the handler: dropped if the job is detached, handed back to
    /// the task otherwise. However many threads call this concurrently, the
    /// release body runs exactly once; later callers return immediately.
    pub fn cleanup(&self) {
        if self.cleanup_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let handler = self.handler.lock().take();
        let Some(handler) = handler else {
            return;
        };
        if self.detached {
            drop(handler);
            return;
        }
        match self.task.upgrade() {
            Some(task) => task.reclaim_handler(handler),
            // The task was torn down first; there is nowhere to return the
            // handler to, so it is dropped here.
            None => drop(handler),
        }
    }

    /// Delivers a handler failure to the task. Never panics; an error with no
    /// live task is logged and dropped.
    pub fn handle_error(&self, error: &VellumError) {
        match self.task.upgrade() {
            Some(task) => task.handle_job_error(error),
            None => {
                tracing::warn!(
                    queue = %self.queue,
                    code = error.code_str(),
                    %error,
                    "job error with no live task"
                );
            }
        }
    }

    /// Final-state notification to the task, invoked by the dispatcher after
    /// cleanup. No-op if the task is gone.
    pub fn notify_done(&self) {
        if let Some(task) = self.task.upgrade() {
            task.job_done(self.state());
        }
    }

    fn store_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("kind", &self.kind)
            .field("queue", &self.queue)
            .field("state", &self.state())
            .field("detached", &self.detached)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
