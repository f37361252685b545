use crate::config::VellumConfig;
use crate::error::VellumError;
use crate::job::{Job, WorkOutcome};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self as std_mpsc, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

enum Message {
    Run(Arc<Job>),
    Stop,
}

/// Worker pool driving jobs through `work()` and `cleanup()`. Jobs are
/// sharded onto workers by queue name, so all jobs of one queue execute on
/// the same worker thread; this upholds the at-most-one-`work()`-per-job
/// contract without per-job locking.
pub struct Dispatcher {
    workers: Vec<Sender<Message>>,
    handles: Vec<JoinHandle<()>>,
    queued_jobs: Arc<AtomicUsize>,
    max_queued_jobs: usize,
    shutting_down: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(config: &VellumConfig) -> Result<Dispatcher, VellumError> {
        config.validate()?;
        let worker_count = config.worker_threads;
        let queued_jobs = Arc::new(AtomicUsize::new(0));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = std_mpsc::channel::<Message>();
            let worker = WorkerContext {
                requeue_tx: tx.clone(),
                queued_jobs: Arc::clone(&queued_jobs),
                shutting_down: Arc::clone(&shutting_down),
            };
            handles.push(
                std::thread::Builder::new()
                    .name(format!("vellum-worker-{index}"))
                    .spawn(move || run_worker(rx, worker))
                    .map_err(VellumError::Io)?,
            );
            workers.push(tx);
        }
        Ok(Dispatcher {
            workers,
            handles,
            queued_jobs,
            max_queued_jobs: config.max_queued_jobs,
            shutting_down,
        })
    }

    /// Enqueues the job for exactly one `work()` invocation (plus any
    /// requeues its handler asks for).
    pub fn submit(&self, job: Arc<Job>) -> Result<(), VellumError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(VellumError::ShuttingDown);
        }
        if self.queued_jobs.load(Ordering::Relaxed) >= self.max_queued_jobs {
            return Err(VellumError::QueueFull);
        }
        let shard = shard_for_queue(job.queue(), self.workers.len());
        self.queued_jobs.fetch_add(1, Ordering::Relaxed);
        if self.workers[shard].send(Message::Run(job)).is_err() {
            self.queued_jobs.fetch_sub(1, Ordering::Relaxed);
            return Err(VellumError::ShuttingDown);
        }
        Ok(())
    }

    pub fn queued_jobs(&self) -> usize {
        self.queued_jobs.load(Ordering::Relaxed)
    }

    /// Graceful shutdown: rejects new submissions, drains already-queued jobs
    /// through `begin_shutdown` (not-yet-started work completes without
    /// running its handler, but still reaches `cleanup`), and joins the
    /// workers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        for tx in self.workers.drain(..) {
            let _ = tx.send(Message::Stop);
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("dispatcher worker panicked during shutdown");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WorkerContext {
    requeue_tx: Sender<Message>,
    queued_jobs: Arc<AtomicUsize>,
    shutting_down: Arc<AtomicBool>,
}

fn run_worker(rx: Receiver<Message>, worker: WorkerContext) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(job) => worker.run_job(job),
            Message::Stop => {
                // Drain whatever was queued ahead of or raced with the stop
                // request; every drained job still reaches cleanup.
                while let Ok(Message::Run(job)) = rx.try_recv() {
                    worker.run_job(job);
                }
                return;
            }
        }
    }
}

impl WorkerContext {
    fn run_job(&self, job: Arc<Job>) {
        self.queued_jobs.fetch_sub(1, Ordering::Relaxed);
        if self.shutting_down.load(Ordering::Acquire) {
            job.begin_shutdown();
        }
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job.work()));
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                // Handler panics are isolated to the job; the worker keeps
                // serving its queue.
                job.handle_error(&VellumError::HandlerPanicked);
                WorkOutcome::Failed
            }
        };
        match outcome {
            WorkOutcome::Requeue => {
                self.queued_jobs.fetch_add(1, Ordering::Relaxed);
                if self
                    .requeue_tx
                    .send(Message::Run(Arc::clone(&job)))
                    .is_err()
                {
                    self.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                    debug!(queue = job.queue(), "requeue after channel close");
                    job.cleanup();
                    job.notify_done();
                }
            }
            WorkOutcome::Done | WorkOutcome::Aborted | WorkOutcome::Failed => {
                job.cleanup();
                job.notify_done();
            }
        }
    }
}

fn shard_for_queue(queue: &str, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    queue.hash(&mut h);
    (h.finish() as usize) % shard_count
}
