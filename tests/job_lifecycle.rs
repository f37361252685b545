use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use vellum::{
    CancelToken, Dispatcher, HandlerProgress, Job, JobKind, JobState, RequestHandler,
    TransportTask, VellumConfig, VellumError, VellumErrorCode, WorkOutcome,
};

fn wait_until(what: &str, pred: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Counts executions and drops; optionally blocks until released, requeues a
/// fixed number of times, or panics.
struct CountingHandler {
    executions: Arc<AtomicUsize>,
    drops: Arc<AtomicUsize>,
    block_until: Option<Arc<AtomicBool>>,
    requeues_left: usize,
    panics: bool,
}

impl CountingHandler {
    fn new(executions: &Arc<AtomicUsize>, drops: &Arc<AtomicUsize>) -> Box<CountingHandler> {
        Box::new(CountingHandler {
            executions: Arc::clone(executions),
            drops: Arc::clone(drops),
            block_until: None,
            requeues_left: 0,
            panics: false,
        })
    }
}

impl RequestHandler for CountingHandler {
    fn execute(&mut self, cancel: &CancelToken<'_>) -> Result<HandlerProgress, VellumError> {
        self.executions.fetch_add(1, Ordering::AcqRel);
        if self.panics {
            panic!("handler blew up");
        }
        if let Some(release) = &self.block_until {
            while !release.load(Ordering::Acquire) {
                cancel.check()?;
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        if self.requeues_left > 0 {
            self.requeues_left -= 1;
            return Ok(HandlerProgress::Requeue);
        }
        Ok(HandlerProgress::Done)
    }
}

impl Drop for CountingHandler {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct RecordingTask {
    errors: AtomicUsize,
    last_error_code: parking_lot::Mutex<Option<VellumErrorCode>>,
    reclaimed: AtomicUsize,
    done: AtomicUsize,
    aborted: AtomicUsize,
}

impl TransportTask for RecordingTask {
    fn handle_job_error(&self, error: &VellumError) {
        self.errors.fetch_add(1, Ordering::AcqRel);
        *self.last_error_code.lock() = Some(error.code());
    }

    fn reclaim_handler(&self, handler: Box<dyn RequestHandler>) {
        self.reclaimed.fetch_add(1, Ordering::AcqRel);
        drop(handler);
    }

    fn job_done(&self, state: JobState) {
        if state == JobState::Aborted {
            self.aborted.fetch_add(1, Ordering::AcqRel);
        }
        self.done.fetch_add(1, Ordering::AcqRel);
    }
}

fn weak_task(task: &Arc<RecordingTask>) -> Weak<dyn TransportTask> {
    let shared: Arc<dyn TransportTask> = task.clone();
    Arc::downgrade(&shared)
}

fn no_task() -> Weak<dyn TransportTask> {
    Weak::<RecordingTask>::new()
}

/// Scenario: detached job cancelled before any work. The handler is never
/// invoked, the job aborts, and two racing cleanup calls destroy the handler
/// exactly once.
#[test]
fn cancel_before_work_then_racing_cleanup() {
    let executions = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));
    let job = Arc::new(Job::new(
        JobKind::Read,
        "standard",
        no_task(),
        CountingHandler::new(&executions, &drops),
        true,
    ));

    assert!(job.cancel(false));
    assert_eq!(job.work(), WorkOutcome::Aborted);
    assert_eq!(job.state(), JobState::Aborted);
    assert_eq!(executions.load(Ordering::Acquire), 0);

    let first = {
        let job = Arc::clone(&job);
        std::thread::spawn(move || job.cleanup())
    };
    let second = {
        let job = Arc::clone(&job);
        std::thread::spawn(move || job.cleanup())
    };
    first.join().expect("first cleanup thread");
    second.join().expect("second cleanup thread");

    assert_eq!(drops.load(Ordering::Acquire), 1, "handler destroyed exactly once");
}

/// Many threads racing on cleanup while the job is also being cancelled:
/// the release body must still run exactly once.
#[test]
fn cleanup_storm_releases_once() {
    for _ in 0..50 {
        let executions = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        let job = Arc::new(Job::new(
            JobKind::Write,
            "standard",
            no_task(),
            CountingHandler::new(&executions, &drops),
            true,
        ));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let job = Arc::clone(&job);
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        job.cancel(false);
                    }
                    job.cleanup();
                })
            })
            .collect();
        for t in threads {
            t.join().expect("storm thread");
        }
        assert_eq!(drops.load(Ordering::Acquire), 1);
    }
}

#[test]
fn dispatcher_runs_jobs_to_completion() {
    let dispatcher = Dispatcher::new(&VellumConfig::bounded(4, 256)).expect("dispatcher");
    let task = Arc::new(RecordingTask::default());
    let executions = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));

    for i in 0..32 {
        let queue = if i % 2 == 0 { "standard" } else { "bulk-import" };
        let job = Arc::new(Job::new(
            JobKind::Read,
            queue,
            weak_task(&task),
            CountingHandler::new(&executions, &drops),
            true,
        ));
        dispatcher.submit(job).expect("submit");
    }

    wait_until("all jobs done", || task.done.load(Ordering::Acquire) == 32);
    assert_eq!(executions.load(Ordering::Acquire), 32);
    assert_eq!(drops.load(Ordering::Acquire), 32);
    assert_eq!(dispatcher.queued_jobs(), 0);
    dispatcher.shutdown();
}

#[test]
fn dispatcher_requeues_until_handler_is_done() {
    let dispatcher = Dispatcher::new(&VellumConfig::serial()).expect("dispatcher");
    let task = Arc::new(RecordingTask::default());
    let executions = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));

    let mut handler = CountingHandler::new(&executions, &drops);
    handler.requeues_left = 2;
    let job = Arc::new(Job::new(
        JobKind::Write,
        "standard",
        weak_task(&task),
        handler,
        true,
    ));
    dispatcher.submit(job).expect("submit");

    wait_until("requeued job done", || {
        task.done.load(Ordering::Acquire) == 1
    });
    assert_eq!(executions.load(Ordering::Acquire), 3);
    assert_eq!(drops.load(Ordering::Acquire), 1);
    dispatcher.shutdown();
}

#[test]
fn dispatcher_reports_queue_full() {
    let dispatcher = Dispatcher::new(&VellumConfig::bounded(1, 1)).expect("dispatcher");
    let task = Arc::new(RecordingTask::default());
    let executions = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));

    let mut blocker = CountingHandler::new(&executions, &drops);
    blocker.block_until = Some(Arc::clone(&release));
    let job = Arc::new(Job::new(
        JobKind::Read,
        "standard",
        weak_task(&task),
        blocker,
        true,
    ));
    dispatcher.submit(job).expect("first submit");
    wait_until("worker picked up blocker", || {
        executions.load(Ordering::Acquire) == 1
    });

    dispatcher
        .submit(Arc::new(Job::new(
            JobKind::Read,
            "standard",
            weak_task(&task),
            CountingHandler::new(&executions, &drops),
            true,
        )))
        .expect("second submit fills the queue");
    let err = dispatcher
        .submit(Arc::new(Job::new(
            JobKind::Read,
            "standard",
            weak_task(&task),
            CountingHandler::new(&executions, &drops),
            true,
        )))
        .expect_err("third submit must be rejected");
    assert_eq!(err.code(), VellumErrorCode::QueueFull);

    release.store(true, Ordering::Release);
    wait_until("queued jobs done", || task.done.load(Ordering::Acquire) == 2);
    dispatcher.shutdown();
    // The rejected job never entered the pool; its handler is dropped with
    // the Arc, plus the two accepted ones released by the workers.
    assert_eq!(drops.load(Ordering::Acquire), 3);
}

#[test]
fn dispatcher_isolates_handler_panics() {
    let dispatcher = Dispatcher::new(&VellumConfig::serial()).expect("dispatcher");
    let task = Arc::new(RecordingTask::default());
    let executions = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));

    let mut panicking = CountingHandler::new(&executions, &drops);
    panicking.panics = true;
    dispatcher
        .submit(Arc::new(Job::new(
            JobKind::Read,
            "standard",
            weak_task(&task),
            panicking,
            true,
        )))
        .expect("submit panicking job");
    dispatcher
        .submit(Arc::new(Job::new(
            JobKind::Read,
            "standard",
            weak_task(&task),
            CountingHandler::new(&executions, &drops),
            true,
        )))
        .expect("submit follow-up job");

    wait_until("both jobs done", || task.done.load(Ordering::Acquire) == 2);
    assert_eq!(task.errors.load(Ordering::Acquire), 1);
    assert_eq!(
        *task.last_error_code.lock(),
        Some(VellumErrorCode::HandlerPanicked)
    );
    assert_eq!(drops.load(Ordering::Acquire), 2);
    dispatcher.shutdown();
}

/// An attached job hands its handler back to the task instead of dropping it
/// on the worker thread.
#[test]
fn attached_job_returns_handler_to_task() {
    let dispatcher = Dispatcher::new(&VellumConfig::serial()).expect("dispatcher");
    let task = Arc::new(RecordingTask::default());
    let executions = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));

    dispatcher
        .submit(Arc::new(Job::new(
            JobKind::Read,
            "standard",
            weak_task(&task),
            CountingHandler::new(&executions, &drops),
            false,
        )))
        .expect("submit attached job");

    wait_until("attached job done", || task.done.load(Ordering::Acquire) == 1);
    assert_eq!(task.reclaimed.load(Ordering::Acquire), 1);
    assert_eq!(drops.load(Ordering::Acquire), 1);
    dispatcher.shutdown();
}

/// Cancellation from the transport thread while the worker is mid-execution:
/// the handler observes the cooperative signal, the job aborts, and cleanup
/// runs exactly once even with the transport also calling it.
#[test]
fn concurrent_cancel_during_execution() {
    let dispatcher = Dispatcher::new(&VellumConfig::serial()).expect("dispatcher");
    let task = Arc::new(RecordingTask::default());
    let executions = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));
    let never = Arc::new(AtomicBool::new(false));

    let mut handler = CountingHandler::new(&executions, &drops);
    handler.block_until = Some(Arc::clone(&never));
    let job = Arc::new(Job::new(
        JobKind::Read,
        "standard",
        weak_task(&task),
        handler,
        true,
    ));
    dispatcher.submit(Arc::clone(&job)).expect("submit");
    wait_until("worker picked up job", || {
        executions.load(Ordering::Acquire) == 1
    });

    assert!(job.cancel(true));
    wait_until("job aborted", || task.done.load(Ordering::Acquire) == 1);
    assert_eq!(task.aborted.load(Ordering::Acquire), 1);
    assert_eq!(job.state(), JobState::Aborted);

    // Transport-side teardown races the worker's own cleanup.
    job.cleanup();
    assert_eq!(drops.load(Ordering::Acquire), 1);
    dispatcher.shutdown();
}

/// Shutdown with a backlog: every queued job still reaches cleanup exactly
/// once and the task hears about each of them.
#[test]
fn shutdown_drains_backlog_with_cleanup() {
    let dispatcher = Dispatcher::new(&VellumConfig::bounded(1, 64)).expect("dispatcher");
    let task = Arc::new(RecordingTask::default());
    let executions = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));

    let mut blocker = CountingHandler::new(&executions, &drops);
    blocker.block_until = Some(Arc::clone(&release));
    dispatcher
        .submit(Arc::new(Job::new(
            JobKind::Read,
            "standard",
            weak_task(&task),
            blocker,
            true,
        )))
        .expect("submit blocker");
    for _ in 0..8 {
        dispatcher
            .submit(Arc::new(Job::new(
                JobKind::Read,
                "standard",
                weak_task(&task),
                CountingHandler::new(&executions, &drops),
                true,
            )))
            .expect("submit backlog job");
    }
    wait_until("worker picked up blocker", || {
        executions.load(Ordering::Acquire) >= 1
    });

    let releaser = {
        let release = Arc::clone(&release);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            release.store(true, Ordering::Release);
        })
    };
    dispatcher.shutdown();
    releaser.join().expect("releaser thread");

    assert_eq!(task.done.load(Ordering::Acquire), 9);
    assert_eq!(drops.load(Ordering::Acquire), 9, "every handler released once");
}
