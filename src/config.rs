use crate::error::VellumError;

/// Runtime configuration for a dispatcher instance.
#[derive(Debug, Clone)]
pub struct VellumConfig {
    pub worker_threads: usize,
    /// Upper bound on jobs queued across all workers. `submit` rejects with
    /// `QueueFull` once this is reached; requeued jobs count against it too.
    pub max_queued_jobs: usize,
}

impl Default for VellumConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get().max(2))
                .unwrap_or(4),
            max_queued_jobs: 1024,
        }
    }
}

impl VellumConfig {
    /// Single worker, deterministic execution order within a queue. Intended
    /// for tests and tooling that need reproducible interleavings.
    pub fn serial() -> Self {
        Self {
            worker_threads: 1,
            ..Self::default()
        }
    }

    pub fn bounded(worker_threads: usize, max_queued_jobs: usize) -> Self {
        Self {
            worker_threads,
            max_queued_jobs,
        }
    }

    pub fn validate(&self) -> Result<(), VellumError> {
        if self.worker_threads == 0 {
            return Err(VellumError::InvalidConfig {
                message: "worker_threads must be at least 1".into(),
            });
        }
        if self.max_queued_jobs == 0 {
            return Err(VellumError::InvalidConfig {
                message: "max_queued_jobs must be at least 1".into(),
            });
        }
        Ok(())
    }
}
