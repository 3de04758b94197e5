use std::str::FromStr;

use shm_transport::env::env_get;

/// Whether several threads may drive one worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThreadMode {
    /// Only the owning thread calls into the worker; the critical section is a no-op.
    #[default]
    Single,
    /// Any thread may call in; the critical section is a reentrant lock.
    Multi,
}

impl FromStr for ThreadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(ThreadMode::Single),
            "multi" => Ok(ThreadMode::Multi),
            other => Err(format!("unknown thread mode '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub thread_mode: ThreadMode,
    /// Capacity of the one-shot progress queue.
    pub progress_queue_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_mode: ThreadMode::Single,
            progress_queue_depth: 1024,
        }
    }
}

impl WorkerConfig {
    /// Defaults overridden by `SHM_WORKER_THREAD_MODE` and `SHM_WORKER_PROGRESS_QUEUE`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            thread_mode: env_get("SHM_WORKER_THREAD_MODE", defaults.thread_mode),
            progress_queue_depth: env_get(
                "SHM_WORKER_PROGRESS_QUEUE",
                defaults.progress_queue_depth,
            ),
        }
    }
}
