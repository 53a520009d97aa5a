// ============================================================================
// FILTER WORKERS — bounded pool for heavy filters, cancellation tokens
// ============================================================================

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use image::RgbaImage;

use crate::settings::EngineSettings;

/// Upper bound on filter worker threads.
pub const MAX_WORKERS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to start filter workers: {0}")]
    Build(#[from] rayon::ThreadPoolBuildError),
}

/// Shared cancellation flag.  Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Hands out one live token per target; starting new work for a target
/// cancels whatever was still running for it.
pub struct SupersedeTracker<K> {
    active: HashMap<K, CancelToken>,
}

impl<K: Eq + Hash> Default for SupersedeTracker<K> {
    fn default() -> Self {
        Self { active: HashMap::new() }
    }
}

impl<K: Eq + Hash> SupersedeTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, key: K) -> CancelToken {
        let token = CancelToken::new();
        if let Some(previous) = self.active.insert(key, token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Forget `token` if it is still the live one for `key`.
    pub fn finish(&mut self, key: &K, token: &CancelToken) {
        if self.active.get(key).is_some_and(|t| t.same_as(token)) {
            self.active.remove(key);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, token) in self.active.drain() {
            token.cancel();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.active.len()
    }
}

#[derive(Debug, PartialEq)]
pub enum JobOutcome<T> {
    Completed(T),
    /// Cancelled before or while running.  Not an error.
    Cancelled,
    Failed(String),
}

/// Handle to a submitted job.
pub struct FilterTicket<T> {
    label: String,
    receiver: mpsc::Receiver<JobOutcome<T>>,
    cancel: CancelToken,
}

impl<T> FilterTicket<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until the job finishes.
    pub fn wait(self) -> JobOutcome<T> {
        self.receiver
            .recv()
            .unwrap_or_else(|_| JobOutcome::Failed(format!("worker for '{}' exited", self.label)))
    }
}

/// Fixed-size worker pool; threads are reused across jobs.
pub struct FilterWorkerPool {
    pool: rayon::ThreadPool,
    threads: usize,
}

impl FilterWorkerPool {
    pub fn new(threads: usize) -> Result<Self, WorkerError> {
        let threads = threads.clamp(1, MAX_WORKERS);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tokenstudio-filter-{}", i))
            .build()?;
        Ok(Self { pool, threads })
    }

    pub fn from_settings(settings: &EngineSettings) -> Result<Self, WorkerError> {
        match settings.worker_threads {
            0 => Self::new(default_threads()),
            n => Self::new(n),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `filter_fn` on `input` on a worker thread.
    pub fn submit<F>(&self, label: impl Into<String>, input: RgbaImage, cancel: CancelToken, filter_fn: F) -> FilterTicket<RgbaImage>
    where
        F: FnOnce(&RgbaImage) -> RgbaImage + Send + 'static,
    {
        self.submit_job(label, cancel, move |_| filter_fn(&input))
    }

    /// Run an arbitrary job.  The job receives the token so it can stop
    /// early; a cancelled token always yields `JobOutcome::Cancelled`.
    pub fn submit_job<T, F>(&self, label: impl Into<String>, cancel: CancelToken, job: F) -> FilterTicket<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> T + Send + 'static,
    {
        let label = label.into();
        let (sender, receiver) = mpsc::channel();
        let token = cancel.clone();
        let description = label.clone();
        self.pool.spawn(move || {
            if token.is_cancelled() {
                let _ = sender.send(JobOutcome::Cancelled);
                return;
            }
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job(&token)));
            let outcome = match result {
                Ok(_) if token.is_cancelled() => JobOutcome::Cancelled,
                Ok(value) => JobOutcome::Completed(value),
                Err(panic_info) => {
                    let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_info.downcast_ref::<String>() {
                        s.to_string()
                    } else {
                        "unknown panic payload".to_string()
                    };
                    log_err!("Filter '{}' panicked: {}", description, msg);
                    JobOutcome::Failed(msg)
                }
            };
            let _ = sender.send(outcome);
        });
        FilterTicket { label, receiver, cancel }
    }
}

/// Available parallelism clamped to 2..=4.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, MAX_WORKERS)
}
