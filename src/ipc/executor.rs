//! Execution contexts for user handlers.
//!
//! Handlers never run on the thread that delivered the inbound message.
//! They are submitted to an [`Executor`]; the default [`SerialQueue`] runs jobs
//! one at a time in submission order, [`PoolExecutor`] runs them concurrently.
//! Both run jobs on tokio's blocking pool, so a job may block.

use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Unit of work submitted to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs jobs.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Runs jobs one at a time, in submission order.
#[derive(Debug, Clone)]
pub struct SerialQueue {
    label: String,
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    /// Creates a queue whose drain task lives on `runtime`.
    ///
    /// The queue stops once every clone has been dropped.
    #[must_use]
    pub fn new(label: impl Into<String>, runtime: &Handle) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let task_label = label.clone();
        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = tokio::task::spawn_blocking(job).await {
                    tracing::warn!(queue = %task_label, error = %e, "Queued job failed");
                }
            }
            tracing::trace!(queue = %task_label, "Serial queue drained");
        });

        Self { label, tx }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Executor for SerialQueue {
    fn execute(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::warn!(queue = %self.label, "Serial queue closed, dropping job");
        }
    }
}

/// Runs every job independently on the runtime's blocking pool.
///
/// No ordering is preserved between jobs.
#[derive(Debug, Clone)]
pub struct PoolExecutor {
    runtime: Handle,
}

impl PoolExecutor {
    #[must_use]
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl Executor for PoolExecutor {
    fn execute(&self, job: Job) {
        drop(self.runtime.spawn_blocking(job));
    }
}
