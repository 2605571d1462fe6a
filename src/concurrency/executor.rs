// Bounded parallel execution of external calls
//
// Tasks start in input order, never more than `max_concurrency` at once. With
// `stop_on_error`, a task that has not started by the time another one fails
// is skipped; tasks already running are left to finish.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

pub type BoxTask<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

/// Box a future for [`BoundedExecutor::execute_all`]
pub fn task<T, F>(future: F) -> BoxTask<T>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Box::pin(future)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub stop_on_error: bool,
    /// Per-task budget
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("skipped after an earlier failure")]
    Skipped,
}

#[derive(Debug)]
pub struct TaskResult<T> {
    pub outcome: Result<T, TaskError>,
    pub duration: Duration,
}

impl<T> TaskResult<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    fn skipped() -> Self {
        Self {
            outcome: Err(TaskError::Skipped),
            duration: Duration::ZERO,
        }
    }
}

/// Holds a running task's permit. Unless the task reports success, dropping it
/// marks the batch as failed before the permit is returned, including on panic.
struct PermitGuard {
    failed: Arc<AtomicBool>,
    succeeded: bool,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        if !self.succeeded {
            self.failed.store(true, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    permits: Arc<Semaphore>,
    max_concurrency: usize,
}

impl BoundedExecutor {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// One result per task, in input order
    pub async fn execute_all<T>(
        &self,
        tasks: Vec<BoxTask<T>>,
        options: ExecuteOptions,
    ) -> Vec<TaskResult<T>>
    where
        T: Send + 'static,
    {
        let total = tasks.len();
        let failed = Arc::new(AtomicBool::new(false));
        let mut results: Vec<Option<TaskResult<T>>> = (0..total).map(|_| None).collect();
        let mut spawned = vec![false; total];
        let mut running = JoinSet::new();

        for (index, future) in tasks.into_iter().enumerate() {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    results[index] = Some(TaskResult {
                        outcome: Err(TaskError::Failed("executor closed".to_string())),
                        duration: Duration::ZERO,
                    });
                    continue;
                }
            };
            if options.stop_on_error && failed.load(Ordering::SeqCst) {
                debug!(index, total, "Not starting task after earlier failure");
                break;
            }

            let failed = failed.clone();
            spawned[index] = true;
            running.spawn(async move {
                let mut guard = PermitGuard {
                    failed,
                    succeeded: false,
                    _permit: permit,
                };
                let start = Instant::now();
                let outcome = match options.timeout {
                    Some(limit) => match tokio::time::timeout(limit, future).await {
                        Ok(result) => result.map_err(|e| TaskError::Failed(format!("{e:#}"))),
                        Err(_) => Err(TaskError::TimedOut(limit)),
                    },
                    None => future.await.map_err(|e| TaskError::Failed(format!("{e:#}"))),
                };
                guard.succeeded = outcome.is_ok();
                drop(guard);
                (
                    index,
                    TaskResult {
                        outcome,
                        duration: start.elapsed(),
                    },
                )
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((index, result)) => {
                    if let Err(error) = &result.outcome {
                        warn!(index, error = %error, "Task failed");
                    }
                    results[index] = Some(result);
                }
                Err(join_error) => {
                    failed.store(true, Ordering::SeqCst);
                    warn!(error = %join_error, "Task panicked or was cancelled");
                }
            }
        }

        results
            .into_iter()
            .zip(spawned)
            .map(|(slot, was_spawned)| match slot {
                Some(result) => result,
                None if was_spawned => TaskResult {
                    outcome: Err(TaskError::Failed("task panicked".to_string())),
                    duration: Duration::ZERO,
                },
                None => TaskResult::skipped(),
            })
            .collect()
    }
}
