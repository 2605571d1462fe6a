//! Primitives for slow, unreliable external calls
//!
//! A [`ConcurrencyToolkit`] is built per orchestrator call. Every git or
//! platform call goes through [`ConcurrencyToolkit::call`], or a copied
//! [`CallPolicy`] inside executor tasks, so timeout and retry behave the same
//! everywhere.

pub mod cache;
pub mod executor;
pub mod retry;
pub mod timing;

pub use cache::{LruCache, TtlCache};
pub use executor::{task, BoundedExecutor, BoxTask, ExecuteOptions, TaskError, TaskResult};
pub use retry::{execute_with_retry, RetryPolicy};
pub use timing::{timed, Stopwatch};

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::capabilities::PullRequest;
use crate::config::ConcurrencyConfig;
use crate::error::OrchestratorError;

#[derive(Debug, Error)]
#[error("no response within {0:?}")]
struct CallTimedOut(Duration);

/// Timeout and retry settings for one external call. `Copy`, so tasks handed
/// to the executor carry their own.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    retry: Option<RetryPolicy>,
    operation_timeout: Duration,
}

impl CallPolicy {
    pub fn new(retry: Option<RetryPolicy>, operation_timeout: Duration) -> Self {
        Self {
            retry,
            operation_timeout,
        }
    }

    /// Run one external call under the operation timeout and retry policy
    pub async fn call<T, F, Fut>(&self, operation: &str, task: F) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.call_with_timeout(operation, self.operation_timeout, task)
            .await
    }

    /// Same as [`CallPolicy::call`] with `limit` applied to each attempt
    pub async fn call_with_timeout<T, F, Fut>(
        &self,
        operation: &str,
        limit: Duration,
        mut task: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let watch = Stopwatch::start(operation);
        let policy = self.retry.unwrap_or_else(RetryPolicy::none);
        let result = execute_with_retry(operation, &policy, || {
            let attempt = task();
            async move {
                match tokio::time::timeout(limit, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(CallTimedOut(limit).into()),
                }
            }
        })
        .await;
        debug!(operation, elapsed_ms = watch.elapsed().as_millis() as u64, ok = result.is_ok(), "External call finished");

        result.map_err(|error| OrchestratorError::ExternalOperationFailure {
            operation: operation.to_string(),
            timed_out: error.downcast_ref::<CallTimedOut>().is_some(),
            message: format!("{error:#}"),
        })
    }
}

#[derive(Debug)]
pub struct ConcurrencyToolkit {
    executor: BoundedExecutor,
    policy: CallPolicy,
    status: TtlCache<String, bool>,
    pull_requests: Mutex<LruCache<u64, PullRequest>>,
}

impl ConcurrencyToolkit {
    /// `retry` is applied only when the caller asked for it
    pub fn new(config: &ConcurrencyConfig, retry: Option<RetryPolicy>) -> Self {
        Self {
            executor: BoundedExecutor::new(config.max_concurrency),
            policy: CallPolicy::new(retry, config.operation_timeout()),
            status: TtlCache::new(config.cache_ttl(), config.cache_capacity),
            pull_requests: Mutex::new(LruCache::new(
                usize::try_from(config.cache_capacity).unwrap_or(usize::MAX),
                Some(config.cache_ttl()),
            )),
        }
    }

    /// Cached yes/no answers such as approval or CI state, keyed by `"<kind>:<pr>"`
    pub fn status_cache(&self) -> &TtlCache<String, bool> {
        &self.status
    }

    pub fn cached_pull_request(&self, number: u64) -> Option<PullRequest> {
        self.pull_requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&number)
    }

    pub fn remember_pull_request(&self, pr: &PullRequest) {
        self.pull_requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(pr.number, pr.clone());
    }

    pub fn policy(&self) -> CallPolicy {
        self.policy
    }

    pub async fn call<T, F, Fut>(&self, operation: &str, task: F) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.policy.call(operation, task).await
    }

    pub async fn call_with_timeout<T, F, Fut>(
        &self,
        operation: &str,
        limit: Duration,
        task: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.policy.call_with_timeout(operation, limit, task).await
    }

    pub async fn execute_all<T>(
        &self,
        tasks: Vec<BoxTask<T>>,
        options: ExecuteOptions,
    ) -> Vec<TaskResult<T>>
    where
        T: Send + 'static,
    {
        self.executor.execute_all(tasks, options).await
    }
}
