use crate::aggregator::ResultAggregator;
use crate::error::{ConfigError, DispatchError, ExecutionError, SharedError};
use crate::limiter::{ConcurrencyLimiter, SlotPermit};
use crate::retry::RetryConfig;
use crate::task::{Task, TaskError};

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_MANAGED_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Smallest accepted concurrency limit.
pub const MIN_CONCURRENCY_LIMIT: usize = 2;

/// Runs tasks producing `T` with at most `concurrency_limit` of them in flight.
///
/// Each admitted task runs on its own Tokio task and keeps its slot until its
/// whole retry chain ends. Outputs and terminal errors are collected in
/// completion order and read back with [`outputs`](Self::outputs) and
/// [`errors`](Self::errors), typically after [`drain`](Self::drain).
pub struct ConcurrencyManager<T: Send + 'static> {
  manager_name: Arc<String>,
  limiter: Arc<ConcurrencyLimiter>,
  results: Arc<ResultAggregator<T>>,
  tokio_handle: TokioHandle,
}

impl<T: Send + 'static> Clone for ConcurrencyManager<T> {
  fn clone(&self) -> Self {
    Self {
      manager_name: self.manager_name.clone(),
      limiter: self.limiter.clone(),
      results: self.results.clone(),
      tokio_handle: self.tokio_handle.clone(),
    }
  }
}

impl<T: Send + 'static> fmt::Debug for ConcurrencyManager<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConcurrencyManager")
      .field("manager_name", &self.manager_name)
      .field("limiter", &self.limiter)
      .field("outputs", &self.results.output_count())
      .field("errors", &self.results.error_count())
      .finish_non_exhaustive()
  }
}

impl<T: Send + 'static> ConcurrencyManager<T> {
  /// Creates a manager that spawns executions on `tokio_handle`.
  ///
  /// # Errors
  /// Returns `ConfigError::ConcurrencyLimitTooLow` when `concurrency_limit` is below 2.
  pub fn new(concurrency_limit: usize, tokio_handle: TokioHandle, manager_name: &str) -> Result<Self, ConfigError> {
    if concurrency_limit < MIN_CONCURRENCY_LIMIT {
      warn!(manager_name, concurrency_limit, "Rejected concurrency limit below minimum.");
      return Err(ConfigError::ConcurrencyLimitTooLow(concurrency_limit));
    }

    info!(manager_name, concurrency_limit, "Concurrency manager created.");
    Ok(Self {
      manager_name: Arc::new(manager_name.to_string()),
      limiter: ConcurrencyLimiter::new(concurrency_limit),
      results: Arc::new(ResultAggregator::with_capacity(concurrency_limit)),
      tokio_handle,
    })
  }

  pub fn name(&self) -> &str {
    &self.manager_name
  }

  pub fn concurrency_limit(&self) -> usize {
    self.limiter.limit()
  }

  /// Number of admitted executions that have not finished, retries included.
  pub fn active_task_count(&self) -> usize {
    self.limiter.outstanding()
  }

  pub fn available_slots(&self) -> usize {
    self.limiter.available_slots()
  }

  /// Admits `task` and starts it on its own Tokio task.
  ///
  /// Waits while every slot is taken. Returns as soon as the task has been
  /// handed off; its outcome is reported through `outputs`/`errors`. `ctx` is
  /// also given to the task as its execution context and governs retry waits.
  ///
  /// # Errors
  /// Returns `DispatchError::Cancelled` if `ctx` is cancelled before a slot is
  /// reserved; the task is dropped without running.
  pub async fn submit<K>(&self, ctx: &CancellationToken, task: K) -> Result<(), DispatchError>
  where
    K: Task<T>,
  {
    let permit = match self.limiter.acquire(ctx).await {
      Ok(permit) => permit,
      Err(err) => {
        warn!(manager_name = %*self.manager_name, "Submit: Task was not admitted: {}", err);
        return Err(err);
      }
    };

    let task_id = NEXT_MANAGED_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    debug!(
      manager_name = %*self.manager_name,
      %task_id,
      available = self.limiter.available_slots(),
      "Task admitted. Spawning execution unit."
    );

    let execution = Execution {
      task_id,
      ctx: ctx.clone(),
      results: self.results.clone(),
    };

    self.tokio_handle.spawn(
      execution
        .run(task, permit)
        .instrument(info_span!("managed_task", manager_name = %*self.manager_name, %task_id)),
    );
    Ok(())
  }

  /// Waits until every admitted task has reached a terminal outcome.
  ///
  /// # Errors
  /// Returns `DispatchError::Cancelled` if `ctx` fires first. Running tasks are
  /// not stopped and still record their outcomes.
  pub async fn drain(&self, ctx: &CancellationToken) -> Result<(), DispatchError> {
    debug!(manager_name = %*self.manager_name, active = self.limiter.outstanding(), "Draining.");
    tokio::select! {
      biased;
      _ = ctx.cancelled() => {
        warn!(
          manager_name = %*self.manager_name,
          active = self.limiter.outstanding(),
          "Drain cancelled before all tasks completed."
        );
        Err(DispatchError::Cancelled)
      }
      _ = self.limiter.wait_idle() => {
        info!(
          manager_name = %*self.manager_name,
          outputs = self.results.output_count(),
          errors = self.results.error_count(),
          "All tasks completed."
        );
        Ok(())
      }
    }
  }

  /// Terminal errors recorded so far, in completion order.
  pub fn errors(&self) -> Vec<ExecutionError> {
    self.results.errors()
  }
}

impl<T: Clone + Send + 'static> ConcurrencyManager<T> {
  /// Outputs recorded so far, in completion order.
  pub fn outputs(&self) -> Vec<T> {
    self.results.outputs()
  }
}

/// State carried by one execution unit.
struct Execution<T> {
  task_id: u64,
  ctx: CancellationToken,
  results: Arc<ResultAggregator<T>>,
}

/// Result of one call to `Task::execute`, with panics caught.
enum Attempt<T> {
  Succeeded(T),
  Failed(TaskError),
  Panicked,
}

impl<T: Send + 'static> Execution<T> {
  async fn run<K: Task<T>>(self, mut task: K, permit: SlotPermit) {
    // Held until the retry chain is over.
    let _slot = permit;

    match self.attempt(&mut task).await {
      Attempt::Succeeded(output) => {
        trace!(task_id = self.task_id, "Task executed successfully.");
        self.results.record_output(output);
      }
      Attempt::Panicked => self.record_panic(),
      Attempt::Failed(TaskError::Retriable(retriable)) => {
        let (source, config) = retriable.into_parts();
        match config {
          Some(config) => self.retry(&mut task, config, source.into()).await,
          None => {
            debug!(task_id = self.task_id, "Retriable error carries no retry policy. Not retrying.");
            self.results.record_error(ExecutionError::Failed(source.into()));
          }
        }
      }
      Attempt::Failed(TaskError::Failed(err)) => {
        debug!(task_id = self.task_id, "Task failed: {}", err);
        self.results.record_error(ExecutionError::Failed(err.into()));
      }
    }

    debug!(task_id = self.task_id, "Execution unit finished. Releasing slot.");
  }

  async fn attempt<K: Task<T>>(&self, task: &mut K) -> Attempt<T> {
    match AssertUnwindSafe(task.execute(self.ctx.clone())).catch_unwind().await {
      Ok(Ok(output)) => Attempt::Succeeded(output),
      Ok(Err(err)) => Attempt::Failed(err),
      Err(_panic_payload) => Attempt::Panicked,
    }
  }

  /// Replays the task under `config`, the policy captured at the first failure.
  async fn retry<K: Task<T>>(&self, task: &mut K, config: RetryConfig, mut last_error: SharedError) {
    for attempt in 0..config.max_attempts {
      let delay = config.delay_for(attempt);
      debug!(task_id = self.task_id, attempt, ?delay, "Retrying after delay: {}", last_error);

      tokio::select! {
        biased;
        _ = self.ctx.cancelled() => {
          warn!(task_id = self.task_id, attempt, "Cancelled while waiting to retry.");
          self.results.record_error(ExecutionError::Cancelled);
          return;
        }
        _ = tokio::time::sleep(delay) => {}
      }

      match self.attempt(task).await {
        Attempt::Succeeded(output) => {
          debug!(task_id = self.task_id, attempt, "Retry succeeded.");
          self.results.record_output(output);
          return;
        }
        Attempt::Panicked => {
          self.record_panic();
          return;
        }
        Attempt::Failed(err) => {
          trace!(task_id = self.task_id, attempt, "Retry failed: {}", err);
          last_error = err.into_source().into();
        }
      }
    }

    warn!(
      task_id = self.task_id,
      retries = config.max_attempts,
      "Retries exhausted: {}",
      last_error
    );
    self.results.record_error(ExecutionError::RetriesExhausted {
      retries: config.max_attempts,
      last: last_error,
    });
  }

  fn record_panic(&self) {
    error!(task_id = self.task_id, "Task panicked during execution.");
    self.results.record_error(ExecutionError::Panicked);
  }
}
