use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// A type-erased error returned by task code.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A type-erased error that can be cloned into result snapshots.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Invalid constructor or retry configuration arguments.
///
/// Raised synchronously when a manager is built or a `RetryConfig` is attached,
/// never recorded among task errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
  #[error("concurrency limit must be at least 2, got {0}")]
  ConcurrencyLimitTooLow(usize),

  #[error("max_attempts must be positive, got {0}")]
  MaxAttemptsNotPositive(u32),

  #[error("initial_delay ({initial_delay:?}) cannot be greater than max_delay ({max_delay:?})")]
  InitialDelayExceedsMaxDelay { initial_delay: Duration, max_delay: Duration },

  #[error("backoff_factor must be a finite, non-negative number, got {0}")]
  InvalidBackoffFactor(f64),

  #[error("backoff_factor of 0.0 with non-zero initial_delay ({0:?}) will result in zero delays")]
  ZeroBackoffWithDelay(Duration),
}

/// Errors returned by `submit` and `drain`. These concern dispatch only; task
/// outcomes are reported through `ConcurrencyManager::errors`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
  #[error("operation cancelled")]
  Cancelled,

  #[error("manager's internal semaphore was closed unexpectedly")]
  LimiterClosed,
}

/// Terminal outcome of a task execution that did not produce an output.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
  /// The task failed with a plain error, or with a retriable error that carried no policy.
  #[error("{0}")]
  Failed(SharedError),

  /// Every retry allowed by the policy failed; holds the last observed error.
  /// `retries` excludes the initial execution.
  #[error("retries exhausted after {retries} retries: {last}")]
  RetriesExhausted { retries: u32, last: SharedError },

  /// The cancellation signal fired while the task was waiting for its next attempt.
  #[error("task cancelled while waiting to retry")]
  Cancelled,

  #[error("task panicked during execution")]
  Panicked,
}

impl ExecutionError {
  /// Returns the error produced by the task itself, if there is one.
  pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
    match self {
      ExecutionError::Failed(err) => Some(err.as_ref()),
      ExecutionError::RetriesExhausted { last, .. } => Some(last.as_ref()),
      ExecutionError::Cancelled | ExecutionError::Panicked => None,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, ExecutionError::Cancelled)
  }
}
