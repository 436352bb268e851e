use crate::error::BoxError;
use crate::retry::RetriableError;

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// The future returned by one execution of a task.
pub type TaskFuture<'a, T> = BoxFuture<'a, Result<T, TaskError>>;

/// A unit of work producing a `T`.
///
/// The manager takes ownership of the task on submission and may call
/// `execute` several times when the task asks to be retried. The token is the
/// cancellation signal shared by everything submitted under it; tasks that want
/// to stop early must check it themselves.
pub trait Task<T>: Send + 'static {
  fn execute(&mut self, ctx: CancellationToken) -> TaskFuture<'_, T>;
}

/// Why an execution failed.
#[derive(Debug)]
pub enum TaskError {
  /// Terminal failure, never retried.
  Failed(BoxError),
  /// Transient failure, retried if it carries a retry policy.
  Retriable(RetriableError),
}

impl TaskError {
  pub fn failed(err: impl Into<BoxError>) -> Self {
    TaskError::Failed(err.into())
  }

  /// A retriable signal with no policy attached; treated as terminal.
  pub fn retriable(err: impl Into<BoxError>) -> Self {
    TaskError::Retriable(RetriableError::new(err))
  }

  pub(crate) fn into_source(self) -> BoxError {
    match self {
      TaskError::Failed(err) => err,
      TaskError::Retriable(err) => err.into_parts().0,
    }
  }
}

impl From<RetriableError> for TaskError {
  fn from(err: RetriableError) -> Self {
    TaskError::Retriable(err)
  }
}

impl fmt::Display for TaskError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TaskError::Failed(err) => fmt::Display::fmt(err, f),
      TaskError::Retriable(err) => fmt::Display::fmt(err, f),
    }
  }
}

/// Closure-backed task. Each call to `execute` invokes the closure again and
/// boxes the future it returns.
pub struct TaskFn<F> {
  f: F,
}

impl<F> TaskFn<F> {
  pub fn new<Fut>(f: F) -> Self
  where
    F: FnMut(CancellationToken) -> Fut,
  {
    Self { f }
  }
}

impl<F> fmt::Debug for TaskFn<F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskFn").finish_non_exhaustive()
  }
}

impl<T, F, Fut> Task<T> for TaskFn<F>
where
  F: FnMut(CancellationToken) -> Fut + Send + 'static,
  Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
{
  fn execute(&mut self, ctx: CancellationToken) -> TaskFuture<'_, T> {
    Box::pin((self.f)(ctx))
  }
}
