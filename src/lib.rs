//! A Tokio-based concurrency manager that runs typed tasks under a fixed
//! concurrency ceiling, aggregates their outputs and errors, and retries
//! transient failures with configurable backoff.

mod aggregator;
mod error;
mod limiter;
mod manager;
mod retry;
mod task;

pub use error::{BoxError, ConfigError, DispatchError, ExecutionError, SharedError};
pub use manager::{ConcurrencyManager, MIN_CONCURRENCY_LIMIT};
pub use retry::{BackoffPolicy, RetriableError, RetryConfig};
pub use task::{Task, TaskError, TaskFn, TaskFuture};
