use futures_conman::{BackoffPolicy, ConcurrencyManager, RetriableError, RetryConfig, Task, TaskError, TaskFuture};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Pretends to call a flaky upstream service that succeeds on a given attempt.
struct FlakyFetch {
  id: usize,
  succeed_on: usize,
  attempts: usize,
  policy: BackoffPolicy,
}

impl Task<String> for FlakyFetch {
  fn execute(&mut self, ctx: CancellationToken) -> TaskFuture<'_, String> {
    Box::pin(async move {
      self.attempts += 1;
      info!("Fetch {} attempt {}", self.id, self.attempts);
      if ctx.is_cancelled() {
        return Err(TaskError::failed("fetch abandoned"));
      }
      if self.attempts < self.succeed_on {
        let err = RetriableError::new(format!("fetch {} got 503", self.id)).with_policy(self.policy);
        return Err(err.into());
      }
      Ok::<String, TaskError>(format!("fetch {} ok after {} attempts", self.id, self.attempts))
    })
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Retry With Backoff Example ---");

  let manager = ConcurrencyManager::<String>::new(3, Handle::current(), "retry_manager").expect("valid limit");
  let ctx = CancellationToken::new();

  let plan = [
    (3, BackoffPolicy::Exponential),
    (2, BackoffPolicy::Linear),
    (10, BackoffPolicy::None),
  ];
  for (id, (succeed_on, policy)) in plan.into_iter().enumerate() {
    let task = FlakyFetch {
      id,
      succeed_on,
      attempts: 0,
      policy,
    };
    manager.submit(&ctx, task).await.expect("context not cancelled");
  }

  // A hand-built schedule must pass validation before it can be attached.
  let custom = RetryConfig {
    max_attempts: 3,
    initial_delay: Duration::from_millis(100),
    backoff_factor: 0.0,
    max_delay: Duration::ZERO,
    jitter: false,
  };
  match RetriableError::new("demo").with_retry_config(custom) {
    Ok(_) => info!("Custom retry config accepted."),
    Err(e) => info!("Custom retry config rejected: {}", e),
  }

  manager.drain(&ctx).await.expect("drain is never cancelled here");
  for output in manager.outputs() {
    info!("Output: {}", output);
  }
  for error in manager.errors() {
    info!("Error: {}", error);
  }
  info!("--- Retry With Backoff Example End ---");
}
