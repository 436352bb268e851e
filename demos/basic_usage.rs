use futures_conman::{ConcurrencyManager, TaskError, TaskFn};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn my_task_fn(id: usize, delay_ms: u64) -> Result<String, TaskError> {
  info!("Task {} starting, will sleep for {}ms", id, delay_ms);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  if id == 3 {
    return Err(TaskError::failed(format!("task {} could not finish", id)));
  }
  let result = format!("Task {} finished successfully after {}ms", id, delay_ms);
  info!("{}", result);
  Ok(result)
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Basic Usage Example ---");

  let manager = match ConcurrencyManager::<String>::new(2, Handle::current(), "basic_manager") {
    Ok(manager) => manager,
    Err(e) => {
      tracing::error!("Invalid manager configuration: {}", e);
      return;
    }
  };
  let ctx = CancellationToken::new();

  for i in 0..5 {
    let sleep_duration: u64 = 500 + (i as u64 % 3 * 250);
    let task = TaskFn::new(move |_ctx: CancellationToken| my_task_fn(i, sleep_duration));
    if let Err(e) = manager.submit(&ctx, task).await {
      tracing::error!("Failed to submit task {}: {}", i, e);
    }
  }

  info!("All tasks submitted. Draining...");
  if let Err(e) = manager.drain(&ctx).await {
    tracing::error!("Drain interrupted: {}", e);
  }

  for output in manager.outputs() {
    info!("Output: {}", output);
  }
  for error in manager.errors() {
    info!("Error: {}", error);
  }
  info!("--- Basic Usage Example End ---");
}
