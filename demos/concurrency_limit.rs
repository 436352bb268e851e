use futures_conman::{ConcurrencyManager, TaskError, TaskFn};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn long_task_fn(id: usize) -> Result<usize, TaskError> {
  info!("Task {} starting (concurrency test - should take 1s)", id);
  tokio::time::sleep(Duration::from_secs(1)).await;
  info!("Task {} finished", id);
  Ok(id)
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Concurrency Limit Example (Limit: 2) ---");

  let concurrency_limit = 2;
  let manager = ConcurrencyManager::<usize>::new(concurrency_limit, Handle::current(), "concurrency_manager")
    .expect("concurrency limit of 2 is valid");
  let ctx = CancellationToken::new();

  let num_tasks = 5;
  info!(
    "Submitting {} tasks, each takes 1 sec. With concurrency {}, this should take ~{} secs.",
    num_tasks,
    concurrency_limit,
    (num_tasks as f32 / concurrency_limit as f32).ceil()
  );

  let started = Instant::now();
  for i in 0..num_tasks {
    let task = TaskFn::new(move |_ctx: CancellationToken| long_task_fn(i));
    if let Err(e) = manager.submit(&ctx, task).await {
      tracing::error!("Failed to submit task {}: {}", i, e);
    }
    info!(
      "Submitted task {} (active: {}, free slots: {})",
      i,
      manager.active_task_count(),
      manager.available_slots()
    );
  }

  manager.drain(&ctx).await.expect("drain is never cancelled here");
  info!("Completed tasks {:?} in {:?}", manager.outputs(), started.elapsed());
  info!("--- Concurrency Limit Example End ---");
}
