use futures_conman::{ConcurrencyManager, ConfigError, DispatchError, ExecutionError, Task, TaskError, TaskFn, TaskFuture};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle as TokioHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_conman=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

/// Doubles its operand.
struct Doubler {
  operand: i64,
}

impl Task<i64> for Doubler {
  fn execute(&mut self, _ctx: CancellationToken) -> TaskFuture<'_, i64> {
    let operand = self.operand;
    Box::pin(async move { Ok::<i64, TaskError>(operand * 2) })
  }
}

/// Always fails with a plain error.
struct FailingDoubler {
  operand: i64,
}

impl Task<i64> for FailingDoubler {
  fn execute(&mut self, _ctx: CancellationToken) -> TaskFuture<'_, i64> {
    let operand = self.operand;
    Box::pin(async move { Err::<i64, TaskError>(TaskError::failed(format!("error calculating for {}", operand))) })
  }
}

/// Sleeps, then doubles its operand unless the context was cancelled meanwhile.
struct SlowDoubler {
  operand: i64,
  delay: Duration,
  running: Arc<AtomicUsize>,
  peak: Arc<AtomicUsize>,
}

impl SlowDoubler {
  fn new(operand: i64, delay_ms: u64) -> Self {
    Self {
      operand,
      delay: Duration::from_millis(delay_ms),
      running: Arc::new(AtomicUsize::new(0)),
      peak: Arc::new(AtomicUsize::new(0)),
    }
  }
}

impl Task<i64> for SlowDoubler {
  fn execute(&mut self, ctx: CancellationToken) -> TaskFuture<'_, i64> {
    let operand = self.operand;
    let delay = self.delay;
    let running = self.running.clone();
    let peak = self.peak.clone();
    Box::pin(async move {
      let now = running.fetch_add(1, Ordering::SeqCst) + 1;
      peak.fetch_max(now, Ordering::SeqCst);
      sleep(delay).await;
      running.fetch_sub(1, Ordering::SeqCst);
      if ctx.is_cancelled() {
        return Err(TaskError::failed("context cancelled"));
      }
      Ok::<i64, TaskError>(operand * 2)
    })
  }
}

fn new_manager(limit: usize, name: &str) -> ConcurrencyManager<i64> {
  ConcurrencyManager::new(limit, TokioHandle::current(), name).unwrap()
}

#[tokio::test]
async fn test_captures_outputs() {
  setup_tracing_for_test();
  let manager = new_manager(5, "test_captures_outputs");
  let ctx = CancellationToken::new();

  for operand in [299, 532, 203] {
    manager.submit(&ctx, Doubler { operand }).await.unwrap();
  }
  manager.drain(&ctx).await.unwrap();

  let mut outputs = manager.outputs();
  outputs.sort_unstable();
  assert_eq!(outputs, vec![406, 598, 1064]);
  assert!(manager.errors().is_empty());
}

#[tokio::test]
async fn test_captures_plain_errors() {
  setup_tracing_for_test();
  let manager = new_manager(5, "test_captures_plain_errors");
  let ctx = CancellationToken::new();

  for operand in [299, 532, 203] {
    manager.submit(&ctx, FailingDoubler { operand }).await.unwrap();
  }
  manager.drain(&ctx).await.unwrap();

  let errors = manager.errors();
  assert_eq!(errors.len(), 3);
  for operand in [299, 532, 203] {
    let expected = format!("error calculating for {}", operand);
    assert!(
      errors.iter().any(|e| matches!(e, ExecutionError::Failed(_)) && e.to_string() == expected),
      "missing error for {}: {:?}",
      operand,
      errors
    );
  }
  assert!(manager.outputs().is_empty());
}

#[tokio::test]
async fn test_mixed_outcomes_are_separated() {
  setup_tracing_for_test();
  let manager = new_manager(3, "test_mixed_outcomes");
  let ctx = CancellationToken::new();

  manager.submit(&ctx, Doubler { operand: 1 }).await.unwrap();
  manager.submit(&ctx, FailingDoubler { operand: 2 }).await.unwrap();
  manager.submit(&ctx, Doubler { operand: 3 }).await.unwrap();
  manager.drain(&ctx).await.unwrap();

  assert_eq!(manager.outputs().len(), 2);
  assert_eq!(manager.errors().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit_is_never_exceeded() {
  setup_tracing_for_test();
  for limit in [2, 3, 5] {
    let manager = new_manager(limit, &format!("test_concurrency_ceiling_{}", limit));
    let ctx = CancellationToken::new();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let task_count = 3 * limit + 1;

    for operand in 0..task_count as i64 {
      let task = SlowDoubler {
        running: running.clone(),
        peak: peak.clone(),
        ..SlowDoubler::new(operand, 40)
      };
      manager.submit(&ctx, task).await.unwrap();
      assert!(manager.active_task_count() <= limit);
    }
    manager.drain(&ctx).await.unwrap();

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= limit, "peak {} exceeded limit {}", peak, limit);
    assert_eq!(peak, limit, "limit {} was never saturated", limit);
    assert_eq!(manager.outputs().len(), task_count);
    assert!(manager.errors().is_empty());
    assert_eq!(manager.available_slots(), limit);
  }
}

#[tokio::test]
async fn test_submit_waits_for_a_free_slot() {
  setup_tracing_for_test();
  let manager = new_manager(2, "test_submit_waits");
  let ctx = CancellationToken::new();

  manager.submit(&ctx, SlowDoubler::new(299, 150)).await.unwrap();
  manager.submit(&ctx, SlowDoubler::new(532, 150)).await.unwrap();

  let third = manager.submit(&ctx, Doubler { operand: 203 });
  tokio::pin!(third);
  tokio::select! {
    _ = &mut third => panic!("submit should wait while both slots are taken"),
    _ = sleep(Duration::from_millis(50)) => {}
  }
  assert!(!manager.outputs().contains(&406));

  tokio::time::timeout(Duration::from_secs(2), third)
    .await
    .expect("submit did not complete after a slot freed up")
    .unwrap();
  manager.drain(&ctx).await.unwrap();
  assert!(manager.outputs().contains(&406));
}

#[tokio::test]
async fn test_submit_after_cancellation_fails() {
  setup_tracing_for_test();
  let manager = new_manager(3, "test_submit_after_cancellation");
  let ctx = CancellationToken::new();

  manager.submit(&ctx, SlowDoubler::new(299, 50)).await.unwrap();
  ctx.cancel();

  let ran = Arc::new(AtomicBool::new(false));
  let ran_flag = ran.clone();
  let result = manager
    .submit(
      &ctx,
      TaskFn::new(move |_ctx: CancellationToken| {
        ran_flag.store(true, Ordering::SeqCst);
        async { Ok::<i64, TaskError>(0) }
      }),
    )
    .await;
  assert_eq!(result, Err(DispatchError::Cancelled));
  assert_eq!(
    manager.submit(&ctx, Doubler { operand: 532 }).await,
    Err(DispatchError::Cancelled)
  );

  manager.drain(&CancellationToken::new()).await.unwrap();
  assert!(!ran.load(Ordering::SeqCst), "rejected task must never run");
  // The admitted task saw the cancellation after its sleep.
  assert_eq!(manager.errors().len(), 1);
  assert!(manager.outputs().is_empty());
}

#[tokio::test]
async fn test_blocked_submit_returns_on_cancellation() {
  setup_tracing_for_test();
  let manager = new_manager(2, "test_blocked_submit_cancel");
  let ctx = CancellationToken::new();
  let worker_ctx = CancellationToken::new();

  manager.submit(&worker_ctx, SlowDoubler::new(1, 300)).await.unwrap();
  manager.submit(&worker_ctx, SlowDoubler::new(2, 300)).await.unwrap();

  let canceller = ctx.clone();
  tokio::spawn(async move {
    sleep(Duration::from_millis(30)).await;
    canceller.cancel();
  });

  let result = tokio::time::timeout(Duration::from_secs(1), manager.submit(&ctx, Doubler { operand: 3 }))
    .await
    .expect("blocked submit ignored cancellation");
  assert_eq!(result, Err(DispatchError::Cancelled));

  manager.drain(&worker_ctx).await.unwrap();
  let mut outputs = manager.outputs();
  outputs.sort_unstable();
  assert_eq!(outputs, vec![2, 4]);
}

#[tokio::test]
async fn test_context_reaches_running_tasks() {
  setup_tracing_for_test();
  let manager = new_manager(3, "test_context_propagation");
  let ctx = CancellationToken::new();

  manager.submit(&ctx, SlowDoubler::new(299, 50)).await.unwrap();
  manager.submit(&ctx, SlowDoubler::new(532, 100)).await.unwrap();
  manager.submit(&ctx, SlowDoubler::new(203, 400)).await.unwrap();

  let canceller = ctx.clone();
  tokio::spawn(async move {
    sleep(Duration::from_millis(200)).await;
    canceller.cancel();
  });

  manager.drain(&CancellationToken::new()).await.unwrap();

  let outputs = manager.outputs();
  assert!(outputs.contains(&598));
  assert!(outputs.contains(&1064));
  assert!(!outputs.contains(&406));
  let errors = manager.errors();
  assert_eq!(errors.len(), 1);
  assert_eq!(errors[0].to_string(), "context cancelled");
}

#[tokio::test]
async fn test_drain_cancellation_leaves_tasks_running() {
  setup_tracing_for_test();
  let manager = new_manager(2, "test_drain_cancellation");
  let ctx = CancellationToken::new();
  manager.submit(&ctx, SlowDoubler::new(21, 200)).await.unwrap();

  let drain_ctx = CancellationToken::new();
  let canceller = drain_ctx.clone();
  tokio::spawn(async move {
    sleep(Duration::from_millis(20)).await;
    canceller.cancel();
  });

  assert_eq!(manager.drain(&drain_ctx).await, Err(DispatchError::Cancelled));
  assert_eq!(manager.active_task_count(), 1);
  assert!(manager.outputs().is_empty());

  manager.drain(&ctx).await.unwrap();
  assert_eq!(manager.outputs(), vec![42]);
  assert_eq!(manager.active_task_count(), 0);
}

#[tokio::test]
async fn test_drain_with_nothing_submitted() {
  setup_tracing_for_test();
  let manager = new_manager(2, "test_drain_empty");
  tokio::time::timeout(Duration::from_millis(100), manager.drain(&CancellationToken::new()))
    .await
    .expect("drain of an idle manager should return immediately")
    .unwrap();
}

#[tokio::test]
async fn test_task_panic_is_recorded_and_slot_released() {
  setup_tracing_for_test();
  let manager = new_manager(2, "test_task_panic");
  let ctx = CancellationToken::new();

  manager
    .submit(
      &ctx,
      TaskFn::new(|_ctx: CancellationToken| async {
        if true {
          panic!("intentional panic");
        }
        Ok::<i64, TaskError>(0)
      }),
    )
    .await
    .unwrap();
  manager.drain(&ctx).await.unwrap();

  assert!(matches!(manager.errors().as_slice(), [ExecutionError::Panicked]));
  assert_eq!(manager.available_slots(), 2);

  manager.submit(&ctx, Doubler { operand: 5 }).await.unwrap();
  manager.drain(&ctx).await.unwrap();
  assert_eq!(manager.outputs(), vec![10]);
}

#[tokio::test]
async fn test_snapshots_are_stable_after_drain() {
  setup_tracing_for_test();
  let manager = new_manager(4, "test_snapshots");
  let ctx = CancellationToken::new();

  for operand in 0..6 {
    if operand % 2 == 0 {
      manager.submit(&ctx, Doubler { operand }).await.unwrap();
    } else {
      manager.submit(&ctx, FailingDoubler { operand }).await.unwrap();
    }
  }
  manager.drain(&ctx).await.unwrap();

  assert_eq!(manager.outputs(), manager.outputs());
  let first: Vec<String> = manager.errors().iter().map(ToString::to_string).collect();
  let second: Vec<String> = manager.errors().iter().map(ToString::to_string).collect();
  assert_eq!(first, second);
  assert_eq!(first.len(), 3);
}

#[tokio::test]
async fn test_new_validates_concurrency_limit() {
  for (limit, expect_ok) in [(0, false), (1, false), (2, true), (5, true)] {
    let result = ConcurrencyManager::<i64>::new(limit, TokioHandle::current(), "validation");
    if expect_ok {
      assert!(result.is_ok(), "limit {} should be accepted", limit);
    } else {
      let err = result.unwrap_err();
      assert_eq!(err, ConfigError::ConcurrencyLimitTooLow(limit));
      assert!(err.to_string().contains(&format!("must be at least 2, got {}", limit)));
    }
  }
}
