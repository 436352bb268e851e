use crate::error::DispatchError;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Admission gate bounding the number of in-flight executions.
///
/// Slots come from a FIFO semaphore. Alongside the semaphore the limiter keeps
/// a count of outstanding executions so that `wait_idle` can block until every
/// admitted execution has released its slot.
pub(crate) struct ConcurrencyLimiter {
  limit: usize,
  semaphore: Arc<Semaphore>,
  outstanding: AtomicUsize,
  idle: Notify,
}

impl fmt::Debug for ConcurrencyLimiter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConcurrencyLimiter")
      .field("limit", &self.limit)
      .field("available", &self.available_slots())
      .field("outstanding", &self.outstanding())
      .finish()
  }
}

/// One reserved slot. Dropping it releases the slot exactly once.
pub(crate) struct SlotPermit {
  limiter: Arc<ConcurrencyLimiter>,
  _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for SlotPermit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SlotPermit").finish_non_exhaustive()
  }
}

impl Drop for SlotPermit {
  fn drop(&mut self) {
    // The semaphore permit field is dropped after this body runs, so the
    // outstanding count reaches zero before the slot is handed to a waiter.
    self.limiter.release();
  }
}

impl ConcurrencyLimiter {
  pub(crate) fn new(limit: usize) -> Arc<Self> {
    Arc::new(Self {
      limit,
      semaphore: Arc::new(Semaphore::new(limit)),
      outstanding: AtomicUsize::new(0),
      idle: Notify::new(),
    })
  }

  pub(crate) fn limit(&self) -> usize {
    self.limit
  }

  pub(crate) fn available_slots(&self) -> usize {
    self.semaphore.available_permits()
  }

  pub(crate) fn outstanding(&self) -> usize {
    self.outstanding.load(Ordering::Acquire)
  }

  /// Reserves a slot, waiting while all slots are taken.
  ///
  /// # Errors
  /// Returns `DispatchError::Cancelled` without reserving anything if `ctx` is
  /// already cancelled or fires while waiting.
  pub(crate) async fn acquire(self: &Arc<Self>, ctx: &CancellationToken) -> Result<SlotPermit, DispatchError> {
    if ctx.is_cancelled() {
      return Err(DispatchError::Cancelled);
    }

    let permit = tokio::select! {
      biased;
      _ = ctx.cancelled() => return Err(DispatchError::Cancelled),
      acquired = self.semaphore.clone().acquire_owned() => {
        acquired.map_err(|_| DispatchError::LimiterClosed)?
      }
    };

    let outstanding = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
    trace!(outstanding, available = self.available_slots(), "Slot reserved.");

    Ok(SlotPermit {
      limiter: self.clone(),
      _permit: permit,
    })
  }

  fn release(&self) {
    let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
    trace!(outstanding = previous - 1, "Slot released.");
    if previous == 1 {
      self.idle.notify_waiters();
    }
  }

  /// Resolves once no admitted execution holds a slot.
  pub(crate) async fn wait_idle(&self) {
    loop {
      let notified = self.idle.notified();
      tokio::pin!(notified);
      // Register before checking the counter so a release in between is not missed.
      notified.as_mut().enable();
      if self.outstanding() == 0 {
        return;
      }
      notified.await;
    }
  }
}
