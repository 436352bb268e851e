use crate::error::ExecutionError;

use parking_lot::Mutex;

#[derive(Debug)]
struct Collected<T> {
  outputs: Vec<T>,
  errors: Vec<ExecutionError>,
}

/// Outputs and terminal errors of every execution, in completion order.
///
/// Both sequences sit behind one lock, so a reader always sees a consistent
/// pair of lengths. Reads hand out copies; later writes never touch them.
#[derive(Debug)]
pub(crate) struct ResultAggregator<T> {
  inner: Mutex<Collected<T>>,
}

impl<T> ResultAggregator<T> {
  pub(crate) fn with_capacity(capacity: usize) -> Self {
    Self {
      inner: Mutex::new(Collected {
        outputs: Vec::with_capacity(capacity),
        errors: Vec::new(),
      }),
    }
  }

  pub(crate) fn record_output(&self, output: T) {
    self.inner.lock().outputs.push(output);
  }

  pub(crate) fn record_error(&self, error: ExecutionError) {
    self.inner.lock().errors.push(error);
  }

  pub(crate) fn errors(&self) -> Vec<ExecutionError> {
    self.inner.lock().errors.clone()
  }

  pub(crate) fn output_count(&self) -> usize {
    self.inner.lock().outputs.len()
  }

  pub(crate) fn error_count(&self) -> usize {
    self.inner.lock().errors.len()
  }
}

impl<T: Clone> ResultAggregator<T> {
  pub(crate) fn outputs(&self) -> Vec<T> {
    self.inner.lock().outputs.clone()
  }
}
