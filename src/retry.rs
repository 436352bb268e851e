//! Retry configuration, named backoff presets and the retriable failure signal.
//!
//! The delay before retry `n` (0-indexed) is `initial_delay × backoff_factor^n`,
//! capped at `max_delay` when the cap is non-zero, then scaled by a uniform
//! draw in `[0, 1)` when `jitter` is enabled.

use crate::error::{BoxError, ConfigError};

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// Backoff schedule for a retry chain.
///
/// Build one by hand and attach it with [`RetriableError::with_retry_config`],
/// which validates it, or pick a preset through [`BackoffPolicy`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
  /// Retries allowed after the first failure.
  pub max_attempts: u32,
  /// Delay before the first retry.
  pub initial_delay: Duration,
  /// Base of the exponential growth applied to `initial_delay`.
  pub backoff_factor: f64,
  /// Upper bound for a computed delay. `Duration::ZERO` disables the cap.
  pub max_delay: Duration,
  /// Scale each delay by a random factor in `[0, 1)`.
  pub jitter: bool,
}

impl RetryConfig {
  /// Checks the fields and their relationships.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.max_attempts == 0 {
      return Err(ConfigError::MaxAttemptsNotPositive(self.max_attempts));
    }
    if !self.max_delay.is_zero() && self.initial_delay > self.max_delay {
      return Err(ConfigError::InitialDelayExceedsMaxDelay {
        initial_delay: self.initial_delay,
        max_delay: self.max_delay,
      });
    }
    if !self.backoff_factor.is_finite() || self.backoff_factor < 0.0 {
      return Err(ConfigError::InvalidBackoffFactor(self.backoff_factor));
    }
    if self.backoff_factor == 0.0 && !self.initial_delay.is_zero() && self.max_attempts > 1 {
      return Err(ConfigError::ZeroBackoffWithDelay(self.initial_delay));
    }
    Ok(())
  }

  /// Computes the wait before retry `attempt` (0-indexed), jitter included.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let base = self.base_delay(attempt);
    if self.jitter {
      let scale = rand::random::<f64>();
      Duration::try_from_secs_f64(base.as_secs_f64() * scale).unwrap_or(base)
    } else {
      base
    }
  }

  /// The capped delay before jitter.
  fn base_delay(&self, attempt: u32) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
    let capped = !self.max_delay.is_zero();

    let delay = if secs.is_finite() {
      Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
      Duration::MAX
    };

    if capped && delay > self.max_delay {
      self.max_delay
    } else {
      delay
    }
  }
}

impl Default for RetryConfig {
  fn default() -> Self {
    BackoffPolicy::Exponential.config()
  }
}

/// Named, pre-validated retry presets.
///
/// | Policy | max_attempts | initial_delay | backoff_factor | max_delay | jitter |
/// |---|---|---|---|---|---|
/// | `Exponential` | 5 | 100 ms | 2.0 | 5 s | yes |
/// | `Linear` | 5 | 200 ms | 1.0 | 2 s | no |
/// | `None` | 3 | 0 | 0.0 | 0 | no |
///
/// `Linear` runs through the same exponential formula with a factor of 1.0, so
/// every retry waits a constant 200 ms rather than an increasing amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffPolicy {
  #[default]
  Exponential,
  Linear,
  None,
}

impl BackoffPolicy {
  pub fn config(self) -> RetryConfig {
    match self {
      BackoffPolicy::Exponential => RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(100),
        backoff_factor: 2.0,
        max_delay: Duration::from_millis(5000),
        jitter: true,
      },
      BackoffPolicy::Linear => RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(200),
        backoff_factor: 1.0,
        max_delay: Duration::from_millis(2000),
        jitter: false,
      },
      BackoffPolicy::None => RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::ZERO,
        backoff_factor: 0.0,
        max_delay: Duration::ZERO,
        jitter: false,
      },
    }
  }
}

/// A task failure marked as transient.
///
/// Without an attached [`RetryConfig`] the manager treats it like any other
/// failure and does not retry.
pub struct RetriableError {
  source: BoxError,
  config: Option<RetryConfig>,
}

impl RetriableError {
  pub fn new(err: impl Into<BoxError>) -> Self {
    Self {
      source: err.into(),
      config: None,
    }
  }

  pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
    self.config = Some(policy.config());
    self
  }

  pub fn with_exponential_backoff(self) -> Self {
    self.with_policy(BackoffPolicy::Exponential)
  }

  pub fn with_linear_backoff(self) -> Self {
    self.with_policy(BackoffPolicy::Linear)
  }

  pub fn with_no_backoff(self) -> Self {
    self.with_policy(BackoffPolicy::None)
  }

  /// Attaches a custom schedule after validating it.
  ///
  /// # Errors
  /// Returns the [`ConfigError`] produced by [`RetryConfig::validate`]; values
  /// are never clamped into range.
  pub fn with_retry_config(mut self, config: RetryConfig) -> Result<Self, ConfigError> {
    config.validate()?;
    self.config = Some(config);
    Ok(self)
  }

  pub fn retry_config(&self) -> Option<&RetryConfig> {
    self.config.as_ref()
  }

  pub fn into_parts(self) -> (BoxError, Option<RetryConfig>) {
    (self.source, self.config)
  }
}

impl fmt::Debug for RetriableError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RetriableError")
      .field("source", &self.source)
      .field("config", &self.config)
      .finish()
  }
}

impl fmt::Display for RetriableError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.source, f)
  }
}

impl StdError for RetriableError {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    Some(self.source.as_ref())
  }
}
