//! Retry policy and backoff strategies, generalized from the panel API
//! client's `calculate_backoff` into the four strategies the engine's retry
//! contract names.

use std::sync::Arc;
use std::time::Duration;

use crate::error::CrossExecError;

#[derive(Clone)]
pub enum RetryStrategy {
    Linear,
    Exponential { factor: f64 },
    Fibonacci,
    Custom(Arc<dyn Fn(u32, Duration, Duration) -> Duration + Send + Sync>),
}

impl std::fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linear => write!(f, "Linear"),
            Self::Exponential { factor } => write!(f, "Exponential({factor})"),
            Self::Fibonacci => write!(f, "Fibonacci"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

type ShouldRetryFn = Arc<dyn Fn(&CrossExecError, u32) -> bool + Send + Sync>;
type OnRetryFn = Arc<dyn Fn(u32, &CrossExecError) + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
    pub jitter: f64,
    pub should_retry: Option<ShouldRetryFn>,
    pub on_retry: Option<OnRetryFn>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("strategy", &self.strategy)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: RetryStrategy::Exponential { factor: 2.0 },
            jitter: 0.0,
            should_retry: None,
            on_retry: None,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&CrossExecError, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(f));
        self
    }

    pub fn with_on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &CrossExecError) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(f));
        self
    }

    /// Delay to apply before attempt `next_attempt` (2-indexed: the delay
    /// between attempt 1 and attempt 2 is `delay_for(2)`).
    pub fn delay_for(&self, next_attempt: u32) -> Duration {
        let base = match &self.strategy {
            RetryStrategy::Linear => self.initial_delay * next_attempt.saturating_sub(1).max(1),
            RetryStrategy::Exponential { factor } => {
                let exp = factor.powi(next_attempt.saturating_sub(1) as i32 - 1);
                Duration::from_secs_f64((self.initial_delay.as_secs_f64() * exp).max(0.0))
            }
            RetryStrategy::Fibonacci => {
                let n = fibonacci(next_attempt.saturating_sub(1));
                self.initial_delay * n.max(1)
            }
            RetryStrategy::Custom(f) => f(next_attempt, self.initial_delay, self.max_delay),
        };
        let capped = base.min(self.max_delay);
        if self.jitter > 0.0 {
            let jitter_range = capped.as_secs_f64() * self.jitter;
            let jittered = capped.as_secs_f64() + jitter_range * (pseudo_rand() - 0.5);
            Duration::from_secs_f64(jittered.max(0.0))
        } else {
            capped
        }
    }

    pub fn should_retry(&self, error: &CrossExecError, attempt: u32) -> bool {
        if let Some(predicate) = &self.should_retry {
            return predicate(error, attempt);
        }
        default_is_retryable(error)
    }
}

fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (1u32, 1u32);
    for _ in 0..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

/// Deliberately not cryptographic; only used to spread jitter across
/// concurrent retries without pulling in a `rand` dependency the teacher
/// never carries.
fn pseudo_rand() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Default retryable classification (spec.md §7): connection errors (not
/// auth), timeouts, adapter errors flagged transient, and retryable-set exit
/// codes are the caller's job via `should_retry`.
pub fn default_is_retryable(error: &CrossExecError) -> bool {
    matches!(
        error,
        CrossExecError::ConnectionError { .. } | CrossExecError::TimeoutError { .. }
    ) || matches!(error, CrossExecError::AdapterError { transient: true, .. })
}
