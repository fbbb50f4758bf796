//! Retry strategies, predicates and policies for handling transient failures.
//!
//! Every request path shares one retry loop in the client. What differs
//! between reads, writes and batches is expressed as a [`RetryPolicy`]: a
//! backoff [`RetryStrategy`], a [`RetryPredicate`] deciding which failures
//! are worth another attempt, and two switches for `Retry-After` handling and
//! token refresh.

use crate::config::RetrySettings;
use crate::Error;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Defines when and how long to wait between attempts.
///
/// # Examples
///
/// ```
/// use listkeeper::RetryStrategy;
/// use std::time::Duration;
///
/// // Full-jitter exponential: random(0, min(5s, 400ms * 2^(attempt-1)))
/// let exponential = RetryStrategy::ExponentialBackoff {
///     initial_delay: Duration::from_millis(400),
///     max_delay: Duration::from_secs(5),
///     max_retries: 3,
///     jitter: true,
/// };
///
/// // Linear ramp: 300ms, 600ms, 900ms...
/// let linear = RetryStrategy::Linear {
///     step: Duration::from_millis(300),
///     max_retries: 2,
/// };
/// assert_eq!(linear.delay_for_attempt(2), Some(Duration::from_millis(600)));
/// ```
#[derive(Debug, Clone, Default)]
pub enum RetryStrategy {
    /// Do not retry failed requests.
    #[default]
    None,

    /// Retry with exponentially increasing delays.
    ///
    /// The ceiling for retry `n` is `initial_delay * 2^(n-1)`, capped at
    /// `max_delay`. With `jitter` the actual wait is drawn uniformly from
    /// `[0, ceiling]` (full jitter); without it the ceiling is used as is.
    ExponentialBackoff {
        /// The ceiling before the first retry.
        initial_delay: Duration,
        /// The maximum ceiling between retries.
        max_delay: Duration,
        /// The maximum number of retry attempts.
        max_retries: usize,
        /// Whether to draw the wait uniformly below the ceiling.
        jitter: bool,
    },

    /// Retry with a delay that grows by `step` every attempt.
    Linear {
        /// Added to the delay on every retry.
        step: Duration,
        /// The maximum number of retry attempts.
        max_retries: usize,
    },
}

impl RetryStrategy {
    /// Returns the delay before the given retry, or `None` if retries are exhausted.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The retry number (1-indexed, so 1 = first retry)
    pub fn delay_for_attempt(&self, attempt: usize) -> Option<Duration> {
        match self {
            RetryStrategy::None => None,
            RetryStrategy::ExponentialBackoff {
                initial_delay,
                max_delay,
                max_retries,
                jitter,
            } => {
                if attempt > *max_retries {
                    return None;
                }

                let ceiling = backoff_ceiling(*initial_delay, *max_delay, attempt);
                if *jitter {
                    let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
                    let ms = rand::thread_rng().gen_range(0..=ceiling_ms);
                    Some(Duration::from_millis(ms))
                } else {
                    Some(ceiling)
                }
            }
            RetryStrategy::Linear { step, max_retries } => {
                if attempt > *max_retries {
                    None
                } else {
                    Some(step.saturating_mul(u32::try_from(attempt).unwrap_or(u32::MAX)))
                }
            }
        }
    }

    /// Returns the maximum number of retries, if applicable.
    pub fn max_retries(&self) -> Option<usize> {
        match self {
            RetryStrategy::None => Some(0),
            RetryStrategy::ExponentialBackoff { max_retries, .. } => Some(*max_retries),
            RetryStrategy::Linear { max_retries, .. } => Some(*max_retries),
        }
    }
}

/// `min(max_delay, initial_delay * 2^(attempt-1))`.
pub(crate) fn backoff_ceiling(initial_delay: Duration, max_delay: Duration, attempt: usize) -> Duration {
    let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    let multiplier = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    initial_delay.saturating_mul(multiplier).min(max_delay)
}

/// Trait for determining whether a failed request should be retried.
///
/// # Examples
///
/// ```
/// use listkeeper::{Error, RetryPredicate};
///
/// struct RetryOnGatewayTimeout;
///
/// impl RetryPredicate for RetryOnGatewayTimeout {
///     fn should_retry(&self, error: &Error, _attempt: usize) -> bool {
///         matches!(error.status(), Some(s) if s.as_u16() == 504)
///     }
/// }
/// ```
pub trait RetryPredicate: Send + Sync {
    /// Determines whether the request should be retried.
    ///
    /// * `error` - The error that occurred
    /// * `attempt` - The attempt number that failed (1-indexed)
    fn should_retry(&self, error: &Error, attempt: usize) -> bool;
}

/// Retry only throttled or busy responses (429, 503, 504).
#[derive(Debug, Clone, Copy)]
pub struct RetryOnThrottle;

impl RetryPredicate for RetryOnThrottle {
    fn should_retry(&self, error: &Error, _attempt: usize) -> bool {
        error.is_throttle()
    }
}

/// Retry failures that never reached a response: connection errors and timeouts.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnConnectionError;

impl RetryPredicate for RetryOnConnectionError {
    fn should_retry(&self, error: &Error, _attempt: usize) -> bool {
        error.is_transport()
    }
}

/// Retries when any of its predicates would.
///
/// # Examples
///
/// ```
/// use listkeeper::retry::{OrPredicate, RetryOnConnectionError, RetryOnThrottle};
/// use listkeeper::{Error, RetryPredicate};
///
/// let transient = OrPredicate::new(vec![
///     Box::new(RetryOnThrottle),
///     Box::new(RetryOnConnectionError),
/// ]);
/// assert!(transient.should_retry(&Error::Timeout, 1));
/// assert!(!transient.should_retry(&Error::NoToken, 1));
/// ```
pub struct OrPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl OrPredicate {
    /// Combines `predicates`.
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }

    /// Throttled or busy responses plus transport failures.
    pub fn transient() -> Self {
        Self::new(vec![Box::new(RetryOnThrottle), Box::new(RetryOnConnectionError)])
    }
}

impl RetryPredicate for OrPredicate {
    fn should_retry(&self, error: &Error, attempt: usize) -> bool {
        self.predicates
            .iter()
            .any(|p| p.should_retry(error, attempt))
    }
}

/// How one request path retries.
///
/// # Examples
///
/// ```
/// use listkeeper::{RetryPolicy, config::RetrySettings};
///
/// let reads = RetryPolicy::read(&RetrySettings::default());
/// assert_eq!(reads.max_attempts(), Some(4));
///
/// let writes = RetryPolicy::write(1);
/// assert!(!writes.honor_retry_after);
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    /// Backoff used when the server gives no `Retry-After`.
    pub strategy: RetryStrategy,
    /// Decides which failures get another attempt.
    pub predicate: Arc<dyn RetryPredicate>,
    /// Prefer a server-provided `Retry-After` over `strategy`.
    pub honor_retry_after: bool,
    /// Ask the token provider for a new token after 401/403 and re-issue once.
    pub refresh_auth: bool,
}

impl RetryPolicy {
    /// Reads: full-jitter exponential backoff on transient failures,
    /// `Retry-After` honoured, one token refresh on 401/403.
    pub fn read(settings: &RetrySettings) -> Self {
        Self {
            strategy: settings.backoff_strategy(),
            predicate: Arc::new(OrPredicate::transient()),
            honor_retry_after: true,
            refresh_auth: true,
        }
    }

    /// Batches: the read backoff restricted to 429/503/504, without token
    /// refresh. A transport failure is reported as the batch outcome.
    pub fn batch(settings: &RetrySettings) -> Self {
        Self {
            refresh_auth: false,
            ..Self::throttle_only(settings)
        }
    }

    /// Non-idempotent mutations: only responses that prove the request was
    /// not processed (429/503/504) are retried; transport failures are not.
    pub fn throttle_only(settings: &RetrySettings) -> Self {
        Self {
            strategy: settings.backoff_strategy(),
            predicate: Arc::new(RetryOnThrottle),
            honor_retry_after: true,
            refresh_auth: true,
        }
    }

    /// Writes: `retries` extra attempts on transient failures with a
    /// `300ms * attempt` ramp.
    pub fn write(retries: usize) -> Self {
        Self {
            strategy: RetryStrategy::Linear {
                step: WRITE_BACKOFF_STEP,
                max_retries: retries,
            },
            predicate: Arc::new(OrPredicate::transient()),
            honor_retry_after: false,
            refresh_auth: true,
        }
    }

    /// A single attempt and nothing else.
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::None,
            predicate: Arc::new(OrPredicate::transient()),
            honor_retry_after: false,
            refresh_auth: false,
        }
    }

    /// Total attempts allowed, when the strategy bounds them.
    pub fn max_attempts(&self) -> Option<usize> {
        self.strategy.max_retries().map(|r| r + 1)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("strategy", &self.strategy)
            .field("honor_retry_after", &self.honor_retry_after)
            .field("refresh_auth", &self.refresh_auth)
            .finish_non_exhaustive()
    }
}

pub(crate) const WRITE_BACKOFF_STEP: Duration = Duration::from_millis(300);

/// Why a request is being re-issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The server answered 429.
    Throttle,
    /// The server answered 503 or 504.
    ServerError,
    /// The token was rejected and a different one was obtained.
    AuthRefresh,
    /// The request failed before a response arrived.
    Transport,
}

impl RetryReason {
    pub(crate) fn for_error(error: &Error) -> Self {
        match error.status().map(|s| s.as_u16()) {
            Some(429) => RetryReason::Throttle,
            Some(401) | Some(403) => RetryReason::AuthRefresh,
            Some(_) => RetryReason::ServerError,
            None => RetryReason::Transport,
        }
    }
}

/// Emitted once per retry cycle to the hook installed with
/// [`ClientBuilder::on_retry`](crate::ClientBuilder::on_retry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    /// The attempt about to be issued (the first retry is attempt 2).
    pub attempt: usize,
    /// Status of the response that triggered the retry, if any.
    pub status: Option<u16>,
    /// Why the retry happens.
    pub reason: RetryReason,
    /// Wait before the retry.
    pub delay: Duration,
}

/// Observability callback for retry cycles.
pub type RetryHook = Arc<dyn Fn(&RetryEvent) + Send + Sync>;
