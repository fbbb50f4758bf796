//! `Retry-After` handling for throttled responses.
//!
//! List stores answer with 429 (throttle) or 503/504 (busy) and usually tell
//! the caller how long to back off. The header carries either an integer
//! number of seconds or an HTTP date.

use http::HeaderMap;
use std::time::{Duration, SystemTime};

/// Configuration for server-directed waits.
///
/// # Examples
///
/// ```
/// use listkeeper::rate_limit::RateLimitConfig;
/// use std::time::Duration;
///
/// let config = RateLimitConfig::builder()
///     .max_wait(Duration::from_secs(60))
///     .build();
/// assert!(config.respect_retry_after);
/// ```
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Whether to honour the `Retry-After` header on read and batch paths.
    ///
    /// When disabled, every throttle retry uses the computed backoff.
    pub respect_retry_after: bool,

    /// Upper bound on a server-provided wait. Defaults to 5 minutes.
    pub max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            respect_retry_after: true,
            max_wait: Duration::from_secs(300),
        }
    }
}

impl RateLimitConfig {
    /// Creates a new builder.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }

    /// Ignores `Retry-After` entirely.
    pub fn disabled() -> Self {
        Self {
            respect_retry_after: false,
            ..Default::default()
        }
    }

    /// Returns the server-directed wait from `headers`, capped by `max_wait`.
    pub fn server_delay(&self, headers: &HeaderMap) -> Option<Duration> {
        if !self.respect_retry_after {
            return None;
        }
        parse_retry_after(headers, SystemTime::now()).map(|d| d.min(self.max_wait))
    }
}

/// Builder for `RateLimitConfig`.
#[derive(Default)]
pub struct RateLimitConfigBuilder {
    respect_retry_after: Option<bool>,
    max_wait: Option<Duration>,
}

impl RateLimitConfigBuilder {
    /// Sets whether to respect the `Retry-After` header.
    pub fn respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = Some(respect);
        self
    }

    /// Sets the maximum wait accepted from the server.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Builds the `RateLimitConfig`.
    pub fn build(self) -> RateLimitConfig {
        let default = RateLimitConfig::default();
        RateLimitConfig {
            respect_retry_after: self
                .respect_retry_after
                .unwrap_or(default.respect_retry_after),
            max_wait: self.max_wait.unwrap_or(default.max_wait),
        }
    }
}

/// Parses the `Retry-After` header relative to `now`.
///
/// Integer values are seconds. HTTP dates yield `date - now`, or zero when
/// the date has already passed. Anything else yields `None` so the caller
/// falls back to computed backoff.
///
/// # Examples
///
/// ```
/// use listkeeper::rate_limit::parse_retry_after;
/// use http::HeaderMap;
/// use std::time::{Duration, SystemTime};
///
/// let mut headers = HeaderMap::new();
/// headers.insert("retry-after", "7".parse().unwrap());
/// assert_eq!(
///     parse_retry_after(&headers, SystemTime::now()),
///     Some(Duration::from_secs(7))
/// );
/// ```
pub fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let header = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = header.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date_time = httpdate::parse_http_date(header).ok()?;
    Some(date_time.duration_since(now).unwrap_or(Duration::ZERO))
}
