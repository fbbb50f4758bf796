//! Connection and retry settings.
//!
//! All retry knobs are optional and default to the values the store's
//! throttling guidance calls for. Only the site URL is mandatory when the
//! client is configured from the environment.

use crate::retry::RetryStrategy;
use crate::{Error, Result};
use std::time::Duration;

/// Environment variable holding the site base URL.
pub const ENV_SITE_URL: &str = "LISTKEEPER_SITE_URL";
/// Environment variable holding the request timeout in seconds.
pub const ENV_TIMEOUT_SECS: &str = "LISTKEEPER_TIMEOUT_SECS";
/// Environment variable capping total attempts for throttled reads.
pub const ENV_MAX_ATTEMPTS: &str = "LISTKEEPER_RETRY_MAX_ATTEMPTS";
/// Environment variable for the base backoff delay in milliseconds.
pub const ENV_BASE_MS: &str = "LISTKEEPER_RETRY_BASE_MS";
/// Environment variable for the backoff cap in milliseconds.
pub const ENV_CAP_MS: &str = "LISTKEEPER_RETRY_CAP_MS";
/// Environment variable enabling verbose retry diagnostics.
pub const ENV_VERBOSE: &str = "LISTKEEPER_RETRY_VERBOSE";

/// Retry tuning shared by the read and batch paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    /// Base of the exponential backoff.
    pub base_delay: Duration,
    /// Ceiling of the exponential backoff.
    pub max_delay: Duration,
    /// Log every retry decision at `info` instead of `debug`.
    pub verbose: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(5000),
            verbose: false,
        }
    }
}

impl RetrySettings {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, falling back to defaults for absent keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use listkeeper::config::RetrySettings;
    /// use std::time::Duration;
    ///
    /// let settings = RetrySettings::from_lookup(|key| match key {
    ///     "LISTKEEPER_RETRY_BASE_MS" => Some("250".to_string()),
    ///     _ => None,
    /// })
    /// .unwrap();
    /// assert_eq!(settings.base_delay, Duration::from_millis(250));
    /// assert_eq!(settings.max_attempts, 4);
    /// ```
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_attempts = parse_number(&lookup, ENV_MAX_ATTEMPTS)?
            .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
            .unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(Error::ConfigurationError(format!(
                "{ENV_MAX_ATTEMPTS} must be at least 1"
            )));
        }

        Ok(Self {
            max_attempts,
            base_delay: parse_number(&lookup, ENV_BASE_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: parse_number(&lookup, ENV_CAP_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            verbose: parse_flag(&lookup, ENV_VERBOSE)?.unwrap_or(defaults.verbose),
        })
    }

    /// The full-jitter exponential strategy these settings describe.
    pub fn backoff_strategy(&self) -> RetryStrategy {
        RetryStrategy::ExponentialBackoff {
            initial_delay: self.base_delay,
            max_delay: self.max_delay,
            max_retries: self.max_attempts.saturating_sub(1),
            jitter: true,
        }
    }
}

/// Everything needed to build a [`Client`](crate::Client) apart from the
/// token provider.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Site base URL; every relative request path is resolved under it.
    pub site_url: String,
    /// Per-request timeout.
    pub timeout: Option<Duration>,
    /// Retry tuning.
    pub retry: RetrySettings,
}

impl ClientConfig {
    /// Creates a config with default retry settings.
    pub fn new(site_url: impl Into<String>) -> Self {
        Self {
            site_url: site_url.into(),
            timeout: None,
            retry: RetrySettings::default(),
        }
    }

    /// Reads the config from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the config through `lookup`. Fails before any network call when
    /// the site URL is missing or malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let site_url = lookup(ENV_SITE_URL)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::MissingSetting(ENV_SITE_URL.to_string()))?;
        url::Url::parse(&site_url).map_err(|e| {
            Error::ConfigurationError(format!("{ENV_SITE_URL} is not a valid URL: {e}"))
        })?;

        let timeout = parse_number(&lookup, ENV_TIMEOUT_SECS)?.map(Duration::from_secs);

        Ok(Self {
            site_url,
            timeout,
            retry: RetrySettings::from_lookup(&lookup)?,
        })
    }
}

fn parse_number<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|_| {
            Error::ConfigurationError(format!(
                "{key} must be a non-negative integer, got `{raw}`"
            ))
        }),
    }
}

fn parse_flag<F>(lookup: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(Error::ConfigurationError(format!(
                "{key} must be a boolean, got `{v}`"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let settings = RetrySettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, RetrySettings::default());
        assert_eq!(settings.max_attempts, 4);
        assert_eq!(settings.base_delay, Duration::from_millis(400));
        assert_eq!(settings.max_delay, Duration::from_millis(5000));
    }

    #[test]
    fn overrides_are_read() {
        let settings = RetrySettings::from_lookup(lookup(&[
            (ENV_MAX_ATTEMPTS, "6"),
            (ENV_CAP_MS, "2000"),
            (ENV_VERBOSE, "true"),
        ]))
        .unwrap();
        assert_eq!(settings.max_attempts, 6);
        assert_eq!(settings.max_delay, Duration::from_millis(2000));
        assert!(settings.verbose);
        assert_eq!(settings.backoff_strategy().max_retries(), Some(5));
    }

    #[test]
    fn malformed_values_name_the_setting() {
        let err = RetrySettings::from_lookup(lookup(&[(ENV_BASE_MS, "fast")])).unwrap_err();
        assert!(err.to_string().contains(ENV_BASE_MS));

        let err = RetrySettings::from_lookup(lookup(&[(ENV_VERBOSE, "maybe")])).unwrap_err();
        assert!(err.to_string().contains(ENV_VERBOSE));

        let err = RetrySettings::from_lookup(lookup(&[(ENV_MAX_ATTEMPTS, "0")])).unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_ATTEMPTS));
    }

    #[test]
    fn missing_site_url_fails_fast() {
        let err = ClientConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, Error::MissingSetting(ref name) if name == ENV_SITE_URL));

        let err = ClientConfig::from_lookup(lookup(&[(ENV_SITE_URL, "not a url")])).unwrap_err();
        assert!(err.to_string().contains(ENV_SITE_URL));
    }

    #[test]
    fn client_config_reads_timeout() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ENV_SITE_URL, "https://contoso.example.com/sites/hr"),
            (ENV_TIMEOUT_SECS, "30"),
        ]))
        .unwrap();
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.retry, RetrySettings::default());
    }
}
