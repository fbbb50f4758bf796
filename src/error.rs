//! Error types for list store calls.
//!
//! Every read-path failure surfaces as one [`Error`] after local recovery
//! (throttle retries, token refresh, schema narrowing) has been exhausted.
//! Write paths do not use this type directly; they return
//! [`WriteResult`](crate::write::WriteResult) instead.

use http::{HeaderMap, StatusCode};
use std::time::Duration;

/// The main error type for list store calls.
///
/// # Examples
///
/// ```no_run
/// use listkeeper::{Client, Error, StaticToken};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder()
///     .base_url("https://contoso.example.com/sites/hr")?
///     .token_provider(StaticToken::new("token"))
///     .build()?;
///
/// match client.get::<serde_json::Value>("/_api/web").await {
///     Ok(response) => println!("Web: {:?}", response.data),
///     Err(Error::HttpError { status, message, .. }) => {
///         eprintln!("HTTP error {}: {}", status, message);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A network-level error occurred (connection refused, DNS failure, reset).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The request timed out.
    #[error("Request timed out")]
    Timeout,

    /// Failed to deserialize the response body into the expected type.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// The server returned a non-2xx HTTP status code.
    ///
    /// `message` is the structured server message when the body carried one,
    /// otherwise the bounded raw body text.
    #[error("HTTP error {status}: {message}{}", auth_guidance(.status))]
    HttpError {
        /// The HTTP status code
        status: StatusCode,
        /// Human-readable server message
        message: String,
        /// Server error code, when the body carried one
        code: Option<String>,
        /// The raw response body
        raw_response: String,
        /// The response headers
        headers: HeaderMap,
        /// Wait requested by the server through `Retry-After`
        retry_after: Option<Duration>,
    },

    /// Invalid configuration was provided.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A required connection setting is absent.
    #[error("Missing required setting `{0}`")]
    MissingSetting(String),

    /// The token provider produced no token at all.
    #[error("No access token available; the token provider returned nothing")]
    NoToken,

    /// All retry attempts were used up on transient failures.
    #[error("Max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        /// The number of attempts made
        attempts: usize,
        /// The last error encountered
        last_error: Box<Error>,
    },

    /// The field selection could not be narrowed further without dropping a
    /// required field.
    #[error("Schema mismatch on list `{list}` could not be resolved (remaining fields: {}): {source}", .fields.join(","))]
    SchemaNarrowingExhausted {
        /// List the request targeted
        list: String,
        /// Fields still selected when narrowing gave up
        fields: Vec<String>,
        /// The schema error reported by the server
        source: Box<Error>,
    },

    /// A field descriptor violates its type invariants.
    #[error("Invalid field descriptor `{field}`: {reason}")]
    InvalidFieldDescriptor {
        /// Internal name of the offending field
        field: String,
        /// What is wrong with it
        reason: String,
    },

    /// A batch response body could not be decoded.
    #[error("Malformed batch response: {0}")]
    MalformedBatch(String),

    /// The caller's cancellation token fired before the work completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Failed to serialize the request body.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

fn auth_guidance(status: &StatusCode) -> &'static str {
    match status.as_u16() {
        401 => " (the access token was rejected; sign in again or check the token audience matches the site)",
        403 => " (access denied; the account or app registration lacks permission on this site or list)",
        _ => "",
    }
}

impl Error {
    /// Returns `true` if this error is transient and worth retrying.
    ///
    /// Network errors, timeouts, 429, 503 and 504 are transient. Concurrency
    /// conflicts and every other status are not.
    ///
    /// # Examples
    ///
    /// ```
    /// use listkeeper::Error;
    /// use http::StatusCode;
    ///
    /// let throttled = Error::HttpError {
    ///     status: StatusCode::TOO_MANY_REQUESTS,
    ///     message: "slow down".to_string(),
    ///     code: None,
    ///     raw_response: String::new(),
    ///     headers: http::HeaderMap::new(),
    ///     retry_after: None,
    /// };
    /// assert!(throttled.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout => true,
            Error::HttpError { status, .. } => is_transient_status(*status),
            _ => false,
        }
    }

    /// Returns `true` for 429/503/504 responses.
    pub fn is_throttle(&self) -> bool {
        matches!(self, Error::HttpError { status, .. } if is_transient_status(*status))
    }

    /// Returns `true` for transport-level failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout)
    }

    /// Returns `true` for 401/403 responses.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.status().map(|s| s.as_u16()),
            Some(401) | Some(403)
        )
    }

    /// Returns `true` for optimistic-concurrency violations (409, 412, 428).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.status().map(|s| s.as_u16()),
            Some(409) | Some(412) | Some(428)
        )
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::HttpError { status, .. } => Some(*status),
            Error::DeserializationFailed { status, .. } => Some(*status),
            Error::MaxRetriesExceeded { last_error, .. } => last_error.status(),
            Error::SchemaNarrowingExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::HttpError { raw_response, .. } => Some(raw_response),
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response),
            Error::MaxRetriesExceeded { last_error, .. } => last_error.raw_response(),
            _ => None,
        }
    }

    /// Returns the server message for HTTP errors.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Error::HttpError { message, .. } => Some(message),
            Error::MaxRetriesExceeded { last_error, .. } => last_error.server_message(),
            Error::SchemaNarrowingExhausted { source, .. } => source.server_message(),
            _ => None,
        }
    }

    /// Returns the wait the server asked for through `Retry-After`.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::HttpError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub(crate) fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 503 | 504)
}

/// A specialized `Result` type for list store calls.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn http_error(status: u16) -> Error {
        Error::HttpError {
            status: StatusCode::from_u16(status).unwrap(),
            message: "boom".to_string(),
            code: None,
            raw_response: "boom".to_string(),
            headers: HeaderMap::new(),
            retry_after: None,
        }
    }

    #[test]
    fn transient_statuses_are_retryable() {
        for status in [429, 503, 504] {
            assert!(http_error(status).is_retryable(), "{status}");
        }
        for status in [400, 401, 404, 409, 412, 428, 500] {
            assert!(!http_error(status).is_retryable(), "{status}");
        }
        assert!(Error::Timeout.is_retryable());
        assert!(!Error::NoToken.is_retryable());
    }

    #[test]
    fn conflicts_are_detected() {
        assert!(http_error(412).is_conflict());
        assert!(http_error(409).is_conflict());
        assert!(http_error(428).is_conflict());
        assert!(!http_error(400).is_conflict());
    }

    #[test]
    fn auth_errors_carry_guidance() {
        let text = http_error(401).to_string();
        assert!(text.starts_with("HTTP error 401 Unauthorized: boom"));
        assert!(text.contains("sign in again"));
        assert!(http_error(403).to_string().contains("lacks permission"));
        assert_eq!(http_error(500).to_string(), "HTTP error 500 Internal Server Error: boom");
    }

    #[test]
    fn status_reaches_through_wrappers() {
        let err = Error::MaxRetriesExceeded {
            attempts: 4,
            last_error: Box::new(http_error(503)),
        };
        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(err.server_message(), Some("boom"));
    }
}
