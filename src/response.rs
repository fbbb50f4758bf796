//! Response wrapper that preserves both parsed data and raw response details.

use crate::{Error, Result};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// A response from the store.
///
/// Untyped responses (`Response<()>`) carry only the raw body; call
/// [`json`](Response::json) to decode them.
///
/// # Examples
///
/// ```
/// # use listkeeper::Response;
/// # use http::{HeaderMap, StatusCode};
/// # use std::time::Duration;
/// let response = Response::new(
///     (),
///     r#"{"Id":7}"#.to_string(),
///     StatusCode::OK,
///     HeaderMap::new(),
///     Duration::from_millis(12),
///     1,
/// );
///
/// let item = response.json::<serde_json::Value>().unwrap();
/// assert_eq!(item.data["Id"], 7);
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The deserialized response data.
    pub data: T,

    /// The raw response body as a string.
    pub raw_body: String,

    /// The HTTP status code of the response.
    pub status: StatusCode,

    /// The response headers.
    pub headers: HeaderMap,

    /// Time from the first attempt until this response arrived, including
    /// backoff sleeps.
    pub latency: Duration,

    /// The number of attempts made to obtain this response.
    pub attempts: usize,
}

impl<T> Response<T> {
    /// Creates a new `Response`.
    pub fn new(
        data: T,
        raw_body: String,
        status: StatusCode,
        headers: HeaderMap,
        latency: Duration,
        attempts: usize,
    ) -> Self {
        Self {
            data,
            raw_body,
            status,
            headers,
            latency,
            attempts,
        }
    }

    /// Maps the response data to a different type using the provided function.
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            data: f(self.data),
            raw_body: self.raw_body,
            status: self.status,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
        }
    }

    /// Returns `true` if the request required retries.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns a reference to a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    /// Returns the entity tag of the returned resource.
    ///
    /// The `ETag` header wins; otherwise the `odata.etag` / `@odata.etag`
    /// annotation of a JSON body is used.
    pub fn etag(&self) -> Option<String> {
        if let Some(tag) = self.header("etag") {
            return Some(tag.to_string());
        }
        let body: serde_json::Value = serde_json::from_str(&self.raw_body).ok()?;
        ["odata.etag", "@odata.etag"]
            .iter()
            .find_map(|key| body.get(*key)?.as_str().map(str::to_string))
    }
}

impl Response<()> {
    /// Decodes the raw body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeserializationFailed`] with the raw body when it is
    /// not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(self) -> Result<Response<T>> {
        match serde_json::from_str::<T>(&self.raw_body) {
            Ok(data) => Ok(self.map(|_| data)),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    status = self.status.as_u16(),
                    "Failed to deserialize response"
                );
                Err(Error::DeserializationFailed {
                    raw_response: self.raw_body,
                    serde_error: e.to_string(),
                    status: self.status,
                })
            }
        }
    }
}

impl<T> AsRef<T> for Response<T> {
    fn as_ref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn response(body: &str, headers: HeaderMap) -> Response<()> {
        Response::new(
            (),
            body.to_string(),
            StatusCode::OK,
            headers,
            Duration::ZERO,
            1,
        )
    }

    #[test]
    fn etag_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert("etag", HeaderValue::from_static("\"4\""));
        let r = response(r#"{"odata.etag":"\"3\""}"#, headers);
        assert_eq!(r.etag().as_deref(), Some("\"4\""));
    }

    #[test]
    fn etag_falls_back_to_body_annotation() {
        let r = response(r#"{"@odata.etag":"\"9\"","Id":1}"#, HeaderMap::new());
        assert_eq!(r.etag().as_deref(), Some("\"9\""));
        assert_eq!(response("", HeaderMap::new()).etag(), None);
    }

    #[test]
    fn json_failure_keeps_raw_body() {
        let err = response("not json", HeaderMap::new())
            .json::<serde_json::Value>()
            .unwrap_err();
        assert_eq!(err.raw_response(), Some("not json"));
    }
}
