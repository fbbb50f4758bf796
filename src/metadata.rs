//! Request descriptions.

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;

/// Everything needed to issue one request against the store.
///
/// `path` is either relative to the site URL (`/_api/web/lists`) or an
/// absolute URL, such as a continuation reference returned by the server,
/// which is then used verbatim.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    /// The HTTP method.
    pub method: Method,

    /// Site-relative path or absolute URL.
    pub path: String,

    /// Additional headers for this request.
    pub headers: HeaderMap,

    /// Query parameters in the order they are sent.
    pub query_params: Vec<(String, String)>,

    /// Request body, if any.
    pub body: Option<RequestBody>,
}

/// A request body.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Sent as `application/json`.
    Json(serde_json::Value),
    /// Sent as is with the given content type.
    Raw {
        /// Value of the `Content-Type` header.
        content_type: String,
        /// Body bytes.
        bytes: Vec<u8>,
    },
}

impl RequestMetadata {
    /// Creates a new `RequestMetadata` with the given method and path.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            query_params: Vec::new(),
            body: None,
        }
    }

    /// Shorthand for a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Shorthand for a POST request.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Adds a header to the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(
        mut self,
        name: impl AsRef<str>,
        value: impl AsRef<str>,
    ) -> Result<Self, crate::Error> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| crate::Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| crate::Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Adds a query parameter to the request.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((key.into(), value.into()));
        self
    }

    /// Adds multiple query parameters to the request.
    pub fn with_query_params(
        mut self,
        params: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.query_params.extend(params);
        self
    }

    /// Serializes `body` as the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerializationFailed`](crate::Error::SerializationFailed)
    /// if `body` cannot be represented as JSON.
    pub fn with_json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, crate::Error> {
        let value = serde_json::to_value(body)
            .map_err(|e| crate::Error::SerializationFailed(e.to_string()))?;
        self.body = Some(RequestBody::Json(value));
        Ok(self)
    }

    /// Sets a pre-encoded body.
    pub fn with_raw_body(mut self, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.body = Some(RequestBody::Raw {
            content_type: content_type.into(),
            bytes,
        });
        self
    }

    /// Returns `true` for methods that change server state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self::new(Method::GET, "")
    }
}
