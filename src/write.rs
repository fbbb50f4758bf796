//! Item writes with optimistic concurrency.
//!
//! [`Client::write`] never returns `Err`: every outcome, including transport
//! failure and cancellation, is a [`WriteResult`] the caller can inspect.
//! Concurrency conflicts (409/412/428) are reported immediately and never
//! retried.

use crate::{
    metadata::RequestMetadata, query::ListRef, retry::RetryPolicy, Client, Error, Response,
};
use http::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// How a write reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
    /// Create.
    Post,
    /// Partial update.
    Patch,
    /// Partial update tunnelled through POST with `X-HTTP-Method: MERGE`.
    Merge,
    /// Delete.
    Delete,
}

/// A single item write.
///
/// # Examples
///
/// ```
/// use listkeeper::{ListRef, WriteRequest};
/// use serde_json::json;
///
/// let request = WriteRequest::update(ListRef::title("Staff"), "12", json!({"Title": "Ada"}))
///     .if_match("\"3\"")
///     .retries(2);
/// assert_eq!(request.retries, 2);
/// ```
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Method.
    pub method: WriteMethod,
    /// Target list.
    pub list: ListRef,
    /// Target item; `None` for creates.
    pub item_id: Option<String>,
    /// Fields to send.
    pub body: Option<Value>,
    /// Entity tag the item must still carry.
    pub if_match: Option<String>,
    /// Extra attempts on transient failure.
    pub retries: usize,
}

impl WriteRequest {
    /// Creates an item. One retry by default.
    pub fn create(list: ListRef, body: Value) -> Self {
        Self {
            method: WriteMethod::Post,
            list,
            item_id: None,
            body: Some(body),
            if_match: None,
            retries: 1,
        }
    }

    /// Merges `body` into an item. Two retries by default.
    pub fn update(list: ListRef, item_id: impl Into<String>, body: Value) -> Self {
        Self {
            method: WriteMethod::Merge,
            list,
            item_id: Some(item_id.into()),
            body: Some(body),
            if_match: None,
            retries: 2,
        }
    }

    /// Patches an item. Two retries by default.
    pub fn patch(list: ListRef, item_id: impl Into<String>, body: Value) -> Self {
        Self {
            method: WriteMethod::Patch,
            ..Self::update(list, item_id, body)
        }
    }

    /// Deletes an item. No retries by default.
    pub fn delete(list: ListRef, item_id: impl Into<String>) -> Self {
        Self {
            method: WriteMethod::Delete,
            list,
            item_id: Some(item_id.into()),
            body: None,
            if_match: None,
            retries: 0,
        }
    }

    /// Makes the write conditional on `etag`.
    pub fn if_match(mut self, etag: impl Into<String>) -> Self {
        self.if_match = Some(etag.into());
        self
    }

    /// Sets the retry budget.
    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    fn to_metadata(&self) -> crate::Result<RequestMetadata> {
        let path = match (&self.item_id, self.method) {
            (Some(id), _) => self.list.item_path(id),
            (None, WriteMethod::Post) => self.list.items_path(),
            (None, method) => {
                return Err(Error::ConfigurationError(format!(
                    "{:?} of an item in `{}` needs an item id",
                    method, self.list
                )))
            }
        };

        let mut metadata = match self.method {
            WriteMethod::Post => RequestMetadata::post(path),
            WriteMethod::Patch => RequestMetadata::new(Method::PATCH, path),
            WriteMethod::Merge => RequestMetadata::post(path).with_header("X-HTTP-Method", "MERGE")?,
            WriteMethod::Delete => RequestMetadata::new(Method::DELETE, path),
        };
        if let Some(body) = &self.body {
            metadata = metadata.with_json(body)?;
        }
        if let Some(etag) = &self.if_match {
            metadata = metadata.with_header("If-Match", etag)?;
        }
        Ok(metadata)
    }
}

/// Why a write did not take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 409/412/428: the item changed or a precondition is required.
    Conflict,
    /// 429/503/504 persisted through every retry.
    Transient,
    /// 401/403, or no token at all.
    Auth,
    /// Any other non-2xx status.
    Rejected,
    /// No response was received.
    Transport,
    /// The cancellation token fired before the write was sent.
    Cancelled,
    /// The request could not be built.
    Invalid,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Conflict => "conflict",
            FailureKind::Transient => "transient",
            FailureKind::Auth => "auth",
            FailureKind::Rejected => "rejected",
            FailureKind::Transport => "transport",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// A write that did not take effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("write failed ({kind}): {message}")]
pub struct WriteFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Status of the last response, if one was received.
    pub status: Option<u16>,
    /// Server or transport message.
    pub message: String,
    /// Server error code, if present.
    pub code: Option<String>,
    /// Requests sent; 0 when the write never reached the server.
    pub attempts: usize,
}

impl WriteFailure {
    /// Describes `error`, the outcome after `attempts` requests were sent.
    fn from_error(error: Error, attempts: usize) -> Self {
        let error = match error {
            Error::MaxRetriesExceeded { last_error, .. } => *last_error,
            other => other,
        };

        let kind = if matches!(error, Error::Cancelled) {
            FailureKind::Cancelled
        } else if error.is_transport() {
            FailureKind::Transport
        } else if error.is_conflict() {
            FailureKind::Conflict
        } else if error.is_throttle() {
            FailureKind::Transient
        } else if error.is_auth_failure() || matches!(error, Error::NoToken) {
            FailureKind::Auth
        } else if error.status().is_some() {
            FailureKind::Rejected
        } else {
            FailureKind::Invalid
        };

        let code = match &error {
            Error::HttpError { code, .. } => code.clone(),
            _ => None,
        };

        Self {
            kind,
            status: error.status().map(|s| s.as_u16()),
            message: error
                .server_message()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            code,
            attempts,
        }
    }
}

/// A write that took effect.
#[derive(Debug, Clone, PartialEq)]
pub struct Saved<T> {
    /// Response status.
    pub status: u16,
    /// Decoded body; `None` for empty bodies such as 204.
    pub data: Option<T>,
    /// Entity tag of the written item.
    pub etag: Option<String>,
    /// Attempts made.
    pub attempts: usize,
}

/// Outcome of [`Client::write`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteResult<T> {
    /// The write took effect.
    Saved(Saved<T>),
    /// The write did not take effect.
    Failed(WriteFailure),
}

impl<T> WriteResult<T> {
    /// Returns `true` if the write took effect.
    pub fn is_saved(&self) -> bool {
        matches!(self, WriteResult::Saved(_))
    }

    /// Returns `true` for concurrency conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, WriteResult::Failed(f) if f.kind == FailureKind::Conflict)
    }

    /// Entity tag of the written item.
    pub fn etag(&self) -> Option<&str> {
        match self {
            WriteResult::Saved(saved) => saved.etag.as_deref(),
            WriteResult::Failed(_) => None,
        }
    }

    /// The failure, if any.
    pub fn failure(&self) -> Option<&WriteFailure> {
        match self {
            WriteResult::Failed(failure) => Some(failure),
            WriteResult::Saved(_) => None,
        }
    }

    /// Converts into a standard `Result`.
    pub fn into_result(self) -> std::result::Result<Saved<T>, WriteFailure> {
        match self {
            WriteResult::Saved(saved) => Ok(saved),
            WriteResult::Failed(failure) => Err(failure),
        }
    }
}

fn saved<T: DeserializeOwned>(response: Response<()>) -> Saved<T> {
    let data = if response.raw_body.trim().is_empty() {
        None
    } else {
        match serde_json::from_str::<T>(&response.raw_body) {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::warn!(error = %e, "Write succeeded but response body did not decode");
                None
            }
        }
    };
    Saved {
        status: response.status.as_u16(),
        etag: response.etag(),
        attempts: response.attempts,
        data,
    }
}

impl Client {
    /// Performs one item write.
    ///
    /// Transient failures are retried up to `request.retries` times with a
    /// linear `300ms * attempt` ramp; `Retry-After` is not consulted. A
    /// 401/403 refreshes the token once.
    pub async fn write<T>(&self, request: WriteRequest) -> WriteResult<T>
    where
        T: DeserializeOwned,
    {
        if self.is_cancelled() {
            return WriteResult::Failed(WriteFailure::from_error(Error::Cancelled, 0));
        }

        let metadata = match request.to_metadata() {
            Ok(metadata) => metadata,
            Err(e) => return WriteResult::Failed(WriteFailure::from_error(e, 0)),
        };

        let policy = RetryPolicy::write(request.retries);
        match self.execute_counted(metadata, &policy).await {
            Ok(response) => {
                tracing::debug!(
                    list = %request.list,
                    method = ?request.method,
                    status = response.status.as_u16(),
                    "Write saved"
                );
                WriteResult::Saved(saved(response))
            }
            Err((error, attempts)) => {
                let failure = WriteFailure::from_error(error, attempts);
                tracing::warn!(
                    list = %request.list,
                    method = ?request.method,
                    kind = %failure.kind,
                    status = ?failure.status,
                    attempts = failure.attempts,
                    "Write failed"
                );
                WriteResult::Failed(failure)
            }
        }
    }
}
