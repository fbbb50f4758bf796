//! `$batch` submission.
//!
//! Operations are encoded into one `multipart/mixed` body. Reads travel as
//! standalone parts; every mutation gets its own changeset so that one
//! failing write does not roll back the others. The server answers with one
//! part per operation, in order.

use crate::{
    client::{ACCEPT_JSON, CONTENT_TYPE_JSON},
    metadata::RequestMetadata,
    query::ListRef,
    retry::RetryPolicy,
    Client, Error, Result,
};
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Site-relative path of the batch endpoint.
pub const BATCH_PATH: &str = "/_api/$batch";

/// One operation inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    /// A read of `path` (site-relative, may carry a query string).
    Get {
        /// Path to read
        path: String,
    },
    /// Creates an item.
    Create {
        /// Target list
        list: ListRef,
        /// Item fields
        data: Value,
    },
    /// Merges fields into an existing item.
    Update {
        /// Target list
        list: ListRef,
        /// Item id
        id: String,
        /// Fields to change
        data: Value,
        /// Entity tag the item must still carry; `*` when `None`
        if_match: Option<String>,
    },
    /// Deletes an item.
    Delete {
        /// Target list
        list: ListRef,
        /// Item id
        id: String,
        /// Entity tag the item must still carry; `*` when `None`
        if_match: Option<String>,
    },
}

impl BatchOperation {
    /// A read of `path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self::Get { path: path.into() }
    }

    /// Create an item in `list`.
    pub fn create(list: ListRef, data: Value) -> Self {
        Self::Create { list, data }
    }

    /// Merge `data` into item `id`.
    pub fn update(list: ListRef, id: impl Into<String>, data: Value) -> Self {
        Self::Update {
            list,
            id: id.into(),
            data,
            if_match: None,
        }
    }

    /// Delete item `id`.
    pub fn delete(list: ListRef, id: impl Into<String>) -> Self {
        Self::Delete {
            list,
            id: id.into(),
            if_match: None,
        }
    }

    /// Makes an update or delete conditional on `etag`.
    pub fn if_match(mut self, etag: impl Into<String>) -> Self {
        match &mut self {
            Self::Update { if_match, .. } | Self::Delete { if_match, .. } => {
                *if_match = Some(etag.into());
            }
            _ => {}
        }
        self
    }

    /// The method on the wire. Updates tunnel MERGE through POST.
    pub fn http_method(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::Create { .. } | Self::Update { .. } => "POST",
            Self::Delete { .. } => "DELETE",
        }
    }

    /// Returns `true` for operations that change data.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Get { .. })
    }

    fn path(&self) -> String {
        match self {
            Self::Get { path } => path.clone(),
            Self::Create { list, .. } => list.items_path(),
            Self::Update { list, id, .. } | Self::Delete { list, id, .. } => list.item_path(id),
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![("Accept", ACCEPT_JSON.to_string())];
        match self {
            Self::Get { .. } => {}
            Self::Create { .. } => headers.push(("Content-Type", CONTENT_TYPE_JSON.to_string())),
            Self::Update { if_match, .. } => {
                headers.push(("Content-Type", CONTENT_TYPE_JSON.to_string()));
                headers.push(("X-HTTP-Method", "MERGE".to_string()));
                headers.push(("If-Match", if_match.clone().unwrap_or_else(|| "*".to_string())));
            }
            Self::Delete { if_match, .. } => {
                headers.push(("If-Match", if_match.clone().unwrap_or_else(|| "*".to_string())));
            }
        }
        headers
    }

    fn body(&self) -> Option<&Value> {
        match self {
            Self::Create { data, .. } | Self::Update { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// The server's answer to one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPartResponse {
    /// Status of the inner response.
    pub status: u16,
    /// Inner response headers, names lowercased.
    pub headers: HashMap<String, String>,
    /// Inner response body.
    pub body: String,
}

impl BatchPartResponse {
    /// Check if this part succeeded.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Looks up an inner header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| Error::DeserializationFailed {
            raw_response: self.body.clone(),
            serde_error: e.to_string(),
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
        })
    }
}

/// Outcome of [`Client::submit_batch`].
#[derive(Debug, Clone)]
pub struct BatchResponse {
    /// Status of the outer response.
    pub status: StatusCode,
    /// One entry per operation, in submission order.
    pub parts: Vec<BatchPartResponse>,
    /// Attempts made for the outer request.
    pub attempts: usize,
    /// Total time including backoff.
    pub latency: Duration,
}

impl BatchResponse {
    /// Returns `true` if every part succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.parts.iter().all(BatchPartResponse::is_success)
    }

    /// Parts that failed, with their index.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &BatchPartResponse)> {
        self.parts.iter().enumerate().filter(|(_, p)| !p.is_success())
    }
}

/// Encodes `operations` under `boundary`, resolving paths with `resolve`.
fn encode<F>(operations: &[BatchOperation], boundary: &str, resolve: F) -> Result<String>
where
    F: Fn(&str) -> Result<String>,
{
    let mut out = String::new();
    for operation in operations {
        let mut request = format!("{} {} HTTP/1.1\r\n", operation.http_method(), resolve(&operation.path())?);
        for (name, value) in operation.headers() {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
        request.push_str("\r\n");
        if let Some(body) = operation.body() {
            let json = serde_json::to_string(body).map_err(|e| Error::SerializationFailed(e.to_string()))?;
            request.push_str(&json);
            request.push_str("\r\n");
        }

        out.push_str(&format!("--{}\r\n", boundary));
        if operation.is_mutation() {
            let changeset = format!("changeset_{}", Uuid::new_v4());
            out.push_str(&format!("Content-Type: multipart/mixed; boundary={}\r\n\r\n", changeset));
            out.push_str(&format!("--{}\r\n", changeset));
            out.push_str("Content-Type: application/http\r\nContent-Transfer-Encoding: binary\r\n\r\n");
            out.push_str(&request);
            out.push_str(&format!("--{}--\r\n", changeset));
        } else {
            out.push_str("Content-Type: application/http\r\nContent-Transfer-Encoding: binary\r\n\r\n");
            out.push_str(&request);
        }
    }
    out.push_str(&format!("--{}--\r\n", boundary));
    Ok(out)
}

/// Extracts the `boundary` parameter of a multipart content type.
fn boundary_of(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
}

/// Splits `text` at the first blank line into header block and remainder.
fn split_head(text: &str) -> (&str, &str) {
    match text.find("\n\n") {
        Some(i) => (&text[..i], &text[i + 2..]),
        None => (text, ""),
    }
}

fn parse_headers(block: &str) -> HashMap<String, String> {
    block
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect()
}

/// Parses a multipart response body, flattening nested changesets.
fn parse_multipart(body: &str, boundary: &str, parts: &mut Vec<BatchPartResponse>) -> Result<()> {
    let delimiter = format!("--{}", boundary);
    let mut sections = body.split(delimiter.as_str());
    sections.next();

    for section in sections {
        if section.starts_with("--") {
            break;
        }
        let section = section.trim_start_matches('\n');
        let (head, rest) = split_head(section);
        let headers = parse_headers(head);
        let content_type = headers.get("content-type").map(String::as_str).unwrap_or("");

        if content_type.to_ascii_lowercase().starts_with("multipart/mixed") {
            let inner = boundary_of(content_type)
                .ok_or_else(|| Error::MalformedBatch("changeset without boundary".to_string()))?;
            parse_multipart(rest, &inner, parts)?;
        } else {
            parts.push(parse_http_part(rest)?);
        }
    }
    Ok(())
}

/// Parses an embedded `HTTP/1.1 <status> <reason>` response.
fn parse_http_part(text: &str) -> Result<BatchPartResponse> {
    let text = text.trim_start_matches('\n');
    let (status_line, rest) = text.split_once('\n').unwrap_or((text, ""));
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::MalformedBatch(format!("bad status line `{}`", status_line.trim())))?;
    let (head, body) = split_head(rest);
    Ok(BatchPartResponse {
        status,
        headers: parse_headers(head),
        body: body.trim_end().to_string(),
    })
}

/// Parses a full batch response given its content type.
fn parse_response(content_type: Option<&str>, body: &str) -> Result<Vec<BatchPartResponse>> {
    let body = body.replace("\r\n", "\n");
    let boundary = content_type
        .and_then(boundary_of)
        .or_else(|| {
            body.lines()
                .find(|l| l.starts_with("--"))
                .map(|l| l.trim_start_matches("--").trim().to_string())
        })
        .ok_or_else(|| Error::MalformedBatch("no multipart boundary".to_string()))?;

    let mut parts = Vec::new();
    parse_multipart(&body, &boundary, &mut parts)?;
    Ok(parts)
}

impl Client {
    /// Submits `operations` as one batch.
    ///
    /// The outer request is retried on 429/503/504 like a read; transport
    /// failures and token rejection are returned as the outcome.
    ///
    /// # Errors
    ///
    /// Fails when the outer request fails or its body cannot be parsed, or
    /// when the number of parts does not match the number of operations.
    /// A cancelled client returns [`Error::Cancelled`] without sending the
    /// batch, since a partial batch result has no meaning.
    pub async fn submit_batch(&self, operations: Vec<BatchOperation>) -> Result<BatchResponse> {
        if operations.is_empty() {
            return Ok(BatchResponse {
                status: StatusCode::OK,
                parts: Vec::new(),
                attempts: 0,
                latency: Duration::ZERO,
            });
        }

        let boundary = format!("batch_{}", Uuid::new_v4());
        let body = encode(&operations, &boundary, |path| {
            self.resolve_url(path).map(String::from)
        })?;

        tracing::debug!(operations = operations.len(), boundary = %boundary, "Submitting batch");

        let metadata = RequestMetadata::post(BATCH_PATH).with_raw_body(
            format!("multipart/mixed; boundary={}", boundary),
            body.into_bytes(),
        );
        let policy = RetryPolicy::batch(self.retry_settings());
        let response = self.execute(metadata, &policy).await?;

        let parts = parse_response(response.header("content-type"), &response.raw_body)?;
        if parts.len() != operations.len() {
            return Err(Error::MalformedBatch(format!(
                "expected {} parts, got {}",
                operations.len(),
                parts.len()
            )));
        }

        let failed = parts.iter().filter(|p| !p.is_success()).count();
        if failed > 0 {
            tracing::warn!(failed, total = parts.len(), "Batch completed with failed operations");
        }

        Ok(BatchResponse {
            status: response.status,
            parts,
            attempts: response.attempts,
            latency: response.latency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolve(path: &str) -> Result<String> {
        Ok(format!("https://contoso.example.com/sites/hr{}", path))
    }

    #[test]
    fn reads_are_standalone_and_writes_get_changesets() {
        let ops = vec![
            BatchOperation::get("/_api/web/lists/getbytitle('Staff')/items?$top=1"),
            BatchOperation::update(ListRef::title("Staff"), "7", json!({"Title": "A"})).if_match("\"3\""),
            BatchOperation::delete(ListRef::title("Staff"), "8"),
        ];
        let body = encode(&ops, "batch_x", resolve).unwrap();

        assert!(body.starts_with("--batch_x\r\nContent-Type: application/http\r\n"));
        assert!(body.contains("GET https://contoso.example.com/sites/hr/_api/web/lists/getbytitle('Staff')/items?$top=1 HTTP/1.1\r\n"));
        assert_eq!(body.matches("Content-Type: multipart/mixed; boundary=changeset_").count(), 2);
        assert!(body.contains("X-HTTP-Method: MERGE\r\nIf-Match: \"3\"\r\n"));
        assert!(body.contains("DELETE https://contoso.example.com/sites/hr/_api/web/lists/getbytitle('Staff')/items(8) HTTP/1.1\r\nAccept: application/json;odata=nometadata\r\nIf-Match: *\r\n"));
        assert!(body.contains("{\"Title\":\"A\"}\r\n"));
        assert!(body.ends_with("--batch_x--\r\n"));
    }

    #[test]
    fn parses_flat_and_nested_parts() {
        let body = "--batchresponse_1\r\n\
Content-Type: application/http\r\n\
Content-Transfer-Encoding: binary\r\n\
\r\n\
HTTP/1.1 200 OK\r\n\
Content-Type: application/json\r\n\
\r\n\
{\"value\":[]}\r\n\
--batchresponse_1\r\n\
Content-Type: multipart/mixed; boundary=changesetresponse_2\r\n\
\r\n\
--changesetresponse_2\r\n\
Content-Type: application/http\r\n\
\r\n\
HTTP/1.1 204 No Content\r\n\
ETag: \"4\"\r\n\
\r\n\
\r\n\
--changesetresponse_2--\r\n\
--batchresponse_1\r\n\
Content-Type: application/http\r\n\
\r\n\
HTTP/1.1 412 Precondition Failed\r\n\
\r\n\
{\"odata.error\":{}}\r\n\
--batchresponse_1--\r\n";

        let parts = parse_response(Some("multipart/mixed; boundary=batchresponse_1"), body).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].status, 200);
        assert_eq!(parts[0].body, "{\"value\":[]}");
        assert_eq!(parts[1].status, 204);
        assert_eq!(parts[1].header("ETag"), Some("\"4\""));
        assert_eq!(parts[2].status, 412);
        assert!(!parts[2].is_success());
    }

    #[test]
    fn boundary_is_found_without_content_type() {
        let body = "--b1\r\nContent-Type: application/http\r\n\r\nHTTP/1.1 201 Created\r\n\r\n{}\r\n--b1--\r\n";
        let parts = parse_response(None, body).unwrap();
        assert_eq!(parts[0].status, 201);
        assert!(matches!(parse_response(None, "garbage"), Err(Error::MalformedBatch(_))));
    }

    #[test]
    fn quoted_boundary() {
        assert_eq!(
            boundary_of("multipart/mixed; boundary=\"batch_1\"").as_deref(),
            Some("batch_1")
        );
        assert_eq!(boundary_of("application/json"), None);
    }
}
