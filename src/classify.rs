//! Server error decoding and classification.
//!
//! Error bodies come in several JSON shapes depending on the endpoint and
//! metadata level, and schema drift is only reported as free text. This
//! module turns a status plus body into a structured [`Classification`]; the
//! textual patterns live in a [`Classifier`] so new server phrasings can be
//! added without touching retry control flow.

use http::StatusCode;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Raw bodies longer than this are truncated when surfaced as the message.
pub const MAX_RAW_MESSAGE_LEN: usize = 512;

/// Patterns whose first capture group names a missing field.
pub const MISSING_FIELD_PATTERNS: &[&str] = &[
    r"(?i)field or property '([^']+)' does not exist",
    r"(?i)column '([^']+)' does not exist",
    r"(?i)could not find a property named '([^']+)'",
    r"(?i)the property '([^']+)' does not exist",
];

/// Patterns that indicate a schema mismatch without naming the field.
pub const SCHEMA_MISMATCH_PATTERNS: &[&str] = &[
    r"(?i)field or property .* does not exist",
    r"(?i)column .* does not exist",
    r"(?i)could not find a property",
    r"(?i)one or more field types are not installed properly",
    r"(?i)invalid field name",
];

static DEFAULT_CLASSIFIER: Lazy<Classifier> = Lazy::new(Classifier::default);

/// What kind of failure a response represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 429.
    Throttled,
    /// 503 or 504.
    Unavailable,
    /// 401 or 403.
    Auth,
    /// 409, 412 or 428.
    Conflict,
    /// A selected field does not exist remotely.
    SchemaMismatch,
    /// 404.
    NotFound,
    /// Anything else.
    Other,
}

/// Result of classifying one failed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// The failure kind.
    pub kind: ErrorKind,
    /// The missing field, for schema mismatches that name one.
    pub field: Option<String>,
}

/// Message and code extracted from an error body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Human-readable message.
    pub message: String,
    /// Server error code, if present.
    pub code: Option<String>,
}

/// Compiled classification patterns.
#[derive(Debug, Clone)]
pub struct Classifier {
    missing_field: Vec<Regex>,
    schema_mismatch: Vec<Regex>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            missing_field: compile(MISSING_FIELD_PATTERNS),
            schema_mismatch: compile(SCHEMA_MISMATCH_PATTERNS),
        }
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!(pattern = %p, error = %e, "Ignoring invalid classifier pattern");
                None
            }
        })
        .collect()
}

impl Classifier {
    /// Adds a pattern whose first capture group names a missing field.
    pub fn with_missing_field_pattern(mut self, pattern: Regex) -> Self {
        self.missing_field.push(pattern);
        self
    }

    /// Adds a pattern that marks a schema mismatch without naming the field.
    pub fn with_schema_mismatch_pattern(mut self, pattern: Regex) -> Self {
        self.schema_mismatch.push(pattern);
        self
    }

    /// Classifies a failed response from its status and server message.
    ///
    /// # Examples
    ///
    /// ```
    /// use listkeeper::classify::{Classifier, ErrorKind};
    /// use http::StatusCode;
    ///
    /// let c = Classifier::default().classify(
    ///     StatusCode::BAD_REQUEST,
    ///     "The field or property 'FullNameKana' does not exist.",
    /// );
    /// assert_eq!(c.kind, ErrorKind::SchemaMismatch);
    /// assert_eq!(c.field.as_deref(), Some("FullNameKana"));
    /// ```
    pub fn classify(&self, status: StatusCode, message: &str) -> Classification {
        let kind = match status.as_u16() {
            429 => ErrorKind::Throttled,
            503 | 504 => ErrorKind::Unavailable,
            401 | 403 => ErrorKind::Auth,
            409 | 412 | 428 => ErrorKind::Conflict,
            404 => ErrorKind::NotFound,
            400 => {
                if let Some(field) = self.missing_field(message) {
                    return Classification {
                        kind: ErrorKind::SchemaMismatch,
                        field: Some(field),
                    };
                }
                if self.schema_mismatch.iter().any(|re| re.is_match(message)) {
                    ErrorKind::SchemaMismatch
                } else {
                    ErrorKind::Other
                }
            }
            _ => ErrorKind::Other,
        };
        Classification { kind, field: None }
    }

    /// Classifies an [`Error`](crate::Error); non-HTTP errors are `Other`.
    pub fn classify_error(&self, error: &crate::Error) -> Classification {
        match (error.status(), error.server_message()) {
            (Some(status), Some(message)) => self.classify(status, message),
            (Some(status), None) => self.classify(status, ""),
            _ => Classification {
                kind: ErrorKind::Other,
                field: None,
            },
        }
    }

    fn missing_field(&self, message: &str) -> Option<String> {
        self.missing_field.iter().find_map(|re| {
            re.captures(message)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|name| !name.is_empty())
        })
    }
}

/// Classifies with the built-in patterns.
pub fn classify(status: StatusCode, message: &str) -> Classification {
    DEFAULT_CLASSIFIER.classify(status, message)
}

/// Extracts the server message from an error body.
///
/// Understands the `odata.error` (minimal metadata), `error.message.value`
/// (verbose) and `error.message` (plain string) shapes, plus bare
/// `message` / `error_description` fields. Falls back to the raw text,
/// truncated to [`MAX_RAW_MESSAGE_LEN`] bytes, or the status reason when the
/// body is empty.
///
/// # Examples
///
/// ```
/// use listkeeper::classify::extract_message;
/// use http::StatusCode;
///
/// let body = r#"{"odata.error":{"code":"-1, ArgumentException","message":{"lang":"en-US","value":"List not found"}}}"#;
/// let msg = extract_message(StatusCode::NOT_FOUND, body);
/// assert_eq!(msg.message, "List not found");
/// assert_eq!(msg.code.as_deref(), Some("-1, ArgumentException"));
/// ```
pub fn extract_message(status: StatusCode, body: &str) -> ServerMessage {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(found) = structured_message(&json) {
            return found;
        }
    }

    let trimmed = body.trim();
    let message = if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string()
    } else {
        truncate(trimmed, MAX_RAW_MESSAGE_LEN)
    };
    ServerMessage {
        message,
        code: None,
    }
}

fn structured_message(json: &Value) -> Option<ServerMessage> {
    let error = json
        .get("odata.error")
        .or_else(|| json.get("error"))
        .filter(|e| e.is_object());

    if let Some(error) = error {
        let code = error.get("code").and_then(Value::as_str).map(str::to_string);
        let message = match error.get("message") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Object(m)) => m.get("value").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        if let Some(message) = message {
            return Some(ServerMessage { message, code });
        }
    }

    ["message", "error_description"]
        .iter()
        .find_map(|key| json.get(*key)?.as_str())
        .map(|message| ServerMessage {
            message: message.to_string(),
            code: json.get("error").and_then(Value::as_str).map(str::to_string),
        })
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_missing_field_is_extracted() {
        let c = classify(
            StatusCode::BAD_REQUEST,
            "The field or property 'FullNameKana' does not exist.",
        );
        assert_eq!(c.kind, ErrorKind::SchemaMismatch);
        assert_eq!(c.field.as_deref(), Some("FullNameKana"));

        let c = classify(
            StatusCode::BAD_REQUEST,
            "Could not find a property named 'Dept' on type 'SP.Data.StaffListItem'.",
        );
        assert_eq!(c.field.as_deref(), Some("Dept"));
    }

    #[test]
    fn unnamed_schema_error_has_no_field() {
        let c = classify(
            StatusCode::BAD_REQUEST,
            "One or more field types are not installed properly. Go to the list settings page to delete these fields.",
        );
        assert_eq!(c.kind, ErrorKind::SchemaMismatch);
        assert_eq!(c.field, None);
    }

    #[test]
    fn schema_patterns_only_apply_to_bad_request() {
        let c = classify(
            StatusCode::NOT_FOUND,
            "The field or property 'X' does not exist.",
        );
        assert_eq!(c.kind, ErrorKind::NotFound);
        assert_eq!(classify(StatusCode::BAD_REQUEST, "Invalid $filter").kind, ErrorKind::Other);
    }

    #[test]
    fn statuses_map_to_kinds() {
        assert_eq!(classify(StatusCode::TOO_MANY_REQUESTS, "").kind, ErrorKind::Throttled);
        assert_eq!(classify(StatusCode::GATEWAY_TIMEOUT, "").kind, ErrorKind::Unavailable);
        assert_eq!(classify(StatusCode::FORBIDDEN, "").kind, ErrorKind::Auth);
        assert_eq!(classify(StatusCode::PRECONDITION_FAILED, "").kind, ErrorKind::Conflict);
        assert_eq!(classify(StatusCode::PRECONDITION_REQUIRED, "").kind, ErrorKind::Conflict);
    }

    #[test]
    fn custom_patterns_extend_classification() {
        let classifier = Classifier::default()
            .with_missing_field_pattern(Regex::new(r"unknown column `(\w+)`").unwrap());
        let c = classifier.classify(StatusCode::BAD_REQUEST, "unknown column `Shift`");
        assert_eq!(c.field.as_deref(), Some("Shift"));
    }

    #[test]
    fn message_shapes() {
        let verbose = r#"{"error":{"code":"-2147024809","message":{"lang":"en-US","value":"Bad field"}}}"#;
        assert_eq!(extract_message(StatusCode::BAD_REQUEST, verbose).message, "Bad field");

        let graph = r#"{"error":{"code":"itemNotFound","message":"Item not found"}}"#;
        let msg = extract_message(StatusCode::NOT_FOUND, graph);
        assert_eq!(msg.message, "Item not found");
        assert_eq!(msg.code.as_deref(), Some("itemNotFound"));

        let oauth = r#"{"error":"invalid_token","error_description":"expired"}"#;
        let msg = extract_message(StatusCode::UNAUTHORIZED, oauth);
        assert_eq!(msg.message, "expired");
        assert_eq!(msg.code.as_deref(), Some("invalid_token"));
    }

    #[test]
    fn raw_text_is_bounded() {
        let long = "x".repeat(2000);
        let msg = extract_message(StatusCode::INTERNAL_SERVER_ERROR, &long);
        assert!(msg.message.len() <= MAX_RAW_MESSAGE_LEN + '…'.len_utf8());

        let empty = extract_message(StatusCode::SERVICE_UNAVAILABLE, "  ");
        assert_eq!(empty.message, "Service Unavailable");
    }
}
