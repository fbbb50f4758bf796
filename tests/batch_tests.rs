//! `$batch` submission against a simulated endpoint.

use listkeeper::{BatchOperation, Client, ListRef, RetrySettings, StaticToken};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BOUNDARY: &str = "batchresponse_0f1e";

fn client(server: &MockServer) -> Client {
    Client::builder()
        .base_url(server.uri())
        .unwrap()
        .token_provider(StaticToken::new("token"))
        .retry_settings(RetrySettings {
            max_attempts: 4,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            verbose: false,
        })
        .build()
        .unwrap()
}

fn multipart(parts: &[(&str, &str)]) -> ResponseTemplate {
    let mut body = String::new();
    for (status_line, json) in parts {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Type: application/http\r\nContent-Transfer-Encoding: binary\r\n\r\nHTTP/1.1 {status_line}\r\nContent-Type: application/json;odata=nometadata\r\n\r\n{json}\r\n"
        ));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    ResponseTemplate::new(200).set_body_raw(
        body.into_bytes(),
        &format!("multipart/mixed; boundary={BOUNDARY}"),
    )
}

#[tokio::test]
async fn test_throttled_batch_is_resubmitted_once() {
    let mock_server = MockServer::start().await;
    let attempt_count = Arc::new(AtomicUsize::new(0));
    let attempt_count_clone = attempt_count.clone();

    Mock::given(method("POST"))
        .and(path("/_api/$batch"))
        .respond_with(move |_req: &wiremock::Request| {
            let count = attempt_count_clone.fetch_add(1, Ordering::SeqCst);
            if count == 0 {
                ResponseTemplate::new(429).insert_header("retry-after", "0")
            } else {
                multipart(&[("200 OK", r#"{"value":[{"Id":1}]}"#)])
            }
        })
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .submit_batch(vec![BatchOperation::get(
            "/_api/web/lists/getbytitle('Staff')/items?$top=1",
        )])
        .await
        .unwrap();

    assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
    assert_eq!(response.attempts, 2);
    assert!(response.all_succeeded());
    let rows: Value = response.parts[0].json().unwrap();
    assert_eq!(rows["value"][0]["Id"], 1);
}

#[tokio::test]
async fn test_part_failures_are_reported_per_operation() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/_api/$batch"))
        .and(body_string_contains("X-HTTP-Method: MERGE"))
        .and(body_string_contains("If-Match: \"3\""))
        .and(body_string_contains("boundary=changeset_"))
        .respond_with(multipart(&[
            ("201 Created", r#"{"Id":9}"#),
            ("412 Precondition Failed", r#"{"odata.error":{"message":{"value":"version conflict"}}}"#),
        ]))
        .expect(1)
        .mount(&mock_server)
        .await;

    let staff = ListRef::title("Staff");
    let response = client(&mock_server)
        .submit_batch(vec![
            BatchOperation::create(staff.clone(), json!({"Title": "Ada"})),
            BatchOperation::update(staff, "4", json!({"Title": "Grace"})).if_match("\"3\""),
        ])
        .await
        .unwrap();

    assert!(!response.all_succeeded());
    let failures: Vec<usize> = response.failures().map(|(i, _)| i).collect();
    assert_eq!(failures, vec![1]);
    assert_eq!(response.parts[1].status, 412);
}

#[tokio::test]
async fn test_batch_does_not_refresh_rejected_token() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/_api/$batch"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .token_provider(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Some("token".to_string()) }
        })
        .build()
        .unwrap();

    let err = client
        .submit_batch(vec![BatchOperation::delete(ListRef::title("Staff"), "1")])
        .await
        .unwrap_err();

    assert_eq!(err.status().map(|s| s.as_u16()), Some(401));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_batch_sends_nothing() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let response = client(&mock_server).submit_batch(Vec::new()).await.unwrap();
    assert!(response.parts.is_empty());
}
