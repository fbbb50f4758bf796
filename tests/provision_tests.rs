//! List and field provisioning against a simulated site.

use listkeeper::provision::DEFAULT_POOL_WIDTH;
use listkeeper::{CancellationToken, Client, Error, FieldDescriptor, ListSpec, StaticToken};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> Client {
    Client::builder()
        .base_url(server.uri())
        .unwrap()
        .token_provider(StaticToken::new("token"))
        .build()
        .unwrap()
}

async fn mount_existing_list(server: &MockServer, title: &str, id: &str, fields: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/_api/web/lists/getbytitle('{}')", title)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Id": id, "Title": title})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/_api/web/lists(guid'{}')/fields", id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": fields })))
        .mount(server)
        .await;
}

fn staff_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::text("FullNameKana"),
        FieldDescriptor::choice("Shift", ["Early", "Late"]).required(true),
    ]
}

#[tokio::test]
async fn test_second_run_is_read_only() {
    let mock_server = MockServer::start().await;

    mount_existing_list(
        &mock_server,
        "Staff",
        "a1b2",
        json!([
            {"InternalName": "Title", "Required": true},
            {"InternalName": "FullNameKana", "Required": false},
            {"InternalName": "Shift", "Required": true}
        ]),
    )
    .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let provisioned = client(&mock_server)
        .ensure_list("Staff", &staff_fields())
        .await
        .unwrap();

    assert_eq!(provisioned.id, "a1b2");
    assert!(!provisioned.created);
    assert!(provisioned.added_fields.is_empty());
    assert!(provisioned.warnings.is_empty());
}

#[tokio::test]
async fn test_repeated_run_adds_field_once() {
    let mock_server = MockServer::start().await;
    let fields_added = Arc::new(AtomicUsize::new(0));
    let fields_added_read = fields_added.clone();
    let fields_added_write = fields_added.clone();

    Mock::given(method("GET"))
        .and(path("/_api/web/lists/getbytitle('Staff')"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Id": "a1b2", "Title": "Staff"})))
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_api/web/lists(guid'a1b2')/fields"))
        .respond_with(move |_req: &wiremock::Request| {
            let mut fields = vec![json!({"InternalName": "Title", "Required": true})];
            if fields_added_read.load(Ordering::SeqCst) > 0 {
                fields.push(json!({"InternalName": "FullNameKana", "Required": false}));
            }
            ResponseTemplate::new(200).set_body_json(json!({ "value": fields }))
        })
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_api/web/lists(guid'a1b2')/fields/createfieldasxml"))
        .respond_with(move |_req: &wiremock::Request| {
            fields_added_write.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(201).set_body_json(json!({"InternalName": "FullNameKana"}))
        })
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_api/web/lists"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);
    let fields = [FieldDescriptor::text("FullNameKana")];

    let first = client.ensure_list("Staff", &fields).await.unwrap();
    assert_eq!(first.added_fields, vec!["FullNameKana"]);

    let second = client.ensure_list("Staff", &fields).await.unwrap();
    assert!(!second.created);
    assert!(second.added_fields.is_empty());
    assert_eq!(fields_added.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_probe_is_not_sent() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let token = CancellationToken::new();
    token.cancel();
    let result = client(&mock_server).cancellable(token).list_exists("Staff").await;

    assert!(matches!(result, Err(Error::Cancelled)), "{:?}", result);
}

#[tokio::test]
async fn test_missing_list_and_fields_are_created() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/_api/web/lists/getbytitle('Rota')"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "odata.error": {"message": {"value": "List 'Rota' does not exist at site."}}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_api/web/lists"))
        .and(body_string_contains("\"BaseTemplate\":100"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"Id": "c3d4", "Title": "Rota"})))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_api/web/lists(guid'c3d4')/fields"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"InternalName": "Title", "Required": true}]
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_api/web/lists(guid'c3d4')/fields/createfieldasxml"))
        .and(body_string_contains("Name=\\\"FullNameKana\\\""))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"InternalName": "FullNameKana"})))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_api/web/lists(guid'c3d4')/fields/createfieldasxml"))
        .and(body_string_contains("<CHOICE>Late</CHOICE>"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"InternalName": "Shift"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);
    client.schema_cache().record_missing("Rota", ["FullNameKana"]);

    let provisioned = client.ensure_list("Rota", &staff_fields()).await.unwrap();

    assert!(provisioned.created);
    assert_eq!(provisioned.added_fields, vec!["FullNameKana", "Shift"]);
    assert!(client.schema_cache().excluded("Rota").is_empty());
}

#[tokio::test]
async fn test_required_mismatch_is_reported_not_changed() {
    let mock_server = MockServer::start().await;

    mount_existing_list(
        &mock_server,
        "Staff",
        "a1b2",
        json!([
            {"InternalName": "FullNameKana", "Required": false},
            {"InternalName": "Shift", "Required": false}
        ]),
    )
    .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let provisioned = client(&mock_server)
        .ensure_list("Staff", &staff_fields())
        .await
        .unwrap();

    assert_eq!(provisioned.warnings.len(), 1);
    assert!(provisioned.warnings[0].contains("Shift"));
}

#[tokio::test]
async fn test_invalid_descriptor_fails_before_any_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let result = client(&mock_server)
        .ensure_list("Staff", &[FieldDescriptor::choice("Shift", Vec::<String>::new())])
        .await;

    assert!(
        matches!(result, Err(Error::InvalidFieldDescriptor { ref field, .. }) if field == "Shift"),
        "{:?}",
        result
    );
}

#[tokio::test]
async fn test_bulk_operations_keep_input_order() {
    let mock_server = MockServer::start().await;

    mount_existing_list(&mock_server, "Staff", "a1b2", json!([])).await;
    mount_existing_list(&mock_server, "Rota", "c3d4", json!([])).await;
    Mock::given(method("GET"))
        .and(path("/_api/web/lists/getbytitle('Gone')"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);

    let exists = client.lists_exist(&["Staff", "Gone", "Rota"], 2).await;
    let summary: Vec<(String, bool)> = exists
        .into_iter()
        .map(|(title, result)| (title, result.unwrap()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("Staff".to_string(), true),
            ("Gone".to_string(), false),
            ("Rota".to_string(), true)
        ]
    );

    let specs = vec![ListSpec::new("Rota", vec![]), ListSpec::new("Staff", vec![])];
    let provisioned = client.ensure_lists(&specs, DEFAULT_POOL_WIDTH).await;
    let ids: Vec<String> = provisioned.into_iter().map(|r| r.unwrap().id).collect();
    assert_eq!(ids, vec!["c3d4", "a1b2"]);
}
