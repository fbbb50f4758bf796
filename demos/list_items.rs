//! Reads a list end to end and updates one item.
//!
//! This example shows how to:
//! - Build a client from `LISTKEEPER_*` environment variables
//! - Provision a list with the fields the program relies on
//! - Read every row with a selection that tolerates missing fields
//! - Update an item conditionally and inspect the outcome
//!
//! Run with:
//! `LISTKEEPER_SITE_URL=https://contoso.example.com/sites/hr LISTKEEPER_TOKEN=... cargo run --example list_items`

use listkeeper::{
    Client, ClientConfig, Error, FieldDescriptor, FieldSelection, ListQuery, ListRef,
    WriteRequest, WriteResult,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Staff {
    #[serde(rename = "Id")]
    id: u32,
    #[serde(rename = "Title")]
    title: String,
    #[serde(rename = "FullNameKana", default)]
    full_name_kana: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter("listkeeper=debug,list_items=info")
        .init();

    let config = ClientConfig::from_env()?;
    let client = Client::from_config(config, || async { std::env::var("LISTKEEPER_TOKEN").ok() })?;

    println!("=== Provisioning ===");
    let provisioned = client
        .ensure_list(
            "Staff",
            &[
                FieldDescriptor::text("FullNameKana"),
                FieldDescriptor::choice("Shift", ["Early", "Late"]).default_text("Early"),
            ],
        )
        .await?;
    println!("List {} ({})", provisioned.title, provisioned.id);
    println!("Created: {}, added fields: {:?}", provisioned.created, provisioned.added_fields);
    for warning in &provisioned.warnings {
        println!("Warning: {}", warning);
    }
    println!();

    println!("=== Reading ===");
    let staff = ListRef::title("Staff");
    let query = ListQuery::new()
        .selection(
            FieldSelection::new()
                .required(["Id", "Title"])
                .optional(["FullNameKana"]),
        )
        .orderby("Id")
        .top(500);
    let rows: Vec<Staff> = client.list_items(&staff, &query).await?;
    println!("Read {} rows", rows.len());
    println!("Excluded fields: {:?}", client.schema_cache().excluded("Staff"));
    println!();

    let Some(first) = rows.first() else {
        return Ok(());
    };

    println!("=== Writing ===");
    let result = client
        .write::<serde_json::Value>(
            WriteRequest::update(staff, first.id.to_string(), json!({"Shift": "Late"})).if_match("*"),
        )
        .await;
    match result {
        WriteResult::Saved(saved) => println!("Saved with status {} (etag {:?})", saved.status, saved.etag),
        WriteResult::Failed(failure) => println!("Not saved: {}", failure),
    }

    Ok(())
}
