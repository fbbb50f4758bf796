//! # Listkeeper - a resilient client for list-based REST stores
//!
//! Listkeeper talks to a site of a SharePoint-style list store over its REST
//! API. It takes care of the things every caller otherwise reimplements:
//! bearer tokens, throttling, schema drift, paging, provisioning, batches and
//! conflict-aware writes.
//!
//! ## Quick Start
//!
//! ```no_run
//! use listkeeper::{Client, FieldDescriptor, ListQuery, ListRef, WriteRequest, WriteResult};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), listkeeper::Error> {
//!     let client = Client::builder()
//!         .base_url("https://contoso.example.com/sites/hr")?
//!         .token_provider(|| async { std::env::var("HR_TOKEN").ok() })
//!         .build()?;
//!
//!     // Make sure the list exists with the fields we rely on
//!     client
//!         .ensure_list("Staff", &[
//!             FieldDescriptor::text("FullNameKana"),
//!             FieldDescriptor::choice("Shift", ["Early", "Late"]),
//!         ])
//!         .await?;
//!
//!     // Read every row; fields missing on this tenant are dropped from $select
//!     let staff = ListRef::title("Staff");
//!     let rows = client
//!         .list_all(&staff, &ListQuery::new().select(["Id", "Title", "FullNameKana"]))
//!         .await?;
//!     println!("{} rows", rows.len());
//!
//!     // Conditional update
//!     let result = client
//!         .write::<serde_json::Value>(
//!             WriteRequest::update(staff, "1", json!({"Shift": "Late"})).if_match("\"1\""),
//!         )
//!         .await;
//!     if let WriteResult::Failed(failure) = result {
//!         eprintln!("not saved: {}", failure);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Reads return [`Error`], which keeps the status, the extracted server
//! message and the raw body:
//!
//! ```no_run
//! use listkeeper::{Client, Error, ListQuery, ListRef, StaticToken};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder()
//! #     .base_url("https://contoso.example.com/sites/hr")?
//! #     .token_provider(StaticToken::new("t"))
//! #     .build()?;
//! match client.list_all(&ListRef::title("Staff"), &ListQuery::new()).await {
//!     Ok(rows) => println!("{} rows", rows.len()),
//!     Err(Error::HttpError { status, message, .. }) => {
//!         eprintln!("HTTP error {}: {}", status, message);
//!     }
//!     Err(Error::SchemaNarrowingExhausted { list, fields, .. }) => {
//!         eprintln!("List {} lacks required fields among {:?}", list, fields);
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Writes never return `Err`; they return a [`WriteResult`] instead.
//!
//! ## Retries
//!
//! Reads retry 429/503/504 and transport failures with full-jitter
//! exponential backoff, waiting for `Retry-After` when the server sends it.
//! Tune it through [`config::RetrySettings`] or the `LISTKEEPER_RETRY_*`
//! environment variables, and observe it with [`ClientBuilder::on_retry`].

pub mod auth;
pub mod batch;
pub mod classify;
mod client;
pub mod config;
mod error;
pub mod metadata;
pub mod provision;
pub mod query;
pub mod rate_limit;
mod response;
pub mod retry;
pub mod schema;
pub mod write;

pub use auth::{StaticToken, TokenProvider};
pub use batch::{BatchOperation, BatchPartResponse, BatchResponse};
pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, RetrySettings};
pub use error::{Error, Result};
pub use provision::{FieldDescriptor, FieldType, ListSpec, ProvisionedList};
pub use query::{ListQuery, ListRef};
pub use rate_limit::RateLimitConfig;
pub use response::Response;
pub use retry::{RetryEvent, RetryPolicy, RetryPredicate, RetryReason, RetryStrategy};
pub use schema::{FieldSelection, SchemaCache};
pub use tokio_util::sync::CancellationToken;
pub use write::{FailureKind, WriteFailure, WriteMethod, WriteRequest, WriteResult};
