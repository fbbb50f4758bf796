//! List reads: schema-negotiated selection and continuation paging.

use crate::{
    classify::ErrorKind,
    metadata::RequestMetadata,
    retry::RetryPolicy,
    schema::FieldSelection,
    Client, Error, Response, Result,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Identifies a list on the site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListRef {
    /// Addressed by display title.
    Title(String),
    /// Addressed by list GUID.
    Id(String),
}

impl ListRef {
    /// A list addressed by its title.
    pub fn title(title: impl Into<String>) -> Self {
        ListRef::Title(title.into())
    }

    /// A list addressed by its GUID, with or without braces.
    pub fn id(id: impl Into<String>) -> Self {
        let id: String = id.into();
        ListRef::Id(id.trim_matches(|c| c == '{' || c == '}').to_string())
    }

    /// Site-relative path of the list resource.
    ///
    /// ```
    /// use listkeeper::ListRef;
    ///
    /// assert_eq!(
    ///     ListRef::title("Staff's Rota").api_path(),
    ///     "/_api/web/lists/getbytitle('Staff''s Rota')"
    /// );
    /// assert_eq!(
    ///     ListRef::id("{6f1c}").items_path(),
    ///     "/_api/web/lists(guid'6f1c')/items"
    /// );
    /// ```
    pub fn api_path(&self) -> String {
        match self {
            ListRef::Title(title) => {
                format!("/_api/web/lists/getbytitle('{}')", odata_literal(title))
            }
            ListRef::Id(id) => format!("/_api/web/lists(guid'{}')", id),
        }
    }

    /// Path of the item collection.
    pub fn items_path(&self) -> String {
        format!("{}/items", self.api_path())
    }

    /// Path of one item.
    pub fn item_path(&self, item_id: &str) -> String {
        format!("{}/items({})", self.api_path(), item_id)
    }

    /// Key under which schema knowledge about this list is cached.
    pub fn cache_key(&self) -> &str {
        match self {
            ListRef::Title(title) => title,
            ListRef::Id(id) => id,
        }
    }
}

impl std::fmt::Display for ListRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.cache_key())
    }
}

fn odata_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Query options for a list read.
///
/// # Examples
///
/// ```
/// use listkeeper::{FieldSelection, ListQuery};
///
/// let query = ListQuery::new()
///     .selection(FieldSelection::new().required(["Id"]).optional(["Title", "Shift"]))
///     .filter("Active eq 1")
///     .orderby("Id")
///     .top(500);
/// assert_eq!(query.top, Some(500));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Fields to select; `None` lets the server choose.
    pub select: Option<FieldSelection>,
    /// `$filter` expression.
    pub filter: Option<String>,
    /// `$orderby` expression.
    pub orderby: Option<String>,
    /// Page size hint.
    pub top: Option<u32>,
}

impl ListQuery {
    /// An empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects `fields`, each of which may be shed on schema mismatch.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(fields.into_iter().collect());
        self
    }

    /// Selects a tiered field set.
    pub fn selection(mut self, selection: FieldSelection) -> Self {
        self.select = Some(selection);
        self
    }

    /// Sets `$filter`.
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Sets `$orderby`.
    pub fn orderby(mut self, orderby: impl Into<String>) -> Self {
        self.orderby = Some(orderby.into());
        self
    }

    /// Sets `$top`.
    pub fn top(mut self, top: u32) -> Self {
        self.top = Some(top);
        self
    }

    fn first_page(&self, list: &ListRef, select: Option<String>) -> RequestMetadata {
        let mut metadata = RequestMetadata::get(list.items_path());
        if let Some(select) = select {
            metadata = metadata.with_query_param("$select", select);
        }
        if let Some(filter) = &self.filter {
            metadata = metadata.with_query_param("$filter", filter);
        }
        if let Some(orderby) = &self.orderby {
            metadata = metadata.with_query_param("$orderby", orderby);
        }
        if let Some(top) = self.top {
            metadata = metadata.with_query_param("$top", top.to_string());
        }
        metadata
    }
}

/// One decoded page of rows.
#[derive(Debug)]
struct Page {
    rows: Vec<Value>,
    next: Option<String>,
}

/// Reads rows and the continuation reference from a page body.
///
/// Rows come from `value` (minimal metadata) or `d.results` (verbose). The
/// continuation is `@odata.nextLink`, `odata.nextLink` or `d.__next`.
fn parse_page(response: Response<()>) -> Result<Page> {
    let status = response.status;
    let mut body: Value = response.json::<Value>()?.data;

    let next = ["@odata.nextLink", "odata.nextLink"]
        .iter()
        .find_map(|key| body.get(*key)?.as_str())
        .or_else(|| body.pointer("/d/__next")?.as_str())
        .map(str::to_string);

    let slot = if body.get("value").is_some() {
        body.get_mut("value")
    } else {
        body.pointer_mut("/d/results")
    };
    let rows = match slot.map(Value::take) {
        Some(Value::Array(rows)) => rows,
        _ => {
            return Err(Error::DeserializationFailed {
                raw_response: body.to_string(),
                serde_error: "page carries no `value` array".to_string(),
                status,
            })
        }
    };

    Ok(Page { rows, next })
}

impl Client {
    /// Issues a read whose `$select` is negotiated against the list schema.
    ///
    /// Fields already known to be absent are left out up front. When the
    /// server still rejects the selection, a named field is recorded in the
    /// [`SchemaCache`](crate::SchemaCache) and dropped; an unnamed mismatch
    /// drops the least essential tier. Every retry selects strictly fewer
    /// fields, so the loop ends.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaNarrowingExhausted`] when a required field is
    /// reported missing or nothing optional is left to shed. A selection is
    /// never widened: `$select` is omitted only when `selection` is `None`
    /// or empty.
    pub async fn execute_selecting<F>(
        &self,
        list: &ListRef,
        selection: Option<&FieldSelection>,
        policy: &RetryPolicy,
        build: F,
    ) -> Result<Response<()>>
    where
        F: Fn(Option<String>) -> RequestMetadata,
    {
        let selection = match selection {
            Some(selection) if !selection.is_empty() => selection,
            _ => return self.execute(build(None), policy).await,
        };

        let key = list.cache_key();
        let cache = self.schema_cache();
        let mut current = selection.narrowed(cache, key);
        if current.is_empty() {
            // Every field is known absent; let the server name the failure.
            current = selection.clone();
        }

        loop {
            let fields = current.fields();
            let error = match self.execute(build(Some(fields.join(","))), policy).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            let classification = self.classifier().classify_error(&error);
            if classification.kind != ErrorKind::SchemaMismatch {
                return Err(error);
            }

            let exhausted = |error: Error, fields: Vec<String>| Error::SchemaNarrowingExhausted {
                list: key.to_string(),
                fields,
                source: Box::new(error),
            };

            let next = match classification.field {
                Some(field) => {
                    cache.record_missing(key, [field.as_str()]);
                    if current.is_required(&field) {
                        tracing::error!(list = %key, field = %field, "Required field is missing from list");
                        return Err(exhausted(error, fields));
                    }
                    let next = current.narrowed(cache, key);
                    if next.fields().len() >= fields.len() {
                        // The field is referenced outside $select (filter, orderby).
                        return Err(exhausted(error, fields));
                    }
                    tracing::warn!(list = %key, field = %field, "Dropping missing field from selection");
                    next
                }
                None => match current.drop_last_tier() {
                    Some(next) => {
                        tracing::warn!(
                            list = %key,
                            remaining = next.fields().len(),
                            "Schema mismatch without field name; shedding optional fields"
                        );
                        next
                    }
                    None => return Err(exhausted(error, fields)),
                },
            };
            if next.is_empty() {
                tracing::error!(list = %key, "No selectable fields left on list");
                return Err(exhausted(error, fields));
            }
            current = next;
        }
    }

    /// Reads every row of `list` matching `query`, following continuation
    /// references until the server stops returning one.
    ///
    /// Rows are returned in server order across pages. If the client's
    /// cancellation token fires, the rows gathered so far are returned.
    ///
    /// # Errors
    ///
    /// Fails with the first unrecoverable page error.
    pub async fn list_all(&self, list: &ListRef, query: &ListQuery) -> Result<Vec<Value>> {
        let policy = self.read_policy();
        let mut rows = Vec::new();

        let first = self
            .execute_selecting(list, query.select.as_ref(), &policy, |select| {
                query.first_page(list, select)
            })
            .await;
        let mut page = match first {
            Ok(response) => parse_page(response)?,
            Err(Error::Cancelled) => {
                tracing::info!(list = %list, "Read cancelled before first page");
                return Ok(rows);
            }
            Err(e) => return Err(e),
        };
        let mut pages = 1usize;

        loop {
            rows.append(&mut page.rows);
            let Some(next) = page.next.take() else {
                break;
            };

            let response = match self.execute(RequestMetadata::get(&next), &policy).await {
                Ok(response) => response,
                Err(Error::Cancelled) => {
                    tracing::info!(list = %list, pages, rows = rows.len(), "Read cancelled; returning partial rows");
                    return Ok(rows);
                }
                Err(e) => return Err(e),
            };
            page = parse_page(response)?;
            pages += 1;

            if page.next.as_deref() == Some(next.as_str()) {
                tracing::warn!(list = %list, next = %next, "Server repeated continuation reference; stopping");
                rows.append(&mut page.rows);
                break;
            }
        }

        tracing::debug!(list = %list, pages, rows = rows.len(), "Read complete");
        Ok(rows)
    }

    /// [`list_all`](Self::list_all), decoding each row into `T`.
    ///
    /// # Errors
    ///
    /// Also fails with [`Error::DeserializationFailed`] on the first row
    /// that does not decode.
    pub async fn list_items<T>(&self, list: &ListRef, query: &ListQuery) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        self.list_all(list, query)
            .await?
            .into_iter()
            .map(|row| {
                let raw = row.to_string();
                serde_json::from_value(row).map_err(|e| Error::DeserializationFailed {
                    raw_response: raw,
                    serde_error: e.to_string(),
                    status: http::StatusCode::OK,
                })
            })
            .collect()
    }

    /// Reads one item with a negotiated selection.
    pub async fn get_item(
        &self,
        list: &ListRef,
        item_id: &str,
        select: Option<&FieldSelection>,
    ) -> Result<Response<Value>> {
        let path = list.item_path(item_id);
        self.execute_selecting(list, select, &self.read_policy(), |select| {
            let metadata = RequestMetadata::get(path.as_str());
            match select {
                Some(select) => metadata.with_query_param("$select", select),
                None => metadata,
            }
        })
        .await?
        .json()
    }
}
