//! Idempotent list and field provisioning.
//!
//! [`Client::ensure_list`] makes a list with the given fields exist. Running
//! it against a list that already has every field issues reads only.

use crate::{
    metadata::RequestMetadata,
    query::ListRef,
    retry::RetryPolicy,
    Client, Error, Result,
};
use futures::stream::{self, StreamExt};
use quick_xml::escape::escape;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

/// Default number of lists provisioned or probed concurrently.
pub const DEFAULT_POOL_WIDTH: usize = 5;

/// `BaseTemplate` of a generic custom list.
const GENERIC_LIST_TEMPLATE: u32 = 100;

/// `AddFieldInternalNameHint`: keep the internal name given in the XML.
const ADD_FIELD_INTERNAL_NAME_HINT: u32 = 8;

/// Column type of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// Single line of text.
    Text,
    /// Multi-line plain text.
    Note,
    /// Number.
    Number,
    /// Yes/No.
    Boolean,
    /// Date and time.
    DateTime,
    /// One of a fixed set of values.
    Choice {
        /// Allowed values, in display order.
        choices: Vec<String>,
    },
    /// Reference to an item in another list.
    Lookup {
        /// GUID of the target list.
        list_id: String,
    },
}

impl FieldType {
    fn xml_type(&self) -> &'static str {
        match self {
            FieldType::Text => "Text",
            FieldType::Note => "Note",
            FieldType::Number => "Number",
            FieldType::Boolean => "Boolean",
            FieldType::DateTime => "DateTime",
            FieldType::Choice { .. } => "Choice",
            FieldType::Lookup { .. } => "Lookup",
        }
    }
}

/// Default value of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldDefault {
    /// A textual default.
    Text(String),
    /// A Yes/No default.
    Bool(bool),
}

/// Declarative description of one field.
///
/// # Examples
///
/// ```
/// use listkeeper::FieldDescriptor;
///
/// let shift = FieldDescriptor::choice("Shift", ["Early", "Late"])
///     .display_name("Shift pattern")
///     .required(true)
///     .default_text("Early");
/// assert!(shift.validate().is_ok());
/// assert!(shift.schema_xml().contains("<CHOICE>Late</CHOICE>"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Internal (static) name.
    pub internal_name: String,
    /// Name shown to users; defaults to the internal name.
    pub display_name: Option<String>,
    /// Column type.
    pub field_type: FieldType,
    /// Whether a value is mandatory.
    pub required: bool,
    /// Default value.
    pub default: Option<FieldDefault>,
}

impl FieldDescriptor {
    /// A field of any type.
    pub fn new(internal_name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            internal_name: internal_name.into(),
            display_name: None,
            field_type,
            required: false,
            default: None,
        }
    }

    /// Single line of text.
    pub fn text(internal_name: impl Into<String>) -> Self {
        Self::new(internal_name, FieldType::Text)
    }

    /// Multi-line text.
    pub fn note(internal_name: impl Into<String>) -> Self {
        Self::new(internal_name, FieldType::Note)
    }

    /// Number.
    pub fn number(internal_name: impl Into<String>) -> Self {
        Self::new(internal_name, FieldType::Number)
    }

    /// Yes/No.
    pub fn boolean(internal_name: impl Into<String>) -> Self {
        Self::new(internal_name, FieldType::Boolean)
    }

    /// Date and time.
    pub fn date_time(internal_name: impl Into<String>) -> Self {
        Self::new(internal_name, FieldType::DateTime)
    }

    /// Choice among `choices`.
    pub fn choice<I, S>(internal_name: impl Into<String>, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            internal_name,
            FieldType::Choice {
                choices: choices.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// Lookup into the list with GUID `list_id`.
    pub fn lookup(internal_name: impl Into<String>, list_id: impl Into<String>) -> Self {
        let list_id: String = list_id.into();
        Self::new(
            internal_name,
            FieldType::Lookup {
                list_id: list_id.trim_matches(|c| c == '{' || c == '}').to_string(),
            },
        )
    }

    /// Sets the display name.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Marks the field mandatory or optional.
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Sets a textual default.
    pub fn default_text(mut self, value: impl Into<String>) -> Self {
        self.default = Some(FieldDefault::Text(value.into()));
        self
    }

    /// Sets a Yes/No default.
    pub fn default_bool(mut self, value: bool) -> Self {
        self.default = Some(FieldDefault::Bool(value));
        self
    }

    /// Checks the type invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFieldDescriptor`] for an empty or
    /// whitespace-containing internal name, a choice field without choices,
    /// a lookup without a target list, or a default of the wrong kind.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidFieldDescriptor {
            field: self.internal_name.clone(),
            reason: reason.to_string(),
        };

        if self.internal_name.is_empty() {
            return Err(invalid("internal name is empty"));
        }
        if self.internal_name.chars().any(char::is_whitespace) {
            return Err(invalid("internal name contains whitespace"));
        }

        match &self.field_type {
            FieldType::Choice { choices } if choices.is_empty() => {
                return Err(invalid("choice field has no choices"))
            }
            FieldType::Lookup { list_id } if list_id.trim().is_empty() => {
                return Err(invalid("lookup field has no target list"))
            }
            _ => {}
        }

        match (&self.default, &self.field_type) {
            (Some(FieldDefault::Bool(_)), FieldType::Boolean) | (None, _) => Ok(()),
            (Some(FieldDefault::Bool(_)), _) => Err(invalid("boolean default on non-boolean field")),
            (Some(FieldDefault::Text(_)), FieldType::Boolean) => {
                Err(invalid("text default on boolean field"))
            }
            (Some(FieldDefault::Text(_)), FieldType::Lookup { .. }) => {
                Err(invalid("lookup fields take no default"))
            }
            (Some(FieldDefault::Text(value)), FieldType::Choice { choices }) => {
                if choices.contains(value) {
                    Ok(())
                } else {
                    Err(invalid("default is not one of the choices"))
                }
            }
            (Some(FieldDefault::Text(_)), _) => Ok(()),
        }
    }

    /// The field definition XML sent to the server.
    pub fn schema_xml(&self) -> String {
        let name = escape(self.internal_name.as_str());
        let display = escape(self.display_name.as_deref().unwrap_or(&self.internal_name));
        let required = if self.required { "TRUE" } else { "FALSE" };

        let mut xml = format!(
            r#"<Field Type="{}" Name="{name}" StaticName="{name}" DisplayName="{display}" Required="{required}""#,
            self.field_type.xml_type()
        );
        match &self.field_type {
            FieldType::Note => xml.push_str(r#" NumLines="6" RichText="FALSE""#),
            FieldType::DateTime => xml.push_str(r#" Format="DateTime""#),
            FieldType::Choice { .. } => xml.push_str(r#" Format="Dropdown""#),
            FieldType::Lookup { list_id } => {
                xml.push_str(&format!(r#" List="{{{}}}" ShowField="Title""#, escape(list_id.as_str())));
            }
            _ => {}
        }
        xml.push('>');

        match &self.default {
            Some(FieldDefault::Text(value)) => {
                xml.push_str(&format!("<Default>{}</Default>", escape(value.as_str())));
            }
            Some(FieldDefault::Bool(value)) => {
                xml.push_str(&format!("<Default>{}</Default>", u8::from(*value)));
            }
            None => {}
        }

        if let FieldType::Choice { choices } = &self.field_type {
            xml.push_str("<CHOICES>");
            for choice in choices {
                xml.push_str(&format!("<CHOICE>{}</CHOICE>", escape(choice.as_str())));
            }
            xml.push_str("</CHOICES>");
        }

        xml.push_str("</Field>");
        xml
    }
}

/// A list to provision with [`Client::ensure_lists`].
#[derive(Debug, Clone)]
pub struct ListSpec {
    /// List title.
    pub title: String,
    /// Fields the list must have.
    pub fields: Vec<FieldDescriptor>,
}

impl ListSpec {
    /// A list titled `title` with `fields`.
    pub fn new(title: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            title: title.into(),
            fields,
        }
    }
}

/// Outcome of [`Client::ensure_list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedList {
    /// GUID of the list.
    pub id: String,
    /// Title as stored on the server.
    pub title: String,
    /// Whether the list was created by this call.
    pub created: bool,
    /// Internal names of fields added by this call.
    pub added_fields: Vec<String>,
    /// Differences left alone, such as a `Required` flag that disagrees.
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListInfo {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Title")]
    title: String,
}

#[derive(Debug, Deserialize)]
struct FieldInfo {
    #[serde(rename = "InternalName")]
    internal_name: String,
    #[serde(rename = "Required", default)]
    required: bool,
}

#[derive(Debug, Deserialize)]
struct FieldPage {
    value: Vec<FieldInfo>,
}

impl Client {
    /// Returns whether a list titled `title` exists.
    ///
    /// # Errors
    ///
    /// A cancelled client returns [`Error::Cancelled`] rather than `false`,
    /// so that an unanswered probe is never mistaken for a missing list.
    pub async fn list_exists(&self, title: &str) -> Result<bool> {
        match self.find_list(&ListRef::title(title)).await? {
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    /// Probes many titles with at most `width` requests in flight.
    ///
    /// Results are in input order; one failed probe does not affect the
    /// others. Probes not yet sent when the client is cancelled report
    /// [`Error::Cancelled`].
    pub async fn lists_exist<S>(&self, titles: &[S], width: usize) -> Vec<(String, Result<bool>)>
    where
        S: AsRef<str>,
    {
        stream::iter(titles)
            .map(|title| async move {
                let title = title.as_ref();
                (title.to_string(), self.list_exists(title).await)
            })
            .buffered(width.max(1))
            .collect()
            .await
    }

    /// Makes sure a list titled `title` exists with every field in `fields`.
    ///
    /// Missing lists and fields are created; existing fields are never
    /// modified. A field whose `Required` flag differs from the descriptor is
    /// reported in [`ProvisionedList::warnings`]. Adding fields resets the
    /// schema cache for the list. Cancellation while fields are being added
    /// returns the fields added so far with a warning.
    ///
    /// # Errors
    ///
    /// Fails before any request if a descriptor is invalid, and with the
    /// first unrecoverable server error otherwise. Cancellation before the
    /// list is found or created returns [`Error::Cancelled`], as there is no
    /// list to report on yet.
    pub async fn ensure_list(&self, title: &str, fields: &[FieldDescriptor]) -> Result<ProvisionedList> {
        for field in fields {
            field.validate()?;
        }

        let by_title = ListRef::title(title);
        let (info, created) = match self.find_list(&by_title).await? {
            Some(info) => (info, false),
            None => (self.create_list(title).await?, true),
        };
        let list = ListRef::id(info.id.as_str());

        let existing: HashMap<String, bool> = self
            .list_fields(&list)
            .await?
            .into_iter()
            .map(|f| (f.internal_name, f.required))
            .collect();

        let mut added_fields = Vec::new();
        let mut warnings = Vec::new();
        for field in fields {
            match existing.get(&field.internal_name) {
                Some(&required) if required != field.required => {
                    let warning = format!(
                        "field `{}` has Required={} remotely but {} was requested; left unchanged",
                        field.internal_name, required, field.required
                    );
                    tracing::warn!(list = %title, field = %field.internal_name, "{}", warning);
                    warnings.push(warning);
                }
                Some(_) => {}
                None => match self.add_field(&list, field).await {
                    Ok(()) => added_fields.push(field.internal_name.clone()),
                    Err(Error::Cancelled) => {
                        warnings.push("cancelled before every field was added".to_string());
                        break;
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        if !added_fields.is_empty() {
            self.schema_cache().reset(Some(title));
            self.schema_cache().reset(Some(list.cache_key()));
        }

        tracing::info!(
            list = %info.title,
            created,
            added = added_fields.len(),
            "List provisioned"
        );

        Ok(ProvisionedList {
            id: info.id,
            title: info.title,
            created,
            added_fields,
            warnings,
        })
    }

    /// Provisions many lists with at most `width` in flight.
    ///
    /// Results are in input order; one failure does not stop the others.
    pub async fn ensure_lists(&self, specs: &[ListSpec], width: usize) -> Vec<Result<ProvisionedList>> {
        stream::iter(specs)
            .map(|spec| self.ensure_list(&spec.title, &spec.fields))
            .buffered(width.max(1))
            .collect()
            .await
    }

    async fn find_list(&self, list: &ListRef) -> Result<Option<ListInfo>> {
        let metadata = RequestMetadata::get(list.api_path()).with_query_param("$select", "Id,Title");
        match self.execute(metadata, &self.read_policy()).await {
            Ok(response) => Ok(Some(response.json::<ListInfo>()?.data)),
            Err(e) if e.status() == Some(http::StatusCode::NOT_FOUND) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_list(&self, title: &str) -> Result<ListInfo> {
        tracing::info!(list = %title, "Creating list");
        let metadata = RequestMetadata::post("/_api/web/lists").with_json(&json!({
            "Title": title,
            "BaseTemplate": GENERIC_LIST_TEMPLATE,
            "AllowContentTypes": true,
            "ContentTypesEnabled": false,
        }))?;
        let policy = RetryPolicy::throttle_only(self.retry_settings());
        Ok(self.execute(metadata, &policy).await?.json::<ListInfo>()?.data)
    }

    async fn list_fields(&self, list: &ListRef) -> Result<Vec<FieldInfo>> {
        let metadata = RequestMetadata::get(format!("{}/fields", list.api_path()))
            .with_query_param("$select", "InternalName,Required");
        Ok(self
            .execute(metadata, &self.read_policy())
            .await?
            .json::<FieldPage>()?
            .data
            .value)
    }

    async fn add_field(&self, list: &ListRef, field: &FieldDescriptor) -> Result<()> {
        tracing::info!(list = %list, field = %field.internal_name, "Adding field");
        let body = json!({
            "parameters": {
                "SchemaXml": field.schema_xml(),
                "Options": ADD_FIELD_INTERNAL_NAME_HINT,
            }
        });
        let metadata = RequestMetadata::post(format!("{}/fields/createfieldasxml", list.api_path()))
            .with_json(&body)?;
        let policy = RetryPolicy::throttle_only(self.retry_settings());
        self.execute(metadata, &policy).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_descriptors_are_rejected() {
        assert!(FieldDescriptor::text("").validate().is_err());
        assert!(FieldDescriptor::text("Full Name").validate().is_err());
        assert!(FieldDescriptor::choice("Shift", Vec::<String>::new()).validate().is_err());
        assert!(FieldDescriptor::lookup("Manager", "").validate().is_err());
        assert!(FieldDescriptor::text("Notes").default_bool(true).validate().is_err());
        assert!(FieldDescriptor::boolean("Active").default_text("yes").validate().is_err());
        assert!(FieldDescriptor::choice("Shift", ["Early"]).default_text("Night").validate().is_err());
        assert!(FieldDescriptor::boolean("Active").default_bool(true).validate().is_ok());
    }

    #[test]
    fn text_xml_escapes_names() {
        let xml = FieldDescriptor::text("Notes")
            .display_name("Notes & <remarks>")
            .required(true)
            .schema_xml();
        assert_eq!(
            xml,
            r#"<Field Type="Text" Name="Notes" StaticName="Notes" DisplayName="Notes &amp; &lt;remarks&gt;" Required="TRUE"></Field>"#
        );
    }

    #[test]
    fn lookup_and_boolean_xml() {
        let xml = FieldDescriptor::lookup("Manager", "{a1b2}").schema_xml();
        assert!(xml.contains(r#"List="{a1b2}" ShowField="Title""#));

        let xml = FieldDescriptor::boolean("Active").default_bool(true).schema_xml();
        assert!(xml.contains("<Default>1</Default>"));
    }

    #[test]
    fn choice_xml_lists_choices_in_order() {
        let xml = FieldDescriptor::choice("Shift", ["Early", "Late"]).schema_xml();
        assert!(xml.ends_with("<CHOICES><CHOICE>Early</CHOICE><CHOICE>Late</CHOICE></CHOICES></Field>"));
    }
}
