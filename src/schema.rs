//! Schema negotiation.
//!
//! Lists drift: columns get removed or were never provisioned on some
//! tenants. The [`SchemaCache`] remembers, per list, which field names the
//! server has reported as absent so that every later request for that list
//! leaves them out of `$select` without paying for another failed round-trip.
//!
//! The cache is cheap to clone and shared by every client built from the same
//! instance. Entries are only removed by [`SchemaCache::reset`].

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Per-list sets of field names known to be absent remotely.
///
/// # Examples
///
/// ```
/// use listkeeper::SchemaCache;
///
/// let cache = SchemaCache::new();
/// cache.record_missing("Staff", ["FullNameKana"]);
///
/// let effective = cache.narrow("staff", &["Id", "Title", "FullNameKana"]);
/// assert_eq!(effective, vec!["Id", "Title"]);
///
/// cache.reset(Some("Staff"));
/// assert_eq!(cache.narrow("Staff", &["FullNameKana"]), vec!["FullNameKana"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
    excluded: Arc<DashMap<String, HashSet<String>>>,
}

impl SchemaCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `requested` minus the fields known to be absent on `list`,
    /// preserving order.
    pub fn narrow<S: AsRef<str>>(&self, list: &str, requested: &[S]) -> Vec<String> {
        let fields = requested.iter().map(|f| f.as_ref().to_string());
        match self.excluded.get(&list_key(list)) {
            Some(excluded) => fields.filter(|f| !excluded.contains(f)).collect(),
            None => fields.collect(),
        }
    }

    /// Records fields as absent on `list`. Recording a field twice is harmless.
    pub fn record_missing<I, S>(&self, list: &str, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entry = self.excluded.entry(list_key(list)).or_default();
        for field in fields {
            let field = field.into();
            if entry.insert(field.clone()) {
                tracing::info!(list = %list, field = %field, "Recorded field as absent from remote schema");
            }
        }
    }

    /// Forgets what is known about `list`, or about every list with `None`.
    pub fn reset(&self, list: Option<&str>) {
        match list {
            Some(list) => {
                self.excluded.remove(&list_key(list));
            }
            None => self.excluded.clear(),
        }
    }

    /// Fields currently excluded for `list`, sorted.
    pub fn excluded(&self, list: &str) -> Vec<String> {
        let mut fields: Vec<String> = self
            .excluded
            .get(&list_key(list))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        fields.sort();
        fields
    }

    /// Returns `true` if `field` is known to be absent on `list`.
    pub fn is_excluded(&self, list: &str, field: &str) -> bool {
        self.excluded
            .get(&list_key(list))
            .is_some_and(|set| set.contains(field))
    }
}

fn list_key(list: &str) -> String {
    list.trim().to_lowercase()
}

/// The fields a read asks for, split into what it cannot do without and what
/// it can shed.
///
/// Optional fields are grouped in tiers, most essential first. When the
/// server rejects the selection without naming a field, the last remaining
/// tier is dropped and the read retried. Collecting an iterator of names
/// yields one optional tier per name, so shedding proceeds from the tail of
/// the list one field at a time.
///
/// # Examples
///
/// ```
/// use listkeeper::FieldSelection;
///
/// let select = FieldSelection::new()
///     .required(["Id", "Title"])
///     .optional(["Department", "Manager"])
///     .optional(["FullNameKana"]);
///
/// assert_eq!(select.fields(), vec!["Id", "Title", "Department", "Manager", "FullNameKana"]);
///
/// let smaller = select.drop_last_tier().unwrap();
/// assert_eq!(smaller.fields(), vec!["Id", "Title", "Department", "Manager"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelection {
    required: Vec<String>,
    tiers: Vec<Vec<String>>,
}

impl FieldSelection {
    /// Creates an empty selection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds fields that must never be dropped.
    pub fn required<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Adds a tier of optional fields, less essential than earlier tiers.
    pub fn optional<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tier: Vec<String> = fields.into_iter().map(Into::into).collect();
        if !tier.is_empty() {
            self.tiers.push(tier);
        }
        self
    }

    /// All selected fields, required first, without duplicates.
    pub fn fields(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.required
            .iter()
            .chain(self.tiers.iter().flatten())
            .filter(|f| seen.insert(f.as_str()))
            .cloned()
            .collect()
    }

    /// Returns `true` if `field` is required.
    pub fn is_required(&self, field: &str) -> bool {
        self.required.iter().any(|f| f == field)
    }

    /// Returns `true` if nothing is selected.
    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.tiers.iter().all(Vec::is_empty)
    }

    /// Required fields among `fields`.
    pub fn required_fields(&self) -> &[String] {
        &self.required
    }

    /// The selection with every field known absent on `list` removed from
    /// the optional tiers. Required fields are kept even if excluded.
    pub fn narrowed(&self, cache: &SchemaCache, list: &str) -> Self {
        let tiers = self
            .tiers
            .iter()
            .map(|tier| cache.narrow(list, tier.as_slice()))
            .filter(|tier| !tier.is_empty())
            .collect();
        Self {
            required: self.required.clone(),
            tiers,
        }
    }

    /// Required fields that are known absent on `list`.
    pub fn missing_required(&self, cache: &SchemaCache, list: &str) -> Vec<String> {
        self.required
            .iter()
            .filter(|f| cache.is_excluded(list, f))
            .cloned()
            .collect()
    }

    /// The selection without its least essential tier, or `None` when only
    /// required fields remain.
    pub fn drop_last_tier(&self) -> Option<Self> {
        let mut tiers = self.tiers.clone();
        tiers.pop()?;
        Some(Self {
            required: self.required.clone(),
            tiers,
        })
    }
}

impl<S: Into<String>> FromIterator<S> for FieldSelection {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            required: Vec::new(),
            tiers: iter.into_iter().map(|f| vec![f.into()]).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_removes_recorded_fields_only_for_that_list() {
        let cache = SchemaCache::new();
        cache.record_missing("Staff", ["FullNameKana"]);

        assert_eq!(cache.narrow("Staff", &["Id", "FullNameKana"]), vec!["Id"]);
        assert_eq!(
            cache.narrow("Shifts", &["Id", "FullNameKana"]),
            vec!["Id", "FullNameKana"]
        );
    }

    #[test]
    fn record_is_idempotent_and_shared_between_clones() {
        let cache = SchemaCache::new();
        let other = cache.clone();
        cache.record_missing("Staff", ["A", "B"]);
        other.record_missing("staff", ["A"]);

        assert_eq!(cache.excluded("STAFF"), vec!["A", "B"]);
    }

    #[test]
    fn reset_all_clears_every_list() {
        let cache = SchemaCache::new();
        cache.record_missing("Staff", ["A"]);
        cache.record_missing("Shifts", ["B"]);
        cache.reset(None);
        assert!(cache.excluded("Staff").is_empty());
        assert!(cache.excluded("Shifts").is_empty());
    }

    #[test]
    fn selection_from_iter_sheds_from_the_tail() {
        let select: FieldSelection = ["Id", "Title", "FullNameKana"].into_iter().collect();
        let smaller = select.drop_last_tier().unwrap();
        assert_eq!(smaller.fields(), vec!["Id", "Title"]);
        let smallest = smaller.drop_last_tier().unwrap().drop_last_tier().unwrap();
        assert!(smallest.is_empty());
        assert!(smallest.drop_last_tier().is_none());
    }

    #[test]
    fn required_fields_are_never_dropped() {
        let select = FieldSelection::new().required(["Id"]).optional(["Notes"]);
        let only_required = select.drop_last_tier().unwrap();
        assert_eq!(only_required.fields(), vec!["Id"]);
        assert!(only_required.drop_last_tier().is_none());
    }

    #[test]
    fn narrowed_keeps_required_and_reports_them() {
        let cache = SchemaCache::new();
        cache.record_missing("Staff", ["Id", "Notes"]);
        let select = FieldSelection::new()
            .required(["Id"])
            .optional(["Notes", "Title"]);

        let narrowed = select.narrowed(&cache, "Staff");
        assert_eq!(narrowed.fields(), vec!["Id", "Title"]);
        assert_eq!(select.missing_required(&cache, "Staff"), vec!["Id"]);
    }
}
