//! Connector operation types
//!
//! Types for CRUD and search operations: UIDs, attribute sets, deltas,
//! filters, paging and the streaming result callback.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved attribute carrying a password in connector payloads.
pub const PASSWORD_ATTRIBUTE: &str = "__PASSWORD__";

/// Unique identifier for an object in a target system.
///
/// Different systems use different identifier schemes:
/// - LDAP: Distinguished Name (DN) or entryUUID
/// - Database: Primary key column value
/// - REST: Resource ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid {
    /// The attribute name used as the identifier (e.g., "dn", "id", "uid").
    attribute_name: String,
    /// The actual value of the identifier.
    value: String,
}

impl Uid {
    /// Create a new UID with the given attribute name and value.
    pub fn new(attribute_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute_name: attribute_name.into(),
            value: value.into(),
        }
    }

    /// Create a UID using the default "uid" attribute name.
    pub fn from_value(value: impl Into<String>) -> Self {
        Self::new("uid", value)
    }

    /// Create a UID for LDAP Distinguished Name.
    pub fn from_dn(dn: impl Into<String>) -> Self {
        Self::new("dn", dn)
    }

    /// Get the attribute name.
    pub fn attribute_name(&self) -> &str {
        &self.attribute_name
    }

    /// Get the value.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attribute_name, self.value)
    }
}

/// A set of attributes for create operations or search results.
///
/// Ordered by name so payload snapshots and digests are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSet {
    #[serde(flatten)]
    attributes: BTreeMap<String, AttributeValue>,
}

impl AttributeSet {
    /// Create a new empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute value, returning the previous one.
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Option<AttributeValue> {
        self.attributes.insert(name.into(), value.into())
    }

    /// Set an attribute using builder pattern.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Get an attribute value.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Get a single-valued string attribute.
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_string())
    }

    /// Check if an attribute exists.
    pub fn has(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Remove an attribute.
    pub fn remove(&mut self, name: &str) -> Option<AttributeValue> {
        self.attributes.remove(name)
    }

    /// Get all attribute names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Get the number of attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Iterate over all attributes.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.attributes.iter()
    }

    /// Overwrite attributes with those of `other` (attribute-level last write wins).
    pub fn merge(&mut self, other: AttributeSet) {
        self.attributes.extend(other.attributes);
    }

    /// String view of every attribute, used as transform input.
    pub fn to_string_map(&self) -> BTreeMap<String, String> {
        self.attributes
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.to_display_string()))
            .collect()
    }
}

impl FromIterator<(String, AttributeValue)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (String, AttributeValue)>>(iter: T) -> Self {
        Self {
            attributes: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for AttributeSet {
    type Item = (String, AttributeValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, AttributeValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.attributes.into_iter()
    }
}

/// A value for an attribute, which may be single or multi-valued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// No value (null).
    Null,
    /// A single string value.
    String(String),
    /// A single integer value.
    Integer(i64),
    /// A single boolean value.
    Boolean(bool),
    /// Multiple values.
    Array(Vec<AttributeValue>),
}

impl AttributeValue {
    /// Check if this is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Get as a string if this is a single string value.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as strings (works for both single and multi-valued).
    pub fn as_strings(&self) -> Vec<&str> {
        match self {
            AttributeValue::String(s) => vec![s.as_str()],
            AttributeValue::Array(arr) => arr.iter().filter_map(|v| v.as_string()).collect(),
            _ => vec![],
        }
    }

    /// Get as a boolean if this is a boolean value.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Render the value as text; multi-values are comma separated.
    pub fn to_display_string(&self) -> String {
        match self {
            AttributeValue::Null => String::new(),
            AttributeValue::String(s) => s.clone(),
            AttributeValue::Integer(i) => i.to_string(),
            AttributeValue::Boolean(b) => b.to_string(),
            AttributeValue::Array(arr) => arr
                .iter()
                .map(AttributeValue::to_display_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Integer(i)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Boolean(b)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(vec: Vec<T>) -> Self {
        AttributeValue::Array(vec.into_iter().map(Into::into).collect())
    }
}

/// Changes to apply to an object during update operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeDelta {
    /// Attributes to replace entirely.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replace: BTreeMap<String, AttributeValue>,

    /// Attributes to clear (remove all values).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clear: Vec<String>,
}

impl AttributeDelta {
    /// Create a new empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a delta from a collapsed payload: null values clear, the rest replace.
    pub fn from_payload(payload: AttributeSet) -> Self {
        let mut delta = Self::new();
        for (name, value) in payload {
            if value.is_null() {
                delta.clear.push(name);
            } else {
                delta.replace.insert(name, value);
            }
        }
        delta
    }

    /// Replace an attribute value entirely.
    pub fn replace(
        &mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> &mut Self {
        self.replace.insert(name.into(), value.into());
        self
    }

    /// Clear all values from an attribute.
    pub fn clear_attribute(&mut self, name: impl Into<String>) -> &mut Self {
        self.clear.push(name.into());
        self
    }

    /// Check if this delta has any changes.
    pub fn is_empty(&self) -> bool {
        self.replace.is_empty() && self.clear.is_empty()
    }

    /// Get all affected attribute names.
    pub fn affected_attributes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.replace.keys().map(String::as_str).collect();
        names.extend(self.clear.iter().map(String::as_str));
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// Filter for search operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    /// Match objects where attribute equals value.
    Equals { attribute: String, value: String },

    /// Match objects where attribute contains value (substring).
    Contains { attribute: String, value: String },

    /// Match objects where attribute starts with value.
    StartsWith { attribute: String, value: String },

    /// Match objects where attribute exists (has any value).
    Present { attribute: String },

    /// Logical AND of multiple filters.
    And { filters: Vec<Filter> },

    /// Logical OR of multiple filters.
    Or { filters: Vec<Filter> },

    /// Logical NOT of a filter.
    Not { filter: Box<Filter> },
}

impl Filter {
    /// Create an equals filter.
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a present (attribute exists) filter.
    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present {
            attribute: attribute.into(),
        }
    }

    /// Create a NOT filter (negation).
    pub fn negate(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    /// Combine this filter with another using AND.
    #[must_use]
    pub fn and_with(self, other: Filter) -> Self {
        match self {
            Filter::And { mut filters } => {
                filters.push(other);
                Filter::And { filters }
            }
            _ => Filter::And {
                filters: vec![self, other],
            },
        }
    }

    /// Evaluate the filter against an attribute set.
    ///
    /// Connectors that cannot push a filter down to the target use this to
    /// filter client side.
    pub fn matches(&self, attributes: &AttributeSet) -> bool {
        let values = |name: &str| {
            attributes
                .get(name)
                .map(AttributeValue::as_strings)
                .unwrap_or_default()
        };
        match self {
            Filter::Equals { attribute, value } => values(attribute).contains(&value.as_str()),
            Filter::Contains { attribute, value } => {
                values(attribute).iter().any(|v| v.contains(value.as_str()))
            }
            Filter::StartsWith { attribute, value } => values(attribute)
                .iter()
                .any(|v| v.starts_with(value.as_str())),
            Filter::Present { attribute } => attributes
                .get(attribute)
                .is_some_and(|v| !v.is_null()),
            Filter::And { filters } => filters.iter().all(|f| f.matches(attributes)),
            Filter::Or { filters } => filters.iter().any(|f| f.matches(attributes)),
            Filter::Not { filter } => !filter.matches(attributes),
        }
    }
}

/// Pagination request for search operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Maximum number of results to deliver in this page.
    pub page_size: u32,

    /// Opaque cursor returned by the previous page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl PageRequest {
    /// Create a first-page request with the given page size.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            cursor: None,
        }
    }

    /// Set the cursor for cursor-based pagination.
    #[must_use]
    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(100)
    }
}

/// An object returned by a target system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorObject {
    pub uid: Uid,
    pub object_class: String,
    pub attributes: AttributeSet,
}

impl ConnectorObject {
    pub fn new(uid: Uid, object_class: impl Into<String>, attributes: AttributeSet) -> Self {
        Self {
            uid,
            object_class: object_class.into(),
            attributes,
        }
    }
}

/// Whether a search should keep delivering results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchControl {
    Continue,
    Stop,
}

/// Callback receiving search results one object at a time.
///
/// Result sets may be unbounded, so connectors stream into this instead of
/// materializing a list.
pub trait ResultsHandler: Send {
    /// Receive one object; returning [`SearchControl::Stop`] ends the page early.
    fn handle(&mut self, object: ConnectorObject) -> SearchControl;
}

impl<F> ResultsHandler for F
where
    F: FnMut(ConnectorObject) -> SearchControl + Send,
{
    fn handle(&mut self, object: ConnectorObject) -> SearchControl {
        self(object)
    }
}

/// Metadata describing one delivered page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPage {
    /// Cursor for the next page (if more results available).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,

    /// Total number of matching objects (if known).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,

    /// Whether there are more results available.
    pub has_more: bool,
}

impl SearchPage {
    /// A final page.
    pub fn last() -> Self {
        Self::default()
    }

    /// Set the total count.
    #[must_use]
    pub fn with_total_count(mut self, count: u64) -> Self {
        self.total_count = Some(count);
        self
    }

    /// Set the next cursor.
    #[must_use]
    pub fn with_next_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.next_cursor = Some(cursor.into());
        self.has_more = true;
        self
    }
}

/// A secret value that never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct GuardedString(String);

impl GuardedString {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Access the clear text.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for GuardedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GuardedString(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_creation() {
        let uid = Uid::from_dn("uid=jdoe,ou=people,dc=example,dc=com");
        assert_eq!(uid.attribute_name(), "dn");
        assert_eq!(uid.to_string(), "dn=uid=jdoe,ou=people,dc=example,dc=com");
    }

    #[test]
    fn test_attribute_set_merge_last_write_wins() {
        let mut attrs = AttributeSet::new().with("mail", "a@example.com").with("cn", "J");
        attrs.merge(AttributeSet::new().with("mail", "b@example.com"));

        assert_eq!(attrs.get_string("mail"), Some("b@example.com"));
        assert_eq!(attrs.get_string("cn"), Some("J"));
        assert_eq!(attrs.len(), 2);
    }

    #[test]
    fn test_to_string_map_skips_nulls() {
        let attrs = AttributeSet::new()
            .with("groups", vec!["admins", "users"])
            .with("age", 30i64)
            .with("phone", AttributeValue::Null);

        let map = attrs.to_string_map();
        assert_eq!(map.get("groups").map(String::as_str), Some("admins,users"));
        assert_eq!(map.get("age").map(String::as_str), Some("30"));
        assert!(!map.contains_key("phone"));
    }

    #[test]
    fn test_delta_from_payload() {
        let payload = AttributeSet::new()
            .with("mail", "b@example.com")
            .with("phone", AttributeValue::Null);
        let delta = AttributeDelta::from_payload(payload);

        assert_eq!(delta.affected_attributes(), vec!["mail", "phone"]);
        assert_eq!(delta.clear, vec!["phone".to_string()]);
    }

    #[test]
    fn test_filter_matches() {
        let attrs = AttributeSet::new()
            .with("mail", "jdoe@example.com")
            .with("memberOf", vec!["staff", "vpn"]);

        assert!(Filter::eq("memberOf", "vpn").matches(&attrs));
        assert!(Filter::present("mail")
            .and_with(Filter::negate(Filter::eq("mail", "x")))
            .matches(&attrs));
        assert!(!Filter::Contains {
            attribute: "mail".to_string(),
            value: "corp".to_string()
        }
        .matches(&attrs));
    }

    #[test]
    fn test_closure_results_handler() {
        let mut seen = Vec::new();
        let mut handler = |obj: ConnectorObject| {
            seen.push(obj.uid.value().to_string());
            SearchControl::Continue
        };
        let obj = ConnectorObject::new(Uid::from_value("jdoe"), "account", AttributeSet::new());
        assert_eq!(handler.handle(obj), SearchControl::Continue);
        assert_eq!(seen, vec!["jdoe".to_string()]);
    }

    #[test]
    fn test_guarded_string_redacted() {
        let secret = GuardedString::new("hunter2");
        assert_eq!(format!("{secret:?}"), "GuardedString(***)");
        assert_eq!(secret.expose(), "hunter2");
    }
}
