//! Access to the external directory.
//!
//! The engine only depends on the small [`DirectoryConnector`] /
//! [`DirectorySession`] / [`DirectoryCursor`] surface defined here:
//!
//! - [`ldap`] implements it on top of `ldap3`.
//! - `memory` implements it over an in-process entry tree for tests
//!   (the `testing` feature exposes it to integration tests).
//! - [`cursor`] drains a cursor into entries with a result cap.
//! - [`members`] expands directory groups into their user entries.
//! - [`filter`] builds escaped search filters.

pub mod cursor;
pub mod filter;
pub mod ldap;
pub mod members;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

use std::collections::BTreeMap;

use crate::errors::DirectoryError;

pub use cursor::{CursorConsumer, DrainStop, DrainedEntries};
pub use ldap::LdapConnector;
#[cfg(any(test, feature = "testing"))]
pub use memory::InMemoryDirectory;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// A directory record: its DN plus named attribute values.
///
/// Attribute names are matched case-insensitively. [`get`](Self::get) gives
/// single-valued semantics (the first value); [`values`](Self::values) is
/// only meant for multi-valued membership attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub dn: String,
    attributes: BTreeMap<String, Vec<String>>,
    binary: BTreeMap<String, Vec<u8>>,
}

impl DirectoryEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            ..Default::default()
        }
    }

    /// Builder-style helper adding one value to `name`.
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// Builder-style helper storing a binary value under `name`.
    pub fn with_binary(mut self, name: &str, value: Vec<u8>) -> Self {
        self.binary.insert(name.to_ascii_lowercase(), value);
        self
    }

    /// Append a value to `name`.
    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        self.attributes
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// The first value of `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// The first non-blank value of `name`, trimmed.
    pub fn get_non_blank(&self, name: &str) -> Option<&str> {
        self.get(name).map(str::trim).filter(|v| !v.is_empty())
    }

    /// Every value of a multi-valued attribute.
    pub fn values(&self, name: &str) -> &[String] {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Binary value of `name`, if any.
    pub fn binary(&self, name: &str) -> Option<&[u8]> {
        self.binary.get(&name.to_ascii_lowercase()).map(Vec::as_slice)
    }

    /// Whether the entry carries `name` with at least one value.
    pub fn has(&self, name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        self.attributes.get(&key).is_some_and(|v| !v.is_empty()) || self.binary.contains_key(&key)
    }

    /// Names of the textual attributes present on this entry (lowercased).
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Keep only the requested attributes. `*` keeps everything.
    pub fn project(mut self, requested: &[String]) -> Self {
        if requested.is_empty() || requested.iter().any(|a| a == "*") {
            return self;
        }
        let wanted: Vec<String> = requested.iter().map(|a| a.to_ascii_lowercase()).collect();
        self.attributes.retain(|k, _| wanted.contains(k));
        self.binary.retain(|k, _| wanted.contains(k));
        self
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Search scope, mirroring the LDAP scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}

/// One directory search.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub base: String,
    pub scope: SearchScope,
    pub filter: String,
    pub attributes: Vec<String>,
}

impl SearchQuery {
    pub fn new(base: impl Into<String>, scope: SearchScope, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            scope,
            filter: filter.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Read a single entry by DN.
    pub fn read(dn: &str) -> Self {
        Self::new(dn, SearchScope::Base, "(objectClass=*)")
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// A paginated result set.
///
/// `has_more` may report `true` before the first `next` even for an empty
/// result; `next` returning `Ok(None)` always means the set is exhausted.
pub trait DirectoryCursor {
    fn has_more(&mut self) -> bool;
    fn next(&mut self) -> Result<Option<DirectoryEntry>, DirectoryError>;
}

/// An open, bound directory connection. Dropping it releases the connection.
pub trait DirectorySession {
    fn search<'a>(
        &'a mut self,
        query: &SearchQuery,
    ) -> Result<Box<dyn DirectoryCursor + 'a>, DirectoryError>;
}

/// Opens directory sessions.
pub trait DirectoryConnector: Send + Sync {
    /// Connect and bind.
    fn connect(&self) -> Result<Box<dyn DirectorySession>, DirectoryError>;

    /// Where this connector points, for logs.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_attribute_lookup_is_case_insensitive() {
        let entry = DirectoryEntry::new("uid=jdoe,ou=people,dc=example,dc=com")
            .with("givenName", "John")
            .with("mail", "jdoe@example.com")
            .with("mail", "john.doe@example.com");

        assert_eq!(entry.get("givenname"), Some("John"));
        assert_eq!(entry.get("MAIL"), Some("jdoe@example.com"));
        assert_eq!(entry.values("mail").len(), 2);
        assert!(entry.get("sn").is_none());
        assert!(entry.values("member").is_empty());
    }

    #[test]
    fn test_get_non_blank_ignores_whitespace() {
        let entry = DirectoryEntry::new("cn=x").with("uid", "   ");
        assert!(entry.has("uid"));
        assert!(entry.get_non_blank("uid").is_none());
    }

    #[test]
    fn test_project_keeps_requested_attributes() {
        let entry = DirectoryEntry::new("cn=x")
            .with("cn", "x")
            .with("sn", "y")
            .with_binary("jpegPhoto", vec![1, 2, 3]);
        let projected = entry.clone().project(&["CN".to_string(), "jpegphoto".to_string()]);
        assert_eq!(projected.get("cn"), Some("x"));
        assert!(projected.get("sn").is_none());
        assert_eq!(projected.binary("jpegPhoto"), Some(&[1u8, 2, 3][..]));

        let all = entry.clone().project(&["*".to_string()]);
        assert_eq!(all, entry);
    }
}
