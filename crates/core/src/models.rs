//! Domain model types used throughout ldapsync.
//!
//! These types bridge the reconciliation engine, the document store, and the
//! command-line surface.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Local references
// ---------------------------------------------------------------------------

/// Reference to a document in the local store (`wiki:Space.Name`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalReference {
    pub wiki: String,
    pub space: String,
    pub name: String,
}

impl LocalReference {
    pub fn new(wiki: impl Into<String>, space: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            wiki: wiki.into(),
            space: space.into(),
            name: name.into(),
        }
    }

    /// Parse `wiki:Space.Name`, `Space.Name` or a bare `Name`.
    ///
    /// Missing parts fall back to `default_wiki` and the `XWiki` space.
    pub fn parse(value: &str, default_wiki: &str) -> Self {
        let (wiki, rest) = match value.split_once(':') {
            Some((wiki, rest)) if !wiki.is_empty() => (wiki, rest),
            _ => (default_wiki, value),
        };
        let (space, name) = match rest.rsplit_once('.') {
            Some((space, name)) if !space.is_empty() => (space, name),
            _ => (DEFAULT_SPACE, rest),
        };
        Self::new(wiki, space, name)
    }

    /// `Space.Name` without the wiki prefix.
    pub fn local_form(&self) -> String {
        format!("{}.{}", self.space, self.name)
    }
}

impl fmt::Display for LocalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.wiki, self.space, self.name)
    }
}

/// Space used when a reference does not name one.
pub const DEFAULT_SPACE: &str = "XWiki";

// ---------------------------------------------------------------------------
// Identity linkage
// ---------------------------------------------------------------------------

/// Subject/issuer pair used to correlate an identity with an external SSO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedIdentity {
    pub subject: String,
    pub issuer: String,
}

// ---------------------------------------------------------------------------
// Group membership
// ---------------------------------------------------------------------------

/// One member entry inside a group document.
///
/// `number` identifies the record within its group and is never reused
/// while the document is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub number: u32,
    pub member: LocalReference,
}

// ---------------------------------------------------------------------------
// Audit Entry
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub group: Option<String>,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, group: Option<&LocalReference>, details: &str) -> Self {
        Self {
            action: action.to_string(),
            group: group.map(ToString::to_string),
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, group: Option<&LocalReference>, details: &str) -> Self {
        Self {
            action: action.to_string(),
            group: group.map(ToString::to_string),
            details: details.to_string(),
            success: false,
            timestamp: Utc::now(),
        }
    }
}
