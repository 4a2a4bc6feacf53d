//! Error types for the ldapsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

// ---------------------------------------------------------------------------
// Directory errors
// ---------------------------------------------------------------------------

/// Errors raised while talking to the external directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The directory could not be reached.
    #[error("cannot connect to directory at '{url}': {detail}")]
    Connection { url: String, detail: String },

    /// The bind request was rejected.
    #[error("directory bind failed for '{bind_dn}' (rc={rc}): {detail}")]
    Bind {
        bind_dn: String,
        rc: u32,
        detail: String,
    },

    /// The server answered a search with a referral instead of entries.
    #[error("directory returned a referral to '{target}'")]
    Referral { target: String },

    /// The connection failed in the middle of an operation.
    #[error("directory transport error: {0}")]
    Transport(String),

    /// A search filter could not be built from the given input.
    #[error("invalid search filter: {0}")]
    InvalidFilter(String),
}

impl DirectoryError {
    /// Whether this error leaves the results gathered so far usable.
    pub fn is_referral(&self) -> bool {
        matches!(self, Self::Referral { .. })
    }
}

impl From<ldap3::LdapError> for DirectoryError {
    fn from(e: ldap3::LdapError) -> Self {
        Self::Transport(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite document store.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored field map could not be (de)serialized.
    #[error("document serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Per-member errors
// ---------------------------------------------------------------------------

/// A failure confined to a single directory member. These never abort a pass.
#[derive(Debug, Error)]
pub enum MemberError {
    /// Fetching the member's attributes from the directory failed.
    #[error("failed to fetch attributes of '{key}': {source}")]
    Fetch {
        key: String,
        #[source]
        source: DirectoryError,
    },

    /// Reading or writing the member's identity document failed.
    #[error("failed to store identity '{reference}': {source}")]
    Store {
        reference: String,
        #[source]
        source: DatabaseError,
    },

    /// The member vanished from the directory between listing and fetching.
    #[error("directory entry '{0}' no longer exists")]
    Vanished(String),
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Errors that abort a reconciliation pass (or one group's part of it).
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another pass is already running on this engine.
    #[error("reconciliation already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// The requested local group has no directory mapping.
    #[error("local group '{0}' is not mapped to any directory group")]
    UnknownGroup(String),

    /// Directory connection or search failure.
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Saving a batch of membership changes failed. Earlier batches stay committed.
    #[error("commit of group '{group}' failed after {committed_batches} committed batch(es): {source}")]
    CommitFailed {
        group: String,
        committed_batches: usize,
        #[source]
        source: DatabaseError,
    },

    /// Reading the local store failed outside of a batch commit.
    #[error("store error: {0}")]
    Database(#[from] DatabaseError),

    /// Cancellation was requested before the group's pass started.
    #[error("reconciliation cancelled before group '{0}'")]
    Cancelled(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = DirectoryError::Referral {
            target: "ldap://other.example.com/dc=example,dc=com".into(),
        };
        assert!(err.to_string().contains("ldap://other.example.com"));
        assert!(err.is_referral());

        let err = SyncError::UnknownGroup("XWiki.Staff".into());
        assert_eq!(
            err.to_string(),
            "local group 'XWiki.Staff' is not mapped to any directory group"
        );

        let err = SyncError::CommitFailed {
            group: "XWiki.Staff".into(),
            committed_batches: 2,
            source: DatabaseError::NotFound {
                entity: "group".into(),
                id: "XWiki.Staff".into(),
            },
        };
        assert!(err.to_string().contains("after 2 committed batch(es)"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let dir_err = DirectoryError::Transport("reset by peer".into());
        let core_err: CoreError = dir_err.into();
        assert!(matches!(core_err, CoreError::Directory(_)));

        let sync_err: SyncError = DirectoryError::Transport("eof".into()).into();
        assert!(matches!(sync_err, SyncError::Directory(_)));
    }
}
