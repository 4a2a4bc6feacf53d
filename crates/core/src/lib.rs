//! ldapsync core library.
//!
//! This crate reconciles local group membership with an external LDAP
//! directory: configuration, the document store, directory access, identity
//! resolution, membership diffing and batched writing, and the sync engine.

pub mod config;
pub mod db;
pub mod directory;
pub mod errors;
pub mod identity;
pub mod mapping;
pub mod membership;
pub mod models;
pub mod search;
pub mod store;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::AppConfig;
pub use db::Database;
pub use directory::LdapConnector;
#[cfg(any(test, feature = "testing"))]
pub use directory::InMemoryDirectory;
pub use store::LocalStore;
pub use sync_engine::{SyncEngine, SyncSettings};
