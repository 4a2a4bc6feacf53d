//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `schema_version`
//! user-version pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            reference   TEXT PRIMARY KEY,
            kind        TEXT    NOT NULL CHECK (kind IN ('identity', 'group')),
            version     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS identities (
            reference     TEXT PRIMARY KEY REFERENCES documents (reference) ON DELETE CASCADE,
            fields        TEXT NOT NULL DEFAULT '{}',
            directory_dn  TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_identities_directory_dn ON identities (directory_dn);

        CREATE TABLE IF NOT EXISTS group_members (
            group_ref   TEXT    NOT NULL REFERENCES documents (reference) ON DELETE CASCADE,
            number      INTEGER NOT NULL,
            member_ref  TEXT    NOT NULL,
            PRIMARY KEY (group_ref, number)
        );

        CREATE INDEX IF NOT EXISTS idx_group_members_member ON group_members (member_ref);

        CREATE TABLE IF NOT EXISTS document_history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            reference   TEXT    NOT NULL,
            version     INTEGER NOT NULL,
            comment     TEXT    NOT NULL DEFAULT '',
            saved_at    TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_document_history_reference ON document_history (reference);

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT    NOT NULL,
            group_ref   TEXT,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log (action);

        CREATE TABLE IF NOT EXISTS kv_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        "federated identity linkage",
        r#"
        CREATE TABLE IF NOT EXISTS federated_identities (
            reference   TEXT PRIMARY KEY REFERENCES documents (reference) ON DELETE CASCADE,
            subject     TEXT NOT NULL,
            issuer      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_federated_identities_subject ON federated_identities (subject, issuer);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    run_migrations_to(conn, latest_version())
}

/// Run pending migrations up to and including `target`.
pub fn run_migrations_to(conn: &Connection, target: u32) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = target,
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version && version <= target {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Version of the newest migration.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.0).unwrap_or(0)
}

/// Whether `table` exists.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Read the current schema version from the SQLite `user_version` pragma.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
