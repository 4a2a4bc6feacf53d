//! Typed query helpers for the audit, state and history tables.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{self, LocalReference};

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub group_ref: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

/// A row from the `document_history` table.
#[derive(Debug, Clone)]
pub struct RevisionEntry {
    pub version: u32,
    pub comment: String,
    pub saved_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- audit_log ----------------------------------------------------------

    /// Insert an audit-log entry.
    pub fn insert_audit_log(
        &self,
        action: &str,
        group_ref: Option<&str>,
        details: Option<&str>,
        success: bool,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, group_ref, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![action, group_ref, details, success, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action, "inserted audit_log entry");
        Ok(id)
    }

    /// Insert an audit entry from a model struct.
    pub fn insert_audit_entry(&self, entry: &models::AuditEntry) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, group_ref, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.action,
                entry.group,
                entry.details,
                entry.success,
                entry.timestamp.to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List recent audit-log entries, newest first.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, group_ref, details, success, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], map_audit_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// List audit-log entries filtered by action, newest first.
    pub fn list_audit_log_by_action(
        &self,
        action: &str,
        limit: u32,
    ) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, group_ref, details, success, created_at
             FROM audit_log WHERE action = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![action, limit], map_audit_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Count total audit-log entries.
    pub fn count_audit_log(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Count audit entries recording a failure.
    pub fn count_failures(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE success = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -- kv_state -----------------------------------------------------------

    /// Get a key-value state entry.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT value FROM kv_state WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(Ok(val)) => Ok(Some(val)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Set a key-value state entry (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        debug!(key, value, "set kv_state");
        Ok(())
    }

    // -- document_history ---------------------------------------------------

    /// Saved revisions of a document, oldest first.
    pub fn list_revisions(&self, reference: &LocalReference) -> Result<Vec<RevisionEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT version, comment, saved_at FROM document_history
             WHERE reference = ?1 ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![reference.to_string()], |row| {
                let saved_at: String = row.get(2)?;
                Ok(RevisionEntry {
                    version: row.get(0)?,
                    comment: row.get(1)?,
                    saved_at: parse_datetime(&saved_at),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Number of saved revisions of a document.
    pub fn count_revisions(&self, reference: &LocalReference) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM document_history WHERE reference = ?1",
            params![reference.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Number of stored documents of a kind (`identity` or `group`).
    pub fn count_documents(&self, kind: &str) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn map_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    let created_at: String = row.get(5)?;
    Ok(AuditLogEntry {
        id: row.get(0)?,
        action: row.get(1)?,
        group_ref: row.get(2)?,
        details: row.get(3)?,
        success: row.get(4)?,
        created_at: parse_datetime(&created_at),
    })
}

/// Parse a datetime string, returning Utc::now() as a fallback if parsing fails.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
