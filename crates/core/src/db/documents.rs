//! [`LocalStore`] implementation over the SQLite tables.
//!
//! Every save runs in its own transaction and appends one row to
//! `document_history`, so each document has a linear revision trail.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::schema;
use super::Database;
use crate::errors::DatabaseError;
use crate::models::{AuditEntry, FederatedIdentity, LocalReference, MembershipRecord};
use crate::store::{GroupDocument, IdentityDocument, LocalStore};

const KIND_IDENTITY: &str = "identity";
const KIND_GROUP: &str = "group";
const FEDERATED_TABLE: &str = "federated_identities";

fn upsert_document(
    conn: &Connection,
    reference: &str,
    kind: &str,
    version: u32,
    now: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO documents (reference, kind, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(reference) DO UPDATE SET version = excluded.version, updated_at = excluded.updated_at",
        params![reference, kind, version, now],
    )?;
    Ok(())
}

fn append_history(
    conn: &Connection,
    reference: &str,
    version: u32,
    comment: &str,
    now: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO document_history (reference, version, comment, saved_at) VALUES (?1, ?2, ?3, ?4)",
        params![reference, version, comment, now],
    )?;
    Ok(())
}

impl LocalStore for Database {
    fn exists(&self, reference: &LocalReference) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE reference = ?1",
            params![reference.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn load_identity(&self, reference: &LocalReference) -> Result<IdentityDocument, DatabaseError> {
        let key = reference.to_string();
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT d.version, i.fields, i.directory_dn
                 FROM documents d JOIN identities i ON i.reference = d.reference
                 WHERE d.reference = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((version, fields, directory_dn)) = row else {
            return Ok(IdentityDocument::new(reference.clone()));
        };

        let fields: BTreeMap<String, String> = serde_json::from_str(&fields)?;
        let federated = if schema::table_exists(&conn, FEDERATED_TABLE)? {
            conn.query_row(
                "SELECT subject, issuer FROM federated_identities WHERE reference = ?1",
                params![key],
                |row| {
                    Ok(FederatedIdentity {
                        subject: row.get(0)?,
                        issuer: row.get(1)?,
                    })
                },
            )
            .optional()?
        } else {
            None
        };

        Ok(IdentityDocument {
            reference: reference.clone(),
            is_new: false,
            fields,
            directory_dn,
            federated,
            version,
        })
    }

    fn save_identity(&self, doc: &mut IdentityDocument, comment: &str) -> Result<(), DatabaseError> {
        let key = doc.reference.to_string();
        let version = doc.version + 1;
        let fields = serde_json::to_string(&doc.fields)?;
        let now = Utc::now().to_rfc3339();

        self.transaction(|conn| {
            upsert_document(conn, &key, KIND_IDENTITY, version, &now)?;
            conn.execute(
                "INSERT INTO identities (reference, fields, directory_dn) VALUES (?1, ?2, ?3)
                 ON CONFLICT(reference) DO UPDATE SET fields = excluded.fields,
                     directory_dn = excluded.directory_dn",
                params![key, fields, doc.directory_dn],
            )?;
            if let Some(federated) = &doc.federated {
                if !schema::table_exists(conn, FEDERATED_TABLE)? {
                    return Err(DatabaseError::NotFound {
                        entity: "table".into(),
                        id: FEDERATED_TABLE.into(),
                    });
                }
                conn.execute(
                    "INSERT INTO federated_identities (reference, subject, issuer) VALUES (?1, ?2, ?3)
                     ON CONFLICT(reference) DO UPDATE SET subject = excluded.subject, issuer = excluded.issuer",
                    params![key, federated.subject, federated.issuer],
                )?;
            }
            append_history(conn, &key, version, comment, &now)
        })?;

        doc.version = version;
        doc.is_new = false;
        debug!(reference = %doc.reference, version, "saved identity");
        Ok(())
    }

    fn load_group(&self, reference: &LocalReference) -> Result<GroupDocument, DatabaseError> {
        let key = reference.to_string();
        let conn = self.conn();
        let version = conn
            .query_row(
                "SELECT version FROM documents WHERE reference = ?1 AND kind = ?2",
                params![key, KIND_GROUP],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;

        let Some(version) = version else {
            return Ok(GroupDocument::new(reference.clone()));
        };

        let mut stmt = conn.prepare(
            "SELECT number, member_ref FROM group_members WHERE group_ref = ?1 ORDER BY number",
        )?;
        let records = stmt
            .query_map(params![key], |row| {
                let member: String = row.get(1)?;
                Ok(MembershipRecord {
                    number: row.get(0)?,
                    member: LocalReference::parse(&member, &reference.wiki),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GroupDocument::from_records(reference.clone(), records, version))
    }

    fn save_group(&self, doc: &mut GroupDocument, comment: &str) -> Result<(), DatabaseError> {
        let key = doc.reference.to_string();
        let version = doc.version + 1;
        let now = Utc::now().to_rfc3339();

        self.transaction(|conn| {
            upsert_document(conn, &key, KIND_GROUP, version, &now)?;
            conn.execute("DELETE FROM group_members WHERE group_ref = ?1", params![key])?;
            let mut insert = conn.prepare(
                "INSERT INTO group_members (group_ref, number, member_ref) VALUES (?1, ?2, ?3)",
            )?;
            for record in doc.records() {
                insert.execute(params![key, record.number, record.member.to_string()])?;
            }
            append_history(conn, &key, version, comment, &now)
        })?;

        doc.version = version;
        doc.is_new = false;
        debug!(reference = %doc.reference, version, members = doc.len(), "saved group");
        Ok(())
    }

    fn supports_federated_identity(&self) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        schema::table_exists(&conn, FEDERATED_TABLE)
    }

    fn record_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError> {
        self.insert_audit_entry(entry).map(|_| ())
    }

    fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        Database::set_state(self, key, value)
    }
}
