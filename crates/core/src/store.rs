//! The local document store as seen by the reconciliation engine.
//!
//! Documents are loaded, mutated in memory, then persisted with a revision
//! comment. A save is atomic for the one document it writes; no operation
//! spans several documents.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::errors::DatabaseError;
use crate::models::{AuditEntry, FederatedIdentity, LocalReference, MembershipRecord};

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// A local identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityDocument {
    pub reference: LocalReference,
    /// `true` until the document is first saved.
    pub is_new: bool,
    /// Local field -> value.
    pub fields: BTreeMap<String, String>,
    /// DN of the directory entry this identity was imported from.
    pub directory_dn: Option<String>,
    pub federated: Option<FederatedIdentity>,
    pub version: u32,
}

impl IdentityDocument {
    pub fn new(reference: LocalReference) -> Self {
        Self {
            reference,
            is_new: true,
            fields: BTreeMap::new(),
            directory_dn: None,
            federated: None,
            version: 0,
        }
    }

    /// Whether this identity is linked to the directory.
    pub fn is_directory_managed(&self) -> bool {
        self.directory_dn.is_some()
    }

    /// Overwrite fields with `values`. Returns whether anything changed.
    pub fn apply_fields(&mut self, values: BTreeMap<String, String>) -> bool {
        let mut changed = false;
        for (field, value) in values {
            if self.fields.get(&field) != Some(&value) {
                self.fields.insert(field, value);
                changed = true;
            }
        }
        changed
    }
}

/// A local group and its membership records.
///
/// Records are keyed by number, and a per-member count backs the membership
/// check, so each mutation of a large group stays logarithmic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDocument {
    pub reference: LocalReference,
    pub is_new: bool,
    records: BTreeMap<u32, MembershipRecord>,
    /// Number of records held by each member. Above one means duplicates.
    members: HashMap<LocalReference, usize>,
    next_number: u32,
    pub version: u32,
}

impl GroupDocument {
    pub fn new(reference: LocalReference) -> Self {
        Self {
            reference,
            is_new: true,
            records: BTreeMap::new(),
            members: HashMap::new(),
            next_number: 0,
            version: 0,
        }
    }

    /// Rebuild a stored group.
    pub fn from_records(reference: LocalReference, records: Vec<MembershipRecord>, version: u32) -> Self {
        let mut group = Self::new(reference);
        group.is_new = false;
        group.version = version;
        for record in records {
            group.next_number = group.next_number.max(record.number + 1);
            group.insert(record);
        }
        group
    }

    /// Records in number order.
    pub fn records(&self) -> impl ExactSizeIterator<Item = &MembershipRecord> + '_ {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains_member(&self, member: &LocalReference) -> bool {
        self.members.contains_key(member)
    }

    /// Append a record for `member` and return its number.
    pub fn new_membership_record(&mut self, member: LocalReference) -> u32 {
        let number = self.next_number;
        self.next_number += 1;
        debug!(group = %self.reference, member = %member, number, "new membership record");
        self.insert(MembershipRecord { number, member });
        number
    }

    /// Remove the record numbered `number`. Returns the removed record.
    pub fn remove_membership_record(&mut self, number: u32) -> Option<MembershipRecord> {
        let record = self.records.remove(&number)?;
        if let Some(count) = self.members.get_mut(&record.member) {
            *count -= 1;
            if *count == 0 {
                self.members.remove(&record.member);
            }
        }
        Some(record)
    }

    fn insert(&mut self, record: MembershipRecord) {
        *self.members.entry(record.member.clone()).or_insert(0) += 1;
        if let Some(replaced) = self.records.insert(record.number, record) {
            if let Some(count) = self.members.get_mut(&replaced.member) {
                *count -= 1;
                if *count == 0 {
                    self.members.remove(&replaced.member);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Operations the engine needs from the document store.
pub trait LocalStore: Send + Sync {
    /// Whether a document exists at `reference`.
    fn exists(&self, reference: &LocalReference) -> Result<bool, DatabaseError>;

    /// Load an identity, or a new empty one if none is stored.
    fn load_identity(&self, reference: &LocalReference) -> Result<IdentityDocument, DatabaseError>;

    /// Persist an identity with a revision comment.
    fn save_identity(&self, doc: &mut IdentityDocument, comment: &str) -> Result<(), DatabaseError>;

    /// Load a group, or a new empty one if none is stored.
    fn load_group(&self, reference: &LocalReference) -> Result<GroupDocument, DatabaseError>;

    /// Persist a group with a revision comment.
    fn save_group(&self, doc: &mut GroupDocument, comment: &str) -> Result<(), DatabaseError>;

    /// Whether federated identity linkage can be stored.
    fn supports_federated_identity(&self) -> Result<bool, DatabaseError>;

    fn record_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError> {
        let _ = entry;
        Ok(())
    }

    fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let _ = (key, value);
        Ok(())
    }
}
