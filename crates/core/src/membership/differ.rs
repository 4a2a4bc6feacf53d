//! Classification of directory membership against a local group.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::models::{LocalReference, MembershipRecord};

/// What must change in one local group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationResult {
    /// Members to add, keyed by local reference, with the directory key they came from.
    pub to_add: BTreeMap<LocalReference, String>,
    /// Records to remove.
    pub to_remove: Vec<MembershipRecord>,
    /// Removal candidates kept because their identity is not directory-managed.
    pub preserved: Vec<MembershipRecord>,
    /// Extra records for a member that already has one.
    pub duplicates: Vec<MembershipRecord>,
}

impl ReconciliationResult {
    /// Whether nothing needs to be written.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Mutations the writer will apply.
    pub fn mutation_count(&self) -> usize {
        self.to_add.len() + self.to_remove.len()
    }
}

/// Computes add and remove sets for a local group.
#[derive(Debug, Clone, Copy, Default)]
pub struct MembershipDiffer {
    force_non_directory_update: bool,
}

impl MembershipDiffer {
    /// With `force_non_directory_update`, members without a directory link
    /// are removed like any other member missing from the directory.
    pub fn new(force_non_directory_update: bool) -> Self {
        Self {
            force_non_directory_update,
        }
    }

    /// Diff `directory_members` (reference -> directory key) against `records`.
    ///
    /// Records of members in `skipped` are left untouched: those members
    /// failed earlier in the pass and their state is unknown.
    /// `is_directory_managed` is asked only for removal candidates.
    pub fn diff<'r, R, F>(
        &self,
        directory_members: &BTreeMap<LocalReference, String>,
        records: R,
        skipped: &BTreeSet<LocalReference>,
        mut is_directory_managed: F,
    ) -> ReconciliationResult
    where
        R: IntoIterator<Item = &'r MembershipRecord>,
        F: FnMut(&LocalReference) -> bool,
    {
        let mut working = directory_members.clone();
        let mut matched: BTreeSet<&LocalReference> = BTreeSet::new();
        let mut candidates: Vec<&MembershipRecord> = Vec::new();
        let mut result = ReconciliationResult::default();

        for record in records {
            if working.remove(&record.member).is_some() {
                matched.insert(&record.member);
            } else if matched.contains(&record.member) {
                warn!(member = %record.member, number = record.number, "member already exists in group");
                result.duplicates.push(record.clone());
            } else if skipped.contains(&record.member) {
                debug!(member = %record.member, "leaving record of a failed member untouched");
            } else {
                candidates.push(record);
            }
        }

        for record in candidates {
            if self.force_non_directory_update || is_directory_managed(&record.member) {
                result.to_remove.push(record.clone());
            } else {
                info!(member = %record.member, "preserving member that is not directory-managed");
                result.preserved.push(record.clone());
            }
        }

        result.to_add = working
            .into_iter()
            .filter(|(reference, _)| !skipped.contains(reference))
            .collect();

        debug!(
            add = result.to_add.len(),
            remove = result.to_remove.len(),
            preserved = result.preserved.len(),
            duplicates = result.duplicates.len(),
            "membership diff computed"
        );
        result
    }
}
