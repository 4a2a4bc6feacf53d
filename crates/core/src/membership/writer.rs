//! Chunked application of membership changes.
//!
//! Additions are applied first, then removals. The group document is saved
//! after every `batch_size` mutations and once more at the end when
//! mutations are pending, so a group with `n` mutations costs
//! `ceil(n / batch_size)` saves. A failed save leaves the earlier batches
//! committed.

use tracing::{debug, error, info, warn};

use super::differ::ReconciliationResult;
use crate::errors::SyncError;
use crate::store::{GroupDocument, LocalStore};

/// Counts of what a write applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub added: usize,
    pub removed: usize,
    pub commits: usize,
}

/// Applies a [`ReconciliationResult`] to a group in bounded batches.
#[derive(Debug, Clone, Copy)]
pub struct BatchedGroupWriter {
    batch_size: usize,
}

impl Default for BatchedGroupWriter {
    fn default() -> Self {
        Self { batch_size: 500 }
    }
}

struct Batcher<'a, S: ?Sized> {
    store: &'a S,
    batch_size: usize,
    comment: &'a str,
    pending: usize,
    outcome: WriteOutcome,
}

impl<S: LocalStore + ?Sized> Batcher<'_, S> {
    fn mutated(&mut self, group: &mut GroupDocument) -> Result<(), SyncError> {
        self.pending += 1;
        if self.pending >= self.batch_size {
            self.commit(group)?;
        }
        Ok(())
    }

    fn commit(&mut self, group: &mut GroupDocument) -> Result<(), SyncError> {
        let batch = self.outcome.commits + 1;
        let comment = format!("{} (batch {batch})", self.comment);
        if let Err(source) = self.store.save_group(group, &comment) {
            error!(
                group = %group.reference,
                batch,
                pending = self.pending,
                error = %source,
                "failed to commit membership batch"
            );
            return Err(SyncError::CommitFailed {
                group: group.reference.to_string(),
                committed_batches: self.outcome.commits,
                source,
            });
        }
        info!(group = %group.reference, batch, mutations = self.pending, "committed membership batch");
        self.outcome.commits += 1;
        self.pending = 0;
        Ok(())
    }
}

impl BatchedGroupWriter {
    /// A `batch_size` of zero is treated as one.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Apply `changes` to `group`, saving through `store` with `comment`.
    ///
    /// The caller must hold the group's lock for the duration.
    pub fn apply<S>(
        &self,
        store: &S,
        group: &mut GroupDocument,
        changes: &ReconciliationResult,
        comment: &str,
    ) -> Result<WriteOutcome, SyncError>
    where
        S: LocalStore + ?Sized,
    {
        let mut batcher = Batcher {
            store,
            batch_size: self.batch_size,
            comment,
            pending: 0,
            outcome: WriteOutcome::default(),
        };

        for member in changes.to_add.keys() {
            if group.contains_member(member) {
                warn!(group = %group.reference, member = %member, "member already exists in group, not adding");
                continue;
            }
            group.new_membership_record(member.clone());
            batcher.outcome.added += 1;
            batcher.mutated(group)?;
        }

        for record in &changes.to_remove {
            if group.remove_membership_record(record.number).is_none() {
                debug!(group = %group.reference, number = record.number, "membership record already gone");
                continue;
            }
            batcher.outcome.removed += 1;
            batcher.mutated(group)?;
        }

        if batcher.pending > 0 {
            batcher.commit(group)?;
        }

        Ok(batcher.outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::errors::DatabaseError;
    use crate::models::LocalReference;
    use crate::store::IdentityDocument;

    /// Records the member count at every save; can fail the n-th save.
    #[derive(Default)]
    struct RecordingStore {
        saves: Mutex<Vec<usize>>,
        fail_on_save: Option<usize>,
    }

    impl LocalStore for RecordingStore {
        fn exists(&self, _: &LocalReference) -> Result<bool, DatabaseError> {
            Ok(false)
        }
        fn load_identity(&self, r: &LocalReference) -> Result<IdentityDocument, DatabaseError> {
            Ok(IdentityDocument::new(r.clone()))
        }
        fn save_identity(&self, _: &mut IdentityDocument, _: &str) -> Result<(), DatabaseError> {
            Ok(())
        }
        fn load_group(&self, r: &LocalReference) -> Result<GroupDocument, DatabaseError> {
            Ok(GroupDocument::new(r.clone()))
        }
        fn save_group(&self, doc: &mut GroupDocument, _: &str) -> Result<(), DatabaseError> {
            let mut saves = self.saves.lock().unwrap();
            if self.fail_on_save == Some(saves.len() + 1) {
                return Err(DatabaseError::NotFound {
                    entity: "group".into(),
                    id: doc.reference.to_string(),
                });
            }
            saves.push(doc.len());
            Ok(())
        }
        fn supports_federated_identity(&self) -> Result<bool, DatabaseError> {
            Ok(false)
        }
    }

    fn r(name: &str) -> LocalReference {
        LocalReference::new("xwiki", "XWiki", name)
    }

    fn additions(count: usize) -> ReconciliationResult {
        ReconciliationResult {
            to_add: (0..count)
                .map(|i| (r(&format!("user{i:05}")), format!("uid=user{i}")))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }
    }

    #[test]
    fn test_1200_additions_take_three_commits() {
        let store = RecordingStore::default();
        let mut group = GroupDocument::new(r("Staff"));
        let outcome = BatchedGroupWriter::new(500)
            .apply(&store, &mut group, &additions(1200), "sync")
            .unwrap();
        assert_eq!(outcome.commits, 3);
        assert_eq!(outcome.added, 1200);
        assert_eq!(*store.saves.lock().unwrap(), vec![500, 1000, 1200]);
    }

    #[test]
    fn test_commit_count_bound() {
        for (mutations, batch, expected) in [(0, 500, 0), (1, 500, 1), (500, 500, 1), (501, 500, 2), (7, 3, 3)] {
            let store = RecordingStore::default();
            let mut group = GroupDocument::new(r("Staff"));
            let outcome = BatchedGroupWriter::new(batch)
                .apply(&store, &mut group, &additions(mutations), "sync")
                .unwrap();
            assert_eq!(outcome.commits, expected, "{mutations} mutations, batch {batch}");
        }
    }

    #[test]
    fn test_additions_and_removals_share_batches() {
        let store = RecordingStore::default();
        let mut group = GroupDocument::new(r("Staff"));
        for i in 0..3 {
            group.new_membership_record(r(&format!("old{i}")));
        }
        let mut changes = additions(2);
        changes.to_remove = group.records().cloned().collect();

        let outcome = BatchedGroupWriter::new(2)
            .apply(&store, &mut group, &changes, "sync")
            .unwrap();
        assert_eq!(outcome, WriteOutcome { added: 2, removed: 3, commits: 3 });
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_failed_commit_reports_committed_batches() {
        let store = RecordingStore {
            fail_on_save: Some(2),
            ..Default::default()
        };
        let mut group = GroupDocument::new(r("Staff"));
        let result = BatchedGroupWriter::new(500).apply(&store, &mut group, &additions(1200), "sync");
        match result {
            Err(SyncError::CommitFailed { committed_batches, .. }) => assert_eq!(committed_batches, 1),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(*store.saves.lock().unwrap(), vec![500]);
    }

    #[test]
    fn test_existing_member_is_not_added_twice() {
        let store = RecordingStore::default();
        let mut group = GroupDocument::new(r("Staff"));
        group.new_membership_record(r("user00000"));
        let outcome = BatchedGroupWriter::new(10)
            .apply(&store, &mut group, &additions(2), "sync")
            .unwrap();
        assert_eq!(outcome.added, 1);
        assert_eq!(group.len(), 2);
    }
}
