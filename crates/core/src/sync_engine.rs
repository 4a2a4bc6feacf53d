//! Directory -> local store membership reconciliation engine.
//!
//! The [`SyncEngine`] runs one reconciliation pass per mapped local group:
//!
//! 1. Fetch every directory member of the external groups mapped to it.
//! 2. Classify each member as absent or present in the local store.
//! 3. Import absent members as new identities.
//! 4. Synchronize present members from the latest directory values.
//! 5. Diff the resolved membership against the local group and commit the
//!    changes in batches.
//!
//! Per-member failures are recorded in the group report and never abort the
//! pass. A directory connection failure or a failed batch commit aborts that
//! group's pass. Each group is reconciled under its own lock, and a
//! "synchronize all" run is guarded against overlapping runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::directory::members::{read_entry, GroupExpansion};
use crate::directory::{filter, CursorConsumer, DirectoryConnector, DirectoryEntry, DirectorySession, SearchQuery, SearchScope};
use crate::errors::{ConfigError, MemberError, SyncError};
use crate::identity::{IdentityResolver, Resolution};
use crate::mapping::AttributeMapping;
use crate::membership::{locks, BatchedGroupWriter, GroupLocks, MembershipDiffer};
use crate::models::{AuditEntry, FederatedIdentity, LocalReference};
use crate::store::LocalStore;

// ---------------------------------------------------------------------------
// Group pass state machine
// ---------------------------------------------------------------------------

/// States of one group's reconciliation pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupSyncState {
    Fetching,
    ImportingNew,
    SyncingExisting,
    Diffing,
    Committing,
    Done,
}

impl std::fmt::Display for GroupSyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetching => write!(f, "fetching"),
            Self::ImportingNew => write!(f, "importing_new"),
            Self::SyncingExisting => write!(f, "syncing_existing"),
            Self::Diffing => write!(f, "diffing"),
            Self::Committing => write!(f, "committing"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// A member skipped during a pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberFailure {
    /// Directory key (DN) of the member.
    pub key: String,
    pub reference: Option<LocalReference>,
    /// Stage at which the member failed.
    pub stage: GroupSyncState,
    pub error: String,
}

/// Outcome of one group's pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSyncReport {
    /// Identifier correlating this pass's log lines and audit entry.
    pub pass_id: String,
    pub group: LocalReference,
    pub state: GroupSyncState,
    /// Directory user entries found under the mapped groups.
    pub fetched: usize,
    /// Entries without a usable identifier.
    pub unresolved: usize,
    pub imported: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub added: usize,
    pub removed: usize,
    /// Members kept because they are not directory-managed.
    pub preserved: usize,
    pub duplicates: usize,
    pub commits: usize,
    pub failures: Vec<MemberFailure>,
    pub referrals: Vec<String>,
    pub missing: Vec<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

impl GroupSyncReport {
    fn new(group: LocalReference) -> Self {
        Self {
            pass_id: Uuid::new_v4().to_string(),
            group,
            state: GroupSyncState::Fetching,
            fetched: 0,
            unresolved: 0,
            imported: 0,
            updated: 0,
            unchanged: 0,
            added: 0,
            removed: 0,
            preserved: 0,
            duplicates: 0,
            commits: 0,
            failures: Vec::new(),
            referrals: Vec::new(),
            missing: Vec::new(),
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
        }
    }

    /// Whether some members were skipped or the directory answered partially.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty() || !self.referrals.is_empty()
    }

    fn summary(&self) -> String {
        format!(
            "pass: {}, imported: {}, updated: {}, added: {}, removed: {}, preserved: {}, failures: {}",
            self.pass_id,
            self.imported,
            self.updated,
            self.added,
            self.removed,
            self.preserved,
            self.failures.len()
        )
    }
}

/// A group whose pass was aborted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupFailure {
    pub group: LocalReference,
    pub error: String,
    /// Batches already committed when a commit failed.
    pub committed_batches: Option<usize>,
}

impl GroupFailure {
    fn new(group: &LocalReference, error: &SyncError) -> Self {
        let committed_batches = match error {
            SyncError::CommitFailed { committed_batches, .. } => Some(*committed_batches),
            _ => None,
        };
        Self {
            group: group.clone(),
            error: error.to_string(),
            committed_batches,
        }
    }
}

/// Outcome of a "synchronize all groups" run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncAllReport {
    pub groups: Vec<GroupSyncReport>,
    pub failed: Vec<GroupFailure>,
    /// The run stopped early at a cancellation point.
    pub cancelled: bool,
    pub started_at: String,
    pub completed_at: Option<String>,
}

impl SyncAllReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// Per-user result of a selected-user import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserImport {
    pub uid: String,
    pub reference: Option<LocalReference>,
    pub created: bool,
    pub error: Option<String>,
}

/// Outcome of importing selected users.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportReport {
    pub users: Vec<UserImport>,
    pub group: Option<LocalReference>,
    pub added_to_group: usize,
    /// Mapped groups reconciled afterwards, when group updates are triggered.
    pub group_updates: Vec<GroupSyncReport>,
    pub failed_group_updates: Vec<GroupFailure>,
}

/// A local group and the directory groups mapped to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappedGroup {
    pub group: LocalReference,
    pub directory_groups: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Everything a pass needs from the configuration, resolved once.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub wiki: String,
    pub base_dn: String,
    pub user_classes: String,
    pub group_classes: String,
    pub group_search_fields: String,
    pub search_fields: String,
    pub single_field_search: bool,
    pub max_import_results: usize,
    pub group_mappings: BTreeMap<LocalReference, BTreeSet<String>>,
    pub mapping: AttributeMapping,
    pub resolver: IdentityResolver,
    pub expansion: GroupExpansion,
    pub differ: MembershipDiffer,
    pub writer: BatchedGroupWriter,
    pub federated_identity_enabled: bool,
    pub federated_identity_issuer: String,
    /// Reconcile the mapped groups after importing selected users.
    pub trigger_group_update: bool,
    /// Attributes read for every user entry.
    pub user_attributes: Vec<String>,
}

impl SyncSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let mapping = AttributeMapping::from_config(&config.ldap);
        let resolver = IdentityResolver::from_config(config)?;

        let mut user_attributes = mapping.attributes();
        user_attributes.extend(resolver.attributes());
        let user_attributes: Vec<String> = user_attributes.into_iter().collect();

        let wiki = config.import.wiki.clone();
        let group_mappings = config
            .groups
            .iter()
            .map(|(group, dns)| (LocalReference::parse(group, &wiki), dns.clone()))
            .collect();

        Ok(Self {
            base_dn: config.ldap.base_dn.clone(),
            user_classes: config.ldap.user_classes.clone(),
            group_classes: config.ldap.group_classes.clone(),
            group_search_fields: config.ldap.group_search_fields.clone(),
            search_fields: config.import.search_fields.clone(),
            single_field_search: config.import.single_field_search,
            max_import_results: config.import.max_import_results,
            group_mappings,
            expansion: GroupExpansion::new(&config.ldap, user_attributes.iter().cloned()),
            differ: MembershipDiffer::new(config.import.force_non_directory_membership_update),
            writer: BatchedGroupWriter::new(config.import.batch_size),
            federated_identity_enabled: config.import.federated_identity_enabled,
            federated_identity_issuer: config.import.federated_identity_issuer.clone(),
            trigger_group_update: config.import.trigger_group_update,
            user_attributes,
            mapping,
            resolver,
            wiki,
        })
    }

    /// Resolve a group name given on the command line.
    pub fn group_reference(&self, name: &str) -> LocalReference {
        LocalReference::parse(name, &self.wiki)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

const GROUP_SYNC_COMMENT: &str = "Synchronized membership from directory";
const IMPORT_COMMENT: &str = "Imported from directory";
const UPDATE_COMMENT: &str = "Updated from directory";

/// The membership reconciliation engine.
pub struct SyncEngine<S: LocalStore> {
    settings: SyncSettings,
    store: S,
    connector: Box<dyn DirectoryConnector>,
    locks: GroupLocks,
    /// Atomic flag preventing overlapping "synchronize all" runs.
    running: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    /// Start of the in-flight "synchronize all" run.
    run_started_at: Mutex<Option<DateTime<Utc>>>,
    started_at: DateTime<Utc>,
}

impl<S: LocalStore> SyncEngine<S> {
    pub fn new(settings: SyncSettings, store: S, connector: Box<dyn DirectoryConnector>) -> Self {
        info!(
            directory = %connector.describe(),
            groups = settings.group_mappings.len(),
            "initializing sync engine"
        );
        Self {
            settings,
            store,
            connector,
            locks: GroupLocks::new(),
            running: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
            run_started_at: Mutex::new(None),
            started_at: Utc::now(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub(crate) fn connector(&self) -> &dyn DirectoryConnector {
        self.connector.as_ref()
    }

    /// Check if a "synchronize all" run is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flag checked between groups; once set, `sync_all` stops early.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// When the in-flight "synchronize all" run started, if one is running.
    pub fn run_started_at(&self) -> Option<DateTime<Utc>> {
        *self.run_slot()
    }

    fn run_slot(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.run_started_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Local groups with a directory mapping.
    pub fn mapped_groups(&self) -> Vec<MappedGroup> {
        self.settings
            .group_mappings
            .iter()
            .map(|(group, dns)| MappedGroup {
                group: group.clone(),
                directory_groups: dns.clone(),
            })
            .collect()
    }

    fn mapping_for(&self, name: &str) -> Result<(LocalReference, &BTreeSet<String>), SyncError> {
        let reference = self.settings.group_reference(name);
        match self.settings.group_mappings.get(&reference) {
            Some(dns) => Ok((reference, dns)),
            None => Err(SyncError::UnknownGroup(reference.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Reconcile one mapped group.
    pub fn sync_group(&self, name: &str) -> Result<GroupSyncReport, SyncError> {
        let (reference, dns) = self.mapping_for(name)?;
        if self.cancel.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled(reference.to_string()));
        }
        self.sync_mapped_group(&reference, dns)
    }

    /// Reconcile every mapped group, one after the other.
    ///
    /// A failing group does not stop the run; it is listed in
    /// [`SyncAllReport::failed`].
    pub fn sync_all(&self) -> Result<SyncAllReport, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = self
                .run_started_at()
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(SyncError::AlreadyRunning { started_at });
        }

        let run_start = Utc::now();
        *self.run_slot() = Some(run_start);
        // RAII guard that clears the running flag on drop (even on panic).
        let _guard = SyncLockGuard {
            running: self.running.clone(),
            started_at: &self.run_started_at,
        };

        let mut report = SyncAllReport {
            started_at: run_start.to_rfc3339(),
            ..Default::default()
        };
        let _ = self.store.set_state("sync_state", "running");
        info!(groups = self.settings.group_mappings.len(), "synchronizing all mapped groups");

        for (reference, dns) in &self.settings.group_mappings {
            if self.cancel.load(Ordering::SeqCst) {
                warn!(group = %reference, "reconciliation cancelled");
                report.cancelled = true;
                break;
            }
            match self.sync_mapped_group(reference, dns) {
                Ok(group_report) => report.groups.push(group_report),
                Err(e) => report.failed.push(GroupFailure::new(reference, &e)),
            }
        }

        report.completed_at = Some(Utc::now().to_rfc3339());
        let final_state = if report.is_success() { "idle" } else { "error" };
        let _ = self.store.set_state("sync_state", final_state);
        let _ = self.store.set_state("last_sync_at", &Utc::now().to_rfc3339());

        let details = format!(
            "groups: {}, failed: {}, cancelled: {}",
            report.groups.len(),
            report.failed.len(),
            report.cancelled
        );
        let audit = if report.is_success() {
            AuditEntry::success("sync_all", None, &details)
        } else {
            AuditEntry::failure("sync_all", None, &details)
        };
        let _ = self.store.record_audit(&audit);

        info!(%details, "synchronize all finished");
        Ok(report)
    }

    fn sync_mapped_group(
        &self,
        reference: &LocalReference,
        dns: &BTreeSet<String>,
    ) -> Result<GroupSyncReport, SyncError> {
        let handle = self.locks.handle(reference);
        let _guard = locks::acquire(&handle);

        let mut report = GroupSyncReport::new(reference.clone());
        let result = self.reconcile(dns, &mut report);
        report.completed_at = Some(Utc::now().to_rfc3339());

        let audit = match &result {
            Ok(()) => AuditEntry::success("sync_group", Some(reference), &report.summary()),
            Err(e) => {
                error!(group = %reference, state = %report.state, error = %e, "group reconciliation failed");
                AuditEntry::failure("sync_group", Some(reference), &format!("{} at {}: {e}", report.summary(), report.state))
            }
        };
        let _ = self.store.record_audit(&audit);
        let _ = self.store.set_state(&format!("group_last_sync:{reference}"), &Utc::now().to_rfc3339());

        result.map(|()| report)
    }

    // -----------------------------------------------------------------------
    // One group's pass
    // -----------------------------------------------------------------------

    fn reconcile(&self, dns: &BTreeSet<String>, report: &mut GroupSyncReport) -> Result<(), SyncError> {
        let reference = report.group.clone();
        info!(group = %reference, pass = %report.pass_id, directory_groups = dns.len(), "reconciling group");

        // FETCHING
        let mut session = self.connector.connect()?;
        let fetched = self.settings.expansion.expand(session.as_mut(), dns)?;
        report.fetched = fetched.members.len();
        report.referrals = fetched.referrals;
        report.missing = fetched.missing;
        for target in &report.referrals {
            warn!(group = %reference, target = %target, "directory referral, using results gathered so far");
        }

        let mut skipped: BTreeSet<LocalReference> = BTreeSet::new();
        let mut absent: Vec<(LocalReference, DirectoryEntry)> = Vec::new();
        let mut present: Vec<(LocalReference, DirectoryEntry)> = Vec::new();
        let mut seen: BTreeSet<LocalReference> = BTreeSet::new();

        for entry in fetched.members {
            match self.settings.resolver.resolve(&entry, &self.store) {
                Ok(Resolution::Unresolved) => report.unresolved += 1,
                Ok(Resolution::Absent(member)) | Ok(Resolution::Present(member)) if seen.contains(&member) => {
                    debug!(member = %member, dn = %entry.dn, "member reported by several directory groups");
                }
                Ok(Resolution::Absent(member)) => {
                    seen.insert(member.clone());
                    absent.push((member, entry));
                }
                Ok(Resolution::Present(member)) => {
                    seen.insert(member.clone());
                    present.push((member, entry));
                }
                Err(source) => {
                    let member = self.settings.resolver.reference_for(&entry);
                    let error = MemberError::Store {
                        reference: member.as_ref().map(ToString::to_string).unwrap_or_default(),
                        source,
                    };
                    self.record_failure(report, &entry.dn, member.clone(), &error);
                    if let Some(member) = member {
                        skipped.insert(member);
                    }
                }
            }
        }

        let mut directory_members: BTreeMap<LocalReference, String> = BTreeMap::new();

        // IMPORTING_NEW
        report.state = GroupSyncState::ImportingNew;
        let federated = self.federated_linkage_available();
        for (member, entry) in absent {
            match self.import_member(session.as_mut(), &member, &entry.dn, federated) {
                Ok(()) => {
                    report.imported += 1;
                    directory_members.insert(member, entry.dn);
                }
                Err(e) => {
                    self.record_failure(report, &entry.dn, Some(member.clone()), &e);
                    skipped.insert(member);
                }
            }
        }

        // SYNCING_EXISTING
        report.state = GroupSyncState::SyncingExisting;
        for (member, entry) in present {
            match self.sync_member(session.as_mut(), &member, &entry.dn) {
                Ok(changed) => {
                    if changed {
                        report.updated += 1;
                    } else {
                        report.unchanged += 1;
                    }
                    directory_members.insert(member, entry.dn);
                }
                Err(e) => {
                    self.record_failure(report, &entry.dn, Some(member.clone()), &e);
                    skipped.insert(member);
                }
            }
        }
        drop(session);

        // DIFFING
        report.state = GroupSyncState::Diffing;
        let mut group = self.store.load_group(&reference)?;
        let changes = self.settings.differ.diff(
            &directory_members,
            group.records(),
            &skipped,
            |member| self.is_directory_managed(member),
        );
        report.preserved = changes.preserved.len();
        report.duplicates = changes.duplicates.len();

        // COMMITTING
        report.state = GroupSyncState::Committing;
        let outcome = self
            .settings
            .writer
            .apply(&self.store, &mut group, &changes, GROUP_SYNC_COMMENT)?;
        report.added = outcome.added;
        report.removed = outcome.removed;
        report.commits = outcome.commits;

        report.state = GroupSyncState::Done;
        info!(group = %reference, summary = %report.summary(), commits = report.commits, "group reconciled");
        Ok(())
    }

    fn record_failure(
        &self,
        report: &mut GroupSyncReport,
        key: &str,
        reference: Option<LocalReference>,
        error: &MemberError,
    ) {
        warn!(group = %report.group, member = %key, stage = %report.state, error = %error, "skipping member");
        report.failures.push(MemberFailure {
            key: key.to_string(),
            reference,
            stage: report.state,
            error: error.to_string(),
        });
    }

    /// Whether federated linkage should be attached to new identities.
    fn federated_linkage_available(&self) -> bool {
        if !self.settings.federated_identity_enabled {
            return false;
        }
        match self.store.supports_federated_identity() {
            Ok(true) => true,
            Ok(false) => {
                warn!("federated identities are enabled but the store does not support them");
                false
            }
            Err(e) => {
                warn!(error = %e, "cannot check federated identity support, not attaching");
                false
            }
        }
    }

    /// Unreadable identities count as not directory-managed, so they are kept.
    fn is_directory_managed(&self, member: &LocalReference) -> bool {
        match self.store.load_identity(member) {
            Ok(doc) => doc.is_directory_managed(),
            Err(e) => {
                warn!(member = %member, error = %e, "cannot load identity, treating as not directory-managed");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Per-member work
    // -----------------------------------------------------------------------

    fn fetch_attributes(
        &self,
        session: &mut dyn DirectorySession,
        dn: &str,
    ) -> Result<DirectoryEntry, MemberError> {
        match read_entry(session, dn, &self.settings.user_attributes) {
            Ok(Some(entry)) => Ok(entry),
            Ok(None) => Err(MemberError::Vanished(dn.to_string())),
            Err(source) => Err(MemberError::Fetch {
                key: dn.to_string(),
                source,
            }),
        }
    }

    fn import_member(
        &self,
        session: &mut dyn DirectorySession,
        member: &LocalReference,
        dn: &str,
        federated: bool,
    ) -> Result<(), MemberError> {
        let entry = self.fetch_attributes(session, dn)?;
        let store_error = |source| MemberError::Store {
            reference: member.to_string(),
            source,
        };

        let mut doc = self.store.load_identity(member).map_err(store_error)?;
        doc.apply_fields(self.settings.mapping.translate(&entry));
        doc.directory_dn = Some(entry.dn.clone());
        if federated && doc.federated.is_none() {
            if let Some(uid) = self.settings.resolver.uid(&entry) {
                doc.federated = Some(FederatedIdentity {
                    subject: uid.to_string(),
                    issuer: self.settings.federated_identity_issuer.clone(),
                });
            }
        }
        self.store.save_identity(&mut doc, IMPORT_COMMENT).map_err(store_error)?;
        debug!(member = %member, dn, "imported identity");
        Ok(())
    }

    /// Returns whether the identity changed.
    fn sync_member(
        &self,
        session: &mut dyn DirectorySession,
        member: &LocalReference,
        dn: &str,
    ) -> Result<bool, MemberError> {
        let entry = self.fetch_attributes(session, dn)?;
        let store_error = |source| MemberError::Store {
            reference: member.to_string(),
            source,
        };

        let mut doc = self.store.load_identity(member).map_err(store_error)?;
        let mut changed = doc.apply_fields(self.settings.mapping.translate(&entry));
        if doc.directory_dn.as_deref() != Some(entry.dn.as_str()) {
            doc.directory_dn = Some(entry.dn.clone());
            changed = true;
        }
        if changed {
            self.store.save_identity(&mut doc, UPDATE_COMMENT).map_err(store_error)?;
            debug!(member = %member, dn, "updated identity");
        }
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Operator operations
    // -----------------------------------------------------------------------

    /// Number of distinct identities a pass over `name` would import or update.
    pub fn group_member_count(&self, name: &str) -> Result<usize, SyncError> {
        let (_, dns) = self.mapping_for(name)?;
        let mut session = self.connector.connect()?;
        let fetched = self.settings.expansion.expand(session.as_mut(), dns)?;
        let references: BTreeSet<LocalReference> = fetched
            .members
            .iter()
            .filter_map(|entry| self.settings.resolver.reference_for(entry))
            .collect();
        Ok(references.len())
    }

    /// Import the users with the given identifiers, optionally adding them to a group.
    ///
    /// Users that cannot be found or stored are reported individually.
    pub fn import_users(&self, uids: &[String], group: Option<&str>) -> Result<ImportReport, SyncError> {
        let group = group.map(|name| self.settings.group_reference(name));
        let mut report = ImportReport {
            group: group.clone(),
            ..Default::default()
        };
        let mut imported: BTreeMap<LocalReference, String> = BTreeMap::new();
        let federated = self.federated_linkage_available();

        {
            let mut session = self.connector.connect()?;
            for uid in uids {
                let outcome = self.import_one(session.as_mut(), uid, federated);
                match &outcome {
                    UserImport {
                        reference: Some(member),
                        error: None,
                        ..
                    } => {
                        imported.insert(member.clone(), uid.clone());
                    }
                    UserImport { error: Some(e), .. } => {
                        warn!(uid = %uid, error = %e, "user import failed");
                    }
                    _ => {}
                }
                let audit = match &outcome.error {
                    None => AuditEntry::success("import_user", group.as_ref(), uid),
                    Some(e) => AuditEntry::failure("import_user", group.as_ref(), &format!("{uid}: {e}")),
                };
                let _ = self.store.record_audit(&audit);
                report.users.push(outcome);
            }
        }

        if let Some(group) = group {
            let handle = self.locks.handle(&group);
            let _guard = locks::acquire(&handle);
            let mut doc = self.store.load_group(&group)?;
            // Add-only: nothing counts as directory-managed, so nothing is removed.
            let changes = MembershipDiffer::new(false).diff(&imported, doc.records(), &BTreeSet::new(), |_| false);
            let outcome = self
                .settings
                .writer
                .apply(&self.store, &mut doc, &changes, "Added imported users")?;
            report.added_to_group = outcome.added;
        }

        if self.settings.trigger_group_update && report.users.iter().any(|u| u.error.is_none()) {
            for (reference, dns) in &self.settings.group_mappings {
                match self.sync_mapped_group(reference, dns) {
                    Ok(group_report) => report.group_updates.push(group_report),
                    Err(e) => report.failed_group_updates.push(GroupFailure::new(reference, &e)),
                }
            }
        }

        info!(
            users = report.users.len(),
            added_to_group = report.added_to_group,
            group_updates = report.group_updates.len(),
            "user import finished"
        );
        Ok(report)
    }

    fn import_one(&self, session: &mut dyn DirectorySession, uid: &str, federated: bool) -> UserImport {
        let mut outcome = UserImport {
            uid: uid.to_string(),
            reference: None,
            created: false,
            error: None,
        };

        let entry = match self.find_user(session, uid) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                outcome.error = Some("no such user in the directory".to_string());
                return outcome;
            }
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        let result = match self.settings.resolver.resolve(&entry, &self.store) {
            Ok(Resolution::Absent(member)) => {
                outcome.created = true;
                outcome.reference = Some(member.clone());
                self.import_member(session, &member, &entry.dn, federated)
            }
            Ok(Resolution::Present(member)) => {
                outcome.reference = Some(member.clone());
                self.sync_member(session, &member, &entry.dn).map(|_| ())
            }
            Ok(Resolution::Unresolved) => {
                outcome.error = Some("directory entry has no identifier".to_string());
                return outcome;
            }
            Err(source) => Err(MemberError::Store {
                reference: String::new(),
                source,
            }),
        };
        if let Err(e) = result {
            outcome.created = false;
            outcome.error = Some(e.to_string());
        }
        outcome
    }

    fn find_user(
        &self,
        session: &mut dyn DirectorySession,
        uid: &str,
    ) -> Result<Option<DirectoryEntry>, MemberError> {
        let identifier = filter::equality(self.settings.mapping.uid_attribute(), uid);
        let filter = match filter::object_classes_filter(&self.settings.user_classes) {
            Some(classes) => format!("(&{identifier}{classes})"),
            None => identifier,
        };
        let query = SearchQuery::new(&self.settings.base_dn, SearchScope::Subtree, filter)
            .with_attributes(self.settings.user_attributes.iter().cloned());

        let fetch_error = |source| MemberError::Fetch {
            key: uid.to_string(),
            source,
        };
        let mut cursor = session.search(&query).map_err(fetch_error)?;
        let drained = CursorConsumer::unbounded()
            .with_max_results(1)
            .drain(cursor.as_mut())
            .map_err(fetch_error)?;
        Ok(drained.entries.into_iter().next())
    }
}

/// RAII guard that resets the running flag and run start when dropped.
struct SyncLockGuard<'a> {
    running: Arc<AtomicBool>,
    started_at: &'a Mutex<Option<DateTime<Utc>>>,
}

impl Drop for SyncLockGuard<'_> {
    fn drop(&mut self) {
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.running.store(false, Ordering::SeqCst);
    }
}
