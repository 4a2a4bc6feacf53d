//! End-to-end tests for directory -> local group reconciliation.
//!
//! These tests exercise the real `SyncEngine` with:
//! - An in-process directory answering searches through the cursor protocol
//! - Real SQLite databases (in memory)
//! - Real attribute mapping and identity naming
//!
//! No network I/O.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use ldapsync_core::config::AppConfig;
use ldapsync_core::db::Database;
use ldapsync_core::directory::{DirectoryEntry, InMemoryDirectory};
use ldapsync_core::errors::{DatabaseError, SyncError};
use ldapsync_core::models::{AuditEntry, LocalReference};
use ldapsync_core::store::{GroupDocument, IdentityDocument, LocalStore};
use ldapsync_core::sync_engine::{GroupSyncState, SyncEngine, SyncSettings};

// ===========================================================================
// Helpers
// ===========================================================================

const PEOPLE: &str = "ou=people,dc=example,dc=com";
const STAFF_DN: &str = "cn=staff,ou=groups,dc=example,dc=com";

fn config_with(extra_import: &str, groups: &str) -> AppConfig {
    let toml = format!(
        r#"
[ldap]
url = "ldap://localhost"
base_dn = "dc=example,dc=com"
uid_attribute = "uid"

[import]
{extra_import}

[groups]
{groups}
"#
    );
    let config: AppConfig = toml::from_str(&toml).unwrap();
    config.validate().unwrap();
    config
}

fn staff_config(extra_import: &str) -> AppConfig {
    config_with(extra_import, &format!(r#""XWiki.Staff" = ["{STAFF_DN}"]"#))
}

fn user_dn(uid: &str) -> String {
    format!("uid={uid},{PEOPLE}")
}

fn user(uid: &str) -> DirectoryEntry {
    DirectoryEntry::new(user_dn(uid))
        .with("objectClass", "inetOrgPerson")
        .with("uid", uid)
        .with("givenName", uid.to_uppercase())
        .with("sn", "Example")
        .with("mail", format!("{uid}@example.com"))
}

fn group(dn: &str, members: &[String]) -> DirectoryEntry {
    let cn = dn
        .split(',')
        .next()
        .and_then(|rdn| rdn.strip_prefix("cn="))
        .unwrap_or_default()
        .to_string();
    let mut entry = DirectoryEntry::new(dn)
        .with("objectClass", "groupOfNames")
        .with("cn", cn);
    for member in members {
        entry.push("member", member.as_str());
    }
    entry
}

/// A directory holding `uids` as users, all members of the staff group.
fn directory_with_staff(uids: &[&str]) -> InMemoryDirectory {
    let dir = InMemoryDirectory::new();
    for uid in uids {
        dir.insert(user(uid));
    }
    let members: Vec<String> = uids.iter().map(|uid| user_dn(uid)).collect();
    dir.insert(group(STAFF_DN, &members));
    dir
}

fn database() -> Database {
    let db = Database::in_memory().unwrap();
    db.initialize().unwrap();
    db
}

fn engine_with<S: LocalStore>(config: &AppConfig, store: S, dir: &InMemoryDirectory) -> SyncEngine<S> {
    let settings = SyncSettings::from_config(config).unwrap();
    SyncEngine::new(settings, store, Box::new(dir.clone()))
}

fn reference(name: &str) -> LocalReference {
    LocalReference::new("xwiki", "XWiki", name)
}

fn staff() -> LocalReference {
    reference("Staff")
}

fn group_members<S: LocalStore>(store: &S, group: &LocalReference) -> Vec<String> {
    let doc = store.load_group(group).unwrap();
    let mut names: Vec<String> = doc.records().map(|r| r.member.name.clone()).collect();
    names.sort();
    names
}

/// Wraps a `Database` and fails the n-th group save (never when n is 0).
/// Once `cancel_after_save` is set, a successful group save raises that flag.
struct FlakyStore {
    inner: Database,
    fail_group_save: usize,
    group_saves: AtomicUsize,
    cancel_after_save: OnceLock<Arc<AtomicBool>>,
}

impl FlakyStore {
    fn failing_group_save(n: usize) -> Self {
        Self {
            inner: database(),
            fail_group_save: n,
            group_saves: AtomicUsize::new(0),
            cancel_after_save: OnceLock::new(),
        }
    }
}

impl LocalStore for FlakyStore {
    fn exists(&self, reference: &LocalReference) -> Result<bool, DatabaseError> {
        self.inner.exists(reference)
    }
    fn load_identity(&self, reference: &LocalReference) -> Result<IdentityDocument, DatabaseError> {
        self.inner.load_identity(reference)
    }
    fn save_identity(&self, doc: &mut IdentityDocument, comment: &str) -> Result<(), DatabaseError> {
        self.inner.save_identity(doc, comment)
    }
    fn load_group(&self, reference: &LocalReference) -> Result<GroupDocument, DatabaseError> {
        self.inner.load_group(reference)
    }
    fn save_group(&self, doc: &mut GroupDocument, comment: &str) -> Result<(), DatabaseError> {
        let n = self.group_saves.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_group_save {
            return Err(DatabaseError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.save_group(doc, comment)?;
        if let Some(cancel) = self.cancel_after_save.get() {
            cancel.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
    fn supports_federated_identity(&self) -> Result<bool, DatabaseError> {
        self.inner.supports_federated_identity()
    }
    fn record_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError> {
        self.inner.record_audit(entry)
    }
    fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        LocalStore::set_state(&self.inner, key, value)
    }
}

// ===========================================================================
// Group passes
// ===========================================================================

#[test]
fn test_first_pass_imports_and_adds_members() {
    let dir = directory_with_staff(&["alice", "bob"]);
    let engine = engine_with(&staff_config(""), database(), &dir);

    let report = engine.sync_group("XWiki.Staff").unwrap();
    assert_eq!(report.state, GroupSyncState::Done);
    assert_eq!(report.fetched, 2);
    assert_eq!(report.imported, 2);
    assert_eq!(report.added, 2);
    assert_eq!(report.commits, 1);
    assert!(report.failures.is_empty());

    let db = engine.store();
    assert_eq!(group_members(db, &staff()), vec!["alice", "bob"]);

    let alice = db.load_identity(&reference("alice")).unwrap();
    assert!(!alice.is_new);
    assert_eq!(alice.directory_dn.as_deref(), Some(user_dn("alice").as_str()));
    assert_eq!(alice.fields.get("first_name").map(String::as_str), Some("ALICE"));
    assert_eq!(alice.fields.get("email").map(String::as_str), Some("alice@example.com"));
    assert_eq!(alice.fields.get("uid").map(String::as_str), Some("alice"));
    assert!(alice.federated.is_none());
}

#[test]
fn test_second_pass_is_idempotent() {
    let dir = directory_with_staff(&["alice", "bob", "carol"]);
    let engine = engine_with(&staff_config(""), database(), &dir);

    engine.sync_group("XWiki.Staff").unwrap();
    let revisions_before = engine.store().count_revisions(&staff()).unwrap();

    let second = engine.sync_group("XWiki.Staff").unwrap();
    assert_eq!(second.imported, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.unchanged, 3);
    assert_eq!(second.added, 0);
    assert_eq!(second.removed, 0);
    assert_eq!(second.commits, 0);
    assert_eq!(engine.store().count_revisions(&staff()).unwrap(), revisions_before);
}

#[test]
fn test_changed_attributes_update_existing_identity() {
    let dir = directory_with_staff(&["alice"]);
    let engine = engine_with(&staff_config(""), database(), &dir);
    engine.sync_group("XWiki.Staff").unwrap();

    dir.insert(
        DirectoryEntry::new(user_dn("alice"))
            .with("objectClass", "inetOrgPerson")
            .with("uid", "alice")
            .with("givenName", "ALICE")
            .with("sn", "Example")
            .with("mail", "alice@corp.example.com"),
    );
    let report = engine.sync_group("XWiki.Staff").unwrap();
    assert_eq!(report.updated, 1);

    let alice = engine.store().load_identity(&reference("alice")).unwrap();
    assert_eq!(alice.fields.get("email").map(String::as_str), Some("alice@corp.example.com"));
    assert_eq!(alice.version, 2);
}

#[test]
fn test_departed_member_is_removed_and_manual_member_preserved() {
    let dir = directory_with_staff(&["alice", "bob"]);
    let engine = engine_with(&staff_config(""), database(), &dir);
    engine.sync_group("XWiki.Staff").unwrap();

    // A local-only identity added to the group by hand.
    let db = engine.store();
    let mut manual = IdentityDocument::new(reference("manual"));
    db.save_identity(&mut manual, "created by hand").unwrap();
    let mut doc = db.load_group(&staff()).unwrap();
    doc.new_membership_record(reference("manual"));
    db.save_group(&mut doc, "added by hand").unwrap();

    // Bob leaves the directory group.
    dir.insert(group(STAFF_DN, &[user_dn("alice")]));

    let report = engine.sync_group("XWiki.Staff").unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.preserved, 1);
    assert_eq!(group_members(engine.store(), &staff()), vec!["alice", "manual"]);
}

#[test]
fn test_forced_update_removes_manual_member() {
    let dir = directory_with_staff(&["alice"]);
    let engine = engine_with(
        &staff_config("force_non_directory_membership_update = true"),
        database(),
        &dir,
    );

    let db = engine.store();
    let mut doc = GroupDocument::new(staff());
    doc.new_membership_record(reference("manual"));
    db.save_group(&mut doc, "added by hand").unwrap();

    let report = engine.sync_group("XWiki.Staff").unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(report.preserved, 0);
    assert_eq!(group_members(engine.store(), &staff()), vec!["alice"]);
}

#[test]
fn test_large_group_commits_in_batches() {
    let uids: Vec<String> = (0..1200).map(|i| format!("user{i:04}")).collect();
    let uid_refs: Vec<&str> = uids.iter().map(String::as_str).collect();
    let dir = directory_with_staff(&uid_refs);
    let engine = engine_with(&staff_config("batch_size = 500"), database(), &dir);

    let report = engine.sync_group("XWiki.Staff").unwrap();
    assert_eq!(report.added, 1200);
    assert_eq!(report.commits, 3);
    assert_eq!(engine.store().count_revisions(&staff()).unwrap(), 3);
    assert_eq!(engine.store().load_group(&staff()).unwrap().len(), 1200);
}

#[test]
fn test_empty_directory_group_makes_no_changes() {
    let dir = directory_with_staff(&[]);
    let engine = engine_with(&staff_config(""), database(), &dir);

    let report = engine.sync_group("XWiki.Staff").unwrap();
    assert_eq!(report.state, GroupSyncState::Done);
    assert_eq!(report.fetched, 0);
    assert_eq!(report.commits, 0);
    assert!(engine.store().load_group(&staff()).unwrap().is_new);
}

#[test]
fn test_member_fetch_failure_is_isolated() {
    let dir = directory_with_staff(&["alice", "bob", "carol"]);
    // Carol is readable during group expansion, then her attribute fetch fails.
    dir.fail_after(&user_dn("carol"), 1);
    let engine = engine_with(&staff_config(""), database(), &dir);

    let report = engine.sync_group("XWiki.Staff").unwrap();
    assert_eq!(report.state, GroupSyncState::Done);
    assert_eq!(report.imported, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].key, user_dn("carol"));
    assert_eq!(report.failures[0].reference, Some(reference("carol")));
    assert_eq!(report.failures[0].stage, GroupSyncState::ImportingNew);
    assert!(report.is_partial());

    assert_eq!(group_members(engine.store(), &staff()), vec!["alice", "bob"]);
    assert!(!engine.store().exists(&reference("carol")).unwrap());
}

#[test]
fn test_failed_member_keeps_its_existing_membership() {
    let dir = directory_with_staff(&["alice", "bob"]);
    let engine = engine_with(&staff_config("force_non_directory_membership_update = true"), database(), &dir);
    engine.sync_group("XWiki.Staff").unwrap();

    dir.fail_after(&user_dn("bob"), 1);
    let report = engine.sync_group("XWiki.Staff").unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.removed, 0);
    assert_eq!(group_members(engine.store(), &staff()), vec!["alice", "bob"]);
}

#[test]
fn test_commit_failure_keeps_earlier_batches() {
    let uids: Vec<String> = (0..1200).map(|i| format!("user{i:04}")).collect();
    let uid_refs: Vec<&str> = uids.iter().map(String::as_str).collect();
    let dir = directory_with_staff(&uid_refs);
    let engine = engine_with(
        &staff_config("batch_size = 500"),
        FlakyStore::failing_group_save(2),
        &dir,
    );

    match engine.sync_group("XWiki.Staff") {
        Err(SyncError::CommitFailed { committed_batches, .. }) => assert_eq!(committed_batches, 1),
        other => panic!("expected a commit failure, got {other:?}"),
    }
    assert_eq!(engine.store().inner.load_group(&staff()).unwrap().len(), 500);
    assert_eq!(engine.store().inner.count_failures().unwrap(), 1);
    assert_eq!(dir.open_sessions(), 0);
}

#[test]
fn test_connection_failure_aborts_group() {
    let dir = directory_with_staff(&["alice"]);
    dir.set_unreachable(true);
    let engine = engine_with(&staff_config(""), database(), &dir);

    let err = engine.sync_group("XWiki.Staff").unwrap_err();
    assert!(matches!(err, SyncError::Directory(_)));
    assert_eq!(dir.open_sessions(), 0);
    assert!(engine.store().load_group(&staff()).unwrap().is_new);

    let audit = engine.store().list_audit_log_by_action("sync_group", 10).unwrap();
    assert_eq!(audit.len(), 1);
    assert!(!audit[0].success);
}

#[test]
fn test_session_released_after_pass() {
    let dir = directory_with_staff(&["alice", "bob"]);
    let engine = engine_with(&staff_config(""), database(), &dir);
    engine.sync_group("XWiki.Staff").unwrap();
    assert_eq!(dir.connect_count(), 1);
    assert_eq!(dir.open_sessions(), 0);
}

#[test]
fn test_nested_and_overlapping_groups_are_deduplicated() {
    let dir = InMemoryDirectory::new();
    for uid in ["alice", "bob", "carol", "dave"] {
        dir.insert(user(uid));
    }
    let devs = "cn=devs,ou=groups,dc=example,dc=com";
    let ops = "cn=ops,ou=groups,dc=example,dc=com";
    let oncall = "cn=oncall,ou=groups,dc=example,dc=com";
    dir.insert(group(devs, &[user_dn("alice"), user_dn("bob"), oncall.to_string()]));
    dir.insert(group(ops, &[user_dn("bob"), user_dn("carol")]));
    dir.insert(group(oncall, &[user_dn("dave"), user_dn("alice")]));

    let config = config_with("", &format!(r#""XWiki.Engineering" = ["{devs}", "{ops}"]"#));
    let engine = engine_with(&config, database(), &dir);

    assert_eq!(engine.group_member_count("XWiki.Engineering").unwrap(), 4);
    let report = engine.sync_group("XWiki.Engineering").unwrap();
    assert_eq!(report.imported, 4);
    assert_eq!(report.added, 4);
    assert_eq!(
        group_members(engine.store(), &reference("Engineering")),
        vec!["alice", "bob", "carol", "dave"]
    );
}

#[test]
fn test_referral_keeps_partial_membership() {
    let dir = directory_with_staff(&["alice"]);
    dir.refer("ou=partners,dc=example,dc=com", "ldap://partners.example.com/dc=example,dc=com");
    dir.insert(group(
        STAFF_DN,
        &[user_dn("alice"), "uid=eve,ou=partners,dc=example,dc=com".to_string()],
    ));
    let engine = engine_with(&staff_config(""), database(), &dir);

    let report = engine.sync_group("XWiki.Staff").unwrap();
    assert_eq!(report.state, GroupSyncState::Done);
    assert_eq!(report.referrals.len(), 1);
    assert_eq!(group_members(engine.store(), &staff()), vec!["alice"]);
}

#[test]
fn test_federated_identity_attached_on_import() {
    let dir = directory_with_staff(&["alice"]);
    let engine = engine_with(
        &staff_config(
            r#"federated_identity_enabled = true
federated_identity_issuer = "https://idp.example.com""#,
        ),
        database(),
        &dir,
    );
    engine.sync_group("XWiki.Staff").unwrap();

    let alice = engine.store().load_identity(&reference("alice")).unwrap();
    let federated = alice.federated.expect("federated identity");
    assert_eq!(federated.subject, "alice");
    assert_eq!(federated.issuer, "https://idp.example.com");
}

#[test]
fn test_federated_identity_skipped_without_store_support() {
    let dir = directory_with_staff(&["alice"]);
    let db = Database::in_memory().unwrap();
    db.initialize_to(1).unwrap();
    let engine = engine_with(
        &staff_config(
            r#"federated_identity_enabled = true
federated_identity_issuer = "https://idp.example.com""#,
        ),
        db,
        &dir,
    );

    let report = engine.sync_group("XWiki.Staff").unwrap();
    assert_eq!(report.imported, 1);
    let alice = engine.store().load_identity(&reference("alice")).unwrap();
    assert!(alice.federated.is_none());
}

// ===========================================================================
// Whole runs and operator operations
// ===========================================================================

#[test]
fn test_sync_all_runs_every_group() {
    let dir = directory_with_staff(&["alice", "bob"]);
    let sales = "cn=sales,ou=groups,dc=example,dc=com";
    dir.insert(group(sales, &[user_dn("bob")]));
    let config = config_with(
        "",
        &format!(
            r#""XWiki.Staff" = ["{STAFF_DN}"]
"XWiki.Sales" = ["{sales}"]"#
        ),
    );
    let engine = engine_with(&config, database(), &dir);

    let report = engine.sync_all().unwrap();
    assert!(report.is_success());
    assert_eq!(report.groups.len(), 2);
    assert!(!engine.is_running());
    assert_eq!(group_members(engine.store(), &reference("Sales")), vec!["bob"]);
    assert_eq!(engine.store().get_state("sync_state").unwrap().as_deref(), Some("idle"));
}

#[test]
fn test_sync_all_continues_after_failed_group() {
    let dir = directory_with_staff(&["alice"]);
    let broken = "cn=broken,ou=groups,dc=example,dc=com";
    dir.insert(group(broken, &[]));
    dir.fail_on(broken);
    let config = config_with(
        "",
        &format!(
            r#""XWiki.Broken" = ["{broken}"]
"XWiki.Staff" = ["{STAFF_DN}"]"#
        ),
    );
    let engine = engine_with(&config, database(), &dir);

    let report = engine.sync_all().unwrap();
    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].group, reference("Broken"));
    assert_eq!(report.groups.len(), 1);
    assert_eq!(group_members(engine.store(), &staff()), vec!["alice"]);
}

#[test]
fn test_sync_all_reports_committed_batches_of_failed_group() {
    let uids: Vec<String> = (0..1200).map(|i| format!("user{i:04}")).collect();
    let uid_refs: Vec<&str> = uids.iter().map(String::as_str).collect();
    let dir = directory_with_staff(&uid_refs);
    let engine = engine_with(
        &staff_config("batch_size = 500"),
        FlakyStore::failing_group_save(2),
        &dir,
    );

    let report = engine.sync_all().unwrap();
    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].group, staff());
    assert_eq!(report.failed[0].committed_batches, Some(1));
    assert!(report.failed[0].error.contains("after 1 committed batch(es)"));
    assert_eq!(engine.store().inner.get_state("sync_state").unwrap().as_deref(), Some("error"));
}

#[test]
fn test_sync_all_stops_at_group_boundary_when_cancelled() {
    let dir = directory_with_staff(&["alice"]);
    let sales = "cn=sales,ou=groups,dc=example,dc=com";
    dir.insert(group(sales, &[user_dn("alice")]));
    let config = config_with(
        "",
        &format!(
            r#""XWiki.Sales" = ["{sales}"]
"XWiki.Staff" = ["{STAFF_DN}"]"#
        ),
    );
    let engine = engine_with(&config, FlakyStore::failing_group_save(0), &dir);
    engine
        .store()
        .cancel_after_save
        .set(engine.cancel_handle())
        .unwrap();

    // Sales is reconciled, then the flag raised by its commit stops the run.
    let report = engine.sync_all().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].group, reference("Sales"));
    assert_eq!(report.groups[0].state, GroupSyncState::Done);
    assert!(report.failed.is_empty());
    assert!(!report.is_success());
    assert!(!engine.store().inner.exists(&staff()).unwrap());
    assert!(!engine.is_running());
}

#[test]
fn test_concurrent_passes_do_not_duplicate() {
    let uids: Vec<String> = (0..50).map(|i| format!("user{i:02}")).collect();
    let uid_refs: Vec<&str> = uids.iter().map(String::as_str).collect();
    let dir = directory_with_staff(&uid_refs);
    let engine = engine_with(&staff_config(""), database(), &dir);

    let reports: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| engine.sync_group("XWiki.Staff")))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let added: usize = reports.iter().map(|r| r.as_ref().unwrap().added).sum();
    assert_eq!(added, 50);

    let doc = engine.store().load_group(&staff()).unwrap();
    assert_eq!(doc.len(), 50);
    let distinct: BTreeSet<_> = doc.records().map(|r| r.member.clone()).collect();
    assert_eq!(distinct.len(), 50);
    assert_eq!(dir.open_sessions(), 0);
}

#[test]
fn test_import_users_adds_to_group_once() {
    let dir = directory_with_staff(&["alice", "bob"]);
    let engine = engine_with(&staff_config(""), database(), &dir);
    let uids = vec!["alice".to_string(), "nobody".to_string()];

    let report = engine.import_users(&uids, Some("XWiki.Staff")).unwrap();
    assert_eq!(report.users.len(), 2);
    assert!(report.users[0].created);
    assert_eq!(report.users[0].reference, Some(reference("alice")));
    assert!(report.users[1].error.is_some());
    assert_eq!(report.added_to_group, 1);

    let again = engine.import_users(&uids, Some("XWiki.Staff")).unwrap();
    assert!(!again.users[0].created);
    assert_eq!(again.added_to_group, 0);
    assert_eq!(group_members(engine.store(), &staff()), vec!["alice"]);
}

#[test]
fn test_search_users_caps_results() {
    let uids: Vec<String> = (0..25).map(|i| format!("user{i:02}")).collect();
    let uid_refs: Vec<&str> = uids.iter().map(String::as_str).collect();
    let dir = directory_with_staff(&uid_refs);
    let engine = engine_with(&staff_config("search_fields = \"uid\""), database(), &dir);

    let capped = engine.search_users(None, "user", false).unwrap();
    assert_eq!(capped.users.len(), 20);
    assert!(capped.reached_limit);
    assert!(engine.reached_limit(capped.users.len()));

    let narrow = engine.search_users(None, "user1", false).unwrap();
    assert!(!narrow.reached_limit);
    let found: Vec<_> = narrow.users.iter().filter_map(|u| u.uid.clone()).collect();
    assert_eq!(found.len(), 10);
    assert_eq!(found[0], "user10");
    assert!(narrow.users.iter().all(|u| !u.exists));
}

#[test]
fn test_search_users_marks_existing_identities() {
    let dir = directory_with_staff(&["alice", "alina"]);
    let engine = engine_with(&staff_config(""), database(), &dir);
    engine.import_users(&["alice".to_string()], None).unwrap();

    let results = engine.search_users(Some("uid"), "ali", false).unwrap();
    let exists: Vec<(String, bool)> = results
        .users
        .iter()
        .map(|u| (u.uid.clone().unwrap_or_default(), u.exists))
        .collect();
    assert_eq!(exists, vec![("alice".to_string(), true), ("alina".to_string(), false)]);

    let none = engine.search_users(Some("uid"), "zzz", true).unwrap();
    assert!(none.users.is_empty());
}

#[test]
fn test_search_groups_flags_associated() {
    let dir = directory_with_staff(&["alice"]);
    dir.insert(group("cn=stage,ou=groups,dc=example,dc=com", &[]));
    let engine = engine_with(&staff_config(""), database(), &dir);

    let results = engine.search_groups("sta", Some("XWiki.Staff"), false).unwrap();
    let flags: Vec<(String, bool)> = results
        .groups
        .iter()
        .map(|g| (g.name.clone().unwrap_or_default(), g.associated))
        .collect();
    assert_eq!(flags, vec![("staff".to_string(), true), ("stage".to_string(), false)]);
}

#[test]
fn test_mapped_groups_listing() {
    let dir = InMemoryDirectory::new();
    let engine = engine_with(&staff_config(""), database(), &dir);
    let mapped = engine.mapped_groups();
    assert_eq!(mapped.len(), 1);
    assert_eq!(mapped[0].group, staff());
    assert_eq!(mapped[0].directory_groups, BTreeSet::from([STAFF_DN.to_string()]));
}
