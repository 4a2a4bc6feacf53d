//! Expansion of directory groups into their user entries.
//!
//! Starting from the external groups mapped to one local group, member
//! references are followed breadth-first. Sub-groups are expanded up to a
//! maximum depth, each group is visited once (cycles are counted and
//! skipped) and users are collected once per DN.

use std::collections::{BTreeSet, HashSet, VecDeque};

use tracing::{debug, info, warn};

use super::filter;
use super::{CursorConsumer, DirectoryEntry, DirectorySession, DrainStop, SearchQuery, SearchScope};
use crate::config::LdapConfig;
use crate::errors::DirectoryError;

/// Attribute holding bare user identifiers instead of DNs (posixGroup).
const MEMBER_UID_ATTRIBUTE: &str = "memberUid";

/// Users found under a set of directory groups.
#[derive(Debug, Clone, Default)]
pub struct GroupMembers {
    /// User entries, in discovery order, each at most once.
    pub members: Vec<DirectoryEntry>,
    /// Referral targets met during the walk. Results gathered before them are kept.
    pub referrals: Vec<String>,
    /// Referenced DNs that do not exist.
    pub missing: Vec<String>,
    pub cycles_detected: usize,
    /// Whether some group was left unexpanded at the depth limit.
    pub depth_reached: bool,
}

/// How directory groups are recognized and walked.
#[derive(Debug, Clone)]
pub struct GroupExpansion {
    base_dn: String,
    uid_attribute: String,
    group_classes: BTreeSet<String>,
    member_attributes: Vec<String>,
    max_depth: u32,
    attributes: Vec<String>,
}

impl GroupExpansion {
    /// `attributes` are the user attributes read along the way.
    pub fn new(config: &LdapConfig, attributes: impl IntoIterator<Item = String>) -> Self {
        let group_classes = config
            .group_classes
            .split(',')
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        let mut requested: BTreeSet<String> = attributes.into_iter().collect();
        requested.insert("objectClass".to_string());
        requested.extend(config.group_member_attributes.iter().cloned());

        Self {
            base_dn: config.base_dn.clone(),
            uid_attribute: config.uid_attribute.clone(),
            group_classes,
            member_attributes: config.group_member_attributes.clone(),
            max_depth: config.max_group_depth,
            attributes: requested.into_iter().collect(),
        }
    }

    fn is_group(&self, entry: &DirectoryEntry) -> bool {
        entry
            .values("objectClass")
            .iter()
            .any(|c| self.group_classes.contains(&c.to_ascii_lowercase()))
            || self.member_attributes.iter().any(|a| entry.has(a))
    }

    /// Walk `group_dns` and collect every user below them.
    ///
    /// Transport errors abort the walk; referrals are recorded and skipped.
    pub fn expand(
        &self,
        session: &mut dyn DirectorySession,
        group_dns: &BTreeSet<String>,
    ) -> Result<GroupMembers, DirectoryError> {
        let mut result = GroupMembers::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut groups_seen: HashSet<String> = HashSet::new();
        let mut users_seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, u32)> = group_dns.iter().map(|dn| (dn.clone(), 0)).collect();

        while let Some((dn, depth)) = queue.pop_front() {
            let key = dn.to_ascii_lowercase();
            if !visited.insert(key.clone()) {
                if groups_seen.contains(&key) {
                    result.cycles_detected += 1;
                }
                continue;
            }

            let Some(entry) = self.read(session, &dn, &mut result)? else {
                continue;
            };

            if !self.is_group(&entry) {
                if users_seen.insert(key) {
                    result.members.push(entry);
                }
                continue;
            }

            groups_seen.insert(key);
            if depth >= self.max_depth {
                result.depth_reached = true;
                continue;
            }

            for attribute in &self.member_attributes {
                for value in entry.values(attribute) {
                    if attribute.eq_ignore_ascii_case(MEMBER_UID_ATTRIBUTE) {
                        for user in self.lookup_uid(session, value, &mut result)? {
                            if users_seen.insert(user.dn.to_ascii_lowercase()) {
                                result.members.push(user);
                            }
                        }
                    } else {
                        queue.push_back((value.clone(), depth + 1));
                    }
                }
            }
        }

        if result.cycles_detected > 0 {
            warn!(cycles = result.cycles_detected, "circular group nesting detected");
        }
        if result.depth_reached {
            info!(max_depth = self.max_depth, "max nesting depth reached during group expansion");
        }
        debug!(
            members = result.members.len(),
            missing = result.missing.len(),
            referrals = result.referrals.len(),
            "expanded directory groups"
        );
        Ok(result)
    }

    fn read(
        &self,
        session: &mut dyn DirectorySession,
        dn: &str,
        result: &mut GroupMembers,
    ) -> Result<Option<DirectoryEntry>, DirectoryError> {
        let query = SearchQuery::read(dn).with_attributes(self.attributes.iter().cloned());
        let mut cursor = session.search(&query)?;
        let drained = CursorConsumer::unbounded().drain(cursor.as_mut())?;
        if let DrainStop::Referral(target) = &drained.stop {
            result.referrals.push(target.clone());
        }
        let entry = drained.entries.into_iter().next();
        if entry.is_none() && drained.stop == DrainStop::Exhausted {
            debug!(dn, "referenced directory entry not found");
            result.missing.push(dn.to_string());
        }
        Ok(entry)
    }

    fn lookup_uid(
        &self,
        session: &mut dyn DirectorySession,
        uid: &str,
        result: &mut GroupMembers,
    ) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let query = SearchQuery::new(
            &self.base_dn,
            SearchScope::Subtree,
            filter::equality(&self.uid_attribute, uid),
        )
        .with_attributes(self.attributes.iter().cloned());
        let mut cursor = session.search(&query)?;
        let drained = CursorConsumer::unbounded().drain(cursor.as_mut())?;
        if let DrainStop::Referral(target) = &drained.stop {
            result.referrals.push(target.clone());
        }
        if drained.entries.is_empty() {
            result.missing.push(uid.to_string());
        }
        Ok(drained
            .entries
            .into_iter()
            .filter(|e| !self.is_group(e))
            .collect())
    }
}

/// Read one entry by DN with the given attributes.
///
/// Returns `Ok(None)` when the entry does not exist; a referral is an error
/// here since there is no partial result to keep.
pub fn read_entry(
    session: &mut dyn DirectorySession,
    dn: &str,
    attributes: &[String],
) -> Result<Option<DirectoryEntry>, DirectoryError> {
    let query = SearchQuery::read(dn).with_attributes(attributes.iter().cloned());
    let mut cursor = session.search(&query)?;
    let drained = CursorConsumer::unbounded().drain(cursor.as_mut())?;
    if let DrainStop::Referral(target) = drained.stop {
        return Err(DirectoryError::Referral { target });
    }
    Ok(drained.entries.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryConnector, InMemoryDirectory};

    fn config(max_depth: u32) -> LdapConfig {
        let mut config: LdapConfig = toml::from_str(
            r#"
url = "ldap://localhost"
base_dn = "dc=example,dc=com"
uid_attribute = "uid"
"#,
        )
        .unwrap();
        config.max_group_depth = max_depth;
        config
    }

    fn user(uid: &str) -> DirectoryEntry {
        DirectoryEntry::new(format!("uid={uid},ou=people,dc=example,dc=com"))
            .with("objectClass", "inetOrgPerson")
            .with("uid", uid)
    }

    fn group(cn: &str, members: &[&str]) -> DirectoryEntry {
        let mut entry = DirectoryEntry::new(format!("cn={cn},ou=groups,dc=example,dc=com"))
            .with("objectClass", "groupOfNames")
            .with("cn", cn);
        for m in members {
            entry.push("member", *m);
        }
        entry
    }

    fn expand(dir: &InMemoryDirectory, max_depth: u32, roots: &[&str]) -> GroupMembers {
        let expansion = GroupExpansion::new(&config(max_depth), vec!["uid".to_string()]);
        let mut session = dir.connect().unwrap();
        let roots: BTreeSet<String> = roots.iter().map(|s| s.to_string()).collect();
        expansion.expand(session.as_mut(), &roots).unwrap()
    }

    fn uids(members: &GroupMembers) -> Vec<&str> {
        let mut uids: Vec<&str> = members.members.iter().filter_map(|e| e.get("uid")).collect();
        uids.sort_unstable();
        uids
    }

    #[test]
    fn test_nested_groups_are_flattened_once() {
        let dir = InMemoryDirectory::new();
        for uid in ["alice", "bob", "carol"] {
            dir.insert(user(uid));
        }
        dir.insert(group(
            "eng",
            &[
                "uid=alice,ou=people,dc=example,dc=com",
                "cn=backend,ou=groups,dc=example,dc=com",
            ],
        ));
        dir.insert(group(
            "backend",
            &[
                "uid=bob,ou=people,dc=example,dc=com",
                "UID=alice,ou=people,dc=example,dc=com",
            ],
        ));
        dir.insert(group("ops", &["uid=carol,ou=people,dc=example,dc=com"]));

        let result = expand(
            &dir,
            10,
            &[
                "cn=eng,ou=groups,dc=example,dc=com",
                "cn=ops,ou=groups,dc=example,dc=com",
            ],
        );
        assert_eq!(uids(&result), vec!["alice", "bob", "carol"]);
        assert_eq!(result.cycles_detected, 0);
    }

    #[test]
    fn test_cycle_is_detected() {
        let dir = InMemoryDirectory::new();
        dir.insert(user("alice"));
        dir.insert(group(
            "a",
            &["cn=b,ou=groups,dc=example,dc=com", "uid=alice,ou=people,dc=example,dc=com"],
        ));
        dir.insert(group("b", &["cn=a,ou=groups,dc=example,dc=com"]));

        let result = expand(&dir, 10, &["cn=a,ou=groups,dc=example,dc=com"]);
        assert_eq!(uids(&result), vec!["alice"]);
        assert_eq!(result.cycles_detected, 1);
    }

    #[test]
    fn test_depth_limit_stops_expansion() {
        let dir = InMemoryDirectory::new();
        dir.insert(user("alice"));
        dir.insert(user("deep"));
        dir.insert(group(
            "top",
            &["uid=alice,ou=people,dc=example,dc=com", "cn=sub,ou=groups,dc=example,dc=com"],
        ));
        dir.insert(group("sub", &["uid=deep,ou=people,dc=example,dc=com"]));

        let result = expand(&dir, 1, &["cn=top,ou=groups,dc=example,dc=com"]);
        assert_eq!(uids(&result), vec!["alice"]);
        assert!(result.depth_reached);
    }

    #[test]
    fn test_member_uid_values_are_looked_up() {
        let dir = InMemoryDirectory::new();
        dir.insert(user("alice"));
        dir.insert(
            DirectoryEntry::new("cn=devs,ou=groups,dc=example,dc=com")
                .with("objectClass", "posixGroup")
                .with("memberUid", "alice")
                .with("memberUid", "ghost"),
        );

        let result = expand(&dir, 10, &["cn=devs,ou=groups,dc=example,dc=com"]);
        assert_eq!(uids(&result), vec!["alice"]);
        assert_eq!(result.missing, vec!["ghost".to_string()]);
    }

    #[test]
    fn test_missing_members_and_referrals_are_reported() {
        let dir = InMemoryDirectory::new();
        dir.insert(user("alice"));
        dir.insert(group(
            "eng",
            &[
                "uid=alice,ou=people,dc=example,dc=com",
                "uid=gone,ou=people,dc=example,dc=com",
                "cn=remote,ou=partners,dc=example,dc=com",
            ],
        ));
        dir.refer("ou=partners,dc=example,dc=com", "ldap://partners.example.com/");

        let result = expand(&dir, 10, &["cn=eng,ou=groups,dc=example,dc=com"]);
        assert_eq!(uids(&result), vec!["alice"]);
        assert_eq!(result.missing, vec!["uid=gone,ou=people,dc=example,dc=com".to_string()]);
        assert_eq!(result.referrals, vec!["ldap://partners.example.com/".to_string()]);
    }

    #[test]
    fn test_transport_error_aborts() {
        let dir = InMemoryDirectory::new();
        dir.insert(user("alice"));
        dir.insert(group("eng", &["uid=alice,ou=people,dc=example,dc=com"]));
        dir.fail_on("uid=alice,ou=people,dc=example,dc=com");

        let expansion = GroupExpansion::new(&config(10), vec!["uid".to_string()]);
        let mut session = dir.connect().unwrap();
        let roots: BTreeSet<String> = ["cn=eng,ou=groups,dc=example,dc=com".to_string()].into();
        let result = expansion.expand(session.as_mut(), &roots);
        assert!(matches!(result, Err(DirectoryError::Transport(_))));
    }
}
