//! Operator-facing directory searches.
//!
//! User searches are capped at `max_import_results`; a capped result carries
//! whatever the server returned first, in server order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::directory::{filter, CursorConsumer, DirectoryEntry, DrainStop, SearchQuery, SearchScope};
use crate::errors::SyncError;
use crate::identity::Resolution;
use crate::store::LocalStore;
use crate::sync_engine::SyncEngine;

/// A directory user matched by a search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserHit {
    pub uid: Option<String>,
    pub dn: String,
    /// Local reference the user is (or would be) stored under.
    pub reference: Option<String>,
    /// Whether the local identity already exists.
    pub exists: bool,
    /// Mapped local fields.
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSearchResults {
    pub users: Vec<UserHit>,
    /// More matches exist than were returned.
    pub reached_limit: bool,
    pub referral: Option<String>,
}

/// A directory group matched by a search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupHit {
    pub dn: String,
    pub name: Option<String>,
    /// The group is already mapped to the requested local group.
    pub associated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupSearchResults {
    pub groups: Vec<GroupHit>,
    pub reached_limit: bool,
    pub referral: Option<String>,
}

/// Split a comma separated field list.
fn split_fields(fields: &str) -> Vec<String> {
    fields
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

impl<S: LocalStore> SyncEngine<S> {
    /// Whether a list of `count` results hit the configured result cap.
    pub fn reached_limit(&self, count: usize) -> bool {
        count >= self.settings().max_import_results
    }

    /// Search directory users.
    ///
    /// `field` restricts the search to one attribute; with single-field search
    /// configured and no field given, the first configured search field is
    /// used. `full` matches the input anywhere in the field instead of as a prefix.
    pub fn search_users(&self, field: Option<&str>, input: &str, full: bool) -> Result<UserSearchResults, SyncError> {
        let settings = self.settings();
        let configured = split_fields(&settings.search_fields);
        let fields = match field {
            Some(field) => vec![field.to_string()],
            None if settings.single_field_search => configured.into_iter().take(1).collect(),
            None => configured,
        };

        let query = SearchQuery::new(
            &settings.base_dn,
            SearchScope::Subtree,
            filter::search_filter(&fields.join(","), input, full, &settings.user_classes),
        )
        .with_attributes(settings.user_attributes.iter().cloned());
        debug!(filter = %query.filter, "searching directory users");

        let drained = {
            let mut session = self.connector().connect()?;
            let mut cursor = session.search(&query)?;
            CursorConsumer::unbounded()
                .with_max_results(settings.max_import_results)
                .sorted_by(settings.mapping.uid_attribute())
                .drain(cursor.as_mut())?
        };

        let mut results = UserSearchResults {
            reached_limit: drained.stop == DrainStop::Capped,
            referral: drained.referral().map(str::to_string),
            ..Default::default()
        };
        for entry in drained.entries {
            results.users.push(self.user_hit(entry));
        }

        info!(
            matches = results.users.len(),
            reached_limit = results.reached_limit,
            "directory user search finished"
        );
        Ok(results)
    }

    fn user_hit(&self, entry: DirectoryEntry) -> UserHit {
        let settings = self.settings();
        let (reference, exists) = match settings.resolver.resolve(&entry, self.store()) {
            Ok(Resolution::Present(reference)) => (Some(reference.to_string()), true),
            Ok(Resolution::Absent(reference)) => (Some(reference.to_string()), false),
            Ok(Resolution::Unresolved) => (None, false),
            Err(e) => {
                warn!(dn = %entry.dn, error = %e, "cannot check local identity");
                (settings.resolver.reference_for(&entry).map(|r| r.to_string()), false)
            }
        };
        UserHit {
            uid: settings.resolver.uid(&entry).map(str::to_string),
            fields: settings.mapping.translate(&entry),
            dn: entry.dn,
            reference,
            exists,
        }
    }

    /// Search directory groups, flagging those mapped to `local_group`.
    pub fn search_groups(
        &self,
        input: &str,
        local_group: Option<&str>,
        full: bool,
    ) -> Result<GroupSearchResults, SyncError> {
        let settings = self.settings();
        let fields = split_fields(&settings.group_search_fields);
        let name_attribute = fields.first().cloned().unwrap_or_else(|| "cn".to_string());

        let query = SearchQuery::new(
            &settings.base_dn,
            SearchScope::Subtree,
            filter::search_filter(&settings.group_search_fields, input, full, &settings.group_classes),
        )
        .with_attributes(fields.iter().cloned());
        debug!(filter = %query.filter, "searching directory groups");

        let drained = {
            let mut session = self.connector().connect()?;
            let mut cursor = session.search(&query)?;
            CursorConsumer::unbounded()
                .with_max_results(settings.max_import_results)
                .sorted_by(&name_attribute)
                .drain(cursor.as_mut())?
        };

        let mapped: Vec<String> = local_group
            .map(|name| settings.group_reference(name))
            .and_then(|reference| settings.group_mappings.get(&reference))
            .map(|dns| dns.iter().map(|dn| dn.to_ascii_lowercase()).collect())
            .unwrap_or_default();

        let groups = drained
            .entries
            .iter()
            .map(|entry| GroupHit {
                dn: entry.dn.clone(),
                name: entry.get_non_blank(&name_attribute).map(str::to_string),
                associated: mapped.contains(&entry.dn.to_ascii_lowercase()),
            })
            .collect();

        Ok(GroupSearchResults {
            groups,
            reached_limit: drained.stop == DrainStop::Capped,
            referral: drained.referral().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_fields() {
        assert_eq!(split_fields("cn, mail,,uid "), vec!["cn", "mail", "uid"]);
        assert!(split_fields(" ").is_empty());
    }
}
