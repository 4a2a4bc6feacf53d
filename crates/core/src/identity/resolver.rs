//! Local reference derivation and existence classification.

use regex_lite::Regex;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::directory::DirectoryEntry;
use crate::errors::{ConfigError, DatabaseError};
use crate::mapping::UID_FIELD;
use crate::models::LocalReference;
use crate::store::LocalStore;

const PLACEHOLDER: &str = r"\$\{([^}]+)\}";

/// Remove the characters a page name cannot carry.
pub fn clean_page_name(name: &str) -> String {
    name.chars().filter(|c| *c != '.' && *c != ' ').collect()
}

/// Renders page names from `${attribute}` templates.
///
/// `${uid}` stands for the identifier value whatever the identifier
/// attribute is called; any other placeholder reads the entry attribute of
/// that name, and an absent attribute renders as nothing.
#[derive(Debug, Clone)]
pub struct PageNameFormatter {
    format: String,
    placeholder: Regex,
}

impl PageNameFormatter {
    pub fn new(format: &str) -> Result<Self, ConfigError> {
        let placeholder = Regex::new(PLACEHOLDER).map_err(|e| ConfigError::InvalidValue {
            field: "import.user_page_name_format".into(),
            detail: e.to_string(),
        })?;
        let stripped = placeholder.replace_all(format, "");
        if stripped.contains("${") {
            return Err(ConfigError::InvalidValue {
                field: "import.user_page_name_format".into(),
                detail: format!("unterminated placeholder in '{format}'"),
            });
        }
        Ok(Self {
            format: format.to_string(),
            placeholder,
        })
    }

    /// Attribute names referenced by the template (`uid` excluded).
    pub fn attributes(&self) -> Vec<String> {
        self.placeholder
            .captures_iter(&self.format)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|name| name != UID_FIELD)
            .collect()
    }

    /// Cleaned page name for `entry`, whose identifier value is `uid`.
    pub fn format(&self, entry: &DirectoryEntry, uid: &str) -> String {
        let rendered = self
            .placeholder
            .replace_all(&self.format, |caps: &regex_lite::Captures<'_>| {
                let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                if name == UID_FIELD {
                    uid.to_string()
                } else {
                    entry.get(name).unwrap_or_default().to_string()
                }
            });
        clean_page_name(&rendered)
    }
}

/// How a directory entry relates to the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No identity exists yet; it must be imported.
    Absent(LocalReference),
    /// An identity exists; it must be synchronized.
    Present(LocalReference),
    /// The entry has no usable identifier and is skipped.
    Unresolved,
}

impl Resolution {
    pub fn reference(&self) -> Option<&LocalReference> {
        match self {
            Resolution::Absent(r) | Resolution::Present(r) => Some(r),
            Resolution::Unresolved => None,
        }
    }
}

/// Derives the local reference of a directory entry and checks whether it exists.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    wiki: String,
    space: String,
    uid_attribute: String,
    formatter: PageNameFormatter,
}

impl IdentityResolver {
    pub fn new(
        wiki: impl Into<String>,
        space: impl Into<String>,
        uid_attribute: impl Into<String>,
        formatter: PageNameFormatter,
    ) -> Self {
        Self {
            wiki: wiki.into(),
            space: space.into(),
            uid_attribute: uid_attribute.into(),
            formatter,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            &config.import.wiki,
            &config.import.user_space,
            &config.ldap.uid_attribute,
            PageNameFormatter::new(&config.import.user_page_name_format)?,
        ))
    }

    /// Attributes needed to name an entry.
    pub fn attributes(&self) -> Vec<String> {
        let mut attributes = vec![self.uid_attribute.clone()];
        attributes.extend(self.formatter.attributes());
        attributes
    }

    /// The identifier value of `entry`, if it has a non-blank one.
    pub fn uid<'e>(&self, entry: &'e DirectoryEntry) -> Option<&'e str> {
        entry.get_non_blank(&self.uid_attribute)
    }

    /// Reference the identity for `entry` would have, without touching the store.
    pub fn reference_for(&self, entry: &DirectoryEntry) -> Option<LocalReference> {
        let uid = self.uid(entry)?;
        let name = self.formatter.format(entry, uid);
        if name.is_empty() {
            return None;
        }
        Some(LocalReference::new(&self.wiki, &self.space, name))
    }

    /// Classify `entry` against `store`.
    pub fn resolve<S>(&self, entry: &DirectoryEntry, store: &S) -> Result<Resolution, DatabaseError>
    where
        S: LocalStore + ?Sized,
    {
        let Some(reference) = self.reference_for(entry) else {
            warn!(dn = %entry.dn, attribute = %self.uid_attribute, "directory entry has no identifier, skipping");
            return Ok(Resolution::Unresolved);
        };
        if store.exists(&reference)? {
            debug!(dn = %entry.dn, reference = %reference, "identity present");
            Ok(Resolution::Present(reference))
        } else {
            debug!(dn = %entry.dn, reference = %reference, "identity absent");
            Ok(Resolution::Absent(reference))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::IdentityDocument;

    fn resolver(format: &str) -> IdentityResolver {
        IdentityResolver::new("xwiki", "XWiki", "uid", PageNameFormatter::new(format).unwrap())
    }

    fn entry() -> DirectoryEntry {
        DirectoryEntry::new("uid=john.doe,ou=people,dc=example,dc=com")
            .with("uid", "john.doe")
            .with("givenName", "John")
            .with("sn", "Van Doe")
    }

    #[test]
    fn test_default_format_cleans_identifier() {
        let r = resolver("${uid}");
        assert_eq!(
            r.reference_for(&entry()),
            Some(LocalReference::new("xwiki", "XWiki", "johndoe"))
        );
    }

    #[test]
    fn test_format_with_attributes() {
        let r = resolver("${givenName}${sn}-${title}");
        assert_eq!(r.reference_for(&entry()).unwrap().name, "JohnVanDoe-");
        assert_eq!(r.attributes(), vec!["uid", "givenName", "sn", "title"]);
    }

    #[test]
    fn test_unterminated_placeholder_is_rejected() {
        assert!(PageNameFormatter::new("${uid").is_err());
        assert!(PageNameFormatter::new("user-${uid}").is_ok());
    }

    #[test]
    fn test_missing_identifier_is_unresolved() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let r = resolver("${uid}");

        let no_uid = DirectoryEntry::new("cn=printer,dc=example,dc=com").with("cn", "printer");
        assert_eq!(r.resolve(&no_uid, &db).unwrap(), Resolution::Unresolved);

        let blank = DirectoryEntry::new("uid= ,dc=example,dc=com").with("uid", "  ");
        assert_eq!(r.resolve(&blank, &db).unwrap(), Resolution::Unresolved);

        let only_dots = DirectoryEntry::new("uid=..,dc=example,dc=com").with("uid", "..");
        assert_eq!(r.resolve(&only_dots, &db).unwrap(), Resolution::Unresolved);
    }

    #[test]
    fn test_existence_is_checked_in_store() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let r = resolver("${uid}");

        let reference = LocalReference::new("xwiki", "XWiki", "johndoe");
        assert_eq!(r.resolve(&entry(), &db).unwrap(), Resolution::Absent(reference.clone()));

        let mut doc = IdentityDocument::new(reference.clone());
        db.save_identity(&mut doc, "test").unwrap();
        assert_eq!(r.resolve(&entry(), &db).unwrap(), Resolution::Present(reference));
    }
}
