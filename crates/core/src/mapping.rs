//! Translation of directory attributes into local identity fields.
//!
//! The site configures `localField=externalAttribute` pairs. They are merged
//! with [`DEFAULT_FIELDS_MAPPING`]: configured pairs win, default pairs only
//! fill in local fields nobody configured. The identifier attribute always
//! maps to the `uid` field.

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::config::LdapConfig;
use crate::directory::DirectoryEntry;

/// Mapping applied when the site configures none.
pub const DEFAULT_FIELDS_MAPPING: &str = "first_name=givenName,last_name=sn,email=mail";

/// Local field receiving the identifier attribute.
pub const UID_FIELD: &str = "uid";

/// Local field receiving the base64-encoded profile photo.
pub const AVATAR_FIELD: &str = "avatar";

/// Split a `local=external,...` mapping string into `(local, external)` pairs.
///
/// Malformed pairs are skipped with a warning.
pub fn parse_fields_mapping(mapping: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for item in mapping.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.split_once('=') {
            Some((local, external)) if !local.trim().is_empty() && !external.trim().is_empty() => {
                pairs.push((local.trim().to_string(), external.trim().to_string()));
            }
            _ => warn!(item, "ignoring malformed field mapping entry"),
        }
    }
    pairs
}

/// Merged external attribute -> local field mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeMapping {
    uid_attribute: String,
    /// Lowercased external attribute -> (external attribute as configured, local field).
    fields: BTreeMap<String, (String, String)>,
    default_attributes: Vec<String>,
    photo_attribute: Option<String>,
}

impl AttributeMapping {
    /// Merge `configured` over the built-in defaults.
    ///
    /// `photo_attribute` is `Some` only when photo sync is enabled.
    pub fn new(uid_attribute: &str, configured: &str, photo_attribute: Option<&str>) -> Self {
        let mut fields: BTreeMap<String, (String, String)> = BTreeMap::new();
        fields.insert(
            uid_attribute.to_ascii_lowercase(),
            (uid_attribute.to_string(), UID_FIELD.to_string()),
        );

        for (local, external) in parse_fields_mapping(configured) {
            fields.insert(external.to_ascii_lowercase(), (external, local));
        }

        let defaults = parse_fields_mapping(DEFAULT_FIELDS_MAPPING);
        for (local, external) in &defaults {
            let key = external.to_ascii_lowercase();
            let local_taken = fields.values().any(|(_, l)| l == local);
            if !local_taken && !fields.contains_key(&key) {
                fields.insert(key, (external.clone(), local.clone()));
            }
        }

        debug!(fields = fields.len(), "built attribute mapping");
        Self {
            uid_attribute: uid_attribute.to_string(),
            fields,
            default_attributes: defaults.into_iter().map(|(_, external)| external).collect(),
            photo_attribute: photo_attribute.map(str::to_string),
        }
    }

    pub fn from_config(config: &LdapConfig) -> Self {
        let photo = config
            .update_photo
            .then_some(config.photo_attribute.as_str());
        Self::new(&config.uid_attribute, config.effective_fields_mapping(), photo)
    }

    pub fn uid_attribute(&self) -> &str {
        &self.uid_attribute
    }

    /// Local field a directory attribute maps to.
    pub fn local_field(&self, attribute: &str) -> Option<&str> {
        self.fields
            .get(&attribute.to_ascii_lowercase())
            .map(|(_, local)| local.as_str())
    }

    /// Every attribute to request from the directory.
    pub fn attributes(&self) -> BTreeSet<String> {
        let mut attributes: BTreeSet<String> = BTreeSet::new();
        attributes.insert(self.uid_attribute.clone());
        attributes.extend(self.fields.values().map(|(external, _)| external.clone()));
        if let Some(photo) = &self.photo_attribute {
            attributes.insert(photo.clone());
        }
        attributes.extend(self.default_attributes.iter().cloned());
        attributes
    }

    /// Local field values for `entry`. Attributes the entry lacks are omitted.
    pub fn translate(&self, entry: &DirectoryEntry) -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        for (external, local) in self.fields.values() {
            if let Some(value) = entry.get(external) {
                values.insert(local.clone(), value.to_string());
            }
        }
        if let Some(photo) = self
            .photo_attribute
            .as_deref()
            .and_then(|attribute| entry.binary(attribute))
        {
            values.insert(AVATAR_FIELD.to_string(), BASE64.encode(photo));
        }
        values
    }
}
