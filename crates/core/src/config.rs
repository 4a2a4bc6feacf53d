//! TOML-based configuration system for ldapsync.
//!
//! All sensitive values (bind passwords) are stored as `_env` fields that
//! reference environment variable names. The actual secrets are resolved at
//! runtime via [`AppConfig::resolve_env_vars`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::mapping::DEFAULT_FIELDS_MAPPING;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / polling settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Directory connection and schema settings.
    pub ldap: LdapConfig,

    /// Import and reconciliation policy.
    #[serde(default)]
    pub import: ImportConfig,

    /// Local group reference -> directory group DNs.
    #[serde(default)]
    pub groups: BTreeMap<String, BTreeSet<String>>,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between reconciliation passes (default 3600).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (the document store database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_poll_interval() -> u64 {
    3600
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/ldapsync")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl DaemonConfig {
    /// Path of the SQLite document store inside `data_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("ldapsync.db")
    }
}

// ---------------------------------------------------------------------------
// LDAP
// ---------------------------------------------------------------------------

/// Directory connection and schema settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// Server URL (`ldap://host:389` or `ldaps://host:636`).
    pub url: String,

    /// DN used for the simple bind. Empty means anonymous.
    #[serde(default)]
    pub bind_dn: String,

    /// Environment variable holding the bind password.
    #[serde(default)]
    pub bind_password_env: Option<String>,

    /// Base DN for user searches.
    pub base_dn: String,

    /// Attribute holding the unique user identifier.
    #[serde(default = "default_uid_attribute")]
    pub uid_attribute: String,

    /// `localField=externalAttribute` pairs separated by `,`.
    #[serde(default)]
    pub fields_mapping: Option<String>,

    /// Object classes identifying users (`*` matches any entry).
    #[serde(default = "default_user_classes")]
    pub user_classes: String,

    /// Object classes identifying groups.
    #[serde(default = "default_group_classes")]
    pub group_classes: String,

    /// Attributes matched by group searches.
    #[serde(default = "default_group_search_fields")]
    pub group_search_fields: String,

    /// Attributes listing the members of a group entry.
    #[serde(default = "default_group_member_attributes")]
    pub group_member_attributes: Vec<String>,

    /// Maximum nesting depth followed when expanding sub-groups.
    #[serde(default = "default_max_group_depth")]
    pub max_group_depth: u32,

    /// Synchronize the profile photo attribute.
    #[serde(default)]
    pub update_photo: bool,

    /// Attribute holding the profile photo.
    #[serde(default = "default_photo_attribute")]
    pub photo_attribute: String,

    /// Paged-results page size requested from the server.
    #[serde(default = "default_page_size")]
    pub page_size: i32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upgrade plain `ldap://` connections with StartTLS.
    #[serde(default)]
    pub starttls: bool,

    /// Resolved bind password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub bind_password: Option<String>,
}

fn default_uid_attribute() -> String {
    "cn".into()
}
fn default_user_classes() -> String {
    "*".into()
}
fn default_group_classes() -> String {
    "group,groupOfNames,groupOfUniqueNames,dynamicGroup,dynamicGroupAux,\
     groupWiseDistributionList,posixGroup,apple-group"
        .into()
}
fn default_group_search_fields() -> String {
    "cn".into()
}
fn default_group_member_attributes() -> Vec<String> {
    vec!["member".into(), "uniqueMember".into(), "memberUid".into()]
}
fn default_max_group_depth() -> u32 {
    10
}
fn default_photo_attribute() -> String {
    "thumbnailPhoto".into()
}
fn default_page_size() -> i32 {
    500
}
fn default_connect_timeout() -> u64 {
    10
}

impl LdapConfig {
    /// The configured field mapping, or the built-in default when blank.
    pub fn effective_fields_mapping(&self) -> &str {
        match self.fields_mapping.as_deref() {
            Some(m) if !m.trim().is_empty() => m,
            _ => DEFAULT_FIELDS_MAPPING,
        }
    }
}

// ---------------------------------------------------------------------------
// Import policy
// ---------------------------------------------------------------------------

/// Import and reconciliation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Wiki that owns imported identities and groups.
    #[serde(default = "default_wiki")]
    pub wiki: String,

    /// Space under which identity documents are created.
    #[serde(default = "default_user_space")]
    pub user_space: String,

    /// Page name format for new identities, with `${attribute}` placeholders.
    #[serde(default = "default_page_name_format")]
    pub user_page_name_format: String,

    /// Maximum number of results returned by a user search.
    #[serde(default = "default_max_import_results")]
    pub max_import_results: usize,

    /// Also remove members that were never imported from the directory.
    #[serde(default)]
    pub force_non_directory_membership_update: bool,

    /// Membership mutations per group save.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Let the daemon synchronize every mapped group on each poll.
    #[serde(default)]
    pub trigger_group_update: bool,

    /// Attach a federated identity (subject + issuer) to new identities.
    #[serde(default)]
    pub federated_identity_enabled: bool,

    /// Issuer recorded on attached federated identities.
    #[serde(default)]
    pub federated_identity_issuer: String,

    /// Restrict user searches to a single field.
    #[serde(default)]
    pub single_field_search: bool,

    /// Fields matched by user searches, separated by `,`.
    #[serde(default = "default_search_fields")]
    pub search_fields: String,
}

fn default_wiki() -> String {
    "xwiki".into()
}
fn default_user_space() -> String {
    "XWiki".into()
}
fn default_page_name_format() -> String {
    "${uid}".into()
}
fn default_max_import_results() -> usize {
    20
}
fn default_batch_size() -> usize {
    500
}
fn default_search_fields() -> String {
    "cn,mail".into()
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            wiki: default_wiki(),
            user_space: default_user_space(),
            user_page_name_format: default_page_name_format(),
            max_import_results: default_max_import_results(),
            force_non_directory_membership_update: false,
            batch_size: default_batch_size(),
            trigger_group_update: false,
            federated_identity_enabled: false,
            federated_identity_issuer: String::new(),
            single_field_search: false,
            search_fields: default_search_fields(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!(groups = config.groups.len(), "configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// A missing variable only logs a warning; an unset bind password leads
    /// to an anonymous-style bind with an empty password.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        if let Some(ref env_name) = self.ldap.bind_password_env {
            self.ldap.bind_password = resolve_optional_env(env_name, "ldap.bind_password_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ldap.url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ldap.url".into(),
                detail: "directory URL must not be empty".into(),
            });
        }
        if !self.ldap.url.starts_with("ldap://") && !self.ldap.url.starts_with("ldaps://") {
            return Err(ConfigError::InvalidValue {
                field: "ldap.url".into(),
                detail: "directory URL must start with ldap:// or ldaps://".into(),
            });
        }
        if self.ldap.base_dn.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ldap.base_dn".into(),
                detail: "base DN must not be empty".into(),
            });
        }
        if self.ldap.uid_attribute.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ldap.uid_attribute".into(),
                detail: "identifier attribute must not be empty".into(),
            });
        }
        if self.import.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "import.batch_size".into(),
                detail: "batch size must be > 0".into(),
            });
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.poll_interval_secs".into(),
                detail: "poll interval must be > 0".into(),
            });
        }
        if self.import.federated_identity_enabled
            && self.import.federated_identity_issuer.trim().is_empty()
        {
            return Err(ConfigError::InvalidValue {
                field: "import.federated_identity_issuer".into(),
                detail: "an issuer is required when federated identities are enabled".into(),
            });
        }
        for (group, dns) in &self.groups {
            if dns.is_empty() {
                warn!(group = %group, "local group is mapped to no directory group");
            }
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
