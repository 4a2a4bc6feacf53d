//! ldapsync command-line management tool.
//!
//! Provides subcommands for generating and validating configuration,
//! inspecting reconciliation status, reconciling one or all mapped groups,
//! searching the directory, importing selected users and viewing the audit
//! log.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use ldapsync_core::config::AppConfig;
use ldapsync_core::db::Database;
use ldapsync_core::directory::LdapConnector;
use ldapsync_core::store::LocalStore;
use ldapsync_core::sync_engine::{GroupSyncReport, SyncEngine, SyncSettings};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// ldapsync command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "ldapsync",
    version,
    about = "Reconcile local group membership with an LDAP directory"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/ldapsync/config.toml"
    )]
    config: PathBuf,

    /// Log level for diagnostic output on stderr.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show reconciliation status.
    Status,

    /// Inspect and reconcile mapped groups.
    Groups {
        #[command(subcommand)]
        action: GroupsAction,
    },

    /// Reconcile every mapped group now.
    Sync,

    /// Search and import directory users.
    Users {
        #[command(subcommand)]
        action: UsersAction,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./ldapsync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Show recent audit log entries.
    Audit {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Only show entries for this action (sync_group, sync_all, import_user).
        #[arg(long)]
        action: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum GroupsAction {
    /// List local groups and the directory groups mapped to them.
    List,
    /// Count the directory members a reconciliation would import or update.
    Count {
        /// Local group reference (`Space.Name` or `wiki:Space.Name`).
        group: String,
    },
    /// Reconcile one local group now.
    Sync {
        /// Local group reference.
        group: String,
    },
    /// Search directory groups.
    Search {
        /// Text to look for.
        input: String,
        /// Flag directory groups already mapped to this local group.
        #[arg(long)]
        local_group: Option<String>,
        /// Match anywhere in the field instead of as a prefix.
        #[arg(long)]
        full: bool,
    },
}

#[derive(Subcommand, Debug)]
enum UsersAction {
    /// Search directory users.
    Search {
        /// Text to look for.
        input: String,
        /// Search only this attribute.
        #[arg(long)]
        field: Option<String>,
        /// Match anywhere in the field instead of as a prefix.
        #[arg(long)]
        full: bool,
    },
    /// Import users by identifier.
    Import {
        /// Directory identifiers to import.
        #[arg(required = true)]
        uids: Vec<String>,
        /// Also add the imported users to this local group.
        #[arg(long)]
        group: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        command => {
            let config = load_config(&cli.config)?;
            let db = open_database(&config)?;

            match command {
                Commands::Status => cmd_status(&config, &db, cli.json),
                Commands::Audit { limit, action } => cmd_audit(&db, limit, action.as_deref(), cli.json),
                Commands::Groups { action } => cmd_groups(build_engine(&config, db)?, action, cli.json),
                Commands::Sync => cmd_sync_all(build_engine(&config, db)?, cli.json),
                Commands::Users { action } => cmd_users(build_engine(&config, db)?, action, cli.json),
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    debug!(path = %path.display(), "loading configuration");
    AppConfig::load_and_resolve(path).context("failed to load configuration")
}

fn open_database(config: &AppConfig) -> Result<Database> {
    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;
    let db = Database::new(config.daemon.database_path()).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    Ok(db)
}

fn build_engine(config: &AppConfig, db: Database) -> Result<SyncEngine<Database>> {
    let settings = SyncSettings::from_config(config).context("invalid reconciliation settings")?;
    Ok(SyncEngine::new(settings, db, Box::new(LdapConnector::new(&config.ldap))))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("failed to encode JSON")?);
    Ok(())
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header);
    table
}

fn yes_no(value: bool, yes: &str, no: &str) -> Cell {
    if value {
        Cell::new(yes).fg(Color::Green)
    } else {
        Cell::new(no)
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# ldapsync configuration
# See documentation for all available options.

[daemon]
poll_interval_secs = 3600
log_level = "info"
data_dir = "/var/lib/ldapsync"

[ldap]
url = "ldap://ldap.example.com:389"
bind_dn = "cn=reader,dc=example,dc=com"
bind_password_env = "LDAP_BIND_PASSWORD"
base_dn = "dc=example,dc=com"
uid_attribute = "uid"
# fields_mapping = "first_name=givenName,last_name=sn,email=mail"
# update_photo = false
# photo_attribute = "thumbnailPhoto"
# starttls = false

[import]
wiki = "xwiki"
user_space = "XWiki"
user_page_name_format = "${uid}"
batch_size = 500
force_non_directory_membership_update = false
# federated_identity_enabled = false
# federated_identity_issuer = "https://idp.example.com"

[groups]
# "XWiki.Staff" = ["cn=staff,ou=groups,dc=example,dc=com"]
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the config file with your directory details and group mappings");
    println!("  2. Set the referenced environment variable (LDAP_BIND_PASSWORD)");
    println!("  3. Validate with: ldapsync validate --config {}", output.display());
    println!("  4. Start the daemon: ldapsync-daemon --config {}", output.display());

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config = AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    let _ = config.resolve_env_vars();
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    if let Err(e) = SyncSettings::from_config(&config) {
        println!("  [FAIL] {}", e);
        anyhow::bail!("configuration validation failed");
    }
    println!("  [OK] Page name format and field mapping are usable");

    println!();
    println!("Configuration summary:");
    println!("  Directory     : {}", config.ldap.url);
    println!("  Bind DN       : {}", if config.ldap.bind_dn.is_empty() { "(anonymous)" } else { config.ldap.bind_dn.as_str() });
    println!(
        "  Bind password : {}",
        if config.ldap.bind_password.is_some() { "set" } else { "NOT SET" }
    );
    println!("  Base DN       : {}", config.ldap.base_dn);
    println!("  Identifier    : {}", config.ldap.uid_attribute);
    println!("  Mapped groups : {}", config.groups.len());
    println!("  Batch size    : {}", config.import.batch_size);
    println!("  Poll interval : {}s", config.daemon.poll_interval_secs);
    println!("  Data directory: {}", config.daemon.data_dir.display());
    println!();
    println!("Configuration is valid.");

    Ok(())
}

fn cmd_status(config: &AppConfig, db: &Database, json: bool) -> Result<()> {
    let state = db
        .get_state("sync_state")
        .context("failed to read sync state")?
        .unwrap_or_else(|| "idle".to_string());
    let last_sync = db
        .get_state("last_sync_at")
        .context("failed to read last sync time")?;
    let identities = db
        .count_documents("identity")
        .context("failed to count identities")?;
    let groups = db.count_documents("group").context("failed to count groups")?;
    let failures = db.count_failures().context("failed to count failures")?;
    let schema_version = db.schema_version().context("failed to read schema version")?;

    if json {
        return print_json(&serde_json::json!({
            "state": state,
            "last_sync_at": last_sync,
            "mapped_groups": config.groups.len(),
            "identities": identities,
            "groups": groups,
            "failures": failures,
            "schema_version": schema_version,
            "federated_identity": db.supports_federated_identity().unwrap_or(false),
        }));
    }

    println!("ldapsync Status");
    println!("===============");
    println!();
    println!("  Sync state       : {}", state);
    println!("  Last sync at     : {}", last_sync.as_deref().unwrap_or("never"));
    println!("  Mapped groups    : {}", config.groups.len());
    println!("  Local identities : {}", identities);
    println!("  Local groups     : {}", groups);
    println!("  Recorded failures: {}", failures);
    println!("  Schema version   : {}", schema_version);

    Ok(())
}

fn cmd_groups(engine: SyncEngine<Database>, action: GroupsAction, json: bool) -> Result<()> {
    match action {
        GroupsAction::List => {
            let mapped = engine.mapped_groups();
            if json {
                return print_json(&mapped);
            }
            if mapped.is_empty() {
                println!("No mapped groups configured.");
                return Ok(());
            }
            let mut table = table(vec!["Local group", "Directory groups", "Last reconciled"]);
            for group in &mapped {
                let last = engine
                    .store()
                    .get_state(&format!("group_last_sync:{}", group.group))
                    .context("failed to read group state")?;
                let dns: Vec<&str> = group.directory_groups.iter().map(String::as_str).collect();
                table.add_row(vec![
                    Cell::new(group.group.to_string()),
                    Cell::new(dns.join("\n")),
                    Cell::new(last.as_deref().unwrap_or("never")),
                ]);
            }
            println!("{table}");
            Ok(())
        }

        GroupsAction::Count { group } => {
            let count = engine
                .group_member_count(&group)
                .with_context(|| format!("failed to count members of '{group}'"))?;
            if json {
                return print_json(&serde_json::json!({ "group": group, "members": count }));
            }
            println!("{group}: {count} directory member(s)");
            Ok(())
        }

        GroupsAction::Sync { group } => {
            let report = engine
                .sync_group(&group)
                .with_context(|| format!("reconciliation of '{group}' failed"))?;
            if json {
                return print_json(&report);
            }
            print_group_report(&report);
            Ok(())
        }

        GroupsAction::Search {
            input,
            local_group,
            full,
        } => {
            let results = engine
                .search_groups(&input, local_group.as_deref(), full)
                .context("directory group search failed")?;
            if json {
                return print_json(&results);
            }
            let mut table = table(vec!["Name", "DN", "Mapped"]);
            for group in &results.groups {
                table.add_row(vec![
                    Cell::new(group.name.as_deref().unwrap_or("-")),
                    Cell::new(&group.dn),
                    yes_no(group.associated, "yes", "-"),
                ]);
            }
            println!("{table}");
            if results.reached_limit {
                println!("Result limit reached; refine the search to see more.");
            }
            if let Some(referral) = &results.referral {
                println!("Partial results: directory referred to {referral}");
            }
            Ok(())
        }
    }
}

fn print_group_report(report: &GroupSyncReport) {
    println!("Group {} reconciled ({})", report.group, report.state);
    println!("  Fetched    : {}", report.fetched);
    println!("  Imported   : {}", report.imported);
    println!("  Updated    : {}", report.updated);
    println!("  Added      : {}", report.added);
    println!("  Removed    : {}", report.removed);
    println!("  Preserved  : {}", report.preserved);
    println!("  Commits    : {}", report.commits);
    if report.unresolved > 0 {
        println!("  Unresolved : {}", report.unresolved);
    }
    for referral in &report.referrals {
        println!("  Referral   : {}", referral);
    }
    if !report.failures.is_empty() {
        println!();
        let mut table = table(vec!["Member", "Stage", "Error"]);
        for failure in &report.failures {
            table.add_row(vec![
                Cell::new(&failure.key),
                Cell::new(failure.stage.to_string()),
                Cell::new(&failure.error).fg(Color::Red),
            ]);
        }
        println!("{table}");
    }
}

fn cmd_sync_all(engine: SyncEngine<Database>, json: bool) -> Result<()> {
    let report = engine.sync_all().context("reconciliation failed")?;
    if json {
        print_json(&report)?;
    } else {
        for group in &report.groups {
            print_group_report(group);
            println!();
        }
        for failure in &report.failed {
            println!("Group {} FAILED: {}", failure.group, failure.error);
        }
        if report.cancelled {
            println!("Reconciliation was cancelled before all groups ran.");
        }
    }
    if !report.is_success() {
        anyhow::bail!("{} group(s) failed to reconcile", report.failed.len());
    }
    Ok(())
}

fn cmd_users(engine: SyncEngine<Database>, action: UsersAction, json: bool) -> Result<()> {
    match action {
        UsersAction::Search { input, field, full } => {
            let results = engine
                .search_users(field.as_deref(), &input, full)
                .context("directory user search failed")?;
            if json {
                return print_json(&results);
            }
            let mut table = table(vec!["UID", "Reference", "Email", "Local"]);
            for user in &results.users {
                table.add_row(vec![
                    Cell::new(user.uid.as_deref().unwrap_or("-")),
                    Cell::new(user.reference.as_deref().unwrap_or("-")),
                    Cell::new(user.fields.get("email").map(String::as_str).unwrap_or("")),
                    yes_no(user.exists, "exists", "new"),
                ]);
            }
            println!("{table}");
            if results.reached_limit {
                println!("Result limit reached; refine the search to see more.");
            }
            if let Some(referral) = &results.referral {
                println!("Partial results: directory referred to {referral}");
            }
            Ok(())
        }

        UsersAction::Import { uids, group } => {
            let report = engine
                .import_users(&uids, group.as_deref())
                .context("user import failed")?;
            if json {
                return print_json(&report);
            }
            let mut table = table(vec!["UID", "Reference", "Result"]);
            for user in &report.users {
                let result = match (&user.error, user.created) {
                    (Some(e), _) => Cell::new(e).fg(Color::Red),
                    (None, true) => Cell::new("created").fg(Color::Green),
                    (None, false) => Cell::new("updated"),
                };
                table.add_row(vec![
                    Cell::new(&user.uid),
                    Cell::new(user.reference.as_ref().map(ToString::to_string).unwrap_or_default()),
                    result,
                ]);
            }
            println!("{table}");
            if let Some(group) = &report.group {
                println!("{} user(s) added to {}", report.added_to_group, group);
            }
            for update in &report.group_updates {
                println!("Reconciled {}: +{} -{}", update.group, update.added, update.removed);
            }
            for failure in &report.failed_group_updates {
                println!("Group {} FAILED: {}", failure.group, failure.error);
            }
            Ok(())
        }
    }
}

fn cmd_audit(db: &Database, limit: u32, action: Option<&str>, json: bool) -> Result<()> {
    let entries = match action {
        Some(action) => db.list_audit_log_by_action(action, limit),
        None => db.list_audit_log(limit),
    }
    .context("failed to list audit entries")?;

    if json {
        let rows: Vec<_> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "id": e.id,
                    "action": e.action,
                    "group": e.group_ref,
                    "details": e.details,
                    "success": e.success,
                    "created_at": e.created_at.to_rfc3339(),
                })
            })
            .collect();
        return print_json(&rows);
    }

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    let mut table = table(vec!["Timestamp", "Action", "Group", "OK", "Details"]);
    for entry in &entries {
        table.add_row(vec![
            Cell::new(
                entry
                    .created_at
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            ),
            Cell::new(&entry.action),
            Cell::new(entry.group_ref.as_deref().unwrap_or("-")),
            if entry.success {
                Cell::new("ok").fg(Color::Green)
            } else {
                Cell::new("FAIL").fg(Color::Red)
            },
            Cell::new(truncate(entry.details.as_deref().unwrap_or(""), 60)),
        ]);
    }
    println!("{table}");
    println!("{} entries shown", entries.len());

    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
