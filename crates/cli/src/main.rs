//! dirauth command-line tool.
//!
//! Generates and validates the LDAP authentication configuration, checks
//! that the directory server is reachable, resolves roles offline, runs a
//! full login against the directory, and lists provisioned users.

mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use dirauth_core::config::AppConfig;
use dirauth_core::db::Database;
use dirauth_core::directory::LdapConnector;
use dirauth_core::dn::DistinguishedName;
use dirauth_core::{Authenticator, ConfigSummary};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// dirauth command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "dirauth",
    version,
    about = "Configure and test LDAP authentication and group-to-role mapping"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Log filter (e.g. `debug`, `warn,dirauth_core::auth=info`). Overrides
    /// the `[logging]` section.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./dirauth.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file and print the summary.
    Validate,

    /// Connect to the directory server and perform the service bind.
    Ping,

    /// Show which roles a set of group DNs resolves to.
    Roles {
        /// Group DNs as the server would return them in the group attribute.
        #[arg(required_unless_present = "list")]
        groups: Vec<String>,

        /// List the configured mapping and the roles held by provisioned
        /// users instead.
        #[arg(long, conflicts_with = "groups")]
        list: bool,
    },

    /// Log in as a user, provisioning the local record.
    Login {
        /// Login name.
        username: String,

        /// Read the password from this environment variable instead of
        /// prompting.
        #[arg(long)]
        password_env: Option<String>,
    },

    /// List provisioned users.
    Users {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dirauth")
        .join("config.toml")
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&cli))
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

/// `--log-level`, then `RUST_LOG`, then the config file's `[logging]`
/// section, then `warn`.
fn log_filter(cli: &Cli) -> EnvFilter {
    if let Some(ref level) = cli.log_level {
        return EnvFilter::new(level);
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    match AppConfig::load_from_file(&cli.config) {
        Ok(config) => EnvFilter::new(config.logging.filter_directives()),
        Err(_) => EnvFilter::new("warn"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Ping => cmd_ping(&cli.config).await,
        Commands::Roles { groups, list } => {
            if list {
                cmd_roles_list(&cli.config)
            } else {
                cmd_roles(&cli.config, &groups)
            }
        }
        Commands::Login {
            username,
            password_env,
        } => cmd_login(&cli.config, &username, password_env.as_deref()).await,
        Commands::Users { json } => cmd_users(&cli.config, json),
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

/// Load, resolve and validate the configuration, then log the summary
/// banner.
fn load_config(path: &Path) -> Result<AppConfig> {
    debug!(path = %path.display(), "loading configuration");
    let config = AppConfig::load_and_resolve(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    ConfigSummary::new(&config).log();
    Ok(config)
}

fn open_database(config: &AppConfig) -> Result<Database> {
    let db = Database::from_config(config).context("failed to open user database")?;
    info!("user database ready");
    Ok(db)
}

fn spinner(msg: String) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(msg);
    spinner.enable_steady_tick(Duration::from_millis(100));
    Ok(spinner)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

const DEFAULT_CONFIG: &str = r#"# dirauth configuration
#
# Secrets are never written here: bind_password_env names the environment
# variable holding the service account password.

[ldap]
server = "ldap://openldap:389"
search_base = "dc=example,dc=org"
uid_field = "uid"
bind_user = "cn=admin,dc=example,dc=org"
bind_password_env = "LDAP_BIND_PASSWORD"
use_tls = false
allow_self_signed = true
firstname_field = "givenName"
lastname_field = "sn"
email_field = "mail"
group_field = "memberOf"
# search_filter = "(objectClass=inetOrgPerson)"
# tls_ca_cert_file = "/etc/ssl/certs/ldap-ca.pem"
# bind_first = false
timeout_secs = 10

[registration]
# Create a local user on first successful login.
enabled = true
# Role given when none of the user's groups is mapped.
default_role = "Viewer"

[roles]
# Replace local roles with the mapped roles on every login.
sync_at_login = true
admin_role = "Admin"

[roles.mapping]
"cn=airflow-admins,ou=groups,dc=example,dc=org" = ["Admin"]
"cn=airflow-users,ou=groups,dc=example,dc=org" = ["User"]
"cn=airflow-viewers,ou=groups,dc=example,dc=org" = ["Viewer"]

[database]
sql_alchemy_conn = "sqlite:////var/lib/dirauth/users.db"

[security]
csrf_enabled = true
wtf_csrf_enabled = true

[logging]
level = "info"
security_level = "info"
ldap_debug = false
"#;

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    std::fs::write(output, DEFAULT_CONFIG).context("failed to write config file")?;

    println!("{}", style::success(&format!("Default configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Edit the server, search base and role mapping for your directory");
    println!("  2. Export the bind password: export LDAP_BIND_PASSWORD=...");
    println!("  3. Validate with: dirauth validate --config {}", output.display());
    println!("  4. Check connectivity: dirauth ping --config {}", output.display());

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("{}", style::header(&format!("Validating {}", config_path.display())));
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure and role mapping keys are valid"));

    if let Err(e) = config.resolve_env_vars() {
        println!("  {}", style::error(&e.to_string()));
        anyhow::bail!("configuration validation failed");
    }
    println!("  {}", style::success("Database connection configured"));

    match (&config.ldap.bind_user, &config.ldap.bind_password) {
        (Some(_), Some(_)) => println!("  {}", style::success("Bind password resolved")),
        (Some(_), None) => println!(
            "  {}",
            style::warn(&format!(
                "Bind password not set (env {})",
                config.ldap.bind_password_env.as_deref().unwrap_or("<none configured>")
            ))
        ),
        (None, _) => println!("  {}", style::warn("No bind user; user searches run anonymously")),
    }

    match config.validate() {
        Ok(()) => println!("  {}", style::success("All fields are valid")),
        Err(e) => {
            println!("  {}", style::error(&e.to_string()));
            anyhow::bail!("configuration validation failed");
        }
    }

    if !config.ldap.is_encrypted() {
        println!("  {}", style::warn("Connection is not encrypted (set use_tls or use ldaps://)"));
    }
    if config.ldap.allow_self_signed {
        println!("  {}", style::warn("Server certificates are not verified"));
    }
    if config.roles.mapping.is_empty() {
        println!("  {}", style::warn("Role mapping is empty; every user gets the default role"));
    }

    println!();
    print!("{}", ConfigSummary::new(&config));
    println!();
    println!("{}", style::success("Configuration is valid."));
    Ok(())
}

async fn cmd_ping(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let connector = LdapConnector::new(&config.ldap).context("failed to set up TLS")?;

    let credentials = config.ldap.service_credentials()?;

    let spinner = spinner(format!("Connecting to {}...", config.ldap.server))?;
    let result = match credentials {
        Some((dn, password)) => connector.ping(Some(dn), password).await,
        None => connector.ping(None, "").await,
    };
    spinner.finish_and_clear();

    result.context("directory check failed")?;
    println!("{}", style::success(&format!("Connected to {}", config.ldap.server)));
    match config.ldap.bind_user {
        Some(ref dn) => println!("{}", style::success(&format!("Service bind as {} succeeded", dn))),
        None => println!("{}", style::dim("No bind user configured; skipped service bind")),
    }
    Ok(())
}

fn cmd_roles(config_path: &Path, groups: &[String]) -> Result<()> {
    let config = AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    let mapping = &config.roles.mapping;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Group", "Roles"]);

    for group in groups {
        let roles = match DistinguishedName::parse(group) {
            Ok(dn) => match mapping.get(&dn) {
                Some(roles) => Cell::new(roles.join(", ")),
                None => Cell::new("(not mapped)").fg(comfy_table::Color::DarkGrey),
            },
            Err(e) => Cell::new(format!("invalid DN: {}", e)).fg(comfy_table::Color::Red),
        };
        table.add_row(vec![Cell::new(group), roles]);
    }
    println!("{table}");

    let roles = config.roles.calculate_roles(groups, &config.registration);
    let mapped = mapping.roles_for_groups(groups);
    println!();
    if roles.is_empty() {
        println!("{}", style::warn("No roles: the user would be refused"));
    } else if mapped.is_empty() {
        println!(
            "{}",
            style::warn(&format!("No mapped group; default role applies: {}", roles.join(", ")))
        );
    } else {
        println!("{}", style::success(&format!("Roles: {}", roles.join(", "))));
    }
    if roles.iter().any(|r| r == &config.roles.admin_role) {
        println!("{}", style::dim(&format!("Includes the admin role ({})", config.roles.admin_role)));
    }
    Ok(())
}

fn cmd_roles_list(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!("{}", style::header("Role mapping"));
    if config.roles.mapping.is_empty() {
        println!("{}", style::dim("(empty)"));
    } else {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Group", "Roles"]);
        for entry in config.roles.mapping.iter() {
            table.add_row(vec![Cell::new(entry.key()), Cell::new(entry.roles().join(", "))]);
        }
        println!("{table}");
    }
    println!(
        "{}",
        style::dim(&format!("Default role: {}", config.registration.default_role))
    );

    let db = open_database(&config)?;
    let roles = db.list_roles().context("failed to list roles")?;
    println!();
    println!("{}", style::header("Provisioned roles"));
    if roles.is_empty() {
        println!("{}", style::dim("No roles provisioned yet."));
        return Ok(());
    }

    let mapped = config.roles.mapping.role_names();
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Role", "Members", "Mapped"]);
    for role in &roles {
        table.add_row(vec![
            Cell::new(&role.name),
            Cell::new(role.members),
            if mapped.iter().any(|m| *m == role.name) {
                Cell::new("yes").fg(comfy_table::Color::Green)
            } else {
                Cell::new("no").fg(comfy_table::Color::DarkGrey)
            },
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn cmd_login(config_path: &Path, username: &str, password_env: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;

    let password = match password_env {
        Some(var) => std::env::var(var)
            .with_context(|| format!("environment variable {} is not set", var))?,
        None => dialoguer::Password::new()
            .with_prompt(format!("Password for {}", username))
            .interact()
            .context("failed to read password")?,
    };

    let db = Arc::new(open_database(&config)?);
    let connector = LdapConnector::new(&config.ldap).context("failed to set up TLS")?;
    let auth = Authenticator::new(connector, Arc::new(config), db);

    let spinner = spinner(format!("Authenticating {}...", username))?;
    let result = auth.authenticate(username, &password).await;
    spinner.finish_and_clear();

    let user = result.context("login failed")?;
    let verb = if user.newly_registered { "Registered" } else { "Logged in" };
    println!("{}", style::success(&format!("{} {}", verb, user.user.username)));
    println!("  DN     : {}", user.dn);
    println!(
        "  Name   : {} {}",
        user.user.profile.first_name, user.user.profile.last_name
    );
    println!("  Email  : {}", user.user.profile.email);
    println!("  Roles  : {}", user.user.roles.join(", "));
    println!("  Admin  : {}", style::flag(user.is_admin(&auth.config().roles.admin_role)));
    println!("  Logins : {}", user.user.login_count);
    if user.groups.is_empty() {
        println!("  Groups : {}", style::dim("(none)"));
    } else {
        println!("  Groups :");
        for group in &user.groups {
            println!("    {}", group);
        }
    }
    Ok(())
}

fn cmd_users(config_path: &Path, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let db = open_database(&config)?;
    let users = db.list_users().context("failed to list users")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&users)?);
        return Ok(());
    }

    if users.is_empty() {
        println!("{}", style::dim("No users provisioned yet."));
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Username", "Name", "Email", "Roles", "Active", "Logins", "Last login"]);

    for user in &users {
        let last_login = user
            .last_login
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".into());
        table.add_row(vec![
            Cell::new(&user.username),
            Cell::new(format!("{} {}", user.profile.first_name, user.profile.last_name).trim()),
            Cell::new(&user.profile.email),
            Cell::new(user.roles.join(", ")),
            if user.active {
                Cell::new("yes").fg(comfy_table::Color::Green)
            } else {
                Cell::new("no").fg(comfy_table::Color::Red)
            },
            Cell::new(user.login_count),
            Cell::new(last_login),
        ]);
    }
    println!("{table}");
    println!();
    println!("{} user(s)", users.len());
    Ok(())
}
