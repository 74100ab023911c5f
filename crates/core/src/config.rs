//! TOML-based configuration for dirauth.
//!
//! Secrets are never stored in the file. The bind password is referenced by
//! `bind_password_env`, the name of an environment variable, and resolved at
//! runtime via [`AppConfig::resolve_env_vars`].

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dn::{is_valid_attribute_type, DistinguishedName};
use crate::errors::{ConfigError, DnError, FilterError};
use crate::filter::Filter;
use crate::roles::RoleMapping;

/// Environment override for `[database] sql_alchemy_conn`.
pub const DATABASE_CONN_ENV: &str = "DIRAUTH__DATABASE__SQL_ALCHEMY_CONN";
/// Environment override for the deprecated `[core] sql_alchemy_conn`.
pub const CORE_CONN_ENV: &str = "DIRAUTH__CORE__SQL_ALCHEMY_CONN";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory server connection and attribute bindings.
    pub ldap: LdapConfig,

    /// Self-registration of users on first login.
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Group-to-role mapping.
    #[serde(default)]
    pub roles: RolesConfig,

    /// Local user store (preferred location of the connection string).
    #[serde(default)]
    pub database: DatabaseSection,

    /// Deprecated location of the connection string.
    #[serde(default)]
    pub core: DatabaseSection,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Connection string chosen by `resolve_env_vars`.
    #[serde(skip)]
    pub database_uri: Option<String>,
}

// ---------------------------------------------------------------------------
// LDAP
// ---------------------------------------------------------------------------

/// Directory server settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// Server URL, `ldap://host:port` or `ldaps://host:port`.
    pub server: String,

    /// Base DN under which users are searched.
    pub search_base: String,

    /// Attribute holding the login name.
    #[serde(default = "default_uid_field")]
    pub uid_field: String,

    /// DN of the service account used for the user search.
    #[serde(default)]
    pub bind_user: Option<String>,

    /// Environment variable holding the service account password.
    #[serde(default)]
    pub bind_password_env: Option<String>,

    /// Upgrade `ldap://` connections with StartTLS.
    #[serde(default)]
    pub use_tls: bool,

    /// Accept certificates that do not verify.
    #[serde(default)]
    pub allow_self_signed: bool,

    /// PEM bundle of additional trusted CAs.
    #[serde(default)]
    pub tls_ca_cert_file: Option<PathBuf>,

    #[serde(default = "default_firstname_field")]
    pub firstname_field: String,

    #[serde(default = "default_lastname_field")]
    pub lastname_field: String,

    #[serde(default = "default_email_field")]
    pub email_field: String,

    /// Attribute listing the DNs of the user's groups.
    #[serde(default = "default_group_field")]
    pub group_field: String,

    /// Extra filter AND-ed with the uid match, e.g. `(objectClass=person)`.
    #[serde(default)]
    pub search_filter: Option<String>,

    /// Bind as the user before searching instead of using the service account.
    #[serde(default)]
    pub bind_first: bool,

    /// Connect and operation timeout in seconds (default 10).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Resolved service account password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub bind_password: Option<String>,
}

fn default_uid_field() -> String {
    "uid".into()
}
fn default_firstname_field() -> String {
    "givenName".into()
}
fn default_lastname_field() -> String {
    "sn".into()
}
fn default_email_field() -> String {
    "mail".into()
}
fn default_group_field() -> String {
    "memberOf".into()
}
fn default_timeout() -> u64 {
    10
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            search_base: String::new(),
            uid_field: default_uid_field(),
            bind_user: None,
            bind_password_env: None,
            use_tls: false,
            allow_self_signed: false,
            tls_ca_cert_file: None,
            firstname_field: default_firstname_field(),
            lastname_field: default_lastname_field(),
            email_field: default_email_field(),
            group_field: default_group_field(),
            search_filter: None,
            bind_first: false,
            timeout_secs: default_timeout(),
            bind_password: None,
        }
    }
}

impl fmt::Debug for LdapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapConfig")
            .field("server", &self.server)
            .field("search_base", &self.search_base)
            .field("uid_field", &self.uid_field)
            .field("bind_user", &self.bind_user)
            .field("bind_password_env", &self.bind_password_env)
            .field("use_tls", &self.use_tls)
            .field("allow_self_signed", &self.allow_self_signed)
            .field("tls_ca_cert_file", &self.tls_ca_cert_file)
            .field("group_field", &self.group_field)
            .field("search_filter", &self.search_filter)
            .field("bind_first", &self.bind_first)
            .field("timeout_secs", &self.timeout_secs)
            .field("bind_password", &self.bind_password.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl LdapConfig {
    /// Filter that finds the entry for `username`.
    pub fn user_filter(&self, username: &str) -> Result<Filter, FilterError> {
        let base = self.base_filter().map(Filter::parse).transpose()?;
        Ok(Filter::user_lookup(&self.uid_field, username, base.as_ref()))
    }

    /// The configured `search_filter`; a blank value means none.
    pub fn base_filter(&self) -> Option<&str> {
        self.search_filter
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
    }

    /// DN bound directly when `bind_first` is set: `<uid_field>=<username>,<search_base>`.
    pub fn user_dn(&self, username: &str) -> Result<DistinguishedName, DnError> {
        DistinguishedName::parse(&self.search_base)?.child(&self.uid_field, username)
    }

    /// Attributes fetched with the user entry.
    pub fn user_attributes(&self) -> [&str; 4] {
        [
            self.firstname_field.as_str(),
            self.lastname_field.as_str(),
            self.email_field.as_str(),
            self.group_field.as_str(),
        ]
    }

    /// Service account DN and password, or `None` for anonymous searches.
    ///
    /// A bind user without a resolved password is an error: an empty
    /// password would turn the bind into an unauthenticated one.
    pub fn service_credentials(&self) -> Result<Option<(&str, &str)>, ConfigError> {
        let Some(bind_user) = self.bind_user.as_deref() else {
            return Ok(None);
        };
        match self.bind_password.as_deref() {
            Some(password) => Ok(Some((bind_user, password))),
            None => Err(ConfigError::EnvVarMissing {
                var: self
                    .bind_password_env
                    .clone()
                    .unwrap_or_else(|| "<ldap.bind_password_env unset>".into()),
                field: "ldap.bind_password_env".into(),
            }),
        }
    }

    /// Whether the connection is encrypted (LDAPS or StartTLS).
    pub fn is_encrypted(&self) -> bool {
        self.server.starts_with("ldaps://") || self.use_tls
    }
}

// ---------------------------------------------------------------------------
// Registration & roles
// ---------------------------------------------------------------------------

/// Provisioning of local users on first successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Create a local user on first login (default false).
    #[serde(default)]
    pub enabled: bool,

    /// Role given when no mapped group matches (default `Public`).
    #[serde(default = "default_registration_role")]
    pub default_role: String,
}

fn default_registration_role() -> String {
    "Public".into()
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_role: default_registration_role(),
        }
    }
}

/// Role assignment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolesConfig {
    /// Replace the local user's roles with the mapped roles on every login.
    #[serde(default)]
    pub sync_at_login: bool,

    /// Name of the administrative role.
    #[serde(default = "default_admin_role")]
    pub admin_role: String,

    /// Group DN to role names.
    #[serde(default)]
    pub mapping: RoleMapping,
}

fn default_admin_role() -> String {
    "Admin".into()
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            sync_at_login: false,
            admin_role: default_admin_role(),
            mapping: RoleMapping::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Database, security, logging
// ---------------------------------------------------------------------------

/// A section that may carry the user store connection string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default)]
    pub sql_alchemy_conn: Option<String>,
}

/// Web form protection flags handed to the host application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub csrf_enabled: bool,

    #[serde(default = "default_true")]
    pub wtf_csrf_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            csrf_enabled: true,
            wtf_csrf_enabled: true,
        }
    }
}

/// Log levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Global level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Level for authentication events.
    #[serde(default = "default_log_level")]
    pub security_level: String,

    /// Trace directory traffic.
    #[serde(default)]
    pub ldap_debug: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            security_level: default_log_level(),
            ldap_debug: false,
        }
    }
}

impl LoggingConfig {
    /// Directive string for `tracing_subscriber::EnvFilter`.
    pub fn filter_directives(&self) -> String {
        let mut directives = format!("{},dirauth_core::auth={}", self.level, self.security_level);
        if self.ldap_debug {
            directives.push_str(",dirauth_core::directory=debug,ldap3=debug");
        }
        directives
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

        debug!(mapped_groups = config.roles.mapping.len(), "configuration parsed successfully");
        Ok(config)
    }

    /// Resolve the bind password and the database connection string.
    ///
    /// A missing password variable is only a warning; callers decide whether
    /// an anonymous search is acceptable. A missing connection string is an
    /// error.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        if let Some(ref env_name) = self.ldap.bind_password_env {
            self.ldap.bind_password = resolve_optional_env(env_name, "ldap.bind_password_env");
        }

        let preferred = env_override(DATABASE_CONN_ENV).or_else(|| non_empty(&self.database.sql_alchemy_conn));
        let deprecated = env_override(CORE_CONN_ENV).or_else(|| non_empty(&self.core.sql_alchemy_conn));
        self.database_uri = Some(select_database_uri(preferred, deprecated)?);

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Check the configuration for values that cannot work.
    ///
    /// Questionable but usable settings are logged as warnings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ldap = &self.ldap;

        validate_server_url(&ldap.server)?;
        if ldap.use_tls && ldap.server.starts_with("ldaps://") {
            return Err(ConfigError::invalid(
                "ldap.use_tls",
                "StartTLS cannot be combined with an ldaps:// server",
            ));
        }

        let search_base = DistinguishedName::parse(&ldap.search_base)
            .map_err(|e| ConfigError::invalid("ldap.search_base", e.to_string()))?;
        if let Some(ref bind_user) = ldap.bind_user {
            DistinguishedName::parse(bind_user)
                .map_err(|e| ConfigError::invalid("ldap.bind_user", e.to_string()))?;
        }

        for (field, value) in [
            ("ldap.uid_field", &ldap.uid_field),
            ("ldap.firstname_field", &ldap.firstname_field),
            ("ldap.lastname_field", &ldap.lastname_field),
            ("ldap.email_field", &ldap.email_field),
            ("ldap.group_field", &ldap.group_field),
        ] {
            if !is_valid_attribute_type(value) {
                return Err(ConfigError::invalid(
                    field,
                    format!("'{}' is not a valid attribute name", value),
                ));
            }
        }

        if let Some(filter) = ldap.base_filter() {
            Filter::parse(filter).map_err(|e| ConfigError::invalid("ldap.search_filter", e.to_string()))?;
        }

        if ldap.timeout_secs == 0 {
            return Err(ConfigError::invalid("ldap.timeout_secs", "timeout must be > 0"));
        }

        if self.registration.default_role.trim().is_empty() {
            return Err(ConfigError::invalid(
                "registration.default_role",
                "default role must not be empty",
            ));
        }
        if self.roles.admin_role.trim().is_empty() {
            return Err(ConfigError::invalid("roles.admin_role", "admin role must not be empty"));
        }
        for entry in self.roles.mapping.iter() {
            if entry.roles().is_empty() {
                warn!(group = entry.key(), "role mapping entry grants no roles");
            }
            if !entry.group().is_within(&search_base) {
                warn!(
                    group = entry.key(),
                    search_base = %ldap.search_base,
                    "mapped group is outside the search base"
                );
            }
        }

        if !ldap.is_encrypted() {
            warn!(server = %ldap.server, "directory connection is not encrypted; passwords travel in clear text");
        }
        if ldap.allow_self_signed {
            warn!("ldap.allow_self_signed is set; server certificates are not verified");
        }
        if ldap.bind_user.is_some() && ldap.bind_password.is_none() && !ldap.bind_first {
            warn!("ldap.bind_user is set but no bind password was resolved");
        }
        if self.registration.enabled && self.roles.mapping.is_empty() {
            warn!(
                default_role = %self.registration.default_role,
                "registration is enabled with an empty role mapping; every user gets the default role"
            );
        }
        if !self.security.csrf_enabled || !self.security.wtf_csrf_enabled {
            warn!("CSRF protection is disabled");
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

    /// The resolved connection string.
    pub fn database_uri(&self) -> Result<&str, ConfigError> {
        self.database_uri
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseConnection)
    }
}

/// Pick the user store connection string: the preferred key when present,
/// otherwise the deprecated key with a warning.
pub fn select_database_uri(
    preferred: Option<String>,
    deprecated: Option<String>,
) -> Result<String, ConfigError> {
    match (preferred, deprecated) {
        (Some(uri), _) => {
            debug!("using [database] sql_alchemy_conn");
            Ok(uri)
        }
        (None, Some(uri)) => {
            warn!(
                "[core] sql_alchemy_conn is deprecated; move it to [database] sql_alchemy_conn"
            );
            Ok(uri)
        }
        (None, None) => Err(ConfigError::MissingDatabaseConnection),
    }
}

fn validate_server_url(server: &str) -> Result<(), ConfigError> {
    let rest = server
        .strip_prefix("ldaps://")
        .or_else(|| server.strip_prefix("ldap://"))
        .ok_or_else(|| ConfigError::invalid("ldap.server", "URL must start with ldap:// or ldaps://"))?;

    let authority = rest.split('/').next().unwrap_or("");
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => {
            if port.parse::<u16>().is_err() {
                return Err(ConfigError::invalid("ldap.server", format!("invalid port '{}'", port)));
            }
            host
        }
        _ => authority,
    };
    if host.is_empty() {
        return Err(ConfigError::invalid("ldap.server", "URL has no host"));
    }
    Ok(())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn env_override(env_name: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.trim().is_empty() => {
            debug!(env_name, "connection string taken from environment");
            Some(val)
        }
        _ => None,
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
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

[registration]
enabled = true
default_role = "Viewer"

[roles]
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
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.ldap.server, "ldap://openldap:389");
        assert_eq!(config.ldap.bind_user.as_deref(), Some("cn=admin,dc=example,dc=org"));
        assert!(config.ldap.allow_self_signed);
        assert!(config.registration.enabled);
        assert_eq!(config.registration.default_role, "Viewer");
        assert!(config.roles.sync_at_login);
        assert_eq!(config.roles.mapping.len(), 3);
        assert_eq!(
            config.database.sql_alchemy_conn.as_deref(),
            Some("sqlite:////var/lib/dirauth/users.db")
        );
        assert!(config.core.sql_alchemy_conn.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.ldap.search_base, "dc=example,dc=org");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_bad_mapping_key_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[ldap]
server = "ldap://openldap:389"
search_base = "dc=example,dc=org"
[roles.mapping]
"airflow-admins" = ["Admin"]
"#,
        )
        .unwrap();
        let result = AppConfig::load_from_file(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(ref msg)) if msg.contains("airflow-admins")));
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[ldap]
server = "ldap://localhost"
search_base = "dc=example,dc=org"
"#;
        let config: AppConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.ldap.uid_field, "uid");
        assert_eq!(config.ldap.firstname_field, "givenName");
        assert_eq!(config.ldap.lastname_field, "sn");
        assert_eq!(config.ldap.email_field, "mail");
        assert_eq!(config.ldap.group_field, "memberOf");
        assert_eq!(config.ldap.timeout_secs, 10);
        assert!(!config.ldap.use_tls);
        assert!(!config.ldap.bind_first);
        assert!(!config.registration.enabled);
        assert_eq!(config.registration.default_role, "Public");
        assert!(!config.roles.sync_at_login);
        assert_eq!(config.roles.admin_role, "Admin");
        assert!(config.roles.mapping.is_empty());
        assert!(config.security.csrf_enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_accepts_sample() {
        let config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.validate().unwrap();
    }

    fn invalid_field(config: &AppConfig) -> Option<String> {
        match config.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => Some(field),
            _ => None,
        }
    }

    #[test]
    fn test_validate_rejects_bad_server() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        for bad in ["http://openldap", "ldap://", "openldap:389", "ldap://host:notaport"] {
            config.ldap.server = bad.into();
            assert_eq!(invalid_field(&config).as_deref(), Some("ldap.server"), "{}", bad);
        }
    }

    #[test]
    fn test_validate_rejects_starttls_over_ldaps() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.ldap.server = "ldaps://openldap:636".into();
        config.validate().unwrap();
        config.ldap.use_tls = true;
        assert_eq!(invalid_field(&config).as_deref(), Some("ldap.use_tls"));
    }

    #[test]
    fn test_validate_rejects_bad_dns_and_fields() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.ldap.search_base = "example.org".into();
        assert_eq!(invalid_field(&config).as_deref(), Some("ldap.search_base"));

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.ldap.bind_user = Some("admin".into());
        assert_eq!(invalid_field(&config).as_deref(), Some("ldap.bind_user"));

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.ldap.group_field = "member of".into();
        assert_eq!(invalid_field(&config).as_deref(), Some("ldap.group_field"));

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.ldap.search_filter = Some("(objectClass=person".into());
        assert_eq!(invalid_field(&config).as_deref(), Some("ldap.search_filter"));

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.ldap.timeout_secs = 0;
        assert_eq!(invalid_field(&config).as_deref(), Some("ldap.timeout_secs"));
    }

    #[test]
    fn test_validate_rejects_empty_roles() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.registration.default_role = " ".into();
        assert_eq!(invalid_field(&config).as_deref(), Some("registration.default_role"));

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.roles.admin_role = String::new();
        assert_eq!(invalid_field(&config).as_deref(), Some("roles.admin_role"));
    }

    #[test]
    fn test_select_database_uri() {
        let preferred = select_database_uri(Some("sqlite:///new.db".into()), Some("sqlite:///old.db".into()));
        assert_eq!(preferred.unwrap(), "sqlite:///new.db");

        let fallback = select_database_uri(None, Some("sqlite:///old.db".into()));
        assert_eq!(fallback.unwrap(), "sqlite:///old.db");

        let missing = select_database_uri(None, None);
        assert!(matches!(missing, Err(ConfigError::MissingDatabaseConnection)));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("TEST_DIRAUTH_BIND_PW", "s3cret");

        let toml_str = r#"
[ldap]
server = "ldap://openldap:389"
search_base = "dc=example,dc=org"
bind_user = "cn=admin,dc=example,dc=org"
bind_password_env = "TEST_DIRAUTH_BIND_PW"
[core]
sql_alchemy_conn = "sqlite:///legacy.db"
"#;
        let mut config: AppConfig = toml::from_str(toml_str).unwrap();
        config.resolve_env_vars().unwrap();

        assert_eq!(config.ldap.bind_password.as_deref(), Some("s3cret"));
        assert_eq!(config.database_uri().unwrap(), "sqlite:///legacy.db");
        assert!(!format!("{:?}", config.ldap).contains("s3cret"));

        // Clean up
        std::env::remove_var("TEST_DIRAUTH_BIND_PW");
    }

    #[test]
    fn test_user_filter() {
        let mut ldap: LdapConfig = toml::from_str::<AppConfig>(sample_toml()).unwrap().ldap;
        assert_eq!(ldap.user_filter("jdoe").unwrap().to_string(), "(uid=jdoe)");

        ldap.search_filter = Some("(objectClass=inetOrgPerson)".into());
        assert_eq!(
            ldap.user_filter("j*doe").unwrap().to_string(),
            "(&(objectClass=inetOrgPerson)(uid=j\\2adoe))"
        );

        ldap.search_filter = Some("   ".into());
        assert_eq!(ldap.base_filter(), None);
        assert_eq!(ldap.user_filter("jdoe").unwrap().to_string(), "(uid=jdoe)");
    }

    #[test]
    fn test_validate_blank_and_extended_filters() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.ldap.search_filter = Some(String::new());
        assert!(config.validate().is_ok());

        config.ldap.search_filter =
            Some("(&(objectClass=user)(!(userAccountControl:1.2.840.113556.1.4.803:=2)))".into());
        assert!(config.validate().is_ok());

        config.ldap.search_filter = Some("(uidNumber>=1000)".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_service_credentials() {
        let mut ldap = LdapConfig::default();
        assert!(ldap.service_credentials().unwrap().is_none());

        ldap.bind_user = Some("cn=admin,dc=example,dc=org".into());
        ldap.bind_password_env = Some("LDAP_BIND_PASSWORD".into());
        assert!(matches!(
            ldap.service_credentials(),
            Err(ConfigError::EnvVarMissing { ref var, .. }) if var == "LDAP_BIND_PASSWORD"
        ));

        ldap.bind_password = Some("admin".into());
        assert_eq!(
            ldap.service_credentials().unwrap(),
            Some(("cn=admin,dc=example,dc=org", "admin"))
        );
    }

    #[test]
    fn test_user_dn() {
        let ldap = LdapConfig {
            search_base: "ou=people,dc=example,dc=org".into(),
            ..Default::default()
        };
        assert_eq!(
            ldap.user_dn("doe, john").unwrap().to_string(),
            "uid=doe\\, john,ou=people,dc=example,dc=org"
        );
    }

    #[test]
    fn test_filter_directives() {
        let mut logging = LoggingConfig::default();
        assert_eq!(logging.filter_directives(), "info,dirauth_core::auth=info");
        logging.security_level = "debug".into();
        logging.ldap_debug = true;
        assert_eq!(
            logging.filter_directives(),
            "info,dirauth_core::auth=debug,dirauth_core::directory=debug,ldap3=debug"
        );
    }
}
