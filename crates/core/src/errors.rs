//! Error types for the dirauth core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! None of these messages ever carry a bind password.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dn(#[from] DnError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    RoleMapping(#[from] RoleMappingError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Neither the preferred nor the deprecated database key is set.
    #[error(
        "no database connection configured: set [database] sql_alchemy_conn \
         (or the deprecated [core] sql_alchemy_conn)"
    )]
    MissingDatabaseConnection,

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidValue`].
    pub fn invalid(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            detail: detail.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Distinguished names
// ---------------------------------------------------------------------------

/// Errors from parsing a distinguished name.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnError {
    /// The input was empty or only whitespace.
    #[error("distinguished name is empty")]
    Empty,

    /// An RDN component has no `=` separator.
    #[error("RDN '{0}' is missing '='")]
    MissingEquals(String),

    /// An attribute type is empty or not a descriptor / numeric OID.
    #[error("invalid attribute type '{0}'")]
    InvalidAttributeType(String),

    /// An RDN (between two commas) is empty.
    #[error("empty RDN at position {0}")]
    EmptyRdn(usize),

    /// A backslash escape is malformed.
    #[error("invalid escape sequence at position {0}")]
    InvalidEscape(usize),

    /// A special character appears unescaped inside a value.
    #[error("unescaped '{ch}' at position {pos}")]
    UnescapedSpecial { ch: char, pos: usize },
}

// ---------------------------------------------------------------------------
// Search filters
// ---------------------------------------------------------------------------

/// Errors from parsing an LDAP search filter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    /// The filter was empty.
    #[error("search filter is empty")]
    Empty,

    /// Parser hit something unexpected.
    #[error("unexpected {found} at position {pos} in search filter")]
    Unexpected { found: String, pos: usize },

    /// Filter ended before it was complete.
    #[error("search filter ended unexpectedly")]
    UnexpectedEnd,

    /// Trailing input after the closing parenthesis.
    #[error("trailing characters after search filter at position {0}")]
    Trailing(usize),

    /// A `\XX` escape in an assertion value is malformed.
    #[error("invalid escape in search filter at position {0}")]
    InvalidEscape(usize),
}

// ---------------------------------------------------------------------------
// Role mapping
// ---------------------------------------------------------------------------

/// Errors building a group-to-role mapping.
#[derive(Debug, Error)]
pub enum RoleMappingError {
    /// A mapping key is not a valid DN.
    #[error("role mapping key '{key}' is not a valid DN: {source}")]
    InvalidGroupDn {
        key: String,
        #[source]
        source: DnError,
    },

    /// Two keys normalize to the same DN.
    #[error("role mapping keys '{first}' and '{second}' refer to the same group")]
    DuplicateGroup { first: String, second: String },

    /// A role name is empty.
    #[error("role mapping for '{0}' contains an empty role name")]
    EmptyRoleName(String),
}

// ---------------------------------------------------------------------------
// Directory errors
// ---------------------------------------------------------------------------

/// Errors talking to the directory server.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Could not open a connection (DNS, TCP, TLS handshake, timeout).
    #[error("cannot connect to directory server '{url}': {detail}")]
    Connection { url: String, detail: String },

    /// A TLS setup problem (CA bundle unreadable, StartTLS refused).
    #[error("directory TLS error: {0}")]
    Tls(String),

    /// The service account bind was rejected.
    #[error("service bind as '{dn}' failed with result code {code}")]
    ServiceBind { dn: String, code: u32 },

    /// A search operation failed.
    #[error("directory search under '{base}' failed: {detail}")]
    Search { base: String, detail: String },

    /// A service account is configured but its password was not resolved.
    #[error("no bind password resolved for service account '{0}'")]
    MissingBindPassword(String),

    /// Protocol-level error from the client library.
    #[error("directory protocol error: {0}")]
    Protocol(String),
}

impl From<ldap3::LdapError> for DirectoryError {
    fn from(err: ldap3::LdapError) -> Self {
        Self::Protocol(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Authentication errors
// ---------------------------------------------------------------------------

/// Outcomes of a failed login.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Wrong password, or an empty username/password.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// No directory entry matched the username.
    #[error("user '{0}' not found in directory")]
    UserNotFound(String),

    /// More than one entry matched the username.
    #[error("username '{username}' matched {count} directory entries")]
    AmbiguousUser { username: String, count: usize },

    /// Account disabled in the directory or locally.
    #[error("account '{0}' is disabled")]
    AccountDisabled(String),

    /// The user is unknown locally and self-registration is off.
    #[error("user '{0}' is not registered and registration is disabled")]
    RegistrationDisabled(String),

    /// A new user would end up with no roles.
    #[error("user '{0}' maps to no roles")]
    NoRoles(String),

    /// Directory unreachable or misbehaving.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Local user store failure.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl AuthError {
    /// Whether the failure was caused by the user (as opposed to the system).
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials
                | Self::UserNotFound(_)
                | Self::AccountDisabled(_)
                | Self::RegistrationDisabled(_)
                | Self::NoRoles(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite user store.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// The connection URI does not point at a SQLite database.
    #[error("unsupported database URI '{0}': only sqlite:// is supported")]
    UnsupportedUri(String),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
