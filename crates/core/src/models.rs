//! Domain model types shared by the authenticator, the user store and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::directory::DirectoryEntry;

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Profile fields copied from the directory entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl UserProfile {
    /// Read the profile from `entry` using the configured attribute names.
    /// Missing attributes become empty strings.
    pub fn from_entry(entry: &DirectoryEntry, first: &str, last: &str, email: &str) -> Self {
        let read = |attr: &str| entry.first(attr).unwrap_or_default().trim().to_string();
        Self {
            first_name: read(first),
            last_name: read(last),
            email: read(email),
        }
    }
}

/// A locally provisioned user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    #[serde(flatten)]
    pub profile: UserProfile,
    pub active: bool,
    pub roles: Vec<String>,
    pub created_on: DateTime<Utc>,
    pub changed_on: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub login_count: i64,
    pub fail_login_count: i64,
}

impl UserRecord {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

// ---------------------------------------------------------------------------
// Login result
// ---------------------------------------------------------------------------

/// Outcome of a successful login.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedUser {
    pub user: UserRecord,
    /// DN of the directory entry that authenticated.
    pub dn: String,
    /// Values of the group attribute, as returned by the server.
    pub groups: Vec<String>,
    /// The local user was created by this login.
    pub newly_registered: bool,
}

impl AuthenticatedUser {
    pub fn is_admin(&self, admin_role: &str) -> bool {
        self.user.has_role(admin_role)
    }
}
