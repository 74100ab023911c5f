//! Directory server access.
//!
//! The authenticator talks to the directory through two small traits so the
//! same login flow runs against a real server ([`ldap::LdapConnector`]) or
//! an in-process fixture ([`memory::MemoryDirectory`]).

pub mod ldap;
pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::DirectoryError;
use crate::filter::Filter;

pub use ldap::LdapConnector;
pub use memory::MemoryDirectory;

/// LDAP result code for `invalidCredentials`.
pub const RC_INVALID_CREDENTIALS: u32 = 49;
/// LDAP result code for `unwillingToPerform` (disabled / locked accounts).
pub const RC_UNWILLING_TO_PERFORM: u32 = 53;
/// LDAP result code for `noSuchObject`.
pub const RC_NO_SUCH_OBJECT: u32 = 32;

/// Outcome of a simple bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStatus {
    Success,
    InvalidCredentials,
    AccountDisabled,
    Other(u32),
}

impl BindStatus {
    /// Classify an LDAP result code.
    pub fn from_rc(rc: u32) -> Self {
        match rc {
            0 => Self::Success,
            RC_INVALID_CREDENTIALS => Self::InvalidCredentials,
            RC_UNWILLING_TO_PERFORM => Self::AccountDisabled,
            other => Self::Other(other),
        }
    }

    /// The LDAP result code this status stands for.
    pub fn rc(&self) -> u32 {
        match self {
            Self::Success => 0,
            Self::InvalidCredentials => RC_INVALID_CREDENTIALS,
            Self::AccountDisabled => RC_UNWILLING_TO_PERFORM,
            Self::Other(rc) => *rc,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A directory entry: DN plus multi-valued attributes.
///
/// Attribute names are matched case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub dn: String,
    attrs: BTreeMap<String, Vec<String>>,
}

impl DirectoryEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter (replaces existing values).
    pub fn with_attr<I, V>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.set_attr(name, values);
        self
    }

    /// Replace the values of an attribute.
    pub fn set_attr<I, V>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.attrs.insert(
            name.to_ascii_lowercase(),
            values.into_iter().map(Into::into).collect(),
        );
    }

    /// All values of an attribute; empty when absent.
    pub fn values(&self, name: &str) -> &[String] {
        self.attrs
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First value of an attribute.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(String::as_str)
    }

    /// A copy restricted to `attrs`; an empty list keeps everything.
    pub fn project(&self, attrs: &[&str]) -> Self {
        if attrs.is_empty() {
            return self.clone();
        }
        let wanted: Vec<String> = attrs.iter().map(|a| a.to_ascii_lowercase()).collect();
        Self {
            dn: self.dn.clone(),
            attrs: self
                .attrs
                .iter()
                .filter(|(k, _)| wanted.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Opens sessions against a directory server.
#[allow(async_fn_in_trait)]
pub trait DirectoryConnector {
    type Session: DirectorySession;

    /// Open a new, unbound session.
    async fn connect(&self) -> Result<Self::Session, DirectoryError>;

    /// Human-readable server address for logs.
    fn server(&self) -> &str;
}

/// One connection to the directory.
#[allow(async_fn_in_trait)]
pub trait DirectorySession {
    /// Simple bind. A rejected bind is a [`BindStatus`], not an error.
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<BindStatus, DirectoryError>;

    /// Subtree search under `base`. A missing base yields no entries.
    async fn search(
        &mut self,
        base: &str,
        filter: &Filter,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>, DirectoryError>;

    /// Close the session.
    async fn unbind(&mut self) -> Result<(), DirectoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_status_codes() {
        assert_eq!(BindStatus::from_rc(0), BindStatus::Success);
        assert_eq!(BindStatus::from_rc(49), BindStatus::InvalidCredentials);
        assert_eq!(BindStatus::from_rc(53), BindStatus::AccountDisabled);
        assert_eq!(BindStatus::from_rc(52), BindStatus::Other(52));
        assert_eq!(BindStatus::Other(52).rc(), 52);
    }

    #[test]
    fn test_entry_attributes_case_insensitive() {
        let entry = DirectoryEntry::new("uid=jdoe,dc=example,dc=org")
            .with_attr("memberOf", ["cn=a,dc=example,dc=org", "cn=b,dc=example,dc=org"])
            .with_attr("givenName", ["John"]);

        assert_eq!(entry.values("MEMBEROF").len(), 2);
        assert_eq!(entry.first("givenname"), Some("John"));
        assert!(entry.values("mail").is_empty());
        assert_eq!(entry.first("mail"), None);

        let projected = entry.project(&["givenName"]);
        assert_eq!(projected.first("givenName"), Some("John"));
        assert!(projected.values("memberOf").is_empty());
    }
}
