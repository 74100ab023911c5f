//! In-process directory used for tests and dry runs.
//!
//! Holds a fixed set of entries with optional passwords. Binds, searches and
//! filter evaluation follow the same rules the real server applies to the
//! subset of operations the authenticator uses.

use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{BindStatus, DirectoryConnector, DirectoryEntry, DirectorySession};
use crate::dn::DistinguishedName;
use crate::errors::DirectoryError;
use crate::filter::Filter;

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: DirectoryEntry,
    dn: DistinguishedName,
    password: Option<String>,
    disabled: bool,
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<StoredEntry>,
    anonymous_search: bool,
    unreachable: bool,
    binds: Vec<String>,
}

/// A directory that lives in memory. Cloning shares the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<State>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Entries without a password cannot be bound to.
    pub fn insert(&self, entry: DirectoryEntry, password: Option<&str>) -> Result<(), DirectoryError> {
        let dn = DistinguishedName::parse(&entry.dn)
            .map_err(|e| DirectoryError::Protocol(format!("invalid DN '{}': {}", entry.dn, e)))?;
        self.lock().entries.push(StoredEntry {
            entry,
            dn,
            password: password.map(str::to_string),
            disabled: false,
        });
        Ok(())
    }

    /// Mark an account as disabled; binds return `unwillingToPerform`.
    pub fn disable(&self, dn: &str) {
        let mut state = self.lock();
        if let Ok(target) = DistinguishedName::parse(dn) {
            for stored in state.entries.iter_mut().filter(|s| s.dn == target) {
                stored.disabled = true;
            }
        }
    }

    /// Replace the values of one attribute on an existing entry. Returns
    /// false when no entry has that DN.
    pub fn replace_attr<I, V>(&self, dn: &str, name: &str, values: I) -> bool
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let Ok(target) = DistinguishedName::parse(dn) else {
            return false;
        };
        let mut state = self.lock();
        match state.entries.iter_mut().find(|s| s.dn == target) {
            Some(stored) => {
                stored.entry.set_attr(name, values);
                true
            }
            None => false,
        }
    }

    /// Allow searches on a session that has not bound.
    pub fn allow_anonymous_search(&self, allow: bool) {
        self.lock().anonymous_search = allow;
    }

    /// Make every `connect` fail, as if the server were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// DNs of every successful bind so far, in order.
    pub fn bind_log(&self) -> Vec<String> {
        self.lock().binds.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DirectoryConnector for MemoryDirectory {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession, DirectoryError> {
        if self.lock().unreachable {
            return Err(DirectoryError::Connection {
                url: self.server().to_string(),
                detail: "connection refused".into(),
            });
        }
        Ok(MemorySession {
            directory: self.clone(),
            bound_as: None,
        })
    }

    fn server(&self) -> &str {
        "memory://"
    }
}

/// A session on a [`MemoryDirectory`].
#[derive(Debug)]
pub struct MemorySession {
    directory: MemoryDirectory,
    bound_as: Option<String>,
}

impl DirectorySession for MemorySession {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<BindStatus, DirectoryError> {
        let Ok(target) = DistinguishedName::parse(dn) else {
            return Ok(BindStatus::InvalidCredentials);
        };

        let mut state = self.directory.lock();
        let status = match state.entries.iter().find(|s| s.dn == target) {
            Some(stored) if stored.disabled => BindStatus::AccountDisabled,
            Some(stored) => match &stored.password {
                Some(expected) if !password.is_empty() && expected == password => BindStatus::Success,
                _ => BindStatus::InvalidCredentials,
            },
            None => BindStatus::InvalidCredentials,
        };

        if status.is_success() {
            state.binds.push(dn.to_string());
            self.bound_as = Some(dn.to_string());
        } else {
            self.bound_as = None;
        }
        debug!(dn, ?status, "memory directory bind");
        Ok(status)
    }

    async fn search(
        &mut self,
        base: &str,
        filter: &Filter,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let state = self.directory.lock();
        if self.bound_as.is_none() && !state.anonymous_search {
            return Err(DirectoryError::Search {
                base: base.to_string(),
                detail: "anonymous search not permitted".into(),
            });
        }

        let base_dn = DistinguishedName::parse(base).map_err(|e| DirectoryError::Search {
            base: base.to_string(),
            detail: e.to_string(),
        })?;

        Ok(state
            .entries
            .iter()
            .filter(|s| s.dn.is_within(&base_dn))
            .filter(|s| filter.matches(&s.entry))
            .map(|s| s.entry.project(attrs))
            .collect())
    }

    async fn unbind(&mut self) -> Result<(), DirectoryError> {
        self.bound_as = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> MemoryDirectory {
        let dir = MemoryDirectory::new();
        dir.insert(DirectoryEntry::new("cn=admin,dc=example,dc=org"), Some("admin"))
            .unwrap();
        dir.insert(
            DirectoryEntry::new("uid=jdoe,ou=people,dc=example,dc=org")
                .with_attr("uid", ["jdoe"])
                .with_attr("mail", ["jdoe@example.org"]),
            Some("secret"),
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_bind_outcomes() {
        let dir = directory();
        let mut session = dir.connect().await.unwrap();

        let status = session.simple_bind("cn=admin,dc=example,dc=org", "admin").await.unwrap();
        assert_eq!(status, BindStatus::Success);

        let status = session.simple_bind("cn=admin,dc=example,dc=org", "wrong").await.unwrap();
        assert_eq!(status, BindStatus::InvalidCredentials);

        let status = session.simple_bind("cn=admin,dc=example,dc=org", "").await.unwrap();
        assert_eq!(status, BindStatus::InvalidCredentials);

        dir.disable("uid=jdoe,ou=people,dc=example,dc=org");
        let status = session
            .simple_bind("uid=jdoe,ou=people,dc=example,dc=org", "secret")
            .await
            .unwrap();
        assert_eq!(status, BindStatus::AccountDisabled);

        assert_eq!(dir.bind_log(), vec!["cn=admin,dc=example,dc=org"]);
    }

    #[tokio::test]
    async fn test_search_requires_bind() {
        let dir = directory();
        let mut session = dir.connect().await.unwrap();
        let filter = Filter::equality("uid", "jdoe");

        let result = session.search("dc=example,dc=org", &filter, &[]).await;
        assert!(matches!(result, Err(DirectoryError::Search { .. })));

        dir.allow_anonymous_search(true);
        let found = session.search("dc=example,dc=org", &filter, &["mail"]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].first("mail"), Some("jdoe@example.org"));
        assert!(found[0].values("uid").is_empty());

        let none = session.search("ou=groups,dc=example,dc=org", &filter, &[]).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable() {
        let dir = directory();
        dir.set_unreachable(true);
        assert!(matches!(
            dir.connect().await,
            Err(DirectoryError::Connection { .. })
        ));
    }
}
