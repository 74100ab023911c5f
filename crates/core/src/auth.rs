//! Login against the directory and provisioning of the local user.
//!
//! A login verifies the password with a bind as the user's own DN, reads the
//! profile and group attributes from the user's entry, and then creates or
//! refreshes the local user record. Events are logged under this module's
//! target so operators can route them with `logging.security_level`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::db::Database;
use crate::directory::{BindStatus, DirectoryConnector, DirectoryEntry, DirectorySession};
use crate::errors::{AuthError, DatabaseError, DirectoryError};
use crate::models::{AuthenticatedUser, UserProfile, UserRecord};

/// Authenticates users against a directory and keeps the local store in step.
pub struct Authenticator<C> {
    connector: C,
    config: Arc<AppConfig>,
    db: Arc<Database>,
}

impl<C: DirectoryConnector> Authenticator<C> {
    pub fn new(connector: C, config: Arc<AppConfig>, db: Arc<Database>) -> Self {
        Self {
            connector,
            config,
            db,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Verify `username`/`password` and return the provisioned local user.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthenticatedUser, AuthError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            warn!(username, "login rejected: empty username or password");
            return Err(AuthError::InvalidCredentials);
        }

        let entry = match self.verify(username, password).await {
            Ok(entry) => entry,
            Err(err) => {
                if matches!(err, AuthError::InvalidCredentials) {
                    self.note_failure(username);
                }
                warn!(username, server = self.connector.server(), error = %err, "login failed");
                return Err(err);
            }
        };

        let groups = entry.values(&self.config.ldap.group_field).to_vec();
        debug!(username, dn = %entry.dn, groups = groups.len(), "directory login succeeded");

        let (user, newly_registered) = self.provision(username, &entry, &groups)?;
        self.db.record_login_success(user.id)?;
        let user = self.db.find_user(username)?.unwrap_or(user);

        info!(
            username,
            dn = %entry.dn,
            roles = ?user.roles,
            newly_registered,
            "login succeeded"
        );

        Ok(AuthenticatedUser {
            user,
            dn: entry.dn,
            groups,
            newly_registered,
        })
    }

    // -----------------------------------------------------------------------
    // Directory side
    // -----------------------------------------------------------------------

    /// Bind and search; returns the user's entry on a correct password.
    async fn verify(&self, username: &str, password: &str) -> Result<DirectoryEntry, AuthError> {
        let mut session = self.connector.connect().await?;
        let result = if self.config.ldap.bind_first {
            self.verify_bind_first(&mut session, username, password).await
        } else {
            self.verify_indirect(&mut session, username, password).await
        };
        if let Err(e) = session.unbind().await {
            debug!(error = %e, "unbind failed");
        }
        result
    }

    /// Service bind (or anonymous), search, then bind as the found DN.
    async fn verify_indirect(
        &self,
        session: &mut C::Session,
        username: &str,
        password: &str,
    ) -> Result<DirectoryEntry, AuthError> {
        let ldap = &self.config.ldap;
        match ldap.bind_user.as_deref() {
            Some(bind_dn) => {
                let bind_password = ldap
                    .bind_password
                    .as_deref()
                    .ok_or_else(|| DirectoryError::MissingBindPassword(bind_dn.to_string()))?;
                let status = session.simple_bind(bind_dn, bind_password).await?;
                if !status.is_success() {
                    return Err(DirectoryError::ServiceBind {
                        dn: bind_dn.to_string(),
                        code: status.rc(),
                    }
                    .into());
                }
            }
            None => debug!("no bind user configured, searching anonymously"),
        }

        let entry = self.find_entry(session, username).await?;
        let status = session.simple_bind(&entry.dn, password).await?;
        check_user_bind(status, username)?;
        Ok(entry)
    }

    /// Bind as `<uid_field>=<username>,<search_base>` and search as the user.
    async fn verify_bind_first(
        &self,
        session: &mut C::Session,
        username: &str,
        password: &str,
    ) -> Result<DirectoryEntry, AuthError> {
        let user_dn = self
            .config
            .ldap
            .user_dn(username)
            .map_err(|e| DirectoryError::Protocol(e.to_string()))?;
        let status = session.simple_bind(&user_dn.to_string(), password).await?;
        check_user_bind(status, username)?;
        self.find_entry(session, username).await
    }

    async fn find_entry(
        &self,
        session: &mut C::Session,
        username: &str,
    ) -> Result<DirectoryEntry, AuthError> {
        let ldap = &self.config.ldap;
        let filter = ldap.user_filter(username).map_err(|e| DirectoryError::Search {
            base: ldap.search_base.clone(),
            detail: e.to_string(),
        })?;

        let mut entries = session
            .search(&ldap.search_base, &filter, &ldap.user_attributes())
            .await?;
        match entries.len() {
            0 => Err(AuthError::UserNotFound(username.to_string())),
            1 => Ok(entries.remove(0)),
            count => Err(AuthError::AmbiguousUser {
                username: username.to_string(),
                count,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Local side
    // -----------------------------------------------------------------------

    /// Create or refresh the local user. Returns the record and whether it
    /// was created.
    fn provision(
        &self,
        username: &str,
        entry: &DirectoryEntry,
        groups: &[String],
    ) -> Result<(UserRecord, bool), AuthError> {
        let ldap = &self.config.ldap;
        let profile = UserProfile::from_entry(
            entry,
            &ldap.firstname_field,
            &ldap.lastname_field,
            &ldap.email_field,
        );
        let roles = self
            .config
            .roles
            .calculate_roles(groups, &self.config.registration);

        match self.db.find_user(username)? {
            Some(user) => self.refresh(user, &profile, &roles),
            None if !self.config.registration.enabled => {
                Err(AuthError::RegistrationDisabled(username.to_string()))
            }
            None if roles.is_empty() => Err(AuthError::NoRoles(username.to_string())),
            None => match self.db.register_user(username, &profile, &roles)? {
                Some(user) => {
                    info!(username, roles = ?roles, "registered new user");
                    Ok((user, true))
                }
                None => {
                    debug!(username, "user registered by a concurrent login");
                    let user = self.db.find_user(username)?.ok_or_else(|| {
                        DatabaseError::NotFound {
                            entity: "user".into(),
                            id: username.to_string(),
                        }
                    })?;
                    self.refresh(user, &profile, &roles)
                }
            },
        }
    }

    /// Apply the existing-user rules: inactive users are refused, and with
    /// `sync_at_login` roles and profile follow the directory.
    fn refresh(
        &self,
        user: UserRecord,
        profile: &UserProfile,
        roles: &[String],
    ) -> Result<(UserRecord, bool), AuthError> {
        if !user.active {
            return Err(AuthError::AccountDisabled(user.username));
        }
        if self.config.roles.sync_at_login {
            if user.roles != sorted(roles) {
                info!(username = %user.username, from = ?user.roles, to = ?roles, "syncing roles from directory");
            }
            self.db.update_profile(user.id, profile)?;
            self.db.set_user_roles(user.id, roles)?;
        }
        Ok((user, false))
    }

    fn note_failure(&self, username: &str) {
        let recorded = self
            .db
            .find_user(username)
            .and_then(|user| match user {
                Some(user) => self.db.record_login_failure(user.id),
                None => Ok(()),
            });
        if let Err(e) = recorded {
            warn!(username, error = %e, "could not record failed login");
        }
    }
}

fn check_user_bind(status: BindStatus, username: &str) -> Result<(), AuthError> {
    match status {
        BindStatus::Success => Ok(()),
        BindStatus::InvalidCredentials => Err(AuthError::InvalidCredentials),
        BindStatus::AccountDisabled => Err(AuthError::AccountDisabled(username.to_string())),
        BindStatus::Other(rc) => Err(DirectoryError::Protocol(format!(
            "bind as user returned result code {}",
            rc
        ))
        .into()),
    }
}

fn sorted(roles: &[String]) -> Vec<String> {
    let mut roles = roles.to_vec();
    roles.sort();
    roles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;

    fn config(extra: &str) -> AppConfig {
        let toml_str = format!(
            r#"
[ldap]
server = "ldap://openldap:389"
search_base = "dc=example,dc=org"
bind_user = "cn=admin,dc=example,dc=org"
{}

[registration]
enabled = true
default_role = "Viewer"

[roles.mapping]
"cn=admins,ou=groups,dc=example,dc=org" = ["Admin"]
"#,
            extra
        );
        let mut config: AppConfig = toml::from_str(&toml_str).unwrap();
        config.ldap.bind_password = Some("admin".into());
        config
    }

    fn directory() -> MemoryDirectory {
        let dir = MemoryDirectory::new();
        dir.insert(DirectoryEntry::new("cn=admin,dc=example,dc=org"), Some("admin"))
            .unwrap();
        dir.insert(
            DirectoryEntry::new("uid=alice,ou=people,dc=example,dc=org")
                .with_attr("uid", ["alice"])
                .with_attr("givenName", ["Alice"])
                .with_attr("memberOf", ["cn=admins,ou=groups,dc=example,dc=org"]),
            Some("wonderland"),
        )
        .unwrap();
        dir
    }

    fn authenticator(config: AppConfig, dir: MemoryDirectory) -> Authenticator<MemoryDirectory> {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        Authenticator::new(dir, Arc::new(config), Arc::new(db))
    }

    #[tokio::test]
    async fn test_empty_password_never_binds() {
        let dir = directory();
        let auth = authenticator(config(""), dir.clone());
        let result = auth.authenticate("alice", "").await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
        let result = auth.authenticate("  ", "wonderland").await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
        assert!(dir.bind_log().is_empty());
    }

    #[tokio::test]
    async fn test_indirect_bind_registers_admin() {
        let dir = directory();
        let auth = authenticator(config(""), dir.clone());

        let user = auth.authenticate("alice", "wonderland").await.unwrap();
        assert!(user.newly_registered);
        assert!(user.is_admin("Admin"));
        assert_eq!(user.user.profile.first_name, "Alice");
        assert_eq!(user.user.login_count, 1);
        assert_eq!(
            dir.bind_log(),
            vec!["cn=admin,dc=example,dc=org", "uid=alice,ou=people,dc=example,dc=org"]
        );
    }

    #[tokio::test]
    async fn test_service_bind_failure() {
        let mut cfg = config("");
        cfg.ldap.bind_password = Some("wrong".into());
        let auth = authenticator(cfg, directory());
        let result = auth.authenticate("alice", "wonderland").await;
        assert!(matches!(
            result,
            Err(AuthError::Directory(DirectoryError::ServiceBind { code: 49, .. }))
        ));
    }

    #[tokio::test]
    async fn test_missing_bind_password() {
        let mut cfg = config("");
        cfg.ldap.bind_password = None;
        let dir = directory();
        let auth = authenticator(cfg, dir.clone());
        let result = auth.authenticate("alice", "wonderland").await;
        assert!(matches!(
            result,
            Err(AuthError::Directory(DirectoryError::MissingBindPassword(_)))
        ));
        assert!(dir.bind_log().is_empty());
    }

    #[tokio::test]
    async fn test_bind_first_uses_user_dn() {
        let dir = MemoryDirectory::new();
        dir.insert(
            DirectoryEntry::new("uid=bob,dc=example,dc=org").with_attr("uid", ["bob"]),
            Some("builder"),
        )
        .unwrap();
        let auth = authenticator(config("bind_first = true"), dir.clone());

        let user = auth.authenticate("bob", "builder").await.unwrap();
        assert_eq!(user.dn, "uid=bob,dc=example,dc=org");
        assert_eq!(user.user.roles, vec!["Viewer"]);
        assert_eq!(dir.bind_log(), vec!["uid=bob,dc=example,dc=org"]);
    }

    #[tokio::test]
    async fn test_ambiguous_user() {
        let dir = directory();
        dir.insert(
            DirectoryEntry::new("uid=alice,ou=contractors,dc=example,dc=org").with_attr("uid", ["alice"]),
            Some("x"),
        )
        .unwrap();
        let auth = authenticator(config(""), dir);
        let result = auth.authenticate("alice", "wonderland").await;
        assert!(matches!(result, Err(AuthError::AmbiguousUser { count: 2, .. })));
    }

    #[tokio::test]
    async fn test_no_roles_refuses_new_user() {
        let dir = directory();
        dir.insert(
            DirectoryEntry::new("uid=carl,ou=people,dc=example,dc=org")
                .with_attr("uid", ["carl"])
                .with_attr("memberOf", ["cn=unmapped,ou=groups,dc=example,dc=org"]),
            Some("pw"),
        )
        .unwrap();
        let mut cfg = config("");
        cfg.registration.default_role = String::new();
        let auth = authenticator(cfg, dir);

        let result = auth.authenticate("carl", "pw").await;
        assert!(matches!(result, Err(AuthError::NoRoles(ref u)) if u == "carl"));
        assert!(auth.db.find_user("carl").unwrap().is_none());

        // A mapped group still registers.
        let alice = auth.authenticate("alice", "wonderland").await.unwrap();
        assert_eq!(alice.user.roles, vec!["Admin"]);
    }

    #[tokio::test]
    async fn test_filter_injection_is_escaped() {
        let auth = authenticator(config(""), directory());
        let result = auth.authenticate("*", "wonderland").await;
        assert!(matches!(result, Err(AuthError::UserNotFound(_))));
    }
}
