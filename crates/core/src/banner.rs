//! Start-up summary of the directory configuration.

use std::fmt;

use tracing::info;

use crate::config::AppConfig;
use crate::roles::RoleMapping;

const RULE: &str = "=================================";

/// The values operators most often need to check after a deploy.
#[derive(Debug, Clone)]
pub struct ConfigSummary<'a> {
    pub server: &'a str,
    pub search_base: &'a str,
    pub group_field: &'a str,
    pub mapping: &'a RoleMapping,
    pub default_role: &'a str,
    pub sync_at_login: bool,
}

impl<'a> ConfigSummary<'a> {
    pub fn new(config: &'a AppConfig) -> Self {
        Self {
            server: &config.ldap.server,
            search_base: &config.ldap.search_base,
            group_field: &config.ldap.group_field,
            mapping: &config.roles.mapping,
            default_role: &config.registration.default_role,
            sync_at_login: config.roles.sync_at_login,
        }
    }

    /// The summary, one line per element.
    pub fn lines(&self) -> Vec<String> {
        vec![
            "=== LDAP CONFIGURATION LOADED ===".to_string(),
            format!("LDAP Server: {}", self.server),
            format!("Search Base: {}", self.search_base),
            format!("Group Field: {}", self.group_field),
            format!("Role Mapping: {}", render_mapping(self.mapping)),
            format!("Default Role: {}", self.default_role),
            format!("Role Sync: {}", self.sync_at_login),
            RULE.to_string(),
        ]
    }

    /// Emit the summary through `tracing` at info level.
    pub fn log(&self) {
        for line in self.lines() {
            info!("{}", line);
        }
    }
}

impl fmt::Display for ConfigSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// `{"<key as written>": ["Role", ...], ...}` in configuration order.
fn render_mapping(mapping: &RoleMapping) -> String {
    let body = mapping
        .iter()
        .map(|entry| {
            let key = serde_json::to_string(entry.key()).unwrap_or_else(|_| entry.key().to_string());
            let roles = serde_json::to_string(entry.roles()).unwrap_or_default();
            format!("{}: {}", key, roles)
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{}}}", body)
}
