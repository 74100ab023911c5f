//! `ldap3`-backed directory connector.
//!
//! Supports `ldap://` (optionally upgraded with StartTLS) and `ldaps://`.
//! When `allow_self_signed` is set, certificate verification is disabled;
//! a custom CA bundle can be supplied with `tls_ca_cert_file`.

use std::time::Duration;

use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry, SearchResult};
use tracing::{debug, info, warn};

use super::{BindStatus, DirectoryConnector, DirectoryEntry, DirectorySession, RC_NO_SUCH_OBJECT};
use crate::config::LdapConfig;
use crate::errors::DirectoryError;
use crate::filter::Filter;

/// Connects to the configured directory server with `ldap3`.
#[derive(Clone)]
pub struct LdapConnector {
    url: String,
    timeout: Duration,
    start_tls: bool,
    no_tls_verify: bool,
    tls_connector: Option<native_tls::TlsConnector>,
}

impl LdapConnector {
    /// Build a connector from the LDAP section of the configuration.
    ///
    /// Reads the CA bundle (if any) immediately so a bad path fails at
    /// start-up rather than on the first login.
    pub fn new(config: &LdapConfig) -> Result<Self, DirectoryError> {
        let tls_connector = match &config.tls_ca_cert_file {
            Some(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    DirectoryError::Tls(format!("cannot read CA file '{}': {}", path.display(), e))
                })?;
                let cert = native_tls::Certificate::from_pem(&pem).map_err(|e| {
                    DirectoryError::Tls(format!("invalid CA file '{}': {}", path.display(), e))
                })?;
                let connector = native_tls::TlsConnector::builder()
                    .add_root_certificate(cert)
                    .danger_accept_invalid_certs(config.allow_self_signed)
                    .build()
                    .map_err(|e| DirectoryError::Tls(e.to_string()))?;
                debug!(path = %path.display(), "loaded directory CA bundle");
                Some(connector)
            }
            None => None,
        };

        if config.allow_self_signed {
            warn!(server = %config.server, "TLS certificate verification is disabled for the directory");
        }

        Ok(Self {
            url: config.server.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            start_tls: config.use_tls,
            no_tls_verify: config.allow_self_signed,
            tls_connector,
        })
    }

    fn settings(&self) -> LdapConnSettings {
        let mut settings = LdapConnSettings::new()
            .set_conn_timeout(self.timeout)
            .set_starttls(self.start_tls)
            .set_no_tls_verify(self.no_tls_verify);
        if let Some(connector) = &self.tls_connector {
            settings = settings.set_connector(connector.clone());
        }
        settings
    }

    /// Connect and, when a bind DN is given, perform the service bind.
    ///
    /// Used at start-up to check that the server is reachable and the
    /// service credentials work.
    pub async fn ping(&self, bind_dn: Option<&str>, password: &str) -> Result<(), DirectoryError> {
        let mut session = self.connect().await?;
        if let Some(dn) = bind_dn {
            let status = session.simple_bind(dn, password).await?;
            if !status.is_success() {
                let _ = session.unbind().await;
                return Err(DirectoryError::ServiceBind {
                    dn: dn.to_string(),
                    code: status.rc(),
                });
            }
        }
        session.unbind().await?;
        info!(server = %self.url, "directory server reachable");
        Ok(())
    }
}

impl DirectoryConnector for LdapConnector {
    type Session = LdapSession;

    async fn connect(&self) -> Result<LdapSession, DirectoryError> {
        debug!(server = %self.url, start_tls = self.start_tls, "connecting to directory server");
        let (conn, ldap) = LdapConnAsync::with_settings(self.settings(), &self.url)
            .await
            .map_err(|e| DirectoryError::Connection {
                url: self.url.clone(),
                detail: e.to_string(),
            })?;
        ldap3::drive!(conn);
        Ok(LdapSession {
            ldap,
            timeout: self.timeout,
        })
    }

    fn server(&self) -> &str {
        &self.url
    }
}

/// A live `ldap3` connection.
pub struct LdapSession {
    ldap: Ldap,
    timeout: Duration,
}

impl DirectorySession for LdapSession {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<BindStatus, DirectoryError> {
        let result = self
            .ldap
            .with_timeout(self.timeout)
            .simple_bind(dn, password)
            .await?;
        let status = BindStatus::from_rc(result.rc);
        debug!(dn, rc = result.rc, "simple bind");
        Ok(status)
    }

    async fn search(
        &mut self,
        base: &str,
        filter: &Filter,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let filter_str = filter.to_string();
        debug!(base, filter = %filter_str, "directory search");

        let SearchResult(entries, result) = self
            .ldap
            .with_timeout(self.timeout)
            .search(base, Scope::Subtree, &filter_str, attrs.to_vec())
            .await?;

        if result.rc == RC_NO_SUCH_OBJECT {
            debug!(base, "search base does not exist");
            return Ok(Vec::new());
        }
        if result.rc != 0 {
            return Err(DirectoryError::Search {
                base: base.to_string(),
                detail: format!("result code {}: {}", result.rc, result.text),
            });
        }

        Ok(entries
            .into_iter()
            .map(SearchEntry::construct)
            .map(entry_from_search)
            .collect())
    }

    async fn unbind(&mut self) -> Result<(), DirectoryError> {
        self.ldap.unbind().await?;
        Ok(())
    }
}

fn entry_from_search(entry: SearchEntry) -> DirectoryEntry {
    let mut out = DirectoryEntry::new(entry.dn);
    for (name, values) in entry.attrs {
        out.set_attr(&name, values);
    }
    out
}
