//! dirauth core library.
//!
//! LDAP authentication for a web application's security manager:
//! configuration loading and validation, DN and search filter handling,
//! group-to-role mapping, directory access, the login flow, and the SQLite
//! store that holds provisioned users.

pub mod auth;
pub mod banner;
pub mod config;
pub mod db;
pub mod directory;
pub mod dn;
pub mod errors;
pub mod filter;
pub mod models;
pub mod roles;

// Re-exports for convenience.
pub use auth::Authenticator;
pub use banner::ConfigSummary;
pub use config::AppConfig;
pub use db::Database;
pub use directory::{LdapConnector, MemoryDirectory};
pub use dn::DistinguishedName;
pub use filter::Filter;
pub use roles::RoleMapping;
