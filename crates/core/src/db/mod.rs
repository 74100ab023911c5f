//! SQLite user store.
//!
//! Provides a [`Database`] handle with WAL-mode journaling, automatic schema
//! migrations, and query helpers for the users and roles the authenticator
//! provisions.

pub mod queries;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{CoreError, DatabaseError};

/// Main database handle wrapping a SQLite connection.
///
/// The connection is opened in WAL mode for concurrent-read performance and
/// uses `PRAGMA foreign_keys = ON`. The inner connection is wrapped in a
/// `Mutex` so that `Database` is `Send + Sync`, enabling use inside `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The database is configured with WAL journaling mode and foreign key
    /// enforcement immediately after opening.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read performance.
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        debug!("database opened successfully with WAL mode");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the database named by a connection URI.
    ///
    /// Only SQLite URIs are supported: `sqlite:////abs/path.db`,
    /// `sqlite:///relative/path.db`, and `sqlite://` or `sqlite:///:memory:`
    /// for an in-memory store. Missing parent directories are created.
    pub fn open_uri(uri: &str) -> Result<Self, DatabaseError> {
        match parse_sqlite_uri(uri)? {
            None => {
                debug!("opening in-memory database");
                Self::in_memory()
            }
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Self::new(path)
            }
        }
    }

    /// Open the user store selected by a resolved configuration and bring
    /// its schema up to date.
    pub fn from_config(config: &AppConfig) -> Result<Self, CoreError> {
        let db = Self::open_uri(config.database_uri()?)?;
        db.initialize()?;
        Ok(db)
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run all schema migrations to bring the database up to date.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        info!("initializing database schema");
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!("database schema is up to date");
        Ok(())
    }

    /// Obtain a lock on the underlying connection.
    ///
    /// Prefer using the typed query methods on [`Database`] over raw SQL
    /// whenever possible.
    ///
    /// If the Mutex is poisoned (a previous holder panicked), the lock is
    /// recovered rather than propagating a panic.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Execute a closure inside a SQLite transaction. If the closure returns
    /// `Ok`, the transaction is committed; otherwise it is rolled back.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

/// Path of a SQLite URI, or `None` for an in-memory database.
fn parse_sqlite_uri(uri: &str) -> Result<Option<PathBuf>, DatabaseError> {
    let rest = uri
        .trim()
        .strip_prefix("sqlite://")
        .ok_or_else(|| DatabaseError::UnsupportedUri(redact_uri(uri)))?;
    let rest = rest.split('?').next().unwrap_or("");

    if rest.is_empty() || rest == "/" || rest == "/:memory:" {
        return Ok(None);
    }
    match rest.strip_prefix('/') {
        Some(path) => Ok(Some(PathBuf::from(path))),
        // `sqlite://host/...` has no meaning for a local file.
        None => Err(DatabaseError::UnsupportedUri(redact_uri(uri))),
    }
}

/// Strip credentials from a URI before it is shown in an error.
fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &uri[..scheme_end], &uri[at..])
        }
        _ => uri.to_string(),
    }
}
