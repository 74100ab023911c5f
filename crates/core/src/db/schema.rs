//! Database schema definitions and migration runner.
//!
//! Migrations are SQL strings applied in order. The SQLite `user_version`
//! pragma records which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "users and roles",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            username         TEXT    NOT NULL UNIQUE,
            first_name       TEXT    NOT NULL DEFAULT '',
            last_name        TEXT    NOT NULL DEFAULT '',
            email            TEXT    NOT NULL DEFAULT '',
            active           INTEGER NOT NULL DEFAULT 1,
            created_on       TEXT    NOT NULL,
            changed_on       TEXT    NOT NULL,
            last_login       TEXT,
            login_count      INTEGER NOT NULL DEFAULT 0,
            fail_login_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS roles (
            id    INTEGER PRIMARY KEY AUTOINCREMENT,
            name  TEXT    NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS user_roles (
            user_id  INTEGER NOT NULL REFERENCES users (id) ON DELETE CASCADE,
            role_id  INTEGER NOT NULL REFERENCES roles (id) ON DELETE CASCADE,
            PRIMARY KEY (user_id, role_id)
        );

        CREATE INDEX IF NOT EXISTS idx_user_roles_role ON user_roles (role_id);
        "#,
    ),
    (
        2,
        "case-insensitive username lookup",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_users_username_nocase
            ON users (username COLLATE NOCASE);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied");
        }
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for table in ["users", "roles", "user_roles"] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_username_unique_ignoring_case() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let insert = "INSERT INTO users (username, created_on, changed_on) VALUES (?1, 'x', 'x')";
        conn.execute(insert, ["jdoe"]).unwrap();
        assert!(conn.execute(insert, ["JDoe"]).is_err());
    }
}
