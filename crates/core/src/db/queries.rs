//! Typed query helpers for the users and roles tables.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{UserProfile, UserRecord};

const USER_COLUMNS: &str = "id, username, first_name, last_name, email, active, created_on, \
                            changed_on, last_login, login_count, fail_login_count";

/// A row from the `roles` table with its member count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleEntry {
    pub id: i64,
    pub name: String,
    pub members: i64,
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- users --------------------------------------------------------------

    /// Look up a user by username (case-insensitive), roles included.
    pub fn find_user(&self, username: &str) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM users WHERE username = ?1 COLLATE NOCASE",
            USER_COLUMNS
        );
        let user = conn
            .query_row(&sql, params![username], row_to_user)
            .optional()?;
        match user {
            Some(mut user) => {
                user.roles = roles_of(&conn, user.id)?;
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    /// Create a user with the given roles; roles that do not exist yet are
    /// created. A taken username is an error.
    pub fn insert_user(
        &self,
        username: &str,
        profile: &UserProfile,
        roles: &[String],
    ) -> Result<UserRecord, DatabaseError> {
        let id = self.insert_with(username, profile, roles, false)?;
        debug!(id, username, ?roles, "inserted user");
        self.require_user(username)
    }

    /// Like [`Database::insert_user`], but returns `None` when the username
    /// is already taken instead of failing, so two first logins of the same
    /// user can race safely.
    pub fn register_user(
        &self,
        username: &str,
        profile: &UserProfile,
        roles: &[String],
    ) -> Result<Option<UserRecord>, DatabaseError> {
        match self.insert_with(username, profile, roles, true)? {
            Some(id) => {
                debug!(id, username, ?roles, "registered user");
                self.require_user(username).map(Some)
            }
            None => Ok(None),
        }
    }

    fn insert_with(
        &self,
        username: &str,
        profile: &UserProfile,
        roles: &[String],
        skip_existing: bool,
    ) -> Result<Option<i64>, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let mut sql = String::from(
            "INSERT INTO users (username, first_name, last_name, email, active, created_on, changed_on)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
        );
        if skip_existing {
            sql.push_str(" ON CONFLICT DO NOTHING");
        }
        self.transaction(|conn| {
            let inserted = conn.execute(
                &sql,
                params![username, profile.first_name, profile.last_name, profile.email, now],
            )?;
            if inserted == 0 {
                return Ok(None);
            }
            let id = conn.last_insert_rowid();
            replace_roles(conn, id, roles)?;
            Ok(Some(id))
        })
    }

    /// Overwrite the profile fields of a user.
    pub fn update_profile(&self, user_id: i64, profile: &UserProfile) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn().execute(
            "UPDATE users SET first_name = ?1, last_name = ?2, email = ?3, changed_on = ?4 WHERE id = ?5",
            params![profile.first_name, profile.last_name, profile.email, now, user_id],
        )?;
        ensure_found(changed, user_id)?;
        debug!(user_id, "updated user profile");
        Ok(())
    }

    /// Replace the roles of a user.
    pub fn set_user_roles(&self, user_id: i64, roles: &[String]) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.transaction(|conn| {
            let changed = conn.execute(
                "UPDATE users SET changed_on = ?1 WHERE id = ?2",
                params![now, user_id],
            )?;
            ensure_found(changed, user_id)?;
            replace_roles(conn, user_id, roles)
        })?;
        debug!(user_id, ?roles, "replaced user roles");
        Ok(())
    }

    /// Enable or disable a user.
    pub fn set_active(&self, user_id: i64, active: bool) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn().execute(
            "UPDATE users SET active = ?1, changed_on = ?2 WHERE id = ?3",
            params![active, now, user_id],
        )?;
        ensure_found(changed, user_id)?;
        debug!(user_id, active, "set user active flag");
        Ok(())
    }

    /// Count a successful login and reset the failure counter.
    pub fn record_login_success(&self, user_id: i64) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn().execute(
            "UPDATE users SET last_login = ?1, login_count = login_count + 1, fail_login_count = 0
             WHERE id = ?2",
            params![now, user_id],
        )?;
        ensure_found(changed, user_id)
    }

    /// Count a failed login.
    pub fn record_login_failure(&self, user_id: i64) -> Result<(), DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE users SET fail_login_count = fail_login_count + 1 WHERE id = ?1",
            params![user_id],
        )?;
        ensure_found(changed, user_id)
    }

    /// All users ordered by username.
    pub fn list_users(&self) -> Result<Vec<UserRecord>, DatabaseError> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM users ORDER BY username COLLATE NOCASE", USER_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let users = stmt
            .query_map([], row_to_user)?
            .collect::<Result<Vec<_>, _>>()?;

        users
            .into_iter()
            .map(|mut user| {
                user.roles = roles_of(&conn, user.id)?;
                Ok(user)
            })
            .collect()
    }

    fn require_user(&self, username: &str) -> Result<UserRecord, DatabaseError> {
        self.find_user(username)?.ok_or_else(|| DatabaseError::NotFound {
            entity: "user".into(),
            id: username.to_string(),
        })
    }

    // -- roles --------------------------------------------------------------

    /// Return the id of role `name`, creating it when missing.
    pub fn ensure_role(&self, name: &str) -> Result<i64, DatabaseError> {
        ensure_role_on(&self.conn(), name)
    }

    /// All roles ordered by name, with member counts.
    pub fn list_roles(&self) -> Result<Vec<RoleEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.name, COUNT(ur.user_id)
             FROM roles r LEFT JOIN user_roles ur ON ur.role_id = r.id
             GROUP BY r.id, r.name
             ORDER BY r.name",
        )?;
        let roles = stmt
            .query_map([], |row| {
                Ok(RoleEntry {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    members: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(roles)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_role_on(conn: &Connection, name: &str) -> Result<i64, DatabaseError> {
    conn.execute("INSERT OR IGNORE INTO roles (name) VALUES (?1)", params![name])?;
    let id = conn.query_row("SELECT id FROM roles WHERE name = ?1", params![name], |row| {
        row.get(0)
    })?;
    Ok(id)
}

fn replace_roles(conn: &Connection, user_id: i64, roles: &[String]) -> Result<(), DatabaseError> {
    conn.execute("DELETE FROM user_roles WHERE user_id = ?1", params![user_id])?;
    for role in roles {
        let role_id = ensure_role_on(conn, role)?;
        conn.execute(
            "INSERT OR IGNORE INTO user_roles (user_id, role_id) VALUES (?1, ?2)",
            params![user_id, role_id],
        )?;
    }
    Ok(())
}

fn roles_of(conn: &Connection, user_id: i64) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT r.name FROM roles r JOIN user_roles ur ON ur.role_id = r.id
         WHERE ur.user_id = ?1 ORDER BY r.name",
    )?;
    let roles = stmt
        .query_map(params![user_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(roles)
}

fn ensure_found(changed: usize, user_id: i64) -> Result<(), DatabaseError> {
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "user".into(),
            id: user_id.to_string(),
        });
    }
    Ok(())
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        profile: UserProfile {
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            email: row.get(4)?,
        },
        active: row.get(5)?,
        roles: Vec::new(),
        created_on: parse_timestamp(row, 6)?,
        changed_on: parse_timestamp(row, 7)?,
        last_login: match row.get::<_, Option<String>>(8)? {
            Some(_) => Some(parse_timestamp(row, 8)?),
            None => None,
        },
        login_count: row.get(9)?,
        fail_login_count: row.get(10)?,
    })
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn profile() -> UserProfile {
        UserProfile {
            first_name: "John".into(),
            last_name: "Doe".into(),
            email: "jdoe@example.org".into(),
        }
    }

    fn roles(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_insert_and_find_user() {
        let db = test_db();
        let user = db.insert_user("jdoe", &profile(), &roles(&["User", "Viewer"])).unwrap();
        assert_eq!(user.username, "jdoe");
        assert!(user.active);
        assert_eq!(user.roles, vec!["User", "Viewer"]);
        assert_eq!(user.login_count, 0);
        assert!(user.last_login.is_none());

        let found = db.find_user("JDOE").unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.profile.email, "jdoe@example.org");

        assert!(db.find_user("nobody").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let db = test_db();
        db.insert_user("jdoe", &profile(), &[]).unwrap();
        let result = db.insert_user("jdoe", &profile(), &[]);
        assert!(matches!(result, Err(DatabaseError::SqliteError(_))));
    }

    #[test]
    fn test_register_user_skips_taken_name() {
        let db = test_db();
        let first = db
            .register_user("jdoe", &profile(), &roles(&["User"]))
            .unwrap()
            .unwrap();
        assert_eq!(first.roles, vec!["User"]);

        let second = db.register_user("JDoe", &profile(), &roles(&["Admin"])).unwrap();
        assert!(second.is_none());

        let users = db.list_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].roles, vec!["User"]);
    }

    #[test]
    fn test_update_profile_and_roles() {
        let db = test_db();
        let user = db.insert_user("jdoe", &profile(), &roles(&["Viewer"])).unwrap();

        let mut changed = profile();
        changed.email = "john.doe@example.org".into();
        db.update_profile(user.id, &changed).unwrap();
        db.set_user_roles(user.id, &roles(&["Admin"])).unwrap();

        let found = db.find_user("jdoe").unwrap().unwrap();
        assert_eq!(found.profile.email, "john.doe@example.org");
        assert_eq!(found.roles, vec!["Admin"]);
        assert!(found.changed_on >= user.changed_on);
    }

    #[test]
    fn test_missing_user_is_not_found() {
        let db = test_db();
        assert!(matches!(
            db.set_active(42, false),
            Err(DatabaseError::NotFound { .. })
        ));
        assert!(matches!(
            db.set_user_roles(42, &[]),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn test_login_counters() {
        let db = test_db();
        let user = db.insert_user("jdoe", &profile(), &[]).unwrap();

        db.record_login_failure(user.id).unwrap();
        db.record_login_failure(user.id).unwrap();
        assert_eq!(db.find_user("jdoe").unwrap().unwrap().fail_login_count, 2);

        db.record_login_success(user.id).unwrap();
        let found = db.find_user("jdoe").unwrap().unwrap();
        assert_eq!(found.login_count, 1);
        assert_eq!(found.fail_login_count, 0);
        assert!(found.last_login.is_some());
    }

    #[test]
    fn test_set_active() {
        let db = test_db();
        let user = db.insert_user("jdoe", &profile(), &[]).unwrap();
        db.set_active(user.id, false).unwrap();
        assert!(!db.find_user("jdoe").unwrap().unwrap().active);
    }

    #[test]
    fn test_list_users_and_roles() {
        let db = test_db();
        db.insert_user("zoe", &profile(), &roles(&["User"])).unwrap();
        db.insert_user("adam", &profile(), &roles(&["Admin", "User"])).unwrap();
        db.ensure_role("Public").unwrap();

        let users = db.list_users().unwrap();
        let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["adam", "zoe"]);
        assert_eq!(users[0].roles, vec!["Admin", "User"]);

        let listed = db.list_roles().unwrap();
        let summary: Vec<(&str, i64)> = listed.iter().map(|r| (r.name.as_str(), r.members)).collect();
        assert_eq!(summary, vec![("Admin", 1), ("Public", 0), ("User", 2)]);
    }

    #[test]
    fn test_ensure_role_is_idempotent() {
        let db = test_db();
        let first = db.ensure_role("Viewer").unwrap();
        let second = db.ensure_role("Viewer").unwrap();
        assert_eq!(first, second);
    }
}
