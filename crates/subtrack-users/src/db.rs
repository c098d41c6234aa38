use rusqlite::{Connection, Result};
use subtrack_core::types::{UserId, UserRole};

use crate::types::User;

pub(crate) const USER_SELECT_SQL: &str =
    "SELECT id, name, email, password_hash, role, created_at, updated_at FROM users";

/// Map a SELECT row (column order from USER_SELECT_SQL) to a User.
pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    use std::str::FromStr;
    let role = UserRole::from_str(&row.get::<_, String>(4)?).unwrap_or_default();
    Ok(User {
        id: UserId(row.get(0)?),
        name: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        role,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Initialise the users table. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY NOT NULL,
            name            TEXT NOT NULL,
            email           TEXT NOT NULL UNIQUE,
            password_hash   TEXT NOT NULL,
            role            TEXT NOT NULL DEFAULT 'user',
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );",
    )
}
