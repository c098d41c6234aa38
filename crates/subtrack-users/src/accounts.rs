use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Utc;
use rusqlite::{params, Connection};
use subtrack_core::types::UserId;

use crate::db::{row_to_user, USER_SELECT_SQL};
use crate::error::{Result, UserError};
use crate::types::{NewUser, User};

pub const NAME_MIN: usize = 2;
pub const NAME_MAX: usize = 50;
pub const PASSWORD_MIN: usize = 6;

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Trim and bound a display name.
pub fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    let len = name.chars().count();
    if !(NAME_MIN..=NAME_MAX).contains(&len) {
        return Err(UserError::InvalidName(format!(
            "name must be {NAME_MIN}-{NAME_MAX} characters"
        )));
    }
    Ok(name.to_string())
}

/// Accept `local@domain.tld` shapes only: one `@`, no whitespace, a dot in
/// the domain that is neither its first nor its last character.
pub fn validate_email(email: &str) -> Result<String> {
    let email = normalize_email(email);
    let invalid = || UserError::InvalidEmail(email.clone());
    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    match domain.rfind('.') {
        Some(dot) if dot > 0 && dot + 1 < domain.len() => Ok(email),
        _ => Err(invalid()),
    }
}

pub fn hash_password(password: &str) -> Result<String> {
    if password.chars().count() < PASSWORD_MIN {
        return Err(UserError::WeakPassword { min: PASSWORD_MIN });
    }
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| UserError::Hashing(e.to_string()))
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Validate, hash and insert a new user. Email uniqueness is checked up front
/// so the caller gets AlreadyExists instead of a raw constraint error.
pub fn create_user(conn: &Connection, new: &NewUser) -> Result<User> {
    let name = validate_name(&new.name)?;
    let email = validate_email(&new.email)?;
    if find_by_email(conn, &email)?.is_some() {
        return Err(UserError::AlreadyExists(email));
    }
    let password_hash = hash_password(&new.password)?;

    let now = Utc::now().to_rfc3339();
    let user = User {
        id: UserId::new(),
        name,
        email,
        password_hash,
        role: new.role,
        created_at: now.clone(),
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO users (id, name, email, password_hash, role, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user.id.as_str(),
            user.name,
            user.email,
            user.password_hash,
            user.role.to_string(),
            user.created_at,
            user.updated_at,
        ],
    )?;
    Ok(user)
}

/// Load a user by primary key. Returns None when absent so callers decide
/// whether missing is exceptional in their context.
pub fn get_user(conn: &Connection, id: &UserId) -> Result<Option<User>> {
    let sql = format!("{USER_SELECT_SQL} WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    match stmt.query_row(params![id.as_str()], row_to_user) {
        Ok(u) => Ok(Some(u)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(UserError::DatabaseError(e)),
    }
}

pub fn find_by_email(conn: &Connection, email: &str) -> Result<Option<User>> {
    let sql = format!("{USER_SELECT_SQL} WHERE email = ?1");
    let mut stmt = conn.prepare(&sql)?;
    match stmt.query_row(params![normalize_email(email)], row_to_user) {
        Ok(u) => Ok(Some(u)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(UserError::DatabaseError(e)),
    }
}

pub fn list_users(conn: &Connection) -> Result<Vec<User>> {
    let sql = format!("{USER_SELECT_SQL} ORDER BY created_at ASC, id ASC");
    let mut stmt = conn.prepare(&sql)?;
    let users = stmt
        .query_map([], row_to_user)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(users)
}

pub fn rename_user(conn: &Connection, id: &UserId, name: &str) -> Result<User> {
    let name = validate_name(name)?;
    let now = Utc::now().to_rfc3339();
    let rows = conn.execute(
        "UPDATE users SET name = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.as_str(), name, now],
    )?;
    if rows == 0 {
        return Err(UserError::NotFound(id.to_string()));
    }
    get_user(conn, id)?.ok_or_else(|| UserError::NotFound(id.to_string()))
}

pub fn delete_user(conn: &Connection, id: &UserId) -> Result<()> {
    let rows = conn.execute("DELETE FROM users WHERE id = ?1", params![id.as_str()])?;
    if rows == 0 {
        return Err(UserError::NotFound(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        conn
    }

    fn new_user(email: &str) -> NewUser {
        NewUser {
            name: "  Ada Lovelace ".to_string(),
            email: email.to_string(),
            password: "hunter22".to_string(),
            role: Default::default(),
        }
    }

    #[test]
    fn create_trims_lowercases_and_hashes() {
        let conn = conn();
        let user = create_user(&conn, &new_user(" Ada@Example.COM ")).unwrap();
        assert_eq!(user.name, "Ada Lovelace");
        assert_eq!(user.email, "ada@example.com");
        assert_ne!(user.password_hash, "hunter22");
        assert!(user.password_hash.starts_with("$argon2"));
        assert!(verify_password(&user.password_hash, "hunter22"));
        assert!(!verify_password(&user.password_hash, "hunter23"));
    }

    #[test]
    fn duplicate_email_is_rejected_case_insensitively() {
        let conn = conn();
        create_user(&conn, &new_user("ada@example.com")).unwrap();
        let err = create_user(&conn, &new_user("ADA@example.com")).unwrap_err();
        assert!(matches!(err, UserError::AlreadyExists(_)));
    }

    #[test]
    fn validation_rules() {
        assert!(validate_name("A").is_err());
        assert!(validate_name(&"x".repeat(51)).is_err());
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("a@nodot").is_err());
        assert!(validate_email("a@b.").is_err());
        assert!(validate_email("a b@c.io").is_err());
        assert!(validate_email("a@b.io").is_ok());
        assert!(matches!(
            hash_password("12345"),
            Err(UserError::WeakPassword { min: 6 })
        ));
    }

    #[test]
    fn rename_and_delete_missing_user() {
        let conn = conn();
        let user = create_user(&conn, &new_user("ada@example.com")).unwrap();
        let renamed = rename_user(&conn, &user.id, "Countess").unwrap();
        assert_eq!(renamed.name, "Countess");

        delete_user(&conn, &user.id).unwrap();
        assert!(get_user(&conn, &user.id).unwrap().is_none());
        assert!(matches!(
            delete_user(&conn, &user.id),
            Err(UserError::NotFound(_))
        ));
    }

    #[test]
    fn password_hash_is_not_serialized() {
        let conn = conn();
        let user = create_user(&conn, &new_user("ada@example.com")).unwrap();
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password_hash").is_none());
        assert_eq!(json["role"], "user");
    }
}
