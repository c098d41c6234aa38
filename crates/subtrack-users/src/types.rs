use serde::{Deserialize, Serialize};
use subtrack_core::types::{UserId, UserRole};

/// Full user record as stored in SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    /// Trimmed and lower-cased; unique across users.
    pub email: String,
    /// Argon2id PHC string. Never serialized.
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub role: UserRole,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    pub fn contact(&self) -> UserContact {
        UserContact {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

/// The slice of a user a notification needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContact {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

/// Registration input. The password is plaintext here and is hashed before
/// anything touches the database.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub role: UserRole,
}
