use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use subtrack_core::types::UserId;
use tracing::{info, instrument};

use crate::accounts;
use crate::error::{Result, UserError};
use crate::types::{NewUser, User, UserContact};

/// Thread-safe user directory backed by SQLite.
///
/// Wraps a shared connection; every call holds the lock only for the
/// duration of its own statements.
pub struct UserDirectory {
    db: Arc<Mutex<Connection>>,
}

impl UserDirectory {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[instrument(skip(self, new), fields(email = %new.email))]
    pub fn register(&self, new: &NewUser) -> Result<User> {
        let user = accounts::create_user(&self.conn(), new)?;
        info!(user_id = %user.id, role = %user.role, "user registered");
        Ok(user)
    }

    pub fn get(&self, id: &UserId) -> Result<Option<User>> {
        accounts::get_user(&self.conn(), id)
    }

    /// Notification recipient for a user, if the user still exists.
    pub fn contact(&self, id: &UserId) -> Result<Option<UserContact>> {
        Ok(self.get(id)?.map(|u| u.contact()))
    }

    pub fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        accounts::find_by_email(&self.conn(), email)
    }

    pub fn list(&self) -> Result<Vec<User>> {
        accounts::list_users(&self.conn())
    }

    #[instrument(skip(self))]
    pub fn rename(&self, id: &UserId, name: &str) -> Result<User> {
        accounts::rename_user(&self.conn(), id, name)
    }

    #[instrument(skip(self))]
    pub fn remove(&self, id: &UserId) -> Result<()> {
        accounts::delete_user(&self.conn(), id)?;
        info!(user_id = %id, "user removed");
        Ok(())
    }

    /// Check an email/password pair. Unknown email and wrong password both
    /// fail with InvalidCredentials.
    pub fn authenticate(&self, email: &str, password: &str) -> Result<User> {
        let user = self
            .find_by_email(email)?
            .ok_or(UserError::InvalidCredentials)?;
        if accounts::verify_password(&user.password_hash, password) {
            Ok(user)
        } else {
            Err(UserError::InvalidCredentials)
        }
    }
}
