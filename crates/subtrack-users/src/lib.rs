pub mod accounts;
pub mod db;
pub mod directory;
pub mod error;
pub mod types;

pub use directory::UserDirectory;
pub use error::{Result, UserError};
pub use types::{NewUser, User, UserContact};
