pub mod clock;
pub mod config;
pub mod error;
pub mod renewal;
pub mod time;
pub mod types;

pub use error::{Result, SubtrackError};
pub use renewal::{next_renewal_after, next_renewal_date, RenewalError};
