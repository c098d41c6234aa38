pub mod db;
pub mod error;
pub mod store;
pub mod types;
pub mod validate;

pub use error::{Result, SubscriptionError};
pub use store::SubscriptionStore;
pub use types::{
    NewSubscription, RenewalApplied, SetOptions, Subscription, SubscriptionFields,
    SubscriptionFilter,
};
