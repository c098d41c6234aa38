use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use subtrack_core::types::{
    Category, Currency, Frequency, SubscriptionId, SubscriptionStatus, UserId, WorkflowHandle,
};

/// A tracked recurring subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub name: String,
    pub price: f64,
    pub currency: Currency,
    pub frequency: Frequency,
    pub category: Category,
    pub payment_method: String,
    pub status: SubscriptionStatus,
    pub start_date: NaiveDate,
    /// None only after an unsubscribe.
    pub renewal_date: Option<NaiveDate>,
    pub owner: UserId,
    /// Handle of the instance currently responsible for this subscription.
    /// Written only through `SubscriptionStore::swap_workflow_handle`.
    pub workflow_handle: Option<WorkflowHandle>,
    pub created_at: String,
    pub updated_at: String,
}

/// Creation input; the renewal date and status are derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub currency: Currency,
    pub frequency: Frequency,
    pub category: Category,
    pub payment_method: String,
    pub start_date: NaiveDate,
    pub owner: UserId,
}

/// Partial update. `None` leaves a field untouched.
///
/// The workflow handle is not patchable here; it has its own
/// compare-and-swap entry point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionFields {
    pub name: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<Currency>,
    pub frequency: Option<Frequency>,
    pub category: Option<Category>,
    pub payment_method: Option<String>,
    pub status: Option<SubscriptionStatus>,
    /// Changing the start date re-derives the renewal date unless
    /// `renewal_date` is also set.
    pub start_date: Option<NaiveDate>,
    /// Explicit override; `Some(None)` clears the date.
    #[serde(skip)]
    pub renewal_date: Option<Option<NaiveDate>>,
}

impl SubscriptionFields {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.price.is_none()
            && self.currency.is_none()
            && self.frequency.is_none()
            && self.category.is_none()
            && self.payment_method.is_none()
            && self.status.is_none()
            && self.start_date.is_none()
            && self.renewal_date.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SetOptions {
    /// Apply the field rules (name/price/payment method bounds, start date
    /// not in the future, renewal after start) to the merged record.
    pub validate: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self { validate: true }
    }
}

/// Conjunctive filter for `SubscriptionStore::find`. Empty matches all.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub owner: Option<UserId>,
    pub status: Option<SubscriptionStatus>,
    /// Inclusive renewal-date window.
    pub renewal_between: Option<(NaiveDate, NaiveDate)>,
}

/// Outcome of a conditional renewal write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalApplied {
    /// The expected date was found and replaced.
    Applied,
    /// The record already carries the new date (replay after a crash).
    AlreadyApplied,
    /// The record carries some other date; nothing was written.
    Drifted(Option<NaiveDate>),
    /// The record names a different workflow handle; nothing was written.
    Superseded,
    /// The record was cancelled or unsubscribed meanwhile; nothing was written.
    NotActive(SubscriptionStatus),
}
