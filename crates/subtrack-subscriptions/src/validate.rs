//! Field rules for subscription records.

use chrono::NaiveDate;

use crate::error::{Result, SubscriptionError};
use crate::types::Subscription;

pub const NAME_MIN: usize = 2;
pub const NAME_MAX: usize = 100;

pub fn name(value: &str) -> Result<String> {
    let value = value.trim();
    let len = value.chars().count();
    if !(NAME_MIN..=NAME_MAX).contains(&len) {
        return Err(SubscriptionError::Validation(format!(
            "name must be {NAME_MIN}-{NAME_MAX} characters"
        )));
    }
    Ok(value.to_string())
}

pub fn price(value: f64) -> Result<f64> {
    if !value.is_finite() || value < 0.0 {
        return Err(SubscriptionError::Validation(
            "price must be a non-negative number".to_string(),
        ));
    }
    Ok(value)
}

pub fn payment_method(value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SubscriptionError::Validation(
            "payment method is required".to_string(),
        ));
    }
    Ok(value.to_string())
}

pub fn start_date(value: NaiveDate, today: NaiveDate) -> Result<NaiveDate> {
    if value > today {
        return Err(SubscriptionError::Validation(format!(
            "start date {value} is in the future"
        )));
    }
    Ok(value)
}

pub fn renewal_after_start(start: NaiveDate, renewal: Option<NaiveDate>) -> Result<()> {
    match renewal {
        Some(r) if r <= start => Err(SubscriptionError::Validation(format!(
            "renewal date {r} must be after start date {start}"
        ))),
        _ => Ok(()),
    }
}

/// Check every rule against a merged record. `start_changed` limits the
/// not-in-the-future rule to start dates that are being written now.
pub fn record(sub: &Subscription, start_changed: bool, today: NaiveDate) -> Result<()> {
    name(&sub.name)?;
    price(sub.price)?;
    payment_method(&sub.payment_method)?;
    if start_changed {
        start_date(sub.start_date, today)?;
    }
    renewal_after_start(sub.start_date, sub.renewal_date)
}
