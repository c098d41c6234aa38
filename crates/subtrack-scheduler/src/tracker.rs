use std::sync::Arc;

use chrono::{Days, NaiveDate};
use subtrack_core::clock::Clock;
use subtrack_core::types::{SubscriptionId, SubscriptionStatus, UserId};
use subtrack_subscriptions::{
    NewSubscription, SetOptions, Subscription, SubscriptionError, SubscriptionFields,
    SubscriptionFilter, SubscriptionStore,
};
use subtrack_users::UserDirectory;
use tracing::{info, instrument};

use crate::error::{Result, SchedulerError};
use crate::lifecycle::WorkflowLifecycleManager;

/// Window used by `upcoming_renewals`, in days from today inclusive.
pub const UPCOMING_WINDOW_DAYS: u64 = 30;

/// Subscription mutations that keep the workflow lifecycle in step.
pub struct SubscriptionTracker {
    subscriptions: Arc<SubscriptionStore>,
    users: Arc<UserDirectory>,
    lifecycle: Arc<WorkflowLifecycleManager>,
    clock: Arc<dyn Clock>,
}

impl SubscriptionTracker {
    pub fn new(
        subscriptions: Arc<SubscriptionStore>,
        users: Arc<UserDirectory>,
        lifecycle: Arc<WorkflowLifecycleManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            subscriptions,
            users,
            lifecycle,
            clock,
        }
    }

    /// Create a subscription and arm its reminder workflow when it is active.
    #[instrument(skip(self, new), fields(owner = %new.owner))]
    pub async fn create(&self, new: &NewSubscription) -> Result<Subscription> {
        if self.users.get(&new.owner)?.is_none() {
            return Err(SchedulerError::OwnerNotFound(new.owner.to_string()));
        }
        let sub = self.subscriptions.create(new)?;
        info!(subscription_id = %sub.id, status = %sub.status, renewal_date = ?sub.renewal_date, "subscription created");
        if sub.status.is_active() {
            self.lifecycle.arm(&sub.id).await?;
        }
        self.require(&sub.id)
    }

    pub fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.get(id)?)
    }

    pub fn list_all(&self) -> Result<Vec<Subscription>> {
        Ok(self.subscriptions.find(&SubscriptionFilter::default())?)
    }

    pub fn list_for_owner(&self, owner: &UserId) -> Result<Vec<Subscription>> {
        Ok(self.subscriptions.find(&SubscriptionFilter {
            owner: Some(owner.clone()),
            ..SubscriptionFilter::default()
        })?)
    }

    /// Patch an active subscription. The reminder workflow is replaced when
    /// the record stays active and disarmed when the patch expired it.
    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: &SubscriptionId, patch: &SubscriptionFields) -> Result<Subscription> {
        let current = self.require(id)?;
        if !current.status.is_active() {
            return Err(SchedulerError::InvalidState(format!(
                "only active subscriptions can be updated (status is {})",
                current.status
            )));
        }
        if patch.status.is_some() {
            return Err(SchedulerError::InvalidState(
                "status changes go through cancel, unsubscribe or resume".to_string(),
            ));
        }
        if patch.is_empty() {
            return Err(SubscriptionError::Validation("no fields to update".to_string()).into());
        }

        let updated = self
            .subscriptions
            .set_fields(id, patch, SetOptions { validate: true })?;
        if updated.status.is_active() {
            self.lifecycle.replace(id).await?;
        } else {
            self.lifecycle.disarm(id).await?;
        }
        info!(subscription_id = %id, status = %updated.status, "subscription updated");
        self.require(id)
    }

    /// Active → cancelled. The workflow is stopped.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &SubscriptionId) -> Result<Subscription> {
        let current = self.require(id)?;
        if !current.status.is_active() {
            return Err(SchedulerError::InvalidState(format!(
                "only active subscriptions can be cancelled (status is {})",
                current.status
            )));
        }
        self.write_status(id, SubscriptionStatus::Cancelled, None)?;
        self.lifecycle.disarm(id).await?;
        info!(subscription_id = %id, "subscription cancelled");
        self.require(id)
    }

    /// Mark inactive and clear the renewal date. The workflow is stopped.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> Result<Subscription> {
        let current = self.require(id)?;
        if current.status == SubscriptionStatus::Inactive {
            return Err(SchedulerError::InvalidState(
                "subscription is already inactive".to_string(),
            ));
        }
        self.write_status(id, SubscriptionStatus::Inactive, Some(None))?;
        self.lifecycle.disarm(id).await?;
        info!(subscription_id = %id, "unsubscribed");
        self.require(id)
    }

    /// Reactivate a cancelled subscription from `start_date` (not in the
    /// future). The renewal date is re-derived; a start so old that the
    /// renewal is already past lands the record `expired` with no workflow.
    #[instrument(skip(self))]
    pub async fn resume(&self, id: &SubscriptionId, start_date: NaiveDate) -> Result<Subscription> {
        let current = self.require(id)?;
        if current.status != SubscriptionStatus::Cancelled {
            return Err(SchedulerError::InvalidState(format!(
                "only cancelled subscriptions can be resumed (status is {})",
                current.status
            )));
        }
        let patch = SubscriptionFields {
            status: Some(SubscriptionStatus::Active),
            start_date: Some(start_date),
            ..SubscriptionFields::default()
        };
        let resumed = self
            .subscriptions
            .set_fields(id, &patch, SetOptions { validate: true })?;
        if resumed.status.is_active() {
            self.lifecycle.replace(id).await?;
        } else {
            self.lifecycle.disarm(id).await?;
        }
        info!(subscription_id = %id, status = %resumed.status, renewal_date = ?resumed.renewal_date, "subscription resumed");
        self.require(id)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &SubscriptionId) -> Result<()> {
        self.lifecycle.disarm(id).await?;
        self.subscriptions.delete(id)?;
        Ok(())
    }

    /// Active subscriptions of `owner` renewing between today and
    /// today + 30 days, soonest first.
    pub fn upcoming_renewals(&self, owner: &UserId) -> Result<Vec<Subscription>> {
        let today = self.clock.today();
        let until = today
            .checked_add_days(Days::new(UPCOMING_WINDOW_DAYS))
            .unwrap_or(NaiveDate::MAX);
        Ok(self.subscriptions.find(&SubscriptionFilter {
            owner: Some(owner.clone()),
            status: Some(SubscriptionStatus::Active),
            renewal_between: Some((today, until)),
        })?)
    }

    fn require(&self, id: &SubscriptionId) -> Result<Subscription> {
        self.subscriptions
            .get(id)?
            .ok_or_else(|| SchedulerError::SubscriptionNotFound(id.to_string()))
    }

    fn write_status(
        &self,
        id: &SubscriptionId,
        status: SubscriptionStatus,
        renewal_date: Option<Option<NaiveDate>>,
    ) -> Result<()> {
        let patch = SubscriptionFields {
            status: Some(status),
            renewal_date,
            ..SubscriptionFields::default()
        };
        self.subscriptions
            .set_fields(id, &patch, SetOptions { validate: false })?;
        Ok(())
    }
}
