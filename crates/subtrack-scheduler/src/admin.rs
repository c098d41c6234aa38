use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use subtrack_core::types::{SubscriptionId, WorkflowHandle};
use subtrack_subscriptions::SubscriptionStore;
use tracing::{info, instrument};

use crate::error::{Result, SchedulerError};
use crate::instances::{StepRecord, StopOutcome, WorkflowStore};
use crate::types::{InstanceStatus, UndeliveredReminder, WorkflowInstance};

/// One row of the running-instances listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub workflow_run_id: WorkflowHandle,
    pub subscription_id: SubscriptionId,
    pub workflow_url: String,
    pub status: InstanceStatus,
    pub wake_at: Option<DateTime<Utc>>,
    pub current_step: Option<String>,
    /// Parked retries since the last checkpoint; `last_error` says why.
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: String,
}

impl From<WorkflowInstance> for InstanceSummary {
    fn from(i: WorkflowInstance) -> Self {
        Self {
            workflow_run_id: i.handle,
            subscription_id: i.subscription_id,
            workflow_url: i.target,
            status: i.status,
            wake_at: i.wake_at,
            current_step: i.current_step,
            retry_count: i.retry_count,
            last_error: if i.retry_count > 0 { i.detail } else { None },
            created_at: i.created_at,
        }
    }
}

/// A failed instance and its error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedInstance {
    pub workflow_run_id: WorkflowHandle,
    pub subscription_id: SubscriptionId,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub failed_at: String,
}

/// One entry of an instance's step journal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub label: String,
    /// `started` (outcome unknown) or `completed`.
    pub state: &'static str,
    pub output: Option<serde_json::Value>,
}

/// Result of an admin cancel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelReport {
    pub workflow_run_id: WorkflowHandle,
    /// `stopped`, `signalled` or the status the instance had already reached.
    pub outcome: String,
    /// Whether the owning subscription's handle was cleared.
    pub detached: bool,
}

/// Operational control over workflow instances.
pub struct WorkflowAdmin {
    workflows: Arc<WorkflowStore>,
    subscriptions: Arc<SubscriptionStore>,
}

impl WorkflowAdmin {
    pub fn new(workflows: Arc<WorkflowStore>, subscriptions: Arc<SubscriptionStore>) -> Self {
        Self {
            workflows,
            subscriptions,
        }
    }

    pub fn status(&self, handle: &WorkflowHandle) -> Result<WorkflowInstance> {
        self.workflows
            .get(handle)?
            .ok_or_else(|| SchedulerError::InstanceNotFound(handle.to_string()))
    }

    /// Stop one instance. When its subscription still names it, the handle
    /// is cleared too, so nothing re-arms from a dead instance.
    #[instrument(skip(self))]
    pub fn cancel(&self, handle: &WorkflowHandle) -> Result<CancelReport> {
        let instance = self.status(handle)?;
        let outcome = match self.workflows.request_stop(handle)? {
            StopOutcome::Stopped => "stopped".to_string(),
            StopOutcome::Signalled => "signalled".to_string(),
            StopOutcome::AlreadyFinished(status) => status.to_string(),
            StopOutcome::Missing => return Err(SchedulerError::InstanceNotFound(handle.to_string())),
        };
        let detached =
            self.subscriptions
                .swap_workflow_handle(&instance.subscription_id, Some(handle), None)?;
        info!(handle = %handle, %outcome, detached, "workflow cancelled by admin");
        Ok(CancelReport {
            workflow_run_id: handle.clone(),
            outcome,
            detached,
        })
    }

    /// Stop every live instance.
    #[instrument(skip(self))]
    pub fn cancel_all(&self) -> Result<Vec<CancelReport>> {
        self.workflows
            .list_active()?
            .iter()
            .map(|i| self.cancel(&i.handle))
            .collect()
    }

    /// Pending, running and sleeping instances.
    pub fn running(&self) -> Result<Vec<InstanceSummary>> {
        Ok(self
            .workflows
            .list_active()?
            .into_iter()
            .map(InstanceSummary::from)
            .collect())
    }

    pub fn failed(&self) -> Result<Vec<FailedInstance>> {
        Ok(self
            .workflows
            .list_by_status(InstanceStatus::Failed)?
            .into_iter()
            .map(|i| FailedInstance {
                workflow_run_id: i.handle,
                subscription_id: i.subscription_id,
                current_step: i.current_step,
                error: i.detail,
                failed_at: i.updated_at,
            })
            .collect())
    }

    /// Reminders that were given up on, newest first.
    pub fn undelivered(&self) -> Result<Vec<UndeliveredReminder>> {
        self.workflows.list_undelivered()
    }

    /// The step journal of one instance, oldest first.
    pub fn steps(&self, handle: &WorkflowHandle) -> Result<Vec<StepSummary>> {
        self.status(handle)?;
        self.workflows
            .journal(handle)?
            .into_iter()
            .map(|(label, record)| -> Result<StepSummary> {
                Ok(match record {
                    StepRecord::Started => StepSummary {
                        label,
                        state: "started",
                        output: None,
                    },
                    StepRecord::Completed(output) => StepSummary {
                        label,
                        state: "completed",
                        output: Some(serde_json::from_str(&output)?),
                    },
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::NaiveDate;
    use rusqlite::Connection;
    use subtrack_core::clock::ManualClock;
    use subtrack_core::types::{Category, Currency, Frequency, UserId};
    use subtrack_subscriptions::NewSubscription;

    use crate::types::NewInstance;

    fn setup() -> (WorkflowAdmin, Arc<WorkflowStore>, Arc<SubscriptionStore>) {
        let conn = Connection::open_in_memory().unwrap();
        subtrack_subscriptions::db::init_db(&conn).unwrap();
        crate::db::init_db(&conn).unwrap();
        let db = Arc::new(Mutex::new(conn));
        let clock = Arc::new(ManualClock::on(NaiveDate::from_ymd_opt(2025, 1, 30).unwrap(), 9));
        let workflows = Arc::new(WorkflowStore::new(db.clone(), clock.clone()));
        let subs = Arc::new(SubscriptionStore::new(db, clock));
        (WorkflowAdmin::new(workflows.clone(), subs.clone()), workflows, subs)
    }

    #[test]
    fn cancel_detaches_owning_subscription() {
        let (admin, workflows, subs) = setup();
        let sub = subs
            .create(
                &NewSubscription {
                    name: "Spotify".into(),
                    price: 9.99,
                    currency: Currency::Eur,
                    frequency: Frequency::Monthly,
                    category: Category::Entertainment,
                    payment_method: "Visa".into(),
                    start_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
                    owner: UserId::from("user-1"),
                },
            )
            .unwrap();
        let handle = WorkflowHandle::new();
        subs.swap_workflow_handle(&sub.id, None, Some(&handle)).unwrap();
        workflows
            .trigger(&NewInstance {
                handle: handle.clone(),
                subscription_id: sub.id.clone(),
                target: "http://t/reminder".into(),
            })
            .unwrap();

        let running = admin.running().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].workflow_url, "http://t/reminder");

        let report = admin.cancel(&handle).unwrap();
        assert_eq!(report.outcome, "stopped");
        assert!(report.detached);
        assert_eq!(subs.get(&sub.id).unwrap().unwrap().workflow_handle, None);
        assert!(admin.running().unwrap().is_empty());
        assert!(admin.cancel_all().unwrap().is_empty());
    }

    #[test]
    fn failed_listing_carries_error() {
        let (admin, workflows, _) = setup();
        let handle = WorkflowHandle::from("wfr_bad");
        workflows
            .trigger(&NewInstance {
                handle: handle.clone(),
                subscription_id: SubscriptionId::from("sub-x"),
                target: "http://t/reminder".into(),
            })
            .unwrap();
        workflows
            .finish(&handle, InstanceStatus::Failed, Some("unsupported frequency: hourly"))
            .unwrap();

        let failed = admin.failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_deref(), Some("unsupported frequency: hourly"));
        assert_eq!(admin.status(&handle).unwrap().status, InstanceStatus::Failed);
        assert_eq!(
            admin.status(&WorkflowHandle::from("wfr_none")).unwrap_err().status(),
            404
        );
    }

    #[test]
    fn steps_and_undelivered_reminders_are_listed() {
        let (admin, workflows, _) = setup();
        let handle = WorkflowHandle::from("wfr_steps");
        workflows
            .trigger(&NewInstance {
                handle: handle.clone(),
                subscription_id: SubscriptionId::from("sub-1"),
                target: "http://t/reminder".into(),
            })
            .unwrap();
        workflows.complete_step(&handle, "clock:start", "\"2025-01-30T09:00:00Z\"").unwrap();
        workflows.begin_step(&handle, "notify:1d").unwrap();

        let steps = admin.steps(&handle).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].label, "clock:start");
        assert_eq!(steps[0].state, "completed");
        assert_eq!(steps[0].output, Some(serde_json::json!("2025-01-30T09:00:00Z")));
        assert_eq!(steps[1].state, "started");
        assert_eq!(steps[1].output, None);
        assert_eq!(
            admin.steps(&WorkflowHandle::from("wfr_none")).unwrap_err().status(),
            404
        );

        assert!(workflows
            .record_undelivered(&handle, &SubscriptionId::from("sub-1"), "1d", "webhook rejected")
            .unwrap());
        let undelivered = admin.undelivered().unwrap();
        assert_eq!(undelivered.len(), 1);
        assert_eq!(undelivered[0].checkpoint, "1d");
    }
}
