use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use subtrack_core::time::start_of_day;
use subtrack_core::types::{SubscriptionId, SubscriptionStatus, WorkflowHandle};

/// Lifecycle state of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Triggered or recovered; runnable as soon as the engine claims it.
    Pending,
    /// Claimed by the engine and executing.
    Running,
    /// Suspended until `wake_at`.
    Sleeping,
    /// Renewed its cycle and armed the next one.
    Completed,
    /// Stopped itself because the subscription drifted out from under it.
    Aborted,
    /// Stopped by a stop signal.
    Cancelled,
    /// Hit an unrecoverable step error.
    Failed,
}

impl InstanceStatus {
    /// Pending, running or sleeping.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Pending | InstanceStatus::Running | InstanceStatus::Sleeping
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Sleeping => "sleeping",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Aborted => "aborted",
            InstanceStatus::Cancelled => "cancelled",
            InstanceStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceStatus::Pending),
            "running" => Ok(InstanceStatus::Running),
            "sleeping" => Ok(InstanceStatus::Sleeping),
            "completed" => Ok(InstanceStatus::Completed),
            "aborted" => Ok(InstanceStatus::Aborted),
            "cancelled" => Ok(InstanceStatus::Cancelled),
            "failed" => Ok(InstanceStatus::Failed),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

/// What `WorkflowStore::trigger` needs to create an instance.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub handle: WorkflowHandle,
    pub subscription_id: SubscriptionId,
    /// Workflow URL, shown in the admin listing.
    pub target: String,
}

/// A persisted workflow instance record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub handle: WorkflowHandle,
    /// Fixed at trigger time.
    pub subscription_id: SubscriptionId,
    pub target: String,
    pub status: InstanceStatus,
    /// When a pending/sleeping instance becomes runnable.
    pub wake_at: Option<DateTime<Utc>>,
    /// Label of the step the instance last suspended or failed on.
    pub current_step: Option<String>,
    pub cancel_requested: bool,
    /// Abort reason or error text for finished instances.
    pub detail: Option<String>,
    /// Consecutive runs parked after a transient failure; reset by every
    /// checkpoint sleep.
    pub retry_count: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// A reminder that could not be delivered. The instance carried on to its
/// later checkpoints and the renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndeliveredReminder {
    pub workflow_run_id: WorkflowHandle,
    pub subscription_id: SubscriptionId,
    /// `7d`, `5d`, `2d` or `1d`.
    pub checkpoint: String,
    pub error: String,
    pub recorded_at: String,
}

/// One (offset, date) pair of a billing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub offset_days: u32,
    pub date: NaiveDate,
}

impl Checkpoint {
    /// Stable step identity: `7d`, `5d`, `2d`, `1d`, `0d`.
    pub fn label(&self) -> String {
        format!("{}d", self.offset_days)
    }

    /// 00:00 UTC of the checkpoint date.
    pub fn at(&self) -> DateTime<Utc> {
        start_of_day(self.date)
    }

    pub fn is_renewal(&self) -> bool {
        self.offset_days == 0
    }
}

/// Why an instance stopped itself without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The subscription no longer exists.
    Missing,
    /// The subscription is cancelled, inactive or expired.
    NotActive(SubscriptionStatus),
    /// The subscription names a different workflow handle.
    Superseded,
    /// The renewal date was already behind the instance's start.
    Lapsed,
    /// The subscription carries no renewal date.
    NoRenewalDate,
    /// The renewal moved so that no checkpoint of this instance came due.
    RenewalMoved,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Missing => write!(f, "subscription missing"),
            AbortReason::NotActive(status) => write!(f, "subscription {status}"),
            AbortReason::Superseded => write!(f, "superseded by a newer instance"),
            AbortReason::Lapsed => write!(f, "renewal date already passed"),
            AbortReason::NoRenewalDate => write!(f, "no renewal date"),
            AbortReason::RenewalMoved => write!(f, "renewal date moved"),
        }
    }
}

/// Result of one run of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Suspended until the checkpoint instant.
    Sleeping {
        until: DateTime<Utc>,
        checkpoint: String,
    },
    /// The cycle was advanced. `next` is the handle armed for the new cycle,
    /// if the subscription still wanted one.
    Completed {
        renewed_to: NaiveDate,
        next: Option<WorkflowHandle>,
    },
    /// A transient failure outlasted the in-run retries; the instance is
    /// parked and replays from its journal at `until`.
    Deferred { until: DateTime<Utc>, attempt: u32 },
    Aborted(AbortReason),
    Cancelled,
}

impl RunOutcome {
    pub fn status(&self) -> InstanceStatus {
        match self {
            RunOutcome::Sleeping { .. } | RunOutcome::Deferred { .. } => InstanceStatus::Sleeping,
            RunOutcome::Completed { .. } => InstanceStatus::Completed,
            RunOutcome::Aborted(_) => InstanceStatus::Aborted,
            RunOutcome::Cancelled => InstanceStatus::Cancelled,
        }
    }
}
