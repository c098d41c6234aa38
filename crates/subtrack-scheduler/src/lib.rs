//! `subtrack-scheduler`: durable renewal-and-reminder workflows with SQLite persistence.
//!
//! # Overview
//!
//! Every active subscription owns one workflow instance. The instance walks
//! the reminder checkpoints of the current billing cycle, suspending between
//! them; the [`engine::SchedulerEngine`] polls for instances whose wake time
//! has arrived and replays them from their step journal.
//!
//! # Checkpoints
//!
//! | Label | When                 | Action                          |
//! |-------|----------------------|---------------------------------|
//! | `7d`  | renewal date − 7 days | reminder                       |
//! | `5d`  | renewal date − 5 days | reminder                       |
//! | `2d`  | renewal date − 2 days | reminder                       |
//! | `1d`  | renewal date − 1 day  | reminder                       |
//! | `0d`  | renewal date          | advance the cycle, arm the next |

pub mod admin;
pub mod db;
pub mod durable;
pub mod engine;
pub mod error;
pub mod executor;
pub mod instances;
pub mod lifecycle;
pub mod notifier;
pub mod planner;
pub mod tracker;
pub mod types;

pub use admin::{CancelReport, FailedInstance, InstanceSummary, StepSummary, WorkflowAdmin};
pub use durable::{DurableContext, RetryPolicy, Wake};
pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use executor::WorkflowExecutor;
pub use instances::{StepRecord, StopOutcome, WorkflowStore};
pub use lifecycle::WorkflowLifecycleManager;
pub use notifier::{LogNotifier, NotificationDispatcher, NotifyError, WebhookNotifier};
pub use tracker::SubscriptionTracker;
pub use types::{
    AbortReason, Checkpoint, InstanceStatus, RunOutcome, UndeliveredReminder, WorkflowInstance,
};

pub use subtrack_core::clock::{Clock, ManualClock, SystemClock};
