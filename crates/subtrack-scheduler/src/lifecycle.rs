use std::sync::Arc;
use std::time::Duration;

use subtrack_core::config::SchedulerConfig;
use subtrack_core::types::{SubscriptionId, WorkflowHandle};
use subtrack_subscriptions::SubscriptionStore;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SchedulerError};
use crate::instances::{StopOutcome, WorkflowStore};
use crate::types::NewInstance;

/// Handle compare-and-swap attempts before giving up with `Conflict`.
const MAX_CAS_ATTEMPTS: usize = 5;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Keeps each subscription's `workflow_handle` in step with the instance
/// that actually runs for it.
///
/// The record's handle is authoritative. Every change goes through a CAS on
/// the subscription row, and the previous instance is stopped before a new
/// one is installed.
pub struct WorkflowLifecycleManager {
    subscriptions: Arc<SubscriptionStore>,
    workflows: Arc<WorkflowStore>,
    target: String,
    stop_ack_timeout: Duration,
}

impl WorkflowLifecycleManager {
    pub fn new(
        subscriptions: Arc<SubscriptionStore>,
        workflows: Arc<WorkflowStore>,
        target: impl Into<String>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            subscriptions,
            workflows,
            target: target.into(),
            stop_ack_timeout: Duration::from_millis(config.stop_ack_timeout_ms),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Stop `handle` and wait for a running instance to acknowledge.
    ///
    /// Best effort: after the ack timeout the stop stays requested and the
    /// caller proceeds anyway.
    #[instrument(skip(self))]
    pub async fn stop(&self, handle: &WorkflowHandle) -> Result<StopOutcome> {
        let outcome = self.workflows.request_stop(handle)?;
        if outcome != StopOutcome::Signalled {
            return Ok(outcome);
        }

        let deadline = Instant::now() + self.stop_ack_timeout;
        loop {
            match self.workflows.status_of(handle)? {
                Some(status) if status.is_live() => {}
                _ => return Ok(outcome),
            }
            if Instant::now() >= deadline {
                warn!(
                    handle = %handle,
                    timeout_ms = self.stop_ack_timeout.as_millis() as u64,
                    "running instance did not acknowledge stop; proceeding"
                );
                return Ok(outcome);
            }
            sleep(STOP_POLL_INTERVAL).await;
        }
    }

    /// Start an instance for an active subscription, stopping any current one.
    #[instrument(skip(self))]
    pub async fn arm(&self, id: &SubscriptionId) -> Result<WorkflowHandle> {
        self.install(id).await
    }

    /// Swap the current instance for a fresh one in a single handle CAS.
    #[instrument(skip(self))]
    pub async fn replace(&self, id: &SubscriptionId) -> Result<WorkflowHandle> {
        self.install(id).await
    }

    async fn install(&self, id: &SubscriptionId) -> Result<WorkflowHandle> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let sub = self
                .subscriptions
                .get(id)?
                .ok_or_else(|| SchedulerError::SubscriptionNotFound(id.to_string()))?;
            let current = sub.workflow_handle;
            if let Some(old) = &current {
                self.stop(old).await?;
            }

            let next = WorkflowHandle::new();
            if !self
                .subscriptions
                .swap_workflow_handle(id, current.as_ref(), Some(&next))?
            {
                debug!(subscription_id = %id, attempt, "handle changed underneath; retrying");
                continue;
            }

            let req = NewInstance {
                handle: next.clone(),
                subscription_id: id.clone(),
                target: self.target.clone(),
            };
            if let Err(e) = self.workflows.trigger(&req) {
                self.subscriptions
                    .swap_workflow_handle(id, Some(&next), None)?;
                return Err(e);
            }
            info!(
                subscription_id = %id,
                handle = %next,
                previous = ?current.as_ref().map(WorkflowHandle::as_str),
                "workflow armed"
            );
            return Ok(next);
        }
        Err(SchedulerError::Conflict(format!(
            "workflow handle of {id} kept changing"
        )))
    }

    /// Stop the current instance and clear the handle. Returns the handle
    /// that was cleared, if there was one.
    #[instrument(skip(self))]
    pub async fn disarm(&self, id: &SubscriptionId) -> Result<Option<WorkflowHandle>> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(sub) = self.subscriptions.get(id)? else {
                return Err(SchedulerError::SubscriptionNotFound(id.to_string()));
            };
            let Some(current) = sub.workflow_handle else {
                return Ok(None);
            };
            self.stop(&current).await?;
            if self
                .subscriptions
                .swap_workflow_handle(id, Some(&current), None)?
            {
                info!(subscription_id = %id, handle = %current, "workflow disarmed");
                return Ok(Some(current));
            }
        }
        Err(SchedulerError::Conflict(format!(
            "workflow handle of {id} kept changing"
        )))
    }

    /// Install the next cycle's instance on behalf of `from`, which is
    /// finishing and is not stopped.
    ///
    /// Safe to repeat: if the record already names another handle that
    /// handle is returned, and triggered first when its instance row is
    /// missing. A record with no handle, or no longer active, gets nothing.
    #[instrument(skip(self))]
    pub async fn arm_next_cycle(
        &self,
        id: &SubscriptionId,
        from: &WorkflowHandle,
    ) -> Result<Option<WorkflowHandle>> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(sub) = self.subscriptions.get(id)? else {
                return Ok(None);
            };
            match sub.workflow_handle {
                Some(current) if &current == from => {
                    if !sub.status.is_active() {
                        return Ok(None);
                    }
                    let next = WorkflowHandle::new();
                    if !self
                        .subscriptions
                        .swap_workflow_handle(id, Some(from), Some(&next))?
                    {
                        continue;
                    }
                    self.trigger_missing(id, &next)?;
                    info!(subscription_id = %id, handle = %next, previous = %from, "next cycle armed");
                    return Ok(Some(next));
                }
                Some(other) => {
                    self.trigger_missing(id, &other)?;
                    return Ok(Some(other));
                }
                None => return Ok(None),
            }
        }
        Err(SchedulerError::Conflict(format!(
            "workflow handle of {id} kept changing"
        )))
    }

    fn trigger_missing(&self, id: &SubscriptionId, handle: &WorkflowHandle) -> Result<()> {
        if self.workflows.get(handle)?.is_none() {
            self.workflows.trigger(&NewInstance {
                handle: handle.clone(),
                subscription_id: id.clone(),
                target: self.target.clone(),
            })?;
        }
        Ok(())
    }

    /// Cancel live instances their subscription no longer points at.
    /// Returns how many were stopped.
    #[instrument(skip(self))]
    pub fn sweep(&self) -> Result<usize> {
        let mut stopped = 0;
        for instance in self.workflows.list_active()? {
            let owner = match self.subscriptions.get(&instance.subscription_id) {
                Ok(owner) => owner,
                Err(e) => {
                    debug!(handle = %instance.handle, "sweep skipped unreadable subscription: {e}");
                    continue;
                }
            };
            let stray = match &owner {
                None => true,
                Some(sub) => sub.workflow_handle.as_ref() != Some(&instance.handle),
            };
            if !stray {
                continue;
            }
            if let StopOutcome::Stopped | StopOutcome::Signalled =
                self.workflows.request_stop(&instance.handle)?
            {
                warn!(
                    handle = %instance.handle,
                    subscription_id = %instance.subscription_id,
                    subscription_present = owner.is_some(),
                    "stray workflow instance stopped"
                );
                stopped += 1;
            }
        }
        Ok(stopped)
    }
}
