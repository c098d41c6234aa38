use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use subtrack_core::next_renewal_after;
use subtrack_core::types::{SubscriptionId, SubscriptionStatus, WorkflowHandle};
use subtrack_subscriptions::{RenewalApplied, Subscription, SubscriptionStore};
use subtrack_users::{UserContact, UserDirectory};
use tracing::{debug, error, info, instrument, warn};

use crate::durable::{DurableContext, RetryPolicy, Wake};
use crate::error::{Result, SchedulerError};
use crate::instances::WorkflowStore;
use crate::lifecycle::WorkflowLifecycleManager;
use crate::notifier::NotificationDispatcher;
use crate::planner;
use crate::types::{AbortReason, Checkpoint, InstanceStatus, RunOutcome, WorkflowInstance};

/// What a `fetch:*` step records.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    subscription: Option<Subscription>,
    owner: Option<UserContact>,
}

/// What a `notify:*` step records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Delivery {
    Sent,
    Undelivered(String),
}

/// What the `renew` step records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Renewal {
    Renewed(NaiveDate),
    Refused(AbortReason),
}

/// Runs one reminder workflow instance from its journal to its next
/// suspension or to a terminal state.
pub struct WorkflowExecutor {
    subscriptions: Arc<SubscriptionStore>,
    users: Arc<UserDirectory>,
    workflows: Arc<WorkflowStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    lifecycle: Arc<WorkflowLifecycleManager>,
    policy: RetryPolicy,
}

impl WorkflowExecutor {
    pub fn new(
        subscriptions: Arc<SubscriptionStore>,
        users: Arc<UserDirectory>,
        workflows: Arc<WorkflowStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        lifecycle: Arc<WorkflowLifecycleManager>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            subscriptions,
            users,
            workflows,
            dispatcher,
            lifecycle,
            policy,
        }
    }

    /// Execute a claimed (`running`) instance and record where it ended up.
    ///
    /// A transient error that outlasts the in-run retries parks the instance
    /// for a later replay while the policy still allows it. Any other error is
    /// terminal: the instance is marked `failed` with the error text, and the
    /// error is returned.
    #[instrument(skip(self, instance), fields(handle = %instance.handle, subscription_id = %instance.subscription_id))]
    pub async fn execute(&self, instance: &WorkflowInstance) -> Result<RunOutcome> {
        let handle = &instance.handle;
        let may_defer = self.policy.may_defer(instance.retry_count);
        let outcome = match self.drive(handle, &instance.subscription_id, !may_defer).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_transient() && may_defer => {
                return self.park(handle, instance.retry_count + 1, &e);
            }
            Err(e) => {
                error!(code = e.code(), "workflow instance failed: {e}");
                self.workflows
                    .finish(handle, InstanceStatus::Failed, Some(&e.to_string()))?;
                return Err(e);
            }
        };

        let detail = match &outcome {
            RunOutcome::Sleeping { until, checkpoint } => {
                info!(%checkpoint, wake_at = %until, "instance sleeping");
                None
            }
            RunOutcome::Deferred { .. } => None,
            RunOutcome::Completed { renewed_to, next } => {
                info!(
                    %renewed_to,
                    next = ?next.as_ref().map(WorkflowHandle::as_str),
                    "instance completed"
                );
                Some(format!("renewed to {renewed_to}"))
            }
            RunOutcome::Aborted(reason) => {
                info!(%reason, "instance aborted");
                Some(reason.to_string())
            }
            RunOutcome::Cancelled => {
                info!("instance cancelled");
                Some("stopped".to_string())
            }
        };
        let status = outcome.status();
        if !status.is_live() {
            self.workflows.finish(handle, status, detail.as_deref())?;
        }
        Ok(outcome)
    }

    fn park(&self, handle: &WorkflowHandle, attempt: u32, e: &SchedulerError) -> Result<RunOutcome> {
        let now = self.workflows.now();
        let until = chrono::Duration::from_std(self.policy.deferral_delay(attempt))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        match self.workflows.defer(handle, until, attempt, &e.to_string())? {
            InstanceStatus::Cancelled => {
                info!("instance cancelled");
                Ok(RunOutcome::Cancelled)
            }
            _ => {
                warn!(code = e.code(), attempt, wake_at = %until, "run failed; parked for a later retry: {e}");
                Ok(RunOutcome::Deferred { until, attempt })
            }
        }
    }

    /// `final_round` is set once no parked retry is left: a reminder that
    /// still cannot be delivered is then recorded as undelivered.
    async fn drive(&self, handle: &WorkflowHandle, id: &SubscriptionId, final_round: bool) -> Result<RunOutcome> {
        let ctx = DurableContext::new(&self.workflows, handle.clone(), self.policy);

        let started = ctx.now("clock:start").await?;
        let snapshot = self.fetch(&ctx, "fetch:start", id).await?;
        let sub = match reconcile(&snapshot, handle) {
            Ok(sub) => sub,
            Err(reason) => return Ok(RunOutcome::Aborted(reason)),
        };
        let Some(renewal) = sub.renewal_date else {
            return Ok(RunOutcome::Aborted(AbortReason::NoRenewalDate));
        };
        if renewal < started.date_naive() {
            return Ok(RunOutcome::Aborted(AbortReason::Lapsed));
        }

        for checkpoint in planner::plan(renewal) {
            let label = checkpoint.label();
            let slept = checkpoint.at() > started;

            if slept {
                if self.workflows.cancel_requested(handle)? {
                    return Ok(RunOutcome::Cancelled);
                }
                match ctx
                    .sleep_until(&format!("sleep:{label}"), checkpoint.at())
                    .await?
                {
                    Wake::Elapsed => {}
                    Wake::Suspended => {
                        return Ok(RunOutcome::Sleeping {
                            until: checkpoint.at(),
                            checkpoint: label,
                        })
                    }
                    Wake::Cancelled => return Ok(RunOutcome::Cancelled),
                }
            }

            if self.workflows.cancel_requested(handle)? {
                return Ok(RunOutcome::Cancelled);
            }
            let snapshot = self.fetch(&ctx, &format!("fetch:{label}"), id).await?;
            let sub = match reconcile(&snapshot, handle) {
                Ok(sub) => sub,
                Err(reason) => return Ok(RunOutcome::Aborted(reason)),
            };
            let today = ctx.now(&format!("clock:{label}")).await?.date_naive();

            let Some(live_renewal) = sub.renewal_date else {
                return Ok(RunOutcome::Aborted(AbortReason::NoRenewalDate));
            };
            let Some(due) = planner::checkpoint_date(live_renewal, checkpoint.offset_days) else {
                continue;
            };
            if today < due {
                debug!(checkpoint = %label, %due, "checkpoint moved later; skipping");
                continue;
            }

            if checkpoint.is_renewal() {
                return self.renew(&ctx, &sub, live_renewal).await;
            }

            if slept && today == due {
                let due_checkpoint = Checkpoint {
                    offset_days: checkpoint.offset_days,
                    date: due,
                };
                self.notify(&ctx, &label, &due_checkpoint, &sub, snapshot.owner.as_ref(), final_round)
                    .await?;
            } else {
                debug!(checkpoint = %label, %due, %today, "reminder elapsed or stale; skipping");
            }
        }

        Ok(RunOutcome::Aborted(AbortReason::RenewalMoved))
    }

    async fn fetch(&self, ctx: &DurableContext<'_>, label: &str, id: &SubscriptionId) -> Result<Snapshot> {
        ctx.run(label, || async {
            let subscription = self.subscriptions.get(id)?;
            let owner = match &subscription {
                Some(sub) => self.users.contact(&sub.owner)?,
                None => None,
            };
            Ok(Snapshot {
                subscription,
                owner,
            })
        })
        .await
    }

    /// A reminder that cannot be delivered never holds up the cycle: a
    /// rejection, or a transient failure in the final round, is logged to
    /// the undelivered list and the run moves on.
    async fn notify(
        &self,
        ctx: &DurableContext<'_>,
        label: &str,
        checkpoint: &Checkpoint,
        sub: &Subscription,
        owner: Option<&UserContact>,
        final_round: bool,
    ) -> Result<()> {
        let Some(owner) = owner else {
            warn!(checkpoint = %label, owner = %sub.owner, "subscription owner missing; reminder not sent");
            return Ok(());
        };
        let step = format!("notify:{label}");
        let sent = ctx
            .run_once(&step, || async {
                match self.dispatcher.send(owner, checkpoint, sub).await {
                    Ok(()) => Ok(Delivery::Sent),
                    Err(e) if e.is_transient() => Err(SchedulerError::from(e)),
                    Err(e) => Ok(Delivery::Undelivered(e.to_string())),
                }
            })
            .await;
        let delivery = match sent {
            Ok(delivery) => delivery,
            Err(e) if e.is_transient() && final_round => {
                let reason = e.to_string();
                let given_up = ctx
                    .run(&step, || {
                        let reason = reason.clone();
                        async move { Ok(Delivery::Undelivered(reason)) }
                    })
                    .await?;
                Some(given_up)
            }
            Err(e) => return Err(e),
        };

        match delivery {
            Some(Delivery::Sent) => info!(
                checkpoint = %label,
                dispatcher = self.dispatcher.name(),
                renewal_date = ?sub.renewal_date,
                "reminder sent"
            ),
            Some(Delivery::Undelivered(reason)) => {
                if self
                    .workflows
                    .record_undelivered(ctx.handle(), &sub.id, label, &reason)?
                {
                    error!(
                        checkpoint = %label,
                        dispatcher = self.dispatcher.name(),
                        "reminder could not be delivered; continuing: {reason}"
                    );
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Advance the renewal date by one cycle counted from the start date,
    /// provided this instance still holds the subscription.
    async fn renew(&self, ctx: &DurableContext<'_>, sub: &Subscription, current: NaiveDate) -> Result<RunOutcome> {
        let handle = ctx.handle();
        let renewal = ctx
            .run("renew", || async {
                let next = next_renewal_after(sub.start_date, sub.frequency, current)?;
                let renewal = match self.subscriptions.advance_renewal(&sub.id, handle, current, next)? {
                    RenewalApplied::Applied | RenewalApplied::AlreadyApplied => Renewal::Renewed(next),
                    RenewalApplied::Drifted(found) => {
                        debug!(expected = %current, ?found, "renewal date changed before renewing");
                        Renewal::Refused(AbortReason::RenewalMoved)
                    }
                    RenewalApplied::Superseded => Renewal::Refused(AbortReason::Superseded),
                    RenewalApplied::NotActive(status) => Renewal::Refused(AbortReason::NotActive(status)),
                };
                Ok(renewal)
            })
            .await?;

        let renewed_to = match renewal {
            Renewal::Renewed(date) => date,
            Renewal::Refused(reason) => return Ok(RunOutcome::Aborted(reason)),
        };
        info!(from = %current, to = %renewed_to, status = %SubscriptionStatus::Active, "subscription renewed");

        let next = ctx
            .run("arm-next", || self.lifecycle.arm_next_cycle(&sub.id, handle))
            .await?;
        Ok(RunOutcome::Completed { renewed_to, next })
    }
}

/// The live subscription, if this instance is still responsible for it.
fn reconcile(snapshot: &Snapshot, handle: &WorkflowHandle) -> std::result::Result<Subscription, AbortReason> {
    let sub = snapshot.subscription.as_ref().ok_or(AbortReason::Missing)?;
    if !sub.status.is_active() {
        return Err(AbortReason::NotActive(sub.status));
    }
    if sub.workflow_handle.as_ref() != Some(handle) {
        return Err(AbortReason::Superseded);
    }
    Ok(sub.clone())
}
