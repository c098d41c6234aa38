use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use subtrack_core::config::SchedulerConfig;
use subtrack_core::types::WorkflowHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::Result;
use crate::instances::{StepRecord, WorkflowStore};
use crate::types::InstanceStatus;

/// Retry budget for transient step failures.
///
/// Within one run a step is retried `attempts` times in place. A run that
/// still fails transiently is parked and replayed later, up to `deferrals`
/// times in a row.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per step invocation, at least 1.
    pub attempts: u32,
    /// Delay after the first failure; doubled after every further one.
    pub backoff: Duration,
    /// Parked retries before the failure is final.
    pub deferrals: u32,
    /// Wake delay of the first parked retry; doubled after every further one.
    pub defer_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            attempts: config.step_retries.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
            deferrals: config.deferred_retries,
            defer_backoff: Duration::from_millis(config.deferred_backoff_ms),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        doubled(self.backoff, attempt)
    }

    /// Wake delay for the `attempt`-th parked retry (1-based).
    pub fn deferral_delay(&self, attempt: u32) -> Duration {
        doubled(self.defer_backoff, attempt)
    }

    /// Whether a run that has already been parked `retry_count` times may be
    /// parked again.
    pub fn may_defer(&self, retry_count: u32) -> bool {
        retry_count < self.deferrals
    }
}

fn doubled(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// Result of `DurableContext::sleep_until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The instant has passed; continue with the next step.
    Elapsed,
    /// The instance was parked. The caller must return without further steps.
    Suspended,
    /// A pending stop turned the suspension into a cancellation.
    Cancelled,
}

/// Per-run view of one instance's journal.
///
/// Steps are keyed by label. A completed step is never executed again; its
/// recorded output is returned instead.
pub struct DurableContext<'a> {
    store: &'a WorkflowStore,
    handle: WorkflowHandle,
    policy: RetryPolicy,
}

impl<'a> DurableContext<'a> {
    pub fn new(store: &'a WorkflowStore, handle: WorkflowHandle, policy: RetryPolicy) -> Self {
        Self {
            store,
            handle,
            policy,
        }
    }

    pub fn handle(&self) -> &WorkflowHandle {
        &self.handle
    }

    /// Memoized step. Transient errors are retried with exponential backoff
    /// up to the policy's attempt count; other errors are returned at once.
    ///
    /// `f` may run more than once across crashes until its output is
    /// recorded, so it must be safe to repeat (reads, conditional writes).
    pub async fn run<T, F, Fut>(&self, label: &str, mut f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(StepRecord::Completed(output)) = self.store.step(&self.handle, label)? {
            debug!(handle = %self.handle, step = label, "replaying journaled step");
            return Ok(serde_json::from_str(&output)?);
        }
        let value = self.attempt(label, &mut f).await?;
        self.store
            .complete_step(&self.handle, label, &serde_json::to_string(&value)?)?;
        Ok(value)
    }

    /// At-most-once step.
    ///
    /// A `started` marker is written before `f` runs. Finding the marker
    /// without a completion means an earlier run died mid-step: the outcome
    /// is unknown, so `f` is not run again and `None` is returned.
    pub async fn run_once<T, F, Fut>(&self, label: &str, mut f: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.store.step(&self.handle, label)? {
            Some(StepRecord::Completed(output)) => {
                debug!(handle = %self.handle, step = label, "replaying journaled step");
                return Ok(Some(serde_json::from_str(&output)?));
            }
            Some(StepRecord::Started) => {
                warn!(handle = %self.handle, step = label, "step in doubt after restart; not repeating it");
                return Ok(None);
            }
            None => {}
        }

        self.store.begin_step(&self.handle, label)?;
        match self.attempt(label, &mut f).await {
            Ok(value) => {
                self.store
                    .complete_step(&self.handle, label, &serde_json::to_string(&value)?)?;
                Ok(Some(value))
            }
            Err(e) => {
                self.store.clear_step(&self.handle, label)?;
                Err(e)
            }
        }
    }

    /// Capture "now" once under `label`; replays return the same instant.
    pub async fn now(&self, label: &str) -> Result<DateTime<Utc>> {
        let now = self.store.now();
        self.run(label, move || async move { Ok(now) }).await
    }

    /// Durable sleep. The only suspension point of an instance.
    ///
    /// Returns `Elapsed` once `until` has passed (recording that fact under
    /// `label`), otherwise parks the instance with `wake_at = until`.
    pub async fn sleep_until(&self, label: &str, until: DateTime<Utc>) -> Result<Wake> {
        if let Some(StepRecord::Completed(_)) = self.store.step(&self.handle, label)? {
            return Ok(Wake::Elapsed);
        }
        if self.store.now() >= until {
            self.store
                .complete_step(&self.handle, label, &serde_json::to_string(&until)?)?;
            return Ok(Wake::Elapsed);
        }
        match self.store.suspend(&self.handle, until, label)? {
            InstanceStatus::Cancelled => Ok(Wake::Cancelled),
            _ => {
                debug!(handle = %self.handle, step = label, wake_at = %until, "instance suspended");
                Ok(Wake::Suspended)
            }
        }
    }

    async fn attempt<T, F, Fut>(&self, label: &str, f: &mut F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.attempts => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        handle = %self.handle,
                        step = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient step failure, retrying: {e}"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.store.set_current_step(&self.handle, label)?;
                    return Err(e);
                }
            }
        }
    }
}
