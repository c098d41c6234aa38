use std::sync::Arc;
use std::time::Duration;

use subtrack_core::config::SchedulerConfig;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::executor::WorkflowExecutor;
use crate::instances::WorkflowStore;
use crate::lifecycle::WorkflowLifecycleManager;

/// Drives workflow instances: claims the ones whose wake time has arrived
/// and runs each on its own task.
pub struct SchedulerEngine {
    workflows: Arc<WorkflowStore>,
    executor: Arc<WorkflowExecutor>,
    lifecycle: Arc<WorkflowLifecycleManager>,
    config: SchedulerConfig,
    ticks: u64,
}

impl SchedulerEngine {
    pub fn new(
        workflows: Arc<WorkflowStore>,
        executor: Arc<WorkflowExecutor>,
        lifecycle: Arc<WorkflowLifecycleManager>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            workflows,
            executor,
            lifecycle,
            config,
            ticks: 0,
        }
    }

    /// Main loop. Polls every `poll_interval_ms` until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "scheduler engine started"
        );
        if let Err(e) = self.workflows.recover_interrupted() {
            error!("recovering interrupted instances failed: {e}");
        }
        self.sweep();

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("scheduler tick error: {e}");
                    }
                    self.ticks += 1;
                    let every = self.config.sweep_every_ticks;
                    if every > 0 && self.ticks % every == 0 {
                        self.sweep();
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Claim due instances and run them to their next suspension or end.
    /// Returns how many instances ran.
    pub async fn tick(&self) -> Result<usize> {
        let due = self.workflows.claim_due(self.config.batch_size)?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "claimed due instances");

        let mut tasks = JoinSet::new();
        for instance in due {
            let executor = self.executor.clone();
            tasks.spawn(async move {
                // Failures are recorded on the instance by the executor.
                let _ = executor.execute(&instance).await;
            });
        }
        let mut ran = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(()) => ran += 1,
                Err(e) => error!("workflow task panicked: {e}"),
            }
        }
        Ok(ran)
    }

    fn sweep(&self) {
        match self.lifecycle.sweep() {
            Ok(0) => {}
            Ok(n) => warn!(stopped = n, "sweep stopped stray instances"),
            Err(e) => error!("instance sweep failed: {e}"),
        }
    }
}
