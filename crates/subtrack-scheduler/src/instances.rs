use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use subtrack_core::time::{format_instant, parse_instant};
use subtrack_core::types::{SubscriptionId, WorkflowHandle};
use subtrack_core::clock::Clock;
use tracing::{info, instrument, warn};

use crate::error::{Result, SchedulerError};
use crate::types::{InstanceStatus, NewInstance, UndeliveredReminder, WorkflowInstance};

const INSTANCE_SELECT_SQL: &str =
    "SELECT handle, subscription_id, target, status, wake_at, current_step,
            cancel_requested, detail, retry_count, created_at, updated_at
     FROM workflow_instances";

const LIVE_STATUSES: &str = "('pending', 'running', 'sleeping')";

/// What a stop request found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The instance was pending or sleeping and is now cancelled.
    Stopped,
    /// The instance is running; `cancel_requested` is set and the instance
    /// will acknowledge at its next reconciliation point.
    Signalled,
    /// The instance had already finished.
    AlreadyFinished(InstanceStatus),
    /// No instance with this handle exists.
    Missing,
}

/// State of one journaled step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepRecord {
    /// Marked before an at-most-once side effect; never completed.
    Started,
    /// Finished with a JSON output.
    Completed(String),
}

/// Durable substrate: instance records plus the per-instance step journal.
pub struct WorkflowStore {
    db: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl WorkflowStore {
    pub fn new(db: Arc<Mutex<Connection>>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a pending instance that is runnable immediately.
    #[instrument(skip(self, req), fields(handle = %req.handle, subscription_id = %req.subscription_id))]
    pub fn trigger(&self, req: &NewInstance) -> Result<WorkflowInstance> {
        let now = self.clock.now();
        let now_str = format_instant(now);
        self.conn().execute(
            "INSERT INTO workflow_instances
             (handle, subscription_id, target, status, wake_at, current_step,
              cancel_requested, detail, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, NULL, 0, NULL, ?4, ?4)",
            params![
                req.handle.as_str(),
                req.subscription_id.as_str(),
                req.target,
                now_str
            ],
        )?;
        info!("workflow instance triggered");
        Ok(WorkflowInstance {
            handle: req.handle.clone(),
            subscription_id: req.subscription_id.clone(),
            target: req.target.clone(),
            status: InstanceStatus::Pending,
            wake_at: Some(now),
            current_step: None,
            cancel_requested: false,
            detail: None,
            retry_count: 0,
            created_at: now_str.clone(),
            updated_at: now_str,
        })
    }

    pub fn get(&self, handle: &WorkflowHandle) -> Result<Option<WorkflowInstance>> {
        let sql = format!("{INSTANCE_SELECT_SQL} WHERE handle = ?1");
        let conn = self.conn();
        let row = conn
            .query_row(&sql, params![handle.as_str()], row_to_instance)
            .optional()?;
        Ok(row)
    }

    pub fn status_of(&self, handle: &WorkflowHandle) -> Result<Option<InstanceStatus>> {
        Ok(self.get(handle)?.map(|i| i.status))
    }

    /// Cooperative stop.
    ///
    /// Pending and sleeping instances are cancelled on the spot, so their
    /// wake never runs. A running instance only gets `cancel_requested`.
    #[instrument(skip(self))]
    pub fn request_stop(&self, handle: &WorkflowHandle) -> Result<StopOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM workflow_instances WHERE handle = ?1",
                params![handle.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(status) = status else {
            return Ok(StopOutcome::Missing);
        };
        let status = parse_status(&status)?;
        let now = format_instant(self.clock.now());

        let outcome = match status {
            InstanceStatus::Pending | InstanceStatus::Sleeping => {
                tx.execute(
                    "UPDATE workflow_instances
                     SET status = 'cancelled', wake_at = NULL, detail = 'stopped', updated_at = ?2
                     WHERE handle = ?1",
                    params![handle.as_str(), now],
                )?;
                StopOutcome::Stopped
            }
            InstanceStatus::Running => {
                tx.execute(
                    "UPDATE workflow_instances SET cancel_requested = 1, updated_at = ?2
                     WHERE handle = ?1",
                    params![handle.as_str(), now],
                )?;
                StopOutcome::Signalled
            }
            finished => StopOutcome::AlreadyFinished(finished),
        };
        tx.commit()?;
        info!(outcome = ?outcome, "stop requested");
        Ok(outcome)
    }

    pub fn cancel_requested(&self, handle: &WorkflowHandle) -> Result<bool> {
        let flag: Option<i64> = self
            .conn()
            .query_row(
                "SELECT cancel_requested FROM workflow_instances WHERE handle = ?1",
                params![handle.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.is_some_and(|f| f != 0))
    }

    /// Pending, running and sleeping instances, oldest first.
    pub fn list_active(&self) -> Result<Vec<WorkflowInstance>> {
        let sql = format!("{INSTANCE_SELECT_SQL} WHERE status IN {LIVE_STATUSES} ORDER BY created_at, handle");
        self.query(&sql, params![])
    }

    pub fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<WorkflowInstance>> {
        let sql = format!("{INSTANCE_SELECT_SQL} WHERE status = ?1 ORDER BY updated_at DESC, handle");
        self.query(&sql, params![status.as_str()])
    }

    pub fn list_for_subscription(&self, id: &SubscriptionId) -> Result<Vec<WorkflowInstance>> {
        let sql = format!("{INSTANCE_SELECT_SQL} WHERE subscription_id = ?1 ORDER BY created_at, handle");
        self.query(&sql, params![id.as_str()])
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<WorkflowInstance>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, row_to_instance)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Move up to `limit` pending/sleeping instances whose wake time has
    /// arrived to `running`.
    ///
    /// Each claim is a conditional UPDATE, so an instance is never handed to
    /// two runners.
    pub fn claim_due(&self, limit: usize) -> Result<Vec<WorkflowInstance>> {
        let now = format_instant(self.clock.now());
        let candidates: Vec<String> = {
            let conn = self.conn();
            let mut stmt = conn.prepare_cached(
                "SELECT handle FROM workflow_instances
                 WHERE status IN ('pending', 'sleeping')
                   AND (wake_at IS NULL OR wake_at <= ?1)
                 ORDER BY wake_at, created_at
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![now, limit as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for handle in candidates {
            let n = self.conn().execute(
                "UPDATE workflow_instances SET status = 'running', updated_at = ?2
                 WHERE handle = ?1 AND status IN ('pending', 'sleeping')",
                params![handle, now],
            )?;
            if n == 1 {
                if let Some(instance) = self.get(&WorkflowHandle(handle))? {
                    claimed.push(instance);
                }
            }
        }
        Ok(claimed)
    }

    /// Park a running instance until `until`.
    ///
    /// A stop that arrived while the instance was running turns the
    /// suspension into a cancellation. Returns the resulting status.
    pub fn suspend(
        &self,
        handle: &WorkflowHandle,
        until: DateTime<Utc>,
        step: &str,
    ) -> Result<InstanceStatus> {
        let now = format_instant(self.clock.now());
        self.conn().execute(
            "UPDATE workflow_instances
             SET status = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'sleeping' END,
                 wake_at = CASE WHEN cancel_requested = 1 THEN NULL ELSE ?2 END,
                 detail = CASE WHEN cancel_requested = 1 THEN 'stopped' ELSE NULL END,
                 current_step = ?3,
                 retry_count = 0,
                 updated_at = ?4
             WHERE handle = ?1 AND status = 'running'",
            params![handle.as_str(), format_instant(until), step, now],
        )?;
        self.status_of(handle)?
            .ok_or_else(|| SchedulerError::InstanceNotFound(handle.to_string()))
    }

    /// Park a running instance after a transient failure, to be replayed at
    /// `until`. `current_step` keeps naming the step that failed.
    ///
    /// A pending stop cancels instead, as with `suspend`.
    pub fn defer(
        &self,
        handle: &WorkflowHandle,
        until: DateTime<Utc>,
        retry_count: u32,
        error: &str,
    ) -> Result<InstanceStatus> {
        let now = format_instant(self.clock.now());
        self.conn().execute(
            "UPDATE workflow_instances
             SET status = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'sleeping' END,
                 wake_at = CASE WHEN cancel_requested = 1 THEN NULL ELSE ?2 END,
                 detail = CASE WHEN cancel_requested = 1 THEN 'stopped' ELSE ?4 END,
                 retry_count = ?3,
                 updated_at = ?5
             WHERE handle = ?1 AND status = 'running'",
            params![handle.as_str(), format_instant(until), retry_count, error, now],
        )?;
        self.status_of(handle)?
            .ok_or_else(|| SchedulerError::InstanceNotFound(handle.to_string()))
    }

    /// Record a terminal status.
    pub fn finish(
        &self,
        handle: &WorkflowHandle,
        status: InstanceStatus,
        detail: Option<&str>,
    ) -> Result<()> {
        let now = format_instant(self.clock.now());
        self.conn().execute(
            "UPDATE workflow_instances
             SET status = ?2, detail = ?3, wake_at = NULL, updated_at = ?4
             WHERE handle = ?1",
            params![handle.as_str(), status.as_str(), detail, now],
        )?;
        Ok(())
    }

    pub fn set_current_step(&self, handle: &WorkflowHandle, step: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE workflow_instances SET current_step = ?2 WHERE handle = ?1",
            params![handle.as_str(), step],
        )?;
        Ok(())
    }

    /// Return instances left `running` by a crash to `pending`, so the engine
    /// replays them from their journal. Call once before the engine starts.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let now = format_instant(self.clock.now());
        let n = self.conn().execute(
            "UPDATE workflow_instances SET status = 'pending', wake_at = ?1, updated_at = ?1
             WHERE status = 'running'",
            params![now],
        )?;
        if n > 0 {
            warn!(count = n, "interrupted workflow instances returned to pending");
        }
        Ok(n)
    }

    // --- journal -------------------------------------------------------------

    pub fn step(&self, handle: &WorkflowHandle, label: &str) -> Result<Option<StepRecord>> {
        let row: Option<(String, Option<String>)> = self
            .conn()
            .query_row(
                "SELECT state, output FROM workflow_steps WHERE handle = ?1 AND label = ?2",
                params![handle.as_str(), label],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(state, output)| match (state.as_str(), output) {
            ("completed", Some(output)) => StepRecord::Completed(output),
            _ => StepRecord::Started,
        }))
    }

    pub fn begin_step(&self, handle: &WorkflowHandle, label: &str) -> Result<()> {
        let now = format_instant(self.clock.now());
        self.conn().execute(
            "INSERT INTO workflow_steps (handle, label, state, output, updated_at)
             VALUES (?1, ?2, 'started', NULL, ?3)
             ON CONFLICT (handle, label) DO NOTHING",
            params![handle.as_str(), label, now],
        )?;
        Ok(())
    }

    pub fn complete_step(&self, handle: &WorkflowHandle, label: &str, output: &str) -> Result<()> {
        let now = format_instant(self.clock.now());
        self.conn().execute(
            "INSERT INTO workflow_steps (handle, label, state, output, updated_at)
             VALUES (?1, ?2, 'completed', ?3, ?4)
             ON CONFLICT (handle, label)
             DO UPDATE SET state = 'completed', output = excluded.output, updated_at = excluded.updated_at",
            params![handle.as_str(), label, output, now],
        )?;
        Ok(())
    }

    /// Drop a `started` marker after a step failed with a known outcome.
    pub fn clear_step(&self, handle: &WorkflowHandle, label: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM workflow_steps WHERE handle = ?1 AND label = ?2 AND state = 'started'",
            params![handle.as_str(), label],
        )?;
        Ok(())
    }

    pub fn journal(&self, handle: &WorkflowHandle) -> Result<Vec<(String, StepRecord)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT label, state, output FROM workflow_steps
             WHERE handle = ?1 ORDER BY updated_at, rowid",
        )?;
        let rows = stmt
            .query_map(params![handle.as_str()], |row| {
                let label: String = row.get(0)?;
                let state: String = row.get(1)?;
                let output: Option<String> = row.get(2)?;
                Ok((label, state, output))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .map(|(label, state, output)| {
                let record = match (state.as_str(), output) {
                    ("completed", Some(output)) => StepRecord::Completed(output),
                    _ => StepRecord::Started,
                };
                (label, record)
            })
            .collect())
    }

    // --- undelivered reminders ---------------------------------------------

    /// Log a reminder given up on. Returns `false` when this checkpoint of
    /// the instance was already logged.
    pub fn record_undelivered(
        &self,
        handle: &WorkflowHandle,
        subscription_id: &SubscriptionId,
        checkpoint: &str,
        error: &str,
    ) -> Result<bool> {
        let now = format_instant(self.clock.now());
        let n = self.conn().execute(
            "INSERT INTO undelivered_reminders (handle, checkpoint, subscription_id, error, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (handle, checkpoint) DO NOTHING",
            params![handle.as_str(), checkpoint, subscription_id.as_str(), error, now],
        )?;
        Ok(n == 1)
    }

    /// Every undelivered reminder, newest first.
    pub fn list_undelivered(&self) -> Result<Vec<UndeliveredReminder>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT handle, subscription_id, checkpoint, error, recorded_at
             FROM undelivered_reminders ORDER BY recorded_at DESC, handle, checkpoint",
        )?;
        let rows = stmt
            .query_map(params![], |row| {
                Ok(UndeliveredReminder {
                    workflow_run_id: WorkflowHandle(row.get(0)?),
                    subscription_id: SubscriptionId(row.get(1)?),
                    checkpoint: row.get(2)?,
                    error: row.get(3)?,
                    recorded_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn parse_status(s: &str) -> Result<InstanceStatus> {
    s.parse().map_err(SchedulerError::InvalidState)
}

/// Column order from INSTANCE_SELECT_SQL.
fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowInstance> {
    let status: String = row.get(3)?;
    let status = status.parse::<InstanceStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    let wake_at: Option<String> = row.get(4)?;
    Ok(WorkflowInstance {
        handle: WorkflowHandle(row.get(0)?),
        subscription_id: SubscriptionId(row.get(1)?),
        target: row.get(2)?,
        status,
        wake_at: wake_at.as_deref().and_then(parse_instant),
        current_step: row.get(5)?,
        cancel_requested: row.get::<_, i64>(6)? != 0,
        detail: row.get(7)?,
        retry_count: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}
