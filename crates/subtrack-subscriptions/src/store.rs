use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use subtrack_core::clock::Clock;
use subtrack_core::next_renewal_date;
use subtrack_core::time::format_instant;
use subtrack_core::types::{SubscriptionId, SubscriptionStatus, WorkflowHandle};
use tracing::{debug, info, instrument, warn};

use crate::db::{format_date, read_row, SUBSCRIPTION_SELECT_SQL};
use crate::error::{Result, SubscriptionError};
use crate::types::{
    NewSubscription, RenewalApplied, SetOptions, Subscription, SubscriptionFields,
    SubscriptionFilter,
};
use crate::validate;

/// Thread-safe store for subscription records.
///
/// Every mutation is a single statement or an `IMMEDIATE` transaction, so the
/// status / renewal date / workflow handle triple is never observed
/// half-written.
///
/// "Today" for validation and expiry, and every audit timestamp, come from
/// the injected clock.
pub struct SubscriptionStore {
    db: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SubscriptionStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(db: Arc<Mutex<Connection>>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    fn stamp(&self) -> String {
        format_instant(self.clock.now())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate and insert a new subscription.
    ///
    /// The renewal date is derived from the start date; a record whose
    /// derived renewal date is already before today is stored `expired`.
    #[instrument(skip(self, new), fields(owner = %new.owner))]
    pub fn create(&self, new: &NewSubscription) -> Result<Subscription> {
        let today = self.clock.today();
        let name = validate::name(&new.name)?;
        let price = validate::price(new.price)?;
        let payment_method = validate::payment_method(&new.payment_method)?;
        let start_date = validate::start_date(new.start_date, today)?;
        let renewal_date = next_renewal_date(start_date, new.frequency)?;
        let status = if renewal_date < today {
            SubscriptionStatus::Expired
        } else {
            SubscriptionStatus::Active
        };

        let now = self.stamp();
        let sub = Subscription {
            id: SubscriptionId::new(),
            name,
            price,
            currency: new.currency,
            frequency: new.frequency,
            category: new.category,
            payment_method,
            status,
            start_date,
            renewal_date: Some(renewal_date),
            owner: new.owner.clone(),
            workflow_handle: None,
            created_at: now.clone(),
            updated_at: now,
        };

        self.conn().execute(
            "INSERT INTO subscriptions
             (id, name, price, currency, frequency, category, payment_method, status,
              start_date, renewal_date, owner_id, workflow_handle, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, ?12, ?13)",
            params![
                sub.id.as_str(),
                sub.name,
                sub.price,
                sub.currency.code(),
                sub.frequency.as_str(),
                sub.category.as_str(),
                sub.payment_method,
                sub.status.as_str(),
                format_date(sub.start_date),
                format_date(renewal_date),
                sub.owner.as_str(),
                sub.created_at,
                sub.updated_at,
            ],
        )?;
        info!(subscription_id = %sub.id, status = %sub.status, renewal_date = %renewal_date, "subscription created");
        Ok(sub)
    }

    /// Retrieve a subscription, returning `None` if it does not exist.
    #[instrument(skip(self))]
    pub fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>> {
        let conn = self.conn();
        get_in(&conn, id)
    }

    /// Atomic partial update.
    ///
    /// Merges `fields` into the current record inside an `IMMEDIATE`
    /// transaction. A start-date change re-derives the renewal date (unless
    /// the patch overrides it) and marks the record `expired` when that date
    /// is already before today. With `validate`, the merged record must
    /// pass every field rule or nothing is written.
    #[instrument(skip(self, fields))]
    pub fn set_fields(
        &self,
        id: &SubscriptionId,
        fields: &SubscriptionFields,
        opts: SetOptions,
    ) -> Result<Subscription> {
        let today = self.clock.today();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut sub = get_in(&tx, id)?.ok_or_else(|| SubscriptionError::NotFound(id.to_string()))?;

        if let Some(name) = &fields.name {
            sub.name = name.trim().to_string();
        }
        if let Some(price) = fields.price {
            sub.price = price;
        }
        if let Some(currency) = fields.currency {
            sub.currency = currency;
        }
        if let Some(frequency) = fields.frequency {
            sub.frequency = frequency;
        }
        if let Some(category) = fields.category {
            sub.category = category;
        }
        if let Some(method) = &fields.payment_method {
            sub.payment_method = method.trim().to_string();
        }
        if let Some(status) = fields.status {
            sub.status = status;
        }

        let start_changed = fields.start_date.is_some();
        if let Some(start) = fields.start_date {
            sub.start_date = start;
        }
        match fields.renewal_date {
            Some(explicit) => sub.renewal_date = explicit,
            None if start_changed => {
                let renewal = next_renewal_date(sub.start_date, sub.frequency)?;
                sub.renewal_date = Some(renewal);
                if renewal < today {
                    debug!(subscription_id = %id, %renewal, "derived renewal date already past; expiring");
                    sub.status = SubscriptionStatus::Expired;
                }
            }
            None => {}
        }

        if opts.validate {
            validate::record(&sub, start_changed, today)?;
        }

        sub.updated_at = self.stamp();
        tx.execute(
            "UPDATE subscriptions SET
                name = ?2, price = ?3, currency = ?4, frequency = ?5, category = ?6,
                payment_method = ?7, status = ?8, start_date = ?9, renewal_date = ?10,
                updated_at = ?11
             WHERE id = ?1",
            params![
                sub.id.as_str(),
                sub.name,
                sub.price,
                sub.currency.code(),
                sub.frequency.as_str(),
                sub.category.as_str(),
                sub.payment_method,
                sub.status.as_str(),
                format_date(sub.start_date),
                sub.renewal_date.map(format_date),
                sub.updated_at,
            ],
        )?;
        tx.commit()?;
        Ok(sub)
    }

    /// All subscriptions matching every set criterion, soonest renewal first
    /// (records without a renewal date last). Rows that no longer parse are
    /// left out with a warning.
    #[instrument(skip(self))]
    pub fn find(&self, filter: &SubscriptionFilter) -> Result<Vec<Subscription>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(owner) = &filter.owner {
            args.push(owner.to_string());
            clauses.push(format!("owner_id = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some((from, to)) = filter.renewal_between {
            args.push(format_date(from));
            clauses.push(format!("renewal_date >= ?{}", args.len()));
            args.push(format_date(to));
            clauses.push(format!("renewal_date <= ?{}", args.len()));
        }
        let mut sql = SUBSCRIPTION_SELECT_SQL.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY renewal_date IS NULL, renewal_date ASC, id ASC");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id().to_string();
                match Subscription::try_from(row) {
                    Ok(sub) => Some(sub),
                    Err(e) => {
                        warn!(subscription_id = %id, "skipping unreadable subscription: {e}");
                        None
                    }
                }
            })
            .collect())
    }

    /// Permanently delete a subscription record.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &SubscriptionId) -> Result<()> {
        let rows = self
            .conn()
            .execute("DELETE FROM subscriptions WHERE id = ?1", params![id.as_str()])?;
        if rows == 0 {
            return Err(SubscriptionError::NotFound(id.to_string()));
        }
        info!(subscription_id = %id, "subscription deleted");
        Ok(())
    }

    /// Compare-and-swap the workflow handle.
    ///
    /// Writes `new` only when the stored handle equals `expected` (both may be
    /// `None`). Returns whether the swap happened; a missing record also
    /// returns `false`.
    #[instrument(skip(self))]
    pub fn swap_workflow_handle(
        &self,
        id: &SubscriptionId,
        expected: Option<&WorkflowHandle>,
        new: Option<&WorkflowHandle>,
    ) -> Result<bool> {
        let now = self.stamp();
        let rows = self.conn().execute(
            "UPDATE subscriptions SET workflow_handle = ?3, updated_at = ?4
             WHERE id = ?1 AND workflow_handle IS ?2",
            params![
                id.as_str(),
                expected.map(WorkflowHandle::as_str),
                new.map(WorkflowHandle::as_str),
                now
            ],
        )?;
        Ok(rows == 1)
    }

    /// Conditional renewal write: replace `expected` with `next` and set the
    /// status back to `active`.
    ///
    /// Only the instance named by `handle` may renew, and only while the
    /// record is `active` or `expired`; otherwise `Superseded` or `NotActive`
    /// is reported. The old renewal date is the last precondition. Finding
    /// `next` already in place reports `AlreadyApplied`; any other date
    /// reports `Drifted`. Nothing is written unless `Applied` is returned.
    #[instrument(skip(self))]
    pub fn advance_renewal(
        &self,
        id: &SubscriptionId,
        handle: &WorkflowHandle,
        expected: NaiveDate,
        next: NaiveDate,
    ) -> Result<RenewalApplied> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<(Option<String>, String, Option<String>)> = tx
            .query_row(
                "SELECT renewal_date, status, workflow_handle FROM subscriptions WHERE id = ?1",
                params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (renewal, status, stored_handle) =
            current.ok_or_else(|| SubscriptionError::NotFound(id.to_string()))?;
        let invalid = |reason: String| SubscriptionError::InvalidRecord {
            id: id.to_string(),
            reason,
        };
        let renewal = renewal
            .map(|s| {
                NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                    .map_err(|e| invalid(format!("bad renewal date {s:?}: {e}")))
            })
            .transpose()?;
        let status: SubscriptionStatus = status.parse().map_err(invalid)?;

        let outcome = if stored_handle.as_deref() != Some(handle.as_str()) {
            RenewalApplied::Superseded
        } else if !matches!(status, SubscriptionStatus::Active | SubscriptionStatus::Expired) {
            RenewalApplied::NotActive(status)
        } else {
            match renewal {
                Some(date) if date == expected => {
                    tx.execute(
                        "UPDATE subscriptions SET renewal_date = ?2, status = 'active', updated_at = ?3
                         WHERE id = ?1",
                        params![id.as_str(), format_date(next), self.stamp()],
                    )?;
                    RenewalApplied::Applied
                }
                Some(date) if date == next => RenewalApplied::AlreadyApplied,
                other => RenewalApplied::Drifted(other),
            }
        };
        tx.commit()?;
        Ok(outcome)
    }
}

fn get_in(conn: &Connection, id: &SubscriptionId) -> Result<Option<Subscription>> {
    let sql = format!("{SUBSCRIPTION_SELECT_SQL} WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id.as_str()], read_row)
        .optional()?;
    row.map(Subscription::try_from).transpose()
}
