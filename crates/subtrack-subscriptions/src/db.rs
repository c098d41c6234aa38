use chrono::NaiveDate;
use rusqlite::Connection;
use subtrack_core::types::{
    Category, Currency, Frequency, SubscriptionId, SubscriptionStatus, UserId, WorkflowHandle,
};

use crate::error::{Result, SubscriptionError};
use crate::types::Subscription;

/// Initialise the subscriptions table and its indexes.
///
/// Idempotent: every statement uses `IF NOT EXISTS`.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS subscriptions (
            id               TEXT PRIMARY KEY NOT NULL,
            name             TEXT NOT NULL,
            price            REAL NOT NULL,
            currency         TEXT NOT NULL DEFAULT 'INR',
            frequency        TEXT NOT NULL,
            category         TEXT NOT NULL,
            payment_method   TEXT NOT NULL,
            status           TEXT NOT NULL DEFAULT 'active',
            start_date       TEXT NOT NULL,   -- YYYY-MM-DD
            renewal_date     TEXT,            -- YYYY-MM-DD, NULL after unsubscribe
            owner_id         TEXT NOT NULL,
            workflow_handle  TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_subscriptions_owner
            ON subscriptions(owner_id, renewal_date);
        CREATE INDEX IF NOT EXISTS idx_subscriptions_handle
            ON subscriptions(workflow_handle);",
    )?;
    Ok(())
}

pub(crate) const SUBSCRIPTION_SELECT_SQL: &str =
    "SELECT id, name, price, currency, frequency, category, payment_method, status,
            start_date, renewal_date, owner_id, workflow_handle, created_at, updated_at
     FROM subscriptions";

/// Raw column values, before the closed-set fields are parsed.
pub(crate) struct SubscriptionRow {
    id: String,
    name: String,
    price: f64,
    currency: String,
    frequency: String,
    category: String,
    payment_method: String,
    status: String,
    start_date: String,
    renewal_date: Option<String>,
    owner_id: String,
    workflow_handle: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SubscriptionRow {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }
}

/// Column order from SUBSCRIPTION_SELECT_SQL.
pub(crate) fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriptionRow> {
    Ok(SubscriptionRow {
        id: row.get(0)?,
        name: row.get(1)?,
        price: row.get(2)?,
        currency: row.get(3)?,
        frequency: row.get(4)?,
        category: row.get(5)?,
        payment_method: row.get(6)?,
        status: row.get(7)?,
        start_date: row.get(8)?,
        renewal_date: row.get(9)?,
        owner_id: row.get(10)?,
        workflow_handle: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = SubscriptionError;

    /// Strict: a stored value outside a closed set is an error, never a
    /// silent default. An unknown frequency surfaces as
    /// `RenewalError::UnsupportedFrequency`.
    fn try_from(row: SubscriptionRow) -> Result<Self> {
        let invalid = |reason: String| SubscriptionError::InvalidRecord {
            id: row.id.clone(),
            reason,
        };
        let parse_date = |s: &str| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|e| invalid(format!("bad date {s:?}: {e}")))
        };

        let frequency: Frequency = row.frequency.parse()?;
        let currency: Currency = row.currency.parse().map_err(invalid)?;
        let category: Category = row.category.parse().map_err(invalid)?;
        let status: SubscriptionStatus = row.status.parse().map_err(invalid)?;
        let start_date = parse_date(&row.start_date)?;
        let renewal_date = row.renewal_date.as_deref().map(parse_date).transpose()?;

        Ok(Subscription {
            id: SubscriptionId(row.id),
            name: row.name,
            price: row.price,
            currency,
            frequency,
            category,
            payment_method: row.payment_method,
            status,
            start_date,
            renewal_date,
            owner: UserId(row.owner_id),
            workflow_handle: row.workflow_handle.map(WorkflowHandle),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
