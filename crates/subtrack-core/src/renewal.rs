use chrono::{Datelike, Days, Months, NaiveDate};
use thiserror::Error;

use crate::types::Frequency;

/// Failures of renewal-date arithmetic. Both are permanent: retrying the same
/// input can never succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenewalError {
    #[error("Unsupported frequency: {0}")]
    UnsupportedFrequency(String),

    #[error("Renewal date out of range: {start} + {units} x {frequency}")]
    OutOfRange {
        start: NaiveDate,
        frequency: Frequency,
        units: u32,
    },
}

/// Advance `start` by exactly one unit of `frequency`.
///
/// Month and year steps keep the day of month and clamp to the last day of
/// the target month when it is shorter (Jan 31 → Feb 28, Feb 29 → Feb 28).
pub fn next_renewal_date(start: NaiveDate, frequency: Frequency) -> Result<NaiveDate, RenewalError> {
    advance(start, frequency, 1)
}

/// Advance `start` by `units` whole units of `frequency` in a single step.
///
/// Clamping happens once, against the final month, so advancing a Jan 31
/// monthly start by 2 lands on Mar 31 rather than on Mar 28.
pub fn advance(start: NaiveDate, frequency: Frequency, units: u32) -> Result<NaiveDate, RenewalError> {
    let out_of_range = || RenewalError::OutOfRange {
        start,
        frequency,
        units,
    };
    match frequency {
        Frequency::Daily => start.checked_add_days(Days::new(units as u64)),
        Frequency::Weekly => start.checked_add_days(Days::new(units as u64 * 7)),
        Frequency::Monthly => start.checked_add_months(Months::new(units)),
        Frequency::Yearly => units
            .checked_mul(12)
            .and_then(|months| start.checked_add_months(Months::new(months))),
    }
    .ok_or_else(out_of_range)
}

/// The first renewal of the cycle anchored on `start` that falls after `after`.
///
/// Every renewal is computed from `start` as a whole number of units, so
/// month-end clamping in one cycle never carries into the next: a Jan 31
/// monthly subscription renews Feb 28, then Mar 31.
pub fn next_renewal_after(
    start: NaiveDate,
    frequency: Frequency,
    after: NaiveDate,
) -> Result<NaiveDate, RenewalError> {
    let mut units = elapsed_units(start, frequency, after).saturating_sub(1).max(1);
    loop {
        let candidate = advance(start, frequency, units)?;
        if candidate > after {
            return Ok(candidate);
        }
        units = units.checked_add(1).ok_or(RenewalError::OutOfRange {
            start,
            frequency,
            units,
        })?;
    }
}

/// Lower estimate of whole units between `start` and `until`.
fn elapsed_units(start: NaiveDate, frequency: Frequency, until: NaiveDate) -> u32 {
    if until <= start {
        return 0;
    }
    let months = |d: NaiveDate| d.year() as i64 * 12 + d.month0() as i64;
    let units = match frequency {
        Frequency::Daily => (until - start).num_days(),
        Frequency::Weekly => (until - start).num_days() / 7,
        Frequency::Monthly => months(until) - months(start),
        Frequency::Yearly => (until.year() - start.year()) as i64,
    };
    u32::try_from(units).unwrap_or(u32::MAX)
}
