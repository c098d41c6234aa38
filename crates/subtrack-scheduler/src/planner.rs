use chrono::{Days, NaiveDate};

use crate::types::Checkpoint;

/// Days before the renewal date at which an instance reconciles, in
/// processing order. The last one is the renewal itself.
pub const REMINDER_OFFSETS: [u32; 5] = [7, 5, 2, 1, 0];

/// Checkpoints of the cycle ending on `renewal_date`, ascending by date.
///
/// Dates too close to the calendar's lower bound to subtract from are left
/// out rather than wrapped.
pub fn plan(renewal_date: NaiveDate) -> Vec<Checkpoint> {
    REMINDER_OFFSETS
        .iter()
        .filter_map(|&offset| {
            checkpoint_date(renewal_date, offset).map(|date| Checkpoint {
                offset_days: offset,
                date,
            })
        })
        .collect()
}

/// `renewal_date − offset_days`.
pub fn checkpoint_date(renewal_date: NaiveDate, offset_days: u32) -> Option<NaiveDate> {
    renewal_date.checked_sub_days(Days::new(offset_days as u64))
}
