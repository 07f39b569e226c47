//! Overflow-safe timestamp arithmetic.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// `now + delay`, or `None` when the result is not representable.
pub fn checked_after(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    let delta = chrono::Duration::from_std(delay).ok()?;
    now.checked_add_signed(delta)
}

/// `now + delay`, saturating at the latest representable instant.
pub fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    checked_after(now, delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
