//! Interval-aligned expiration.
//!
//! Expiry can snap to the next boundary of a fixed interval in a
//! configured timezone: an 8-hour interval in `America/Chicago` expires
//! entries at 00:00, 08:00 and 16:00 local time, not at UTC boundaries.
//! The math shifts the clock into local-epoch seconds, rounds up to the
//! next multiple of the interval, and shifts back.

use chrono::{Offset, TimeZone, Utc};
use chrono_tz::Tz;

/// Signed UTC offset in minutes for `tz` at epoch second `t`
/// (`local_minus_utc`; America/Chicago is -300 or -360).
pub fn utc_offset_minutes(tz: &Tz, t: i64) -> i32 {
    let utc = match Utc.timestamp_opt(t, 0).single() {
        Some(datetime) => datetime,
        None => return 0,
    };
    tz.offset_from_utc_datetime(&utc.naive_utc())
        .fix()
        .local_minus_utc()
        / 60
}

/// The next interval boundary strictly after `t`.
///
/// Boundaries are multiples of `interval_secs` on the local timeline
/// anchored at the Unix epoch; this also covers multi-day intervals.
/// A `t` exactly on a boundary advances a full interval, so the result
/// always satisfies `t < next <= t + interval_secs`.
pub fn next_boundary(interval_secs: i64, t: i64, offset_minutes: i32) -> i64 {
    let interval = interval_secs.max(1);
    let shift = i64::from(offset_minutes) * 60;
    let local = t + shift;

    let remainder = local.rem_euclid(interval);
    let next_local = if remainder == 0 {
        local + interval
    } else {
        local - remainder + interval
    };

    next_local - shift
}
