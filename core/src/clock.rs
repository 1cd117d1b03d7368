//! Wall clock abstraction and the regional timezone.
//!
//! RULE: Rule code never calls `Utc::now()` directly.
//! "Now" is read once per invocation from a Clock and passed down,
//! so a whole recalculation sees one instant.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{BillingError, BillingResult};

/// Timezone every calendar boundary (Sept 1, Dec 31, proration window) is
/// evaluated in, regardless of where the caller runs.
pub const REGIONAL_TZ: Tz = chrono_tz::America::Edmonton;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to one instant. Used by tests and replay tooling.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Midnight at the start of `date` in the regional timezone, as UTC.
pub fn regional_midnight(date: NaiveDate) -> BillingResult<DateTime<Utc>> {
    regional_instant(date.and_time(NaiveTime::MIN))
}

/// Interpret a naive local wall time in the regional timezone.
/// Ambiguous times (DST fall-back) resolve to the earlier instant.
pub fn regional_instant(local: NaiveDateTime) -> BillingResult<DateTime<Utc>> {
    REGIONAL_TZ
        .from_local_datetime(&local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| {
            BillingError::invalid("local_time", format!("{local} does not exist in {}", REGIONAL_TZ.name()))
        })
}

/// Calendar date of an instant as seen in the regional timezone.
pub fn regional_date(instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(&REGIONAL_TZ).date_naive()
}
