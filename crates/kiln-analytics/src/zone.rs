//! The reporting zone.
//!
//! All hour and day bucketing happens at one fixed UTC offset, never in the
//! host's local timezone, so the same events produce the same histogram on
//! every machine. The default is UTC-4.

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AnalyticsError;

/// Default reporting offset, in hours east of UTC.
pub const DEFAULT_OFFSET_HOURS: i32 = -4;

/// Fixed UTC offset used for bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct ReportingZone {
    offset: FixedOffset,
    hours: i32,
}

impl ReportingZone {
    /// Zone at `hours` east of UTC.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::InvalidOffset`] outside `-23..=23`.
    pub fn from_hours(hours: i32) -> Result<Self, AnalyticsError> {
        let offset = hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .ok_or(AnalyticsError::InvalidOffset(hours))?;
        Ok(Self { offset, hours })
    }

    /// Offset in hours east of UTC.
    pub const fn hours(self) -> i32 {
        self.hours
    }

    /// `ts` as wall-clock time in this zone.
    pub fn local(self, ts: DateTime<Utc>) -> DateTime<FixedOffset> {
        ts.with_timezone(&self.offset)
    }

    /// Hour-of-day bucket, `0..24`.
    pub fn hour(self, ts: DateTime<Utc>) -> usize {
        usize::try_from(self.local(ts).hour()).unwrap_or(0)
    }

    /// Calendar-day bucket.
    pub fn day(self, ts: DateTime<Utc>) -> NaiveDate {
        self.local(ts).date_naive()
    }
}

impl Default for ReportingZone {
    fn default() -> Self {
        Self::from_hours(DEFAULT_OFFSET_HOURS).unwrap_or(Self {
            offset: Utc.fix(),
            hours: 0,
        })
    }
}

impl TryFrom<i32> for ReportingZone {
    type Error = AnalyticsError;

    fn try_from(hours: i32) -> Result<Self, Self::Error> {
        Self::from_hours(hours)
    }
}

impl From<ReportingZone> for i32 {
    fn from(zone: ReportingZone) -> Self {
        zone.hours
    }
}
