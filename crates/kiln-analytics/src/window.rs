//! Time windows.
//!
//! Named windows are offsets back from an end instant (default: now).
//! Every window is half-open: `[start, end)`.
//!
//! | Window | Start |
//! |--------|-------|
//! | `daily` | `end - 1 day` |
//! | `weekly` | `end - 7 days` |
//! | `monthly` | `end - 1 calendar month` |
//! | `allTime` | `2020-01-01T00:00Z` |
//! | `custom` | explicit |

use chrono::{DateTime, Duration, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AnalyticsError;

/// A requested aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Window {
    /// The last day.
    Daily,
    /// The last seven days.
    Weekly,
    /// The last calendar month.
    Monthly,
    /// Everything since 2020-01-01.
    AllTime,
    /// Explicit bounds.
    Custom {
        /// Inclusive start.
        start: DateTime<Utc>,
        /// Exclusive end.
        end: DateTime<Utc>,
    },
}

/// A window with concrete bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolved {
    /// The request this came from.
    pub window: Window,
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

fn all_time_start() -> Result<DateTime<Utc>, AnalyticsError> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| AnalyticsError::OutOfRange("allTime start".to_owned()))
}

impl Window {
    /// Parse a window name (`daily`, `weekly`, `monthly`, `allTime`).
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "allTime" | "all_time" | "alltime" => Some(Self::AllTime),
            _ => None,
        }
    }

    /// Window name as used in cache signatures and reports.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::AllTime => "allTime",
            Self::Custom { .. } => "custom",
        }
    }

    /// Resolve concrete bounds, counting named windows back from `end`.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::InvalidWindow`] for a custom window whose
    /// start is not before its end.
    pub fn resolve(self, end: DateTime<Utc>) -> Result<Resolved, AnalyticsError> {
        let out_of_range =
            || AnalyticsError::OutOfRange(format!("{} window ending {end}", self.name()));
        let (start, end) = match self {
            Self::Daily => (
                end.checked_sub_signed(Duration::days(1)).ok_or_else(out_of_range)?,
                end,
            ),
            Self::Weekly => (
                end.checked_sub_signed(Duration::days(7)).ok_or_else(out_of_range)?,
                end,
            ),
            Self::Monthly => (
                end.checked_sub_months(Months::new(1)).ok_or_else(out_of_range)?,
                end,
            ),
            Self::AllTime => (all_time_start()?, end),
            Self::Custom { start, end } => (start, end),
        };
        if start >= end {
            return Err(AnalyticsError::InvalidWindow { start, end });
        }
        Ok(Resolved {
            window: self,
            start,
            end,
        })
    }
}

impl Resolved {
    /// Whether `ts` falls in `[start, end)`.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Cache signature: named windows use the name and `end` to the
    /// minute; custom windows use both bounds in epoch milliseconds.
    pub fn signature(&self) -> String {
        match self.window {
            Window::Custom { .. } => format!(
                "custom:{}-{}",
                self.start.timestamp_millis(),
                self.end.timestamp_millis()
            ),
            named => format!("{}:{}", named.name(), self.end.format("%Y%m%d%H%M")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    #[test]
    fn named_windows_count_back_from_end() {
        let end = at(2025, 3, 31, 12, 0);
        assert_eq!(Window::Daily.resolve(end).unwrap().start, at(2025, 3, 30, 12, 0));
        assert_eq!(Window::Weekly.resolve(end).unwrap().start, at(2025, 3, 24, 12, 0));
        // One calendar month back from Mar 31 clamps to Feb 28.
        assert_eq!(Window::Monthly.resolve(end).unwrap().start, at(2025, 2, 28, 12, 0));
        assert_eq!(Window::AllTime.resolve(end).unwrap().start, at(2020, 1, 1, 0, 0));
    }

    #[test]
    fn half_open_bounds() {
        let resolved = Window::Custom {
            start: at(2025, 1, 1, 0, 0),
            end: at(2025, 1, 2, 0, 0),
        }
        .resolve(Utc::now())
        .unwrap();
        assert!(resolved.contains(at(2025, 1, 1, 0, 0)));
        assert!(!resolved.contains(at(2025, 1, 2, 0, 0)));
    }

    #[test]
    fn inverted_custom_window_is_rejected() {
        let err = Window::Custom {
            start: at(2025, 1, 2, 0, 0),
            end: at(2025, 1, 1, 0, 0),
        }
        .resolve(Utc::now())
        .unwrap_err();
        assert!(matches!(err, AnalyticsError::InvalidWindow { .. }));
    }

    #[test]
    fn signatures_truncate_named_windows_to_the_minute() {
        let a = Window::Daily.resolve(at(2025, 1, 1, 10, 5)).unwrap();
        let b = Window::Daily
            .resolve(at(2025, 1, 1, 10, 5) + Duration::seconds(40))
            .unwrap();
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature(), "daily:202501011005");
        assert_ne!(
            a.signature(),
            Window::Weekly.resolve(at(2025, 1, 1, 10, 5)).unwrap().signature()
        );
    }
}
