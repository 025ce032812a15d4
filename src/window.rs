use crate::error::Error;
use chrono::{Datelike, Duration, Months, NaiveDate};
use std::fmt;

/// Number of days after the end of the install month during which
/// attributed events still count towards that install.
const ATTRIBUTION_GRACE_DAYS: i64 = 5;

/// An inclusive range of days that a job run is responsible for replacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Window {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, Error> {
        if start > end {
            return Err(Error::StartDateAfterEndDate {
                start_date: start.to_string(),
                end_date: end.to_string(),
            });
        }

        Ok(Window { start, end })
    }

    /// Builds the window `[today - from_days_ago, today - to_days_ago]`.
    pub fn trailing(today: NaiveDate, from_days_ago: u32, to_days_ago: u32) -> Self {
        let a = today - Duration::days(i64::from(from_days_ago));
        let b = today - Duration::days(i64::from(to_days_ago));

        Window {
            start: a.min(b),
            end: a.max(b),
        }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {}", self.start, self.end)
    }
}

/// Parses the day part of the date and timestamp formats the providers emit:
/// `2024-01-10`, `20240110`, `2024-01-10 13:45:00`, `2024-01-10T00:00:00Z`.
pub fn parse_day(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();

    if let Some(prefix) = raw.get(..10) {
        if let Ok(day) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Some(day);
        }
    }

    NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
}

/// Lowercase three letter month name, e.g. `jan`.
pub fn month_abbrev(day: NaiveDate) -> String {
    day.format("%b").to_string().to_lowercase()
}

/// Range of event days credited to an install: from the first day of the
/// install month up to and including the last day of that month plus the
/// grace period.
pub fn attribution_window(install_day: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let month_start = install_day.with_day(1)?;
    let month_end = month_start.checked_add_months(Months::new(1))? - Duration::days(1);

    Some((month_start, month_end + Duration::days(ATTRIBUTION_GRACE_DAYS)))
}
