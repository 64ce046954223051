//! Calendar windows over UTC.
//!
//! Day boundaries are UTC midnight-to-midnight everywhere: the daily booking
//! limit, the by-day listing and both week policies use the same cutoff,
//! regardless of the server's local zone.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, SecondsFormat, Utc};

use crate::engine::ValidationError;
use crate::model::{DAY_MS, Ms, Span};

/// How a week listing picks its 7-day window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeekPolicy {
    /// ISO week: Monday 00:00 UTC through the following Monday.
    Iso,
    /// Seven days starting at 00:00 UTC of the query date.
    Rolling,
}

/// The UTC day containing `t`.
pub fn day_window(t: Ms) -> Span {
    let start = t.div_euclid(DAY_MS) * DAY_MS;
    Span::new(start, start + DAY_MS)
}

pub fn date_window(date: NaiveDate) -> Span {
    let start = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    Span::new(start, start + DAY_MS)
}

pub fn week_window(date: NaiveDate, policy: WeekPolicy) -> Span {
    let day = date_window(date);
    let start = match policy {
        WeekPolicy::Iso => {
            day.start - date.weekday().num_days_from_monday() as Ms * DAY_MS
        }
        WeekPolicy::Rolling => day.start,
    };
    Span::new(start, start + 7 * DAY_MS)
}

/// The UTC calendar date of `t`, if representable.
pub fn date_of(t: Ms) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(t).map(|dt| dt.date_naive())
}

/// Accepts `YYYY-MM-DD` or a full RFC 3339 timestamp (whose UTC date is used).
pub fn parse_date(input: &str) -> Result<NaiveDate, ValidationError> {
    let input = input.trim();
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.with_timezone(&Utc).date_naive())
        .map_err(|_| ValidationError::InvalidDate(input.to_string()))
}

/// RFC 3339 timestamp with any offset, normalized to unix milliseconds.
pub fn parse_instant(input: &str) -> Result<Ms, ValidationError> {
    DateTime::parse_from_rfc3339(input.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| ValidationError::InvalidDate(input.to_string()))
}

/// RFC 3339 rendering for log lines.
pub fn format_instant(t: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(t)
        .map_or_else(|| t.to_string(), |dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HOUR_MS;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn day_window_floors_to_utc_midnight() {
        let nine = parse_instant("2025-03-12T09:00:00Z").unwrap();
        let w = day_window(nine);
        assert_eq!(w.start, parse_instant("2025-03-12T00:00:00Z").unwrap());
        assert_eq!(w.end, parse_instant("2025-03-13T00:00:00Z").unwrap());
        // Exactly midnight belongs to the day it opens.
        assert_eq!(day_window(w.start), w);
        assert_eq!(day_window(w.end - 1), w);
    }

    #[test]
    fn offset_instants_use_the_utc_day() {
        // 07:30 in Singapore is 23:30 UTC the previous day.
        let t = parse_instant("2025-03-13T07:30:00+08:00").unwrap();
        assert_eq!(date_of(t), Some(ymd(2025, 3, 12)));
        assert_eq!(day_window(t), date_window(ymd(2025, 3, 12)));
    }

    #[test]
    fn iso_week_starts_monday() {
        // 2025-03-12 is a Wednesday.
        let w = week_window(ymd(2025, 3, 12), WeekPolicy::Iso);
        assert_eq!(w.start, date_window(ymd(2025, 3, 10)).start);
        assert_eq!(w.end, date_window(ymd(2025, 3, 17)).start);

        // A Monday is its own week start.
        let monday = week_window(ymd(2025, 3, 10), WeekPolicy::Iso);
        assert_eq!(monday, w);

        // Sunday belongs to the week that started six days earlier.
        let sunday = week_window(ymd(2025, 3, 16), WeekPolicy::Iso);
        assert_eq!(sunday, w);
    }

    #[test]
    fn rolling_week_starts_on_query_date() {
        let w = week_window(ymd(2025, 3, 12), WeekPolicy::Rolling);
        assert_eq!(w.start, date_window(ymd(2025, 3, 12)).start);
        assert_eq!(w.duration_ms(), 7 * 24 * HOUR_MS);
    }

    #[test]
    fn parse_date_accepts_both_forms() {
        assert_eq!(parse_date("2025-03-12").unwrap(), ymd(2025, 3, 12));
        assert_eq!(
            parse_date("2025-03-12T18:00:00-08:00").unwrap(),
            ymd(2025, 3, 13)
        );
        assert!(matches!(
            parse_date("12/03/2025"),
            Err(ValidationError::InvalidDate(_))
        ));
        assert!(parse_instant("not a date").is_err());
    }

    #[test]
    fn format_instant_is_rfc3339() {
        let t = parse_instant("2025-03-12T09:00:00Z").unwrap();
        assert_eq!(format_instant(t), "2025-03-12T09:00:00Z");
    }
}
