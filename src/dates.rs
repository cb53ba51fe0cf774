//! Calendar-date normalization for session rows.
//!
//! Sessions are stamped in UTC; the `date` column is the user's local calendar day.

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Local calendar day of `at` for a user `utc_offset_minutes` east of UTC.
pub fn session_date(at: DateTime<Utc>, utc_offset_minutes: i32) -> NaiveDate {
    (at + Duration::minutes(i64::from(utc_offset_minutes))).date_naive()
}

/// Normalize a stored date string to a `NaiveDate`. Accepts plain `YYYY-MM-DD`
/// and legacy RFC 3339 timestamps, which are converted with the given offset.
pub fn normalize_date(value: &str, utc_offset_minutes: i32) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| session_date(dt.with_timezone(&Utc), utc_offset_minutes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn offset_moves_late_utc_evening_to_next_day() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 23, 30, 0).unwrap();
        assert_eq!(
            session_date(at, 0),
            NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
        );
        assert_eq!(
            session_date(at, 60),
            NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()
        );
        assert_eq!(
            session_date(Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap(), -300),
            NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
        );
    }

    #[test]
    fn normalizes_both_stored_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert_eq!(normalize_date("2024-01-05", 0), Some(expected));
        assert_eq!(normalize_date("2024-01-05T10:00:00Z", 0), Some(expected));
        assert_eq!(normalize_date("2024-01-04T23:30:00Z", 120), Some(expected));
        assert_eq!(normalize_date("not a date", 0), None);
    }
}
