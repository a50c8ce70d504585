//! Time periods used for windowing and period grouping.
use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Timelike, Utc};

use crate::{
    error::{BucketError, Result},
    validation::value_is_valid_datetime_string,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Period {
    Hour,
    Day,
    Week,
    Month,
}

pub const PERIODS: [Period; 4] = [Period::Hour, Period::Day, Period::Week, Period::Month];

impl Period {
    /// The record field holding the start of the period a record's `_timestamp` falls into.
    pub fn key(&self) -> &'static str {
        match self {
            Period::Hour => "_hour_start_at",
            Period::Day => "_day_start_at",
            Period::Week => "_week_start_at",
            Period::Month => "_month_start_at",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Period::Hour => "hour",
            Period::Day => "day",
            Period::Week => "week",
            Period::Month => "month",
        }
    }

    /// Start of the period containing `ts`. Weeks start on Monday.
    pub fn start_of(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let date = ts.date_naive();
        match self {
            Period::Hour => midnight(date) + Duration::hours(ts.hour() as i64),
            Period::Day => midnight(date),
            Period::Week => {
                midnight(date) - Duration::days(date.weekday().num_days_from_monday() as i64)
            }
            Period::Month => midnight(date.with_day(1).unwrap_or(date)),
        }
    }

    pub fn shift_back(&self, anchor: DateTime<Utc>, periods: u32) -> Result<DateTime<Utc>> {
        let shifted = match self {
            Period::Hour => anchor.checked_sub_signed(Duration::hours(periods as i64)),
            Period::Day => anchor.checked_sub_signed(Duration::days(periods as i64)),
            Period::Week => anchor.checked_sub_signed(Duration::weeks(periods as i64)),
            Period::Month => anchor.checked_sub_months(Months::new(periods)),
        };
        shifted.ok_or_else(|| {
            BucketError::Validation(format!(
                "{} {}s before {} is out of range",
                periods,
                self.name(),
                anchor
            ))
        })
    }

    fn shift_forward(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Period::Hour => start.checked_add_signed(Duration::hours(1)),
            Period::Day => start.checked_add_signed(Duration::days(1)),
            Period::Week => start.checked_add_signed(Duration::weeks(1)),
            Period::Month => start.checked_add_months(Months::new(1)),
        }
    }

    /// Whether `[start, end)` covers at least one whole period.
    pub fn minimum_span_reached(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        match self.shift_forward(start) {
            Some(minimum_end) => end >= minimum_end,
            None => false,
        }
    }

    pub fn minimum_span_description(&self) -> &'static str {
        match self {
            Period::Hour => "1 hour",
            Period::Day => "1 day",
            Period::Week => "7 days",
            Period::Month => "1 month",
        }
    }
}

impl FromStr for Period {
    type Err = BucketError;

    fn from_str(s: &str) -> Result<Self> {
        PERIODS
            .iter()
            .find(|period| period.name() == s)
            .copied()
            .ok_or_else(|| {
                BucketError::Validation(
                    "Unrecognised grouping for period. Supported periods include: hour, day, week, month"
                        .to_string(),
                )
            })
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

/// Parses a datetime string in the accepted grammar into UTC.
///
/// Accepts `YYYY-MM-DDTHH:MM:SS` followed by `Z`, `+HH:MM`, `-HH:MM`, `+HHMM` or `-HHMM`.
pub fn parse_time_string(s: &str) -> Result<DateTime<Utc>> {
    if !value_is_valid_datetime_string(s) {
        return Err(BucketError::Validation(format!(
            "{s} is not a valid datetime string"
        )));
    }
    parse_grammar_checked(s)
        .ok_or_else(|| BucketError::Validation(format!("{s} is not a valid datetime string")))
}

/// Parses a string already known to match the datetime grammar. Returns `None` for strings that
/// match the grammar but name an impossible date or time.
pub(crate) fn parse_grammar_checked(s: &str) -> Option<DateTime<Utc>> {
    // Offsets without a colon are normalised so the string is RFC 3339.
    let normalised = if s.ends_with('Z') {
        s.to_string()
    } else if s.len() == 24 {
        format!("{}:{}", &s[..22], &s[22..])
    } else {
        s.to_string()
    };
    DateTime::parse_from_rfc3339(&normalised)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn parse_time_string_accepts_all_offset_forms() -> Result<()> {
        let expected = utc(2014, 1, 1, 0, 0, 0);
        assert_eq!(parse_time_string("2014-01-01T00:00:00Z")?, expected);
        assert_eq!(parse_time_string("2014-01-01T00:00:00+00:00")?, expected);
        assert_eq!(parse_time_string("2014-01-01T00:00:00-00:00")?, expected);
        assert_eq!(parse_time_string("2014-01-01T00:00:00+0000")?, expected);
        assert_eq!(
            parse_time_string("2014-01-01T01:30:00+01:30")?,
            expected
        );
        Ok(())
    }

    #[test]
    fn parse_time_string_rejects_garbage() {
        assert!(parse_time_string("hammer time").is_err());
        assert!(parse_time_string("2014-13-01T00:00:00Z").is_err());
    }

    #[test]
    fn period_starts() {
        // 2013-05-16 is a Thursday.
        let ts = utc(2013, 5, 16, 17, 33, 31);
        assert_eq!(Period::Hour.start_of(ts), utc(2013, 5, 16, 17, 0, 0));
        assert_eq!(Period::Day.start_of(ts), utc(2013, 5, 16, 0, 0, 0));
        assert_eq!(Period::Week.start_of(ts), utc(2013, 5, 13, 0, 0, 0));
        assert_eq!(Period::Month.start_of(ts), utc(2013, 5, 1, 0, 0, 0));
    }

    #[test]
    fn week_start_of_a_monday_is_itself() {
        let monday = utc(2013, 5, 13, 0, 0, 0);
        assert_eq!(Period::Week.start_of(monday), monday);
    }

    #[test]
    fn minimum_span() {
        let start = utc(2012, 1, 1, 0, 0, 0);
        assert!(!Period::Week.minimum_span_reached(start, utc(2012, 1, 5, 0, 0, 0)));
        assert!(Period::Week.minimum_span_reached(start, utc(2012, 1, 8, 0, 0, 0)));
        assert!(Period::Month.minimum_span_reached(start, utc(2012, 2, 1, 0, 0, 0)));
        assert!(!Period::Month.minimum_span_reached(start, utc(2012, 1, 31, 0, 0, 0)));
    }

    #[test]
    fn shift_back_by_periods() -> Result<()> {
        let anchor = utc(2013, 3, 31, 0, 0, 0);
        assert_eq!(Period::Week.shift_back(anchor, 2)?, utc(2013, 3, 17, 0, 0, 0));
        assert_eq!(Period::Month.shift_back(anchor, 1)?, utc(2013, 2, 28, 0, 0, 0));
        assert_eq!(Period::Hour.shift_back(anchor, 3)?, utc(2013, 3, 30, 21, 0, 0));
        Ok(())
    }

    #[test]
    fn period_from_str() {
        assert_eq!("week".parse::<Period>().ok(), Some(Period::Week));
        assert!("fortnight".parse::<Period>().is_err());
    }
}
