use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};

use super::EngineError;

/// Anything that falls on a calendar day.
pub trait CalendarDay {
    fn calendar_day(&self) -> NaiveDate;
}

impl CalendarDay for NaiveDate {
    fn calendar_day(&self) -> NaiveDate {
        *self
    }
}

impl CalendarDay for NaiveDateTime {
    fn calendar_day(&self) -> NaiveDate {
        self.date()
    }
}

/// Local calendar day in the timestamp's own offset.
impl<Tz: TimeZone> CalendarDay for DateTime<Tz> {
    fn calendar_day(&self) -> NaiveDate {
        self.date_naive()
    }
}

/// A set of blocked calendar dates.
pub trait BlockedDates {
    fn contains_day(&self, day: &NaiveDate) -> bool;
}

impl BlockedDates for HashSet<NaiveDate> {
    fn contains_day(&self, day: &NaiveDate) -> bool {
        self.contains(day)
    }
}

impl BlockedDates for BTreeSet<NaiveDate> {
    fn contains_day(&self, day: &NaiveDate) -> bool {
        self.contains(day)
    }
}

impl<V> BlockedDates for BTreeMap<NaiveDate, V> {
    fn contains_day(&self, day: &NaiveDate) -> bool {
        self.contains_key(day)
    }
}

/// Exact calendar-date membership. The time of day is ignored.
pub fn is_blocked(day: &impl CalendarDay, blocked: &impl BlockedDates) -> bool {
    blocked.contains_day(&day.calendar_day())
}

/// Every calendar day from `from` to `to`, inclusive.
pub fn expand_range(from: NaiveDate, to: NaiveDate) -> Result<Vec<NaiveDate>, EngineError> {
    if from > to {
        return Err(EngineError::InvalidRange { from, to });
    }
    let days = (to - from).num_days() + 1;
    if days > crate::limits::MAX_BLOCK_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("date range too long"));
    }
    Ok(from.iter_days().take(days as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveTime};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn expand_three_days() {
        let days = expand_range(d(2024, 5, 1), d(2024, 5, 3)).unwrap();
        assert_eq!(days, vec![d(2024, 5, 1), d(2024, 5, 2), d(2024, 5, 3)]);
    }

    #[test]
    fn expand_single_day() {
        let days = expand_range(d(2024, 5, 1), d(2024, 5, 1)).unwrap();
        assert_eq!(days, vec![d(2024, 5, 1)]);
    }

    #[test]
    fn expand_reversed_fails() {
        let err = expand_range(d(2024, 5, 3), d(2024, 5, 1)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRange { .. }));
    }

    #[test]
    fn expand_crosses_month_and_leap_day() {
        let days = expand_range(d(2024, 2, 28), d(2024, 3, 1)).unwrap();
        assert_eq!(days, vec![d(2024, 2, 28), d(2024, 2, 29), d(2024, 3, 1)]);
    }

    #[test]
    fn expand_caps_length() {
        assert!(expand_range(d(2024, 1, 1), d(2024, 12, 31)).is_ok()); // 366 days
        assert!(matches!(
            expand_range(d(2024, 1, 1), d(2025, 1, 1)),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn blocked_ignores_time_of_day() {
        let blocked: HashSet<NaiveDate> = [d(2024, 5, 1)].into();
        let late = d(2024, 5, 1).and_time(NaiveTime::from_hms_opt(23, 59, 0).unwrap());
        assert!(is_blocked(&late, &blocked));
        assert!(is_blocked(&d(2024, 5, 1), &blocked));
        let next = d(2024, 5, 2).and_time(NaiveTime::MIN);
        assert!(!is_blocked(&next, &blocked));
    }

    #[test]
    fn blocked_uses_local_date_of_zoned_timestamp() {
        let blocked: BTreeSet<NaiveDate> = [d(2024, 5, 1)].into();
        let msk = FixedOffset::east_opt(3 * 3600).unwrap();
        // 2024-05-01 01:30 in UTC+3 is still April 30th in UTC.
        let ts = msk.with_ymd_and_hms(2024, 5, 1, 1, 30, 0).unwrap();
        assert!(is_blocked(&ts, &blocked));
        assert!(!is_blocked(&ts.naive_utc(), &blocked));
    }

    #[test]
    fn blocked_works_with_reason_map() {
        let mut blocked: BTreeMap<NaiveDate, Option<String>> = BTreeMap::new();
        blocked.insert(d(2024, 12, 31), Some("holiday".into()));
        assert!(is_blocked(&d(2024, 12, 31), &blocked));
        assert!(!is_blocked(&d(2024, 12, 30), &blocked));
    }
}
