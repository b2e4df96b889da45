//! Lightweight cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Per field: *, */N, N, A-B, A-B/N, N/M and comma lists of those.
//! Months accept jan..dec, weekdays accept sun..sat (0 and 7 are Sunday).
//! Example: "30 9 * * mon-fri" = weekdays at 9:30
//!
//! No cron crate dependency.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike,
    Utc,
};

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// How far ahead `next_after` searches before giving up (e.g. "0 0 30 2 *").
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// Bit set of allowed values for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, v: u32) -> bool {
        v < 64 && self.0 & (1 << v) != 0
    }
}

/// A parsed 5-field cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: FieldSet,
    hours: FieldSet,
    days: FieldSet,
    months: FieldSet,
    weekdays: FieldSet,
    /// Whether day-of-month / day-of-week were left as "*".
    dom_any: bool,
    dow_any: bool,
}

impl CronSchedule {
    /// Parse a cron expression.
    pub fn parse(expression: &str) -> Result<Self, String> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(format!(
                "invalid cron expression '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            ));
        }

        let mut weekdays = parse_field(parts[4], 0, 7, Some(&DAY_NAMES[..]))?;
        // 7 is an alias for Sunday
        if weekdays.contains(7) {
            weekdays.0 |= 1;
        }

        Ok(Self {
            expression: parts.join(" "),
            minutes: parse_field(parts[0], 0, 59, None)?,
            hours: parse_field(parts[1], 0, 23, None)?,
            days: parse_field(parts[2], 1, 31, None)?,
            months: parse_field(parts[3], 1, 12, Some(&MONTH_NAMES[..]))?,
            weekdays,
            dom_any: parts[2] == "*",
            dow_any: parts[4] == "*",
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Classic cron day rule: when both day fields are restricted, either may match.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days.contains(date.day());
        let dow = self.weekdays.contains(date.weekday().num_days_from_sunday());
        match (self.dom_any, self.dow_any) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            (false, false) => dom || dow,
        }
    }

    /// Whether a wall-clock minute matches.
    pub fn matches(&self, t: NaiveDateTime) -> bool {
        self.months.contains(t.month())
            && self.day_matches(t.date())
            && self.hours.contains(t.hour())
            && self.minutes.contains(t.minute())
    }

    /// First matching minute strictly after `after`, evaluated in `offset` wall-clock time.
    pub fn next_after(&self, after: DateTime<Utc>, offset: FixedOffset) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&offset).naive_local() + Duration::minutes(1);
        let mut t = local.with_second(0)?.with_nanosecond(0)?;
        let limit = t + Duration::days(SEARCH_HORIZON_DAYS);

        while t <= limit {
            if !self.months.contains(t.month()) {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return offset
                .from_local_datetime(&t)
                .single()
                .map(|d| d.with_timezone(&Utc));
        }

        None
    }
}

/// Parse a cron expression and compute the next run time (UTC wall clock).
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match CronSchedule::parse(expression) {
        Ok(schedule) => schedule.next_after(after, Utc.fix()),
        Err(e) => {
            tracing::warn!("{e}");
            None
        }
    }
}

/// Parse a cron field into the set of matching values.
fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
) -> Result<FieldSet, String> {
    let mut set = 0u64;
    for item in field.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(format!("empty item in cron field '{field}'"));
        }

        let (range, step) = match item.split_once('/') {
            Some((r, s)) => {
                let n: u32 = s
                    .parse()
                    .map_err(|_| format!("invalid step '{s}' in cron field '{field}'"))?;
                if n == 0 {
                    return Err(format!("zero step in cron field '{field}'"));
                }
                (r, Some(n))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names, min)?, parse_value(b, names, min)?)
        } else {
            let v = parse_value(range, names, min)?;
            // "N/M" runs from N to the end of the field
            if step.is_some() { (v, max) } else { (v, v) }
        };

        if lo < min || hi > max || lo > hi {
            return Err(format!(
                "value out of range in cron field '{field}' (allowed {min}-{max})"
            ));
        }

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            set |= 1 << v;
        }
    }
    Ok(FieldSet(set))
}

fn parse_value(s: &str, names: Option<&[&str]>, min: u32) -> Result<u32, String> {
    if let Ok(n) = s.parse::<u32>() {
        return Ok(n);
    }
    let lower = s.to_ascii_lowercase();
    names
        .and_then(|names| names.iter().position(|n| *n == lower))
        .map(|i| i as u32 + min)
        .ok_or_else(|| format!("invalid cron value '{s}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_hour() {
        let next = next_run_from_cron("0 * * * *", at(2026, 2, 22, 10, 30)).unwrap();
        assert_eq!(next, at(2026, 2, 22, 11, 0));
    }

    #[test]
    fn test_specific_time() {
        let next = next_run_from_cron("0 8 * * *", at(2026, 2, 22, 7, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 22, 8, 0));
        // Strictly after: 8:00 itself rolls to the next day
        let next = next_run_from_cron("0 8 * * *", next).unwrap();
        assert_eq!(next, at(2026, 2, 23, 8, 0));
    }

    #[test]
    fn test_every_15_minutes() {
        let next = next_run_from_cron("*/15 * * * *", at(2026, 2, 22, 10, 2)).unwrap();
        assert_eq!(next.minute(), 15);
    }

    #[test]
    fn test_weekdays_by_name() {
        // 2026-02-21 is a Saturday
        let next = next_run_from_cron("30 9 * * mon-fri", at(2026, 2, 21, 12, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 23, 9, 30));
    }

    #[test]
    fn test_month_and_day_of_month() {
        let next = next_run_from_cron("0 0 1 jun *", at(2026, 2, 22, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 6, 1, 0, 0));
    }

    #[test]
    fn test_dom_or_dow_when_both_restricted() {
        // 15th of the month OR any Sunday; 2026-03-01 is a Sunday
        let next = next_run_from_cron("0 12 15 * 0", at(2026, 2, 22, 13, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 1, 12, 0));
    }

    #[test]
    fn test_sunday_alias_seven() {
        let s = CronSchedule::parse("0 0 * * 7").unwrap();
        assert!(s.weekdays.contains(0));
    }

    #[test]
    fn test_lists_and_stepped_ranges() {
        let s = CronSchedule::parse("0,20-30/5 * * * *").unwrap();
        for m in [0, 20, 25, 30] {
            assert!(s.minutes.contains(m));
        }
        assert!(!s.minutes.contains(21));
        assert!(!s.minutes.contains(35));
    }

    #[test]
    fn test_fixed_offset() {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let s = CronSchedule::parse("0 9 * * *").unwrap();
        // 09:00 at +08:00 is 01:00 UTC
        let next = s.next_after(at(2026, 2, 22, 0, 0), offset).unwrap();
        assert_eq!(next, at(2026, 2, 22, 1, 0));
    }

    #[test]
    fn test_impossible_date_returns_none() {
        assert!(next_run_from_cron("0 0 30 2 *", at(2026, 1, 1, 0, 0)).is_none());
    }

    #[test]
    fn test_invalid_expression() {
        assert!(next_run_from_cron("bad", Utc::now()).is_none());
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("0 0 * foo *").is_err());
    }
}
