//! Timezone-aware cron evaluator.
//!
//! Accepts 5-field (`m h dom mon dow`), 6-field (`s m h dom mon dow`), and
//! the `@hourly`/`@daily`/`@weekly`/`@monthly`/`@yearly` aliases. Day-of-month
//! and day-of-week follow the classic rule: when both are restricted, a date
//! matches if either does.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use hb_domain::{Error, Result};

/// A parsed cron expression, canonically six fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    /// Whether dom/dow were both restricted (triggers the either-matches rule).
    dom_restricted: bool,
    dow_restricted: bool,
}

/// Allowed values for one field, as a bitmask (max value 60).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    mask: u64,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.mask & (1 << value) != 0
    }
}

fn parse_field(field: &str, min: u32, max: u32, label: &str) -> Result<(FieldSet, bool)> {
    let mut mask: u64 = 0;
    // A bare `*` leaves the field unrestricted, which feeds the
    // day-of-month/day-of-week either-matches rule.
    let restricted = field != "*";
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| Error::Validation(format!("bad step '{s}' in {label}")))?;
                if step == 0 {
                    return Err(Error::Validation(format!("zero step in {label}")));
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo: u32 = a
                .parse()
                .map_err(|_| Error::Validation(format!("bad range start '{a}' in {label}")))?;
            let hi: u32 = b
                .parse()
                .map_err(|_| Error::Validation(format!("bad range end '{b}' in {label}")))?;
            (lo, hi)
        } else {
            let v: u32 = range
                .parse()
                .map_err(|_| Error::Validation(format!("bad value '{range}' in {label}")))?;
            (v, v)
        };
        if lo < min || hi > max || lo > hi {
            return Err(Error::Validation(format!(
                "{label} value out of range {min}..={max}: '{part}'"
            )));
        }
        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }
    if mask == 0 {
        return Err(Error::Validation(format!("empty {label} field")));
    }
    Ok((FieldSet { mask }, restricted))
}

fn alias_to_fields(alias: &str) -> Option<&'static str> {
    match alias {
        "@hourly" => Some("0 0 * * * *"),
        "@daily" => Some("0 0 0 * * *"),
        "@weekly" => Some("0 0 0 * * 0"),
        "@monthly" => Some("0 0 0 1 * *"),
        "@yearly" => Some("0 0 0 1 1 *"),
        _ => None,
    }
}

impl CronExpr {
    /// Parse an expression. 5-field forms get an implicit `0` seconds field.
    pub fn parse(expr: &str) -> Result<CronExpr> {
        let expr = expr.trim();
        let canonical = match alias_to_fields(expr) {
            Some(fields) => fields.to_string(),
            None if expr.starts_with('@') => {
                return Err(Error::Validation(format!("unknown cron alias '{expr}'")))
            }
            None => {
                let fields: Vec<&str> = expr.split_whitespace().collect();
                match fields.len() {
                    5 => format!("0 {expr}"),
                    6 => expr.to_string(),
                    n => {
                        return Err(Error::Validation(format!(
                            "cron expression must have 5 or 6 fields, got {n}"
                        )))
                    }
                }
            }
        };

        let fields: Vec<&str> = canonical.split_whitespace().collect();
        let (seconds, _) = parse_field(fields[0], 0, 59, "seconds")?;
        let (minutes, _) = parse_field(fields[1], 0, 59, "minutes")?;
        let (hours, _) = parse_field(fields[2], 0, 23, "hours")?;
        let (days_of_month, dom_restricted) = parse_field(fields[3], 1, 31, "day-of-month")?;
        let (months, _) = parse_field(fields[4], 1, 12, "month")?;
        // Day-of-week accepts 0-7 with 7 = Sunday = 0.
        let (mut days_of_week, dow_restricted) = parse_field(fields[5], 0, 7, "day-of-week")?;
        if days_of_week.contains(7) {
            days_of_week.mask |= 1;
            days_of_week.mask &= !(1 << 7);
        }

        Ok(CronExpr {
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted,
            dow_restricted,
        })
    }

    fn day_matches(&self, dt: &NaiveDateTime) -> bool {
        let dom = self.days_of_month.contains(dt.day());
        let dow = self
            .days_of_week
            .contains(dt.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            // Both restricted: either may match (classic cron rule).
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }

    fn matches_local(&self, dt: &NaiveDateTime) -> bool {
        self.seconds.contains(dt.second())
            && self.minutes.contains(dt.minute())
            && self.hours.contains(dt.hour())
            && self.months.contains(dt.month())
            && self.day_matches(dt)
    }

    /// Next occurrence strictly after `after`, evaluated in `tz`, as UTC.
    ///
    /// DST handling: local times erased by a spring-forward gap are skipped;
    /// fall-back overlaps resolve to the earliest (pre-transition) mapping.
    pub fn next_occurrence(&self, after: &DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        // Advance to the next whole second, then scan minute by minute,
        // checking matching seconds inside each candidate minute.
        let local_after = after.with_timezone(&tz).naive_local();
        let start = local_after + chrono::Duration::seconds(1);

        let max_minutes = 366 * 24 * 60; // one year
        let mut minute_start = start
            .with_second(0)
            .unwrap_or(start);
        let mut first_second = start.second();

        for _ in 0..max_minutes {
            if self.minutes.contains(minute_start.minute())
                && self.hours.contains(minute_start.hour())
                && self.months.contains(minute_start.month())
                && self.day_matches(&minute_start)
            {
                for sec in first_second..60 {
                    if !self.seconds.contains(sec) {
                        continue;
                    }
                    let candidate = minute_start + chrono::Duration::seconds(i64::from(sec));
                    debug_assert!(self.matches_local(&candidate));
                    match tz.from_local_datetime(&candidate) {
                        chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                        chrono::LocalResult::Ambiguous(earliest, _) => {
                            return Some(earliest.with_timezone(&Utc))
                        }
                        chrono::LocalResult::None => {
                            // DST gap: this local time does not exist.
                        }
                    }
                }
            }
            minute_start += chrono::Duration::minutes(1);
            first_second = 0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn five_field_gets_zero_seconds() {
        let expr = CronExpr::parse("*/5 * * * *").unwrap();
        let next = expr
            .next_occurrence(&utc(2024, 6, 15, 10, 2, 30), chrono_tz::UTC)
            .unwrap();
        assert_eq!((next.minute(), next.second()), (5, 0));
    }

    #[test]
    fn six_field_seconds_granularity() {
        let expr = CronExpr::parse("30 * * * * *").unwrap();
        let next = expr
            .next_occurrence(&utc(2024, 6, 15, 10, 0, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!((next.minute(), next.second()), (0, 30));
        // Strictly after: from exactly :30 the next hit is the next minute.
        let next2 = expr.next_occurrence(&next, chrono_tz::UTC).unwrap();
        assert_eq!((next2.minute(), next2.second()), (1, 30));
    }

    #[test]
    fn aliases_expand() {
        let cases: [(&str, fn(&DateTime<Utc>) -> bool); 5] = [
            ("@hourly", |d| d.minute() == 0 && d.second() == 0),
            ("@daily", |d| d.hour() == 0 && d.minute() == 0),
            ("@weekly", |d| d.weekday().num_days_from_sunday() == 0),
            ("@monthly", |d| d.day() == 1),
            ("@yearly", |d| d.month() == 1 && d.day() == 1),
        ];
        for (alias, check) in cases {
            let expr = CronExpr::parse(alias).unwrap();
            let next = expr
                .next_occurrence(&utc(2024, 6, 15, 10, 20, 30), chrono_tz::UTC)
                .unwrap();
            assert!(check(&next), "{alias} produced {next}");
        }
        assert!(CronExpr::parse("@fortnightly").is_err());
    }

    #[test]
    fn ranges_lists_and_steps() {
        let expr = CronExpr::parse("0 9-17 * * 1-5").unwrap();
        // Saturday 2024-06-15 -> Monday 09:00.
        let next = expr
            .next_occurrence(&utc(2024, 6, 15, 10, 0, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!((next.day(), next.hour()), (17, 9));

        let expr = CronExpr::parse("0,15,30,45 * * * *").unwrap();
        let next = expr
            .next_occurrence(&utc(2024, 6, 15, 10, 16, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn sunday_is_zero_and_seven() {
        let zero = CronExpr::parse("0 12 * * 0").unwrap();
        let seven = CronExpr::parse("0 12 * * 7").unwrap();
        let after = utc(2024, 6, 14, 0, 0, 0); // Friday
        assert_eq!(
            zero.next_occurrence(&after, chrono_tz::UTC),
            seven.next_occurrence(&after, chrono_tz::UTC)
        );
    }

    #[test]
    fn dom_dow_both_restricted_is_union() {
        // "the 13th or any Friday"
        let expr = CronExpr::parse("0 0 13 * 5").unwrap();
        // 2024-06-10 is a Monday; first hit is Thursday the 13th.
        let next = expr
            .next_occurrence(&utc(2024, 6, 10, 0, 0, 0), chrono_tz::UTC)
            .unwrap();
        assert_eq!(next.day(), 13);
        // From the 13th, next hit is Friday the 14th.
        let next2 = expr.next_occurrence(&next, chrono_tz::UTC).unwrap();
        assert_eq!(next2.day(), 14);
    }

    #[test]
    fn timezone_evaluation() {
        let expr = CronExpr::parse("0 9 * * *").unwrap();
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        let next = expr
            .next_occurrence(&utc(2024, 6, 15, 12, 0, 0), tz)
            .unwrap();
        assert_eq!(next.hour(), 0); // 9 JST = 0 UTC
    }

    #[test]
    fn spring_forward_gap_skipped() {
        // US/Eastern 2024-03-10: 02:30 local does not exist.
        let expr = CronExpr::parse("30 2 * * *").unwrap();
        let tz: Tz = "US/Eastern".parse().unwrap();
        let next = expr
            .next_occurrence(&utc(2024, 3, 10, 6, 0, 0), tz)
            .unwrap();
        assert_eq!((next.day(), next.hour(), next.minute()), (11, 6, 30));
    }

    #[test]
    fn fall_back_takes_earliest_mapping() {
        // US/Eastern 2024-11-03: 01:30 local occurs twice; EDT first.
        let expr = CronExpr::parse("30 1 * * *").unwrap();
        let tz: Tz = "US/Eastern".parse().unwrap();
        let next = expr
            .next_occurrence(&utc(2024, 11, 3, 4, 0, 0), tz)
            .unwrap();
        assert_eq!((next.hour(), next.minute()), (5, 30)); // 01:30 EDT = 05:30 UTC
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "* * * *",
            "* * * * * * *",
            "61 * * * *",
            "* 25 * * *",
            "*/0 * * * *",
            "a b c d e",
            "@nope",
        ] {
            assert!(CronExpr::parse(bad).is_err(), "{bad} should fail");
        }
    }
}
