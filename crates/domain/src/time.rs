//! Wall-clock reads, IANA timezone rendering, and the two human time input
//! formats: absolute/relative deliver-at expressions and duration strings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, Months, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};

/// Milliseconds since the Unix epoch (UTC).
pub type TimestampMs = u64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> TimestampMs {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Parse an IANA timezone name, falling back to UTC.
pub fn parse_tz(tz: &str) -> Tz {
    tz.parse::<Tz>().unwrap_or(chrono_tz::UTC)
}

/// Validate an IANA timezone name.
pub fn validate_tz(tz: &str) -> Result<Tz> {
    tz.parse::<Tz>()
        .map_err(|_| Error::Validation(format!("unknown timezone '{tz}'")))
}

fn to_utc(ms: TimestampMs) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Render an epoch-ms timestamp as local ISO-8601 with offset, e.g.
/// `2026-01-27T16:30:00+08:00`.
pub fn to_local_iso(ms: TimestampMs, tz: Tz) -> String {
    to_utc(ms)
        .with_timezone(&tz)
        .format("%Y-%m-%dT%H:%M:%S%:z")
        .to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deliver-at expressions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse a deliver-at input: either absolute ISO-8601 with an offset or `Z`
/// (`2026-01-27T16:30:00+08:00`), or a signed relative expression applied to
/// `now` unit-by-unit (`+2s`, `-1h30m`, `+1M2D`). Units: `Y M D h m s`.
pub fn parse_deliver_at(input: &str, now: TimestampMs) -> Result<TimestampMs> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::Validation("empty deliver-at expression".into()));
    }

    if let Some(rest) = input.strip_prefix('+') {
        return apply_relative(rest, now, true);
    }
    // A leading '-' could also start a (nonsensical) ISO date; relative
    // expressions always have a digit right after the sign and no '-'
    // separators, so `-1h` parses relative while `-2026-...` falls through.
    if let Some(rest) = input.strip_prefix('-') {
        if rest.chars().next().is_some_and(|c| c.is_ascii_digit()) && !rest.contains('-') {
            return apply_relative(rest, now, false);
        }
    }

    let dt = DateTime::parse_from_rfc3339(input)
        .map_err(|e| Error::Validation(format!("bad deliver-at '{input}': {e}")))?;
    let ms = dt.with_timezone(&Utc).timestamp_millis();
    if ms < 0 {
        return Err(Error::Validation(format!("deliver-at '{input}' is before the epoch")));
    }
    Ok(ms as u64)
}

/// Apply `<n><unit>...` to `now`, adding or subtracting each unit in turn.
/// Calendar units (Y/M/D) shift calendar fields; clock units (h/m/s) shift by
/// exact duration.
fn apply_relative(expr: &str, now: TimestampMs, add: bool) -> Result<TimestampMs> {
    let mut dt = to_utc(now);
    let mut chars = expr.chars().peekable();
    let mut saw_component = false;

    while chars.peek().is_some() {
        let mut n: u64 = 0;
        let mut saw_digit = false;
        while let Some(c) = chars.peek().copied() {
            if let Some(d) = c.to_digit(10) {
                n = n
                    .checked_mul(10)
                    .and_then(|v| v.checked_add(d as u64))
                    .ok_or_else(|| Error::Validation(format!("relative amount overflow in '{expr}'")))?;
                saw_digit = true;
                chars.next();
            } else {
                break;
            }
        }
        let unit = chars
            .next()
            .ok_or_else(|| Error::Validation(format!("trailing number without unit in '{expr}'")))?;
        if !saw_digit {
            return Err(Error::Validation(format!("unit '{unit}' without amount in '{expr}'")));
        }

        dt = match unit {
            'Y' => shift_months(dt, n.saturating_mul(12), add)?,
            'M' => shift_months(dt, n, add)?,
            'D' => {
                let days = Days::new(n);
                let shifted = if add {
                    dt.checked_add_days(days)
                } else {
                    dt.checked_sub_days(days)
                };
                shifted.ok_or_else(|| Error::Validation(format!("date out of range in '{expr}'")))?
            }
            'h' | 'm' | 's' => {
                let secs = match unit {
                    'h' => n.saturating_mul(3600),
                    'm' => n.saturating_mul(60),
                    _ => n,
                };
                let delta = chrono::Duration::seconds(secs as i64);
                if add { dt + delta } else { dt - delta }
            }
            other => {
                return Err(Error::Validation(format!(
                    "unknown unit '{other}' in '{expr}' (expected Y M D h m s)"
                )))
            }
        };
        saw_component = true;
    }

    if !saw_component {
        return Err(Error::Validation(format!("empty relative expression '{expr}'")));
    }
    let ms = dt.timestamp_millis();
    if ms < 0 {
        return Err(Error::Validation(format!("'{expr}' lands before the epoch")));
    }
    Ok(ms as u64)
}

fn shift_months(dt: DateTime<Utc>, months: u64, add: bool) -> Result<DateTime<Utc>> {
    let months = u32::try_from(months)
        .map_err(|_| Error::Validation("month amount out of range".into()))?;
    let shifted = if add {
        dt.checked_add_months(Months::new(months))
    } else {
        dt.checked_sub_months(Months::new(months))
    };
    shifted.ok_or_else(|| Error::Validation("date out of range".into()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Duration strings (session policy idle timeout)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse a duration like `1h30m`, `2d`, `45s` (units `d h m s`) into
/// milliseconds.
pub fn parse_duration_ms(input: &str) -> Result<u64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::Validation("empty duration".into()));
    }
    let mut total: u64 = 0;
    let mut chars = input.chars().peekable();
    while chars.peek().is_some() {
        let mut n: u64 = 0;
        let mut saw_digit = false;
        while let Some(c) = chars.peek().copied() {
            if let Some(d) = c.to_digit(10) {
                n = n
                    .checked_mul(10)
                    .and_then(|v| v.checked_add(d as u64))
                    .ok_or_else(|| Error::Validation(format!("duration overflow in '{input}'")))?;
                saw_digit = true;
                chars.next();
            } else {
                break;
            }
        }
        let unit = chars
            .next()
            .ok_or_else(|| Error::Validation(format!("trailing number without unit in '{input}'")))?;
        if !saw_digit {
            return Err(Error::Validation(format!("unit '{unit}' without amount in '{input}'")));
        }
        let secs = match unit {
            'd' => n.saturating_mul(86_400),
            'h' => n.saturating_mul(3_600),
            'm' => n.saturating_mul(60),
            's' => n,
            other => {
                return Err(Error::Validation(format!(
                    "unknown duration unit '{other}' in '{input}' (expected d h m s)"
                )))
            }
        };
        total = total.saturating_add(secs.saturating_mul(1000));
    }
    Ok(total)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Local clock times (session policy daily reset)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A local wall-clock time of day (`HH:MM`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTime {
    pub hour: u8,
    pub minute: u8,
}

impl ClockTime {
    /// Most recent occurrence of this local clock time at or before `now`,
    /// in `tz`, as epoch milliseconds. Local times erased by a DST gap
    /// resolve to the earliest valid mapping after the gap.
    pub fn last_occurrence(&self, now: TimestampMs, tz: Tz) -> TimestampMs {
        let local_now = to_utc(now).with_timezone(&tz);
        let mut date = local_now.date_naive();
        let today_candidate = local_now.time().hour() > u32::from(self.hour)
            || (local_now.time().hour() == u32::from(self.hour)
                && local_now.time().minute() >= u32::from(self.minute));
        if !today_candidate {
            date = date.pred_opt().unwrap_or(date);
        }
        // Walk back (at most a couple of days) until the local datetime maps
        // onto the timeline.
        for _ in 0..3 {
            if let Some(naive) = date.and_hms_opt(u32::from(self.hour), u32::from(self.minute), 0) {
                match tz.from_local_datetime(&naive) {
                    chrono::LocalResult::Single(dt) => return dt.timestamp_millis().max(0) as u64,
                    chrono::LocalResult::Ambiguous(earliest, _) => {
                        return earliest.timestamp_millis().max(0) as u64
                    }
                    chrono::LocalResult::None => {
                        date = date.pred_opt().unwrap_or(date);
                    }
                }
            }
        }
        now
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for ClockTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| Error::Validation(format!("bad clock time '{s}' (expected HH:MM)")))?;
        let hour: u8 = h
            .parse()
            .map_err(|_| Error::Validation(format!("bad hour in '{s}'")))?;
        let minute: u8 = m
            .parse()
            .map_err(|_| Error::Validation(format!("bad minute in '{s}'")))?;
        if hour > 23 || minute > 59 {
            return Err(Error::Validation(format!("clock time '{s}' out of range")));
        }
        Ok(ClockTime { hour, minute })
    }
}

impl serde::Serialize for ClockTime {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
        ser.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ClockTime {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    const T0: TimestampMs = 1_750_000_000_000; // 2025-06-15T15:06:40Z

    #[test]
    fn absolute_deliver_at_with_offset() {
        let ms = parse_deliver_at("2026-01-27T16:30:00+08:00", T0).unwrap();
        assert_eq!(ms, 1_769_502_600_000);
    }

    #[test]
    fn absolute_deliver_at_zulu() {
        let ms = parse_deliver_at("2026-01-27T08:30:00Z", T0).unwrap();
        assert_eq!(ms, 1_769_502_600_000);
    }

    #[test]
    fn relative_seconds() {
        assert_eq!(parse_deliver_at("+2s", T0).unwrap(), T0 + 2_000);
    }

    #[test]
    fn relative_mixed_units() {
        assert_eq!(
            parse_deliver_at("+1h30m", T0).unwrap(),
            T0 + 90 * 60 * 1000
        );
    }

    #[test]
    fn relative_negative() {
        assert_eq!(parse_deliver_at("-10m", T0).unwrap(), T0 - 600_000);
    }

    #[test]
    fn relative_calendar_units() {
        // +1M from June 15 lands on July 15 (same wall clock).
        let ms = parse_deliver_at("+1M", T0).unwrap();
        let dt = Utc.timestamp_millis_opt(ms as i64).unwrap();
        assert_eq!((dt.month(), dt.day()), (7, 15));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_deliver_at("tomorrow", T0).is_err());
        assert!(parse_deliver_at("+5x", T0).is_err());
        assert!(parse_deliver_at("+", T0).is_err());
        assert!(parse_deliver_at("", T0).is_err());
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration_ms("1h30m").unwrap(), 5_400_000);
        assert_eq!(parse_duration_ms("2s").unwrap(), 2_000);
        assert_eq!(parse_duration_ms("1d").unwrap(), 86_400_000);
        assert!(parse_duration_ms("90x").is_err());
        assert!(parse_duration_ms("").is_err());
    }

    #[test]
    fn clock_time_parse_and_display() {
        let ct: ClockTime = "04:30".parse().unwrap();
        assert_eq!(ct, ClockTime { hour: 4, minute: 30 });
        assert_eq!(ct.to_string(), "04:30");
        assert!("24:00".parse::<ClockTime>().is_err());
        assert!("0430".parse::<ClockTime>().is_err());
    }

    #[test]
    fn clock_time_last_occurrence_today_and_yesterday() {
        // T0 is 15:06:40 UTC.
        let ct: ClockTime = "09:00".parse().unwrap();
        let last = ct.last_occurrence(T0, chrono_tz::UTC);
        let dt = Utc.timestamp_millis_opt(last as i64).unwrap();
        assert_eq!((dt.day(), dt.hour()), (15, 9));

        let ct: ClockTime = "20:00".parse().unwrap();
        let last = ct.last_occurrence(T0, chrono_tz::UTC);
        let dt = Utc.timestamp_millis_opt(last as i64).unwrap();
        assert_eq!((dt.day(), dt.hour()), (14, 20));
    }

    #[test]
    fn local_iso_rendering() {
        let s = to_local_iso(1_769_502_600_000, parse_tz("Asia/Singapore"));
        assert_eq!(s, "2026-01-27T16:30:00+08:00");
    }
}
