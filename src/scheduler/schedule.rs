//! Five-field cron expressions and next-fire computation.
//!
//! Expressions use the familiar `minute hour day-of-month month
//! day-of-week` layout.  They are evaluated with the `cron` crate, which
//! expects a leading seconds field and numbers weekdays 1-7 from Sunday,
//! so [`CronExpr::parse`] pins seconds to `0` and rewrites numeric
//! weekdays (0-7, Sunday = 0 or 7) to their names.

use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;

const WEEKDAYS: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// A validated cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpr {
    /// Parse a 5-field expression.  Returns a human-readable reason on
    /// failure.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!("expected 5 fields, got {}", fields.len()));
        }
        let dow = normalize_weekdays(fields[4])?;
        let six = format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow);
        let schedule = cron::Schedule::from_str(&six).map_err(|e| e.to_string())?;
        Ok(Self {
            source: fields.join(" "),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Next matching instant strictly after `after`, evaluated in `tz`
    /// (the host's local zone when `None`).
    pub fn next_after(&self, after: DateTime<Utc>, tz: Option<Tz>) -> Option<DateTime<Utc>> {
        match tz {
            Some(tz) => self
                .schedule
                .after(&after.with_timezone(&tz))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            None => self
                .schedule
                .after(&after.with_timezone(&Local))
                .next()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// Rewrite numeric weekday tokens to names.  Ranges ending at 7 are
/// split so `5-7` becomes `Fri-Sat,Sun`.
fn normalize_weekdays(field: &str) -> Result<String, String> {
    let mut parts = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => (r, Some(s)),
            None => (part, None),
        };
        let suffix = step.map(|s| format!("/{s}")).unwrap_or_default();

        if range == "*" {
            parts.push(format!("*{suffix}"));
            continue;
        }

        match range.split_once('-') {
            Some((a, b)) => {
                let start = weekday_token(a)?;
                let end_num = b.parse::<usize>().ok();
                if end_num == Some(7) && step.is_none() && start != "Sun" {
                    if start == "Sat" {
                        parts.push(start);
                    } else {
                        parts.push(format!("{start}-Sat"));
                    }
                    parts.push("Sun".to_string());
                } else {
                    let end = if end_num == Some(7) { "Sat".to_string() } else { weekday_token(b)? };
                    parts.push(format!("{start}-{end}{suffix}"));
                }
            }
            None => parts.push(format!("{}{suffix}", weekday_token(range)?)),
        }
    }
    Ok(parts.join(","))
}

fn weekday_token(token: &str) -> Result<String, String> {
    if let Ok(n) = token.parse::<usize>() {
        return WEEKDAYS
            .get(n)
            .map(|s| s.to_string())
            .ok_or_else(|| format!("weekday {n} out of range 0-7"));
    }
    if token.chars().all(|c| c.is_ascii_alphabetic()) && !token.is_empty() {
        let lower = token.to_ascii_lowercase();
        return Ok(lower[..1].to_ascii_uppercase() + &lower[1..]);
    }
    Err(format!("invalid weekday '{token}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("0 0 * * * *").is_err());
        assert!(CronExpr::parse("").is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("0 9 * * 8").is_err());
        assert!(CronExpr::parse("0 9 * * mon?").is_err());
    }

    #[test]
    fn minute_and_hour_match() {
        let expr = CronExpr::parse("30 9 * * *").unwrap();
        let next = expr.next_after(utc(2026, 3, 2, 10, 0), Some(chrono_tz::UTC)).unwrap();
        assert_eq!(next, utc(2026, 3, 3, 9, 30));
    }

    #[test]
    fn weekday_field_is_evaluated() {
        // 2026-03-06 is a Friday; Monday-only must skip the weekend.
        let expr = CronExpr::parse("0 9 * * 1").unwrap();
        let next = expr.next_after(utc(2026, 3, 6, 12, 0), Some(chrono_tz::UTC)).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next, utc(2026, 3, 9, 9, 0));
    }

    #[test]
    fn sunday_as_zero_and_seven() {
        let zero = CronExpr::parse("0 8 * * 0").unwrap();
        let seven = CronExpr::parse("0 8 * * 7").unwrap();
        let from = utc(2026, 3, 2, 0, 0);
        let a = zero.next_after(from, Some(chrono_tz::UTC)).unwrap();
        let b = seven.next_after(from, Some(chrono_tz::UTC)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.weekday(), Weekday::Sun);
    }

    #[test]
    fn weekend_range_through_seven() {
        let expr = CronExpr::parse("0 10 * * 6-7").unwrap();
        // Friday noon: next is Saturday, then Sunday.
        let sat = expr.next_after(utc(2026, 3, 6, 12, 0), Some(chrono_tz::UTC)).unwrap();
        assert_eq!(sat.weekday(), Weekday::Sat);
        let sun = expr.next_after(sat, Some(chrono_tz::UTC)).unwrap();
        assert_eq!(sun.weekday(), Weekday::Sun);
    }

    #[test]
    fn day_of_month_and_month_are_evaluated() {
        let expr = CronExpr::parse("0 0 1 Jan *").unwrap();
        let next = expr.next_after(utc(2026, 3, 2, 0, 0), Some(chrono_tz::UTC)).unwrap();
        assert_eq!(next, utc(2027, 1, 1, 0, 0));
    }

    #[test]
    fn steps_are_supported() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        let next = expr.next_after(utc(2026, 3, 2, 10, 1), Some(chrono_tz::UTC)).unwrap();
        assert_eq!(next.minute(), 15);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn timezone_shifts_the_match() {
        let expr = CronExpr::parse("0 9 * * *").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        let next = expr.next_after(utc(2026, 7, 1, 0, 0), Some(tz)).unwrap();
        // 09:00 EDT is 13:00 UTC.
        assert_eq!(next, utc(2026, 7, 1, 13, 0));
    }

    #[test]
    fn source_is_normalized_whitespace() {
        let expr = CronExpr::parse("  0   9 * *   1-5 ").unwrap();
        assert_eq!(expr.as_str(), "0 9 * * 1-5");
    }
}
