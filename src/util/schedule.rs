//! Cron-like schedule expressions.
//!
//! Accepts the classic five fields (`minute hour day-of-month month day-of-week`),
//! an optional leading seconds field, and the `@hourly`, `@daily`, `@weekly` and
//! `@monthly` shorthands. Every field understands `*`, numbers, ranges (`1-5`),
//! steps (`*/15`, `0-30/10`) and comma separated lists thereof.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Local, NaiveDateTime, TimeZone, Timelike};
use derive_more::{Display, Error};

/// Schedule expression could not be parsed.
#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[display("schedule expression is empty")]
    Empty,
    #[display("schedule expression must have 5 or 6 fields, found {_0}")]
    FieldCount(#[error(ignore)] usize),
    #[display("invalid {field} field '{value}'")]
    InvalidField {
        field: &'static str,
        value: String,
    },
    #[display("no upcoming run for schedule '{_0}'")]
    NoUpcomingRun(#[error(ignore)] String),
}

/// Set of allowed values of a single field, as a bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    mask: u64,
    restricted: bool,
}

impl Field {
    fn contains(self, value: u32) -> bool {
        self.mask & (1 << value) != 0
    }

    fn parse(raw: &str, name: &'static str, min: u32, max: u32) -> Result<Self, ScheduleError> {
        let invalid = || ScheduleError::InvalidField {
            field: name,
            value: raw.to_string(),
        };
        let number = |s: &str| -> Result<u32, ScheduleError> {
            let n: u32 = s.parse().map_err(|_| invalid())?;
            if n < min || n > max {
                return Err(invalid());
            }
            Ok(n)
        };

        let mut mask = 0u64;
        for part in raw.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid())?;
                    if step == 0 {
                        return Err(invalid());
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else if let Some((start, end)) = range.split_once('-') {
                (number(start)?, number(end)?)
            } else {
                let value = number(range)?;
                // `5/10` means every 10 starting at 5
                if part.contains('/') {
                    (value, max)
                } else {
                    (value, value)
                }
            };
            if start > end {
                return Err(invalid());
            }

            for value in (start..=end).step_by(step as usize) {
                mask |= 1 << value;
            }
        }

        Ok(Self {
            mask,
            restricted: raw != "*",
        })
    }
}

/// A parsed schedule expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    seconds: Option<Field>,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
    raw: String,
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let expanded = match trimmed {
            "" => return Err(ScheduleError::Empty),
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            other => other,
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        let (seconds, fields) = match parts.len() {
            5 => (None, &parts[..]),
            6 => (Some(Field::parse(parts[0], "seconds", 0, 59)?), &parts[1..]),
            n => return Err(ScheduleError::FieldCount(n)),
        };

        let mut day_of_week = Field::parse(fields[4], "day-of-week", 0, 7)?;
        // 7 is an alias for sunday
        if day_of_week.contains(7) {
            day_of_week.mask |= 1;
        }

        Ok(Self {
            seconds,
            minute: Field::parse(fields[0], "minute", 0, 59)?,
            hour: Field::parse(fields[1], "hour", 0, 23)?,
            day_of_month: Field::parse(fields[2], "day-of-month", 1, 31)?,
            month: Field::parse(fields[3], "month", 1, 12)?,
            day_of_week,
            raw: trimmed.to_string(),
        })
    }
}

impl Schedule {
    /// The expression this schedule was parsed from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn matches_minute(&self, candidate: &NaiveDateTime) -> bool {
        if !self.minute.contains(candidate.minute())
            || !self.hour.contains(candidate.hour())
            || !self.month.contains(candidate.month())
        {
            return false;
        }

        let dom = self.day_of_month.contains(candidate.day());
        let dow = self
            .day_of_week
            .contains(candidate.weekday().num_days_from_sunday());

        match (self.day_of_month.restricted, self.day_of_week.restricted) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }

    /// First instant strictly after `now` matching the schedule.
    ///
    /// Local times skipped by a DST transition are not considered.
    pub fn next_after(&self, now: DateTime<Local>) -> Result<DateTime<Local>, ScheduleError> {
        let start = now
            .naive_local()
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .ok_or_else(|| ScheduleError::NoUpcomingRun(self.raw.clone()))?;

        // four years cover every valid day-of-month/month combination incl. Feb 29
        let max_minutes = 4 * 366 * 24 * 60;
        let mut candidate = start;
        for _ in 0..=max_minutes {
            if self.matches_minute(&candidate) {
                let seconds = match self.seconds {
                    Some(field) => (0..60).filter(|s| field.contains(*s)).collect(),
                    None => vec![0],
                };
                for second in seconds {
                    let Some(naive) = candidate.with_second(second) else {
                        continue;
                    };
                    let Some(local) = Local.from_local_datetime(&naive).earliest() else {
                        continue;
                    };
                    if local > now {
                        return Ok(local);
                    }
                }
            }
            candidate += Duration::minutes(1);
        }

        Err(ScheduleError::NoUpcomingRun(self.raw.clone()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, m, d, h, min, s)
            .earliest()
            .unwrap()
    }

    #[test]
    fn every_minute() {
        let schedule: Schedule = "* * * * *".parse().unwrap();
        let now = at(2024, 3, 5, 10, 15, 30);
        assert_eq!(schedule.next_after(now).unwrap(), at(2024, 3, 5, 10, 16, 0));
        let now = at(2024, 3, 5, 10, 16, 0);
        assert_eq!(schedule.next_after(now).unwrap(), at(2024, 3, 5, 10, 17, 0));
    }

    #[test]
    fn daily_at_two() {
        let schedule: Schedule = "0 2 * * *".parse().unwrap();
        let now = at(2024, 3, 5, 10, 15, 0);
        assert_eq!(schedule.next_after(now).unwrap(), at(2024, 3, 6, 2, 0, 0));
    }

    #[test]
    fn steps_ranges_and_lists() {
        let schedule: Schedule = "*/15 9-17 * * 1-5".parse().unwrap();
        // saturday
        let now = at(2024, 3, 9, 12, 0, 0);
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!((next.hour(), next.minute()), (9, 0));

        let schedule: Schedule = "5,35 * * * *".parse().unwrap();
        let now = at(2024, 3, 5, 10, 6, 0);
        assert_eq!(schedule.next_after(now).unwrap(), at(2024, 3, 5, 10, 35, 0));
    }

    #[test]
    fn seconds_field() {
        let schedule: Schedule = "*/20 * * * * *".parse().unwrap();
        let now = at(2024, 3, 5, 10, 15, 21);
        assert_eq!(schedule.next_after(now).unwrap(), at(2024, 3, 5, 10, 15, 40));
    }

    #[test]
    fn sunday_alias_and_macros() {
        let seven: Schedule = "0 3 * * 7".parse().unwrap();
        let weekly: Schedule = "@weekly".parse().unwrap();
        let now = at(2024, 3, 5, 10, 0, 0);
        assert_eq!(seven.next_after(now).unwrap().weekday(), Weekday::Sun);
        assert_eq!(weekly.next_after(now).unwrap(), at(2024, 3, 10, 0, 0, 0));
    }

    #[test]
    fn leap_day() {
        let schedule: Schedule = "0 0 29 2 *".parse().unwrap();
        let now = at(2024, 3, 1, 0, 0, 0);
        assert_eq!(schedule.next_after(now).unwrap(), at(2028, 2, 29, 0, 0, 0));
    }

    #[test]
    fn rejects_invalid_expressions() {
        assert_eq!("".parse::<Schedule>(), Err(ScheduleError::Empty));
        assert_eq!(
            "* * *".parse::<Schedule>(),
            Err(ScheduleError::FieldCount(3))
        );
        assert!("60 * * * *".parse::<Schedule>().is_err());
        assert!("* 24 * * *".parse::<Schedule>().is_err());
        assert!("*/0 * * * *".parse::<Schedule>().is_err());
        assert!("5-1 * * * *".parse::<Schedule>().is_err());
        assert!("a * * * *".parse::<Schedule>().is_err());
        assert!("0 0 31 2 *".parse::<Schedule>().unwrap().next_after(Local::now()).is_err());
    }
}
