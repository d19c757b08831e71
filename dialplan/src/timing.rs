//! Time-of-day restrictions for includes and `GotoIfTime`.
//!
//! A restriction reads `times,weekdays,mdays,months[,timezone]` (`|` also
//! separates fields). Every field is `*`, a single value or a range, and
//! several of them may be joined with `&`. Ranges wrap, so `fri-mon` and
//! `22:00-06:00` do what they look like.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Local, Month, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;

use crate::error::DialplanError;

#[derive(Clone, PartialEq)]
pub struct TimeSpec {
    source: String,
    times: Option<Vec<(NaiveTime, NaiveTime)>>,
    weekdays: [bool; 7],
    mdays: [bool; 31],
    months: [bool; 12],
    timezone: Option<Tz>,
}

impl fmt::Debug for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TimeSpec").field(&self.source).finish()
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for TimeSpec {
    type Err = DialplanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DialplanError::InvalidTiming(s.to_string());
        let fields: Vec<&str> = s.split([',', '|']).map(|f| f.trim()).collect();
        if fields.len() > 5 {
            return Err(invalid());
        }
        let field = |i: usize| fields.get(i).copied().filter(|f| !f.is_empty()).unwrap_or("*");

        let times = parse_times(field(0)).ok_or_else(invalid)?;
        let mut weekdays = [false; 7];
        fill_mask(&mut weekdays, field(1), |v| {
            Weekday::from_str(v).ok().map(|d| d.num_days_from_monday() as usize)
        })
        .ok_or_else(invalid)?;
        let mut mdays = [false; 31];
        fill_mask(&mut mdays, field(2), |v| {
            v.parse::<usize>().ok().filter(|d| (1..=31).contains(d)).map(|d| d - 1)
        })
        .ok_or_else(invalid)?;
        let mut months = [false; 12];
        fill_mask(&mut months, field(3), |v| {
            Month::from_str(v)
                .ok()
                .map(|m| m.number_from_month() as usize - 1)
                .or_else(|| {
                    v.parse::<usize>().ok().filter(|m| (1..=12).contains(m)).map(|m| m - 1)
                })
        })
        .ok_or_else(invalid)?;
        let timezone = match fields.get(4).filter(|f| !f.is_empty()) {
            Some(tz) => Some(tz.parse::<Tz>().map_err(|_| invalid())?),
            None => None,
        };

        Ok(TimeSpec {
            source: s.to_string(),
            times,
            weekdays,
            mdays,
            months,
            timezone,
        })
    }
}

impl TimeSpec {
    /// Whether the restriction holds right now, in its own time zone if it
    /// names one, local time otherwise.
    pub fn is_active(&self) -> bool {
        let now = Utc::now();
        match self.timezone {
            Some(tz) => self.matches(&now.with_timezone(&tz)),
            None => self.matches(&now.with_timezone(&Local)),
        }
    }

    pub fn matches<T: Datelike + Timelike>(&self, time: &T) -> bool {
        if !self.weekdays[time.weekday().num_days_from_monday() as usize] {
            return false;
        }
        if !self.mdays[time.day0() as usize] {
            return false;
        }
        if !self.months[time.month0() as usize] {
            return false;
        }
        let Some(ranges) = &self.times else {
            return true;
        };
        let Some(now) = NaiveTime::from_hms_opt(time.hour(), time.minute(), 0) else {
            return false;
        };
        ranges.iter().any(|(start, end)| {
            if start <= end {
                *start <= now && now <= *end
            } else {
                !(*end < now && now < *start)
            }
        })
    }
}

fn parse_times(field: &str) -> Option<Option<Vec<(NaiveTime, NaiveTime)>>> {
    if field == "*" {
        return Some(None);
    }
    let mut ranges = Vec::new();
    for part in field.split('&') {
        let parse = |t: &str| NaiveTime::parse_from_str(t.trim(), "%H:%M").ok();
        let range = match part.split_once('-') {
            Some((start, end)) => (parse(start)?, parse(end)?),
            None => {
                let t = parse(part)?;
                (t, t)
            }
        };
        ranges.push(range);
    }
    Some(Some(ranges))
}

fn fill_mask<const N: usize>(
    mask: &mut [bool; N],
    field: &str,
    index: impl Fn(&str) -> Option<usize>,
) -> Option<()> {
    if field == "*" {
        *mask = [true; N];
        return Some(());
    }
    for part in field.split('&') {
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (index(start.trim())?, index(end.trim())?);
                let mut i = start;
                loop {
                    mask[i] = true;
                    if i == end {
                        break;
                    }
                    i = (i + 1) % N;
                }
            }
            None => mask[index(part.trim())?] = true,
        }
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn office_hours() {
        let spec: TimeSpec = "09:00-17:00,mon-fri,*,*".parse().unwrap();
        // 2024-01-03 is a Wednesday
        assert!(spec.matches(&at(2024, 1, 3, 9, 0)));
        assert!(spec.matches(&at(2024, 1, 3, 17, 0)));
        assert!(!spec.matches(&at(2024, 1, 3, 17, 1)));
        assert!(!spec.matches(&at(2024, 1, 6, 10, 0)));
    }

    #[test]
    fn wrapping_ranges() {
        let spec: TimeSpec = "22:00-06:00|fri-mon|*|*".parse().unwrap();
        assert!(spec.matches(&at(2024, 1, 6, 23, 30)));
        assert!(spec.matches(&at(2024, 1, 8, 5, 59)));
        assert!(!spec.matches(&at(2024, 1, 8, 12, 0)));
        assert!(!spec.matches(&at(2024, 1, 3, 23, 0)));
    }

    #[test]
    fn days_and_months() {
        let spec: TimeSpec = "*,*,1-15,dec&jan".parse().unwrap();
        assert!(spec.matches(&at(2024, 12, 1, 0, 0)));
        assert!(spec.matches(&at(2024, 1, 15, 0, 0)));
        assert!(!spec.matches(&at(2024, 1, 16, 0, 0)));
        assert!(!spec.matches(&at(2024, 2, 1, 0, 0)));
    }

    #[test]
    fn missing_fields_are_wildcards() {
        let spec: TimeSpec = "*".parse().unwrap();
        assert!(spec.matches(&at(2024, 7, 4, 12, 0)));
        assert!(spec.is_active());
    }

    #[test]
    fn rejects_garbage() {
        assert!("25:00-26:00,*,*,*".parse::<TimeSpec>().is_err());
        assert!("*,funday,*,*".parse::<TimeSpec>().is_err());
        assert!("*,*,32,*".parse::<TimeSpec>().is_err());
        assert!("*,*,*,*,Mars/Olympus".parse::<TimeSpec>().is_err());
    }

    #[test]
    fn timezone_field() {
        let spec: TimeSpec = "*,*,*,*,Europe/London".parse().unwrap();
        assert_eq!(Some(chrono_tz::Europe::London), spec.timezone);
    }
}
