//! IntervalRecurrence: ISO-8601 style repeating intervals.
//!
//! Supported descriptors:
//! - `R3/PT10S`: three more occurrences, ten seconds apart
//! - `R/PT1H30M`: unbounded, every ninety minutes
//!
//! Each occurrence decrements the count (`R3` -> `R2` -> ... -> `R0`); at
//! `R0` the recurrence is exhausted.

use chrono::{DateTime, TimeDelta, Utc};

use crate::domain::RecurrenceError;
use crate::ports::{NextOccurrence, Recurrence};

#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalRecurrence;

#[derive(Debug, PartialEq, Eq)]
struct Descriptor<'a> {
    remaining: Option<u32>,
    interval: TimeDelta,
    interval_text: &'a str,
}

fn parse(repeat: &str) -> Result<Descriptor<'_>, RecurrenceError> {
    let malformed = || RecurrenceError::Malformed(repeat.to_owned());

    let (count, interval_text) = repeat.trim().split_once('/').ok_or_else(malformed)?;
    let count = count.strip_prefix('R').ok_or_else(malformed)?;
    let remaining = if count.is_empty() {
        None
    } else {
        Some(count.parse::<u32>().map_err(|_| malformed())?)
    };

    let mut rest = interval_text.strip_prefix("PT").ok_or_else(malformed)?;
    if rest.is_empty() {
        return Err(malformed());
    }
    let mut interval = TimeDelta::zero();
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(malformed)?;
        let (digits, tail) = rest.split_at(split);
        let value: i64 = digits.parse().map_err(|_| malformed())?;
        let unit = match tail.chars().next() {
            Some('H') => TimeDelta::try_hours(value),
            Some('M') => TimeDelta::try_minutes(value),
            Some('S') => TimeDelta::try_seconds(value),
            _ => None,
        }
        .ok_or_else(malformed)?;
        interval = interval.checked_add(&unit).ok_or_else(malformed)?;
        rest = &tail[1..];
    }

    if interval.is_zero() {
        return Err(RecurrenceError::ZeroInterval(repeat.to_owned()));
    }

    Ok(Descriptor {
        remaining,
        interval,
        interval_text,
    })
}

impl Recurrence for IntervalRecurrence {
    fn next(
        &self,
        repeat: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<NextOccurrence>, RecurrenceError> {
        let descriptor = parse(repeat)?;
        let repeat = match descriptor.remaining {
            Some(0) => return Ok(None),
            Some(1) => None,
            Some(n) => Some(format!("R{}/{}", n - 1, descriptor.interval_text)),
            None => Some(format!("R/{}", descriptor.interval_text)),
        };
        Ok(Some(NextOccurrence {
            due_time: after + descriptor.interval,
            repeat,
        }))
    }
}
