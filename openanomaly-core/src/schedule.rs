//! Cron schedule evaluation
//!
//! Pipelines use standard 5-field cron; the `cron` crate wants a leading
//! seconds field and numbers weekdays 1-7 from Sunday, so expressions are
//! normalized before parsing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

/// Upper bound on ticks walked in a single window. A minute-level schedule
/// reaches it only after ~70 days of downtime.
const MAX_TICK_SCAN: usize = 100_000;

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

/// Ticks that fell in an evaluated window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTicks {
    pub latest: Option<DateTime<Utc>>,
    pub count: usize,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let normalized = normalize_cron(expression);
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| format!("invalid cron expression '{expression}': {e}"))?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Ticks in `(after, until]`.
    pub fn ticks_between(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> WindowTicks {
        let mut window = WindowTicks {
            latest: None,
            count: 0,
        };
        for tick in self
            .schedule
            .after(&after)
            .take_while(|tick| *tick <= until)
            .take(MAX_TICK_SCAN)
        {
            window.latest = Some(tick);
            window.count += 1;
        }
        window
    }

    /// Most recent tick at or before `at`, looking back at most `lookback`.
    pub fn latest_at_or_before(
        &self,
        at: DateTime<Utc>,
        lookback: chrono::Duration,
    ) -> Option<DateTime<Utc>> {
        self.ticks_between(at - lookback, at).latest
    }
}

/// Normalize a 5-field cron expression to the `cron` crate's 6-field form.
///
/// A zero seconds field is prepended and numeric weekdays move from 0-6
/// (0 or 7 = Sunday) to 1-7 (1 = Sunday). Other shapes are passed through
/// for the parser to judge.
pub fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, day, month, weekday] => {
            format!("0 {minute} {hour} {day} {month} {}", shift_weekdays(weekday))
        }
        _ => trimmed.to_string(),
    }
}

fn shift_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(shift_weekday_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_weekday_item(item: &str) -> String {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };
    let with_step = |base: String| match step {
        Some(step) => format!("{base}/{step}"),
        None => base,
    };

    match base.split_once('-') {
        Some((from, to)) => match (from.parse::<u8>(), to.parse::<u8>()) {
            // Sunday written as 7 closes the range; the crate has no 8.
            (Ok(from), Ok(7)) if from <= 6 && step.is_none() => format!("{}-7,1", from + 1),
            (Ok(from), Ok(to)) if from <= 6 && to <= 6 => {
                with_step(format!("{}-{}", from + 1, to + 1))
            }
            _ => item.to_string(),
        },
        None => match base.parse::<u8>() {
            Ok(7) => with_step("1".to_string()),
            Ok(day) if day <= 6 => with_step((day + 1).to_string()),
            _ => item.to_string(),
        },
    }
}
