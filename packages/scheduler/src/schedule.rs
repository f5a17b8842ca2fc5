//! Schedule expressions.
//!
//! Standard five-field cron (`min hour dom mon dow`) is accepted alongside
//! the six- and seven-field forms with a leading seconds field (and an
//! optional trailing year). Five-field expressions fire at second 0.
//! Numeric days of the week always use crontab numbering (`0-7`, where
//! both 0 and 7 are Sunday), whichever form the expression takes, so an
//! expression fires on the same days in-process and from a crontab.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Highest numeric day of the week; 7 is Sunday again.
const MAX_DAY: usize = 7;

/// A malformed schedule expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid schedule expression '{expression}': {message}")]
pub struct ScheduleError {
    pub expression: String,
    pub message: String,
}

impl From<ScheduleError> for georisk_monitor_models::ValidationError {
    fn from(e: ScheduleError) -> Self {
        Self::Schedule {
            expression: e.expression,
            message: e.message,
        }
    }
}

/// A parsed, validated schedule expression.
#[derive(Debug, Clone)]
pub struct ScheduleExpression {
    source: String,
    schedule: cron::Schedule,
    has_seconds: bool,
}

impl ScheduleExpression {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] if the expression is blank, has the wrong
    /// number of fields or does not parse.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let source = expression.trim();
        let error = |message: String| ScheduleError {
            expression: source.to_string(),
            message,
        };

        let fields: Vec<&str> = source.split_whitespace().collect();
        let (normalized, has_seconds) = match fields.len() {
            5 => {
                let dow = translate_day_of_week(fields[4]);
                (
                    format!(
                        "0 {} {} {} {} {dow}",
                        fields[0], fields[1], fields[2], fields[3]
                    ),
                    false,
                )
            }
            6 | 7 => {
                let mut fields: Vec<String> = fields.iter().map(|f| (*f).to_string()).collect();
                fields[5] = translate_day_of_week(&fields[5]);
                (fields.join(" "), true)
            }
            0 => return Err(error("expression is empty".to_string())),
            n => return Err(error(format!("expected 5, 6 or 7 fields, got {n}"))),
        };

        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| error(e.to_string()))?;
        Ok(Self {
            source: source.to_string(),
            schedule,
            has_seconds,
        })
    }

    /// The expression as written (trimmed).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The first fire time strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// The expression in five-field crontab form, if it has one.
    ///
    /// Six- and seven-field expressions only qualify when they fire at
    /// second 0 every year.
    #[must_use]
    pub fn to_crontab(&self) -> Option<String> {
        if !self.has_seconds {
            return Some(self.source.clone());
        }
        let fields: Vec<&str> = self.source.split_whitespace().collect();
        let year_ok = fields.get(6).is_none_or(|year| *year == "*");
        (fields[0] == "0" && year_ok).then(|| fields[1..6].join(" "))
    }
}

impl fmt::Display for ScheduleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for ScheduleExpression {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Rewrites numeric days of the week (`0-7`) as day names.
///
/// Numeric items (`5`, `1-5`, `5-7`, `0/2`, `*/2`, `1-5/2`) are expanded
/// into an explicit list of names; anything else is left for the cron
/// parser to accept or reject.
fn translate_day_of_week(field: &str) -> String {
    let mut items: Vec<String> = Vec::new();
    for item in field.split(',') {
        match numeric_days(item) {
            Some(days) => {
                for day in days {
                    let name = DAY_NAMES[day % DAY_NAMES.len()].to_string();
                    if !items.contains(&name) {
                        items.push(name);
                    }
                }
            }
            None => items.push(item.to_string()),
        }
    }
    items.join(",")
}

/// The days a numeric day-of-week item selects, or `None` if the item is
/// not purely numeric, is out of range or is a bare `*`.
fn numeric_days(item: &str) -> Option<Vec<usize>> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step.parse::<usize>().ok().filter(|s| *s > 0)?)),
        None => (item, None),
    };

    let day = |token: &str| token.parse::<usize>().ok().filter(|n| *n <= MAX_DAY);
    let (first, last) = match (range, step) {
        ("*", None) => return None,
        ("*", Some(_)) => (0, MAX_DAY),
        _ => match range.split_once('-') {
            Some((first, last)) => (day(first)?, day(last)?),
            None if step.is_some() => (day(range)?, MAX_DAY),
            None => {
                let single = day(range)?;
                (single, single)
            }
        },
    };
    if first > last {
        return None;
    }

    Some((first..=last).step_by(step.unwrap_or(1)).collect())
}
