//! WeMeet recurring rule to DingTalk calendar recurrence.

use crate::models::RecurringRule;
use crate::services::formatting::{iso_utc, local_day_of_month};
use serde::Serialize;

const WEEKDAY_FLAGS: [(i64, &str); 7] = [
    (1, "monday"),
    (2, "tuesday"),
    (4, "wednesday"),
    (8, "thursday"),
    (16, "friday"),
    (32, "saturday"),
    (64, "sunday"),
];

const WEEK_INDEX_FLAGS: [(i64, &str); 5] = [
    (128, "first"),
    (256, "second"),
    (512, "third"),
    (1024, "fourth"),
    (2048, "last"),
];

const WORKDAYS: &str = "monday,tuesday,wednesday,thursday,friday";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recurrence {
    pub pattern: RecurrencePattern,
    pub range: RecurrenceRange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrencePattern {
    #[serde(rename = "type")]
    pub kind: &'static str,

    pub interval: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,

    /// Comma-separated lowercase weekday names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceRange {
    #[serde(rename = "type")]
    pub kind: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_occurrences: Option<i64>,
}

impl RecurrencePattern {
    fn new(kind: &'static str, interval: i64) -> Self {
        Self {
            kind,
            interval,
            day_of_month: None,
            days_of_week: None,
            index: None,
        }
    }
}

/// Weekday names set in the low seven bits of `flags`.
fn weekdays(flags: i64) -> String {
    WEEKDAY_FLAGS
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(",")
}

/// First week-of-month flag set in `flags`, defaulting to the first week.
fn week_index(flags: i64) -> &'static str {
    WEEK_INDEX_FLAGS
        .iter()
        .find(|(bit, _)| flags & bit != 0)
        .map_or("first", |(_, name)| *name)
}

/// Convert a rule for a meeting starting at `start_secs`.
///
/// Unknown recurrence types fall back to daily.
pub fn convert(rule: &RecurringRule, start_secs: i64) -> Recurrence {
    let pattern = match rule.recurring_type {
        1 => RecurrencePattern {
            days_of_week: Some(WORKDAYS.to_string()),
            ..RecurrencePattern::new("weekly", 1)
        },
        2 => RecurrencePattern::new("weekly", 1),
        3 => RecurrencePattern::new("weekly", 2),
        4 => RecurrencePattern {
            day_of_month: Some(local_day_of_month(start_secs)),
            ..RecurrencePattern::new("absoluteMonthly", 1)
        },
        5 => custom_pattern(rule, start_secs),
        _ => RecurrencePattern::new("daily", 1),
    };

    let range = match rule.until_type {
        0 => RecurrenceRange {
            kind: "endDate",
            end_date: Some(iso_utc(rule.until_date)),
            number_of_occurrences: None,
        },
        1 => RecurrenceRange {
            kind: "numbered",
            end_date: None,
            number_of_occurrences: Some(rule.until_count),
        },
        _ => RecurrenceRange {
            kind: "noEnd",
            end_date: None,
            number_of_occurrences: None,
        },
    };

    Recurrence { pattern, range }
}

fn custom_pattern(rule: &RecurringRule, start_secs: i64) -> RecurrencePattern {
    let interval = rule.customized_recurring_step.max(1);
    let days = rule.customized_recurring_days;

    match rule.customized_recurring_type {
        1 => RecurrencePattern {
            days_of_week: Some(weekdays(days)),
            ..RecurrencePattern::new("weekly", interval)
        },
        2 => RecurrencePattern {
            index: Some(week_index(days)),
            days_of_week: Some(weekdays(days)),
            ..RecurrencePattern::new("relativeMonthly", interval)
        },
        3 => RecurrencePattern {
            day_of_month: Some(local_day_of_month(start_secs)),
            ..RecurrencePattern::new("absoluteMonthly", interval)
        },
        _ => RecurrencePattern::new("daily", interval),
    }
}
