// Trigger argument parsing and next-fire-time calculation
//
// Every trigger type has its own argument grammar. Parsing happens once when
// the trigger infos are built, and again when a trigger is instantiated from a
// stored document, so a malformed document never reaches a running task.

use crate::errors::ArgumentError;
use crate::models::{ChangeEvent, TriggerType, Verb};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use std::time::Duration;

/// Check `arguments` (and `debounce`) against the grammar of `trigger_type`
pub fn validate_arguments(
    trigger_type: TriggerType,
    arguments: &str,
    debounce: Option<&str>,
) -> Result<(), ArgumentError> {
    match trigger_type {
        TriggerType::At => parse_timestamp(arguments).map(|_| ())?,
        TriggerType::In => parse_duration(arguments).map(|_| ())?,
        TriggerType::Cron => parse_cron_expression(arguments).map(|_| ())?,
        TriggerType::Every => parse_interval(arguments).map(|_| ())?,
        TriggerType::Event => parse_event_arguments(arguments).map(|_| ())?,
    }

    match debounce {
        Some(window) if trigger_type == TriggerType::Event => parse_interval(window).map(|_| ()),
        Some(_) => Err(ArgumentError::DebounceNotAllowed(trigger_type.to_string())),
        None => Ok(()),
    }
}

/// Parse an RFC 3339 timestamp
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ArgumentError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ArgumentError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Parse a duration such as `300ms`, `2s`, `1h30m` or `1.5h`
pub fn parse_duration(value: &str) -> Result<Duration, ArgumentError> {
    let invalid = |reason: &str| ArgumentError::InvalidDuration {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let mut rest = value.trim();
    if let Some(stripped) = rest.strip_prefix('+') {
        rest = stripped;
    } else if rest.starts_with('-') {
        return Err(invalid("negative durations are not allowed"));
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid("empty duration"));
    }

    let mut total_nanos: f64 = 0.0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| invalid("missing unit"))?;
        if number_len == 0 {
            return Err(invalid("expected a number"));
        }
        let number: f64 = rest[..number_len]
            .parse()
            .map_err(|_| invalid("malformed number"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return Err(invalid("unknown unit")),
        };
        rest = &rest[unit_len..];
        total_nanos += number * nanos_per_unit;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid("duration out of range"));
    }
    Ok(Duration::from_nanos(total_nanos as u64))
}

/// Like [`parse_duration`], but zero is rejected
pub fn parse_interval(value: &str) -> Result<Duration, ArgumentError> {
    let interval = parse_duration(value)?;
    if interval.is_zero() {
        return Err(ArgumentError::InvalidDuration {
            value: value.to_string(),
            reason: "interval must be positive".to_string(),
        });
    }
    Ok(interval)
}

/// Parse a cron expression with second precision, or a shorthand like `@daily`
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ArgumentError> {
    CronSchedule::from_str(expression.trim()).map_err(|e| ArgumentError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Parse an IANA timezone name
pub fn parse_timezone(name: &str) -> Result<Tz, ArgumentError> {
    Tz::from_str(name).map_err(|_| ArgumentError::InvalidTimezone(name.to_string()))
}

/// Rule computing the next fire time of a recurring trigger
#[derive(Debug, Clone)]
pub enum Recurrence {
    Cron { schedule: Box<CronSchedule>, timezone: Tz },
    Every(Duration),
}

impl Recurrence {
    pub fn cron(expression: &str, timezone: Tz) -> Result<Self, ArgumentError> {
        Ok(Recurrence::Cron {
            schedule: Box::new(parse_cron_expression(expression)?),
            timezone,
        })
    }

    pub fn every(interval: &str) -> Result<Self, ArgumentError> {
        Ok(Recurrence::Every(parse_interval(interval)?))
    }

    /// First fire time strictly after `reference`, or `None` when the rule is exhausted
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::Cron { schedule, timezone } => schedule
                .after(&reference.with_timezone(timezone))
                .next()
                .map(|next| next.with_timezone(&Utc)),
            Recurrence::Every(interval) => {
                chrono::Duration::from_std(*interval)
                    .ok()
                    .and_then(|step| reference.checked_add_signed(step))
            }
        }
    }
}

/// One `doctype[:VERBS[:VALUES[:PATH]]]` clause of an event trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSelector {
    pub doctype: String,
    /// Empty means any verb
    pub verbs: Vec<Verb>,
    /// Empty means any value
    pub values: Vec<String>,
    /// Dotted path of the compared field; `None` compares the document id
    pub path: Option<String>,
}

impl EventSelector {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.doctype != self.doctype {
            return false;
        }
        if !self.verbs.is_empty() && !self.verbs.contains(&event.verb) {
            return false;
        }
        if self.values.is_empty() {
            return true;
        }

        let doc = if event.verb == Verb::Deleted {
            event.old_doc.as_ref().unwrap_or(&event.doc)
        } else {
            &event.doc
        };
        let field = match &self.path {
            Some(path) => lookup_path(doc, path),
            None => doc.get("_id").or_else(|| doc.get("id")),
        };

        match field {
            Some(serde_json::Value::String(s)) => self.values.iter().any(|v| v == s),
            Some(other) => self.values.iter().any(|v| *v == other.to_string()),
            None => false,
        }
    }
}

fn lookup_path<'a>(doc: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.')
        .try_fold(doc, |current, segment| current.get(segment))
}

/// Parse whitespace separated event selectors
pub fn parse_event_arguments(arguments: &str) -> Result<Vec<EventSelector>, ArgumentError> {
    let selectors = arguments
        .split_whitespace()
        .map(parse_event_selector)
        .collect::<Result<Vec<_>, _>>()?;

    if selectors.is_empty() {
        return Err(ArgumentError::InvalidEventSelector {
            selector: arguments.to_string(),
            reason: "at least one doctype is required".to_string(),
        });
    }
    Ok(selectors)
}

fn parse_event_selector(selector: &str) -> Result<EventSelector, ArgumentError> {
    let invalid = |reason: String| ArgumentError::InvalidEventSelector {
        selector: selector.to_string(),
        reason,
    };

    let mut parts = selector.splitn(4, ':');
    let doctype = parts.next().unwrap_or_default().to_string();
    if doctype.is_empty() {
        return Err(invalid("empty doctype".to_string()));
    }

    let verbs = split_list(parts.next())
        .into_iter()
        .map(|verb| verb.parse::<Verb>().map_err(&invalid))
        .collect::<Result<Vec<_>, _>>()?;
    let values: Vec<String> = split_list(parts.next())
        .into_iter()
        .map(str::to_string)
        .collect();
    let path = parts
        .next()
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    if path.is_some() && values.is_empty() {
        return Err(invalid("a field path requires at least one value".to_string()));
    }

    Ok(EventSelector {
        doctype,
        verbs,
        values,
        path,
    })
}

fn split_list(part: Option<&str>) -> Vec<&str> {
    part.map(|p| p.split(',').filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}
