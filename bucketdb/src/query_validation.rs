//! Validation of raw read request arguments, run before a [`crate::Query`] is parsed.
use chrono::{DateTime, Utc};

use crate::{
    period::{parse_time_string, Period},
    query::SINGLE_VALUED_PARAMS,
    validation::{key_is_reserved, key_is_valid, ValidationResult},
};

struct RequestArgs<'a> {
    params: &'a [(String, String)],
}

impl<'a> RequestArgs<'a> {
    fn get(&self, name: &str) -> Option<&'a str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn get_all(&self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.params
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn time(&self, name: &str) -> Option<DateTime<Utc>> {
        self.get(name).and_then(|value| parse_time_string(value).ok())
    }

    fn is_grouped(&self) -> bool {
        self.has("group_by") || self.has("period")
    }
}

type Rule = fn(&RequestArgs, bool) -> ValidationResult;

const RULES: [Rule; 11] = [
    single_valued_params_are_unique,
    datetimes_are_valid,
    limit_is_valid,
    sort_is_valid,
    group_by_is_valid,
    period_is_valid,
    duration_is_valid,
    collect_is_valid,
    filter_by_is_valid,
    raw_queries_are_allowed,
    time_span_is_long_enough,
];

/// Checks request arguments, returning the first failure.
pub fn validate_request_args(
    params: &[(String, String)],
    raw_queries_allowed: bool,
) -> ValidationResult {
    let args = RequestArgs { params };
    RULES
        .iter()
        .map(|rule| rule(&args, raw_queries_allowed))
        .find(|result| !result.is_valid())
        .unwrap_or(ValidationResult::Valid)
}

fn single_valued_params_are_unique(args: &RequestArgs, _: bool) -> ValidationResult {
    match SINGLE_VALUED_PARAMS
        .iter()
        .find(|name| args.get_all(**name).nth(1).is_some())
    {
        Some(name) => ValidationResult::invalid(format!("{name} may only be given once")),
        None => ValidationResult::Valid,
    }
}

fn datetimes_are_valid(args: &RequestArgs, _: bool) -> ValidationResult {
    for name in ["start_at", "end_at", "date"] {
        if let Some(value) = args.get(name) {
            if parse_time_string(value).is_err() {
                return ValidationResult::invalid(format!("{name} is not a valid datetime"));
            }
        }
    }
    ValidationResult::Valid
}

fn limit_is_valid(args: &RequestArgs, _: bool) -> ValidationResult {
    match args.get("limit") {
        Some(limit) if limit.parse::<usize>().is_err() => {
            ValidationResult::invalid("limit is not a valid number")
        }
        _ => ValidationResult::Valid,
    }
}

fn sort_is_valid(args: &RequestArgs, _: bool) -> ValidationResult {
    let Some(sort_by) = args.get("sort_by") else {
        return ValidationResult::Valid;
    };
    let parts: Vec<&str> = sort_by.split(':').collect();
    let direction = match parts.as_slice() {
        [_] => args.get("direction"),
        [_, direction] => Some(*direction),
        _ => return ValidationResult::invalid("sort_by must be a key and a direction"),
    };
    match direction {
        Some("ascending" | "descending") => ValidationResult::Valid,
        Some(_) => ValidationResult::invalid(
            "Unrecognised sort direction. Supported directions include: ascending, descending",
        ),
        None => ValidationResult::invalid("sort_by must be a key and a direction"),
    }
}

fn group_by_is_valid(args: &RequestArgs, _: bool) -> ValidationResult {
    match args.get("group_by") {
        Some(key) if !key_is_valid(key) => {
            ValidationResult::invalid("Cannot group by an invalid field name")
        }
        Some(key) if key_is_reserved(key) => ValidationResult::invalid(
            "Cannot group by internal fields, internal fields start with an underscore",
        ),
        _ => ValidationResult::Valid,
    }
}

fn period_is_valid(args: &RequestArgs, _: bool) -> ValidationResult {
    match args.get("period").map(str::parse::<Period>) {
        Some(Err(error)) => ValidationResult::invalid(error.to_string()),
        _ => ValidationResult::Valid,
    }
}

fn duration_is_valid(args: &RequestArgs, _: bool) -> ValidationResult {
    let Some(duration) = args.get("duration") else {
        return ValidationResult::Valid;
    };
    if !args.has("period") {
        return ValidationResult::invalid("duration requires a period");
    }
    if !matches!(duration.parse::<u32>(), Ok(n) if n > 0) {
        return ValidationResult::invalid("duration must be a positive integer");
    }
    if args.has("start_at") && args.has("end_at") {
        return ValidationResult::invalid("duration cannot be used with both start_at and end_at");
    }
    ValidationResult::Valid
}

fn collect_is_valid(args: &RequestArgs, _: bool) -> ValidationResult {
    let group_by = args.get("group_by");
    for field in args
        .get_all("collect")
        .flat_map(|value| value.split(','))
        .map(str::trim)
    {
        if !args.is_grouped() {
            return ValidationResult::invalid("collect is only allowed when grouping");
        }
        if !key_is_valid(field) {
            return ValidationResult::invalid(format!("Cannot collect an invalid field name: {field}"));
        }
        if key_is_reserved(field) {
            return ValidationResult::invalid(
                "Cannot collect internal fields, internal fields start with an underscore",
            );
        }
        if Some(field) == group_by {
            return ValidationResult::invalid("Cannot collect the group_by field");
        }
    }
    ValidationResult::Valid
}

fn filter_by_is_valid(args: &RequestArgs, _: bool) -> ValidationResult {
    for filter in args.get_all("filter_by") {
        match filter.split_once(':') {
            Some((key, _)) if key_is_valid(key) => {}
            _ => return ValidationResult::invalid(format!("filter_by must be key:value, got {filter}")),
        }
    }
    ValidationResult::Valid
}

fn raw_queries_are_allowed(args: &RequestArgs, raw_queries_allowed: bool) -> ValidationResult {
    if !raw_queries_allowed && !args.is_grouped() {
        ValidationResult::invalid("querying for raw data is not allowed")
    } else {
        ValidationResult::Valid
    }
}

fn time_span_is_long_enough(args: &RequestArgs, _: bool) -> ValidationResult {
    let period = args.get("period").and_then(|p| p.parse::<Period>().ok());
    match (period, args.time("start_at"), args.time("end_at")) {
        (Some(period), Some(start), Some(end)) if !period.minimum_span_reached(start, end) => {
            ValidationResult::invalid(format!(
                "The minimum time span for a query is {}",
                period.minimum_span_description()
            ))
        }
        _ => ValidationResult::Valid,
    }
}
