//! The read request model and the filter it renders for storage.
use std::{cmp::Ordering, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::{
    error::{BucketError, Result},
    period::{parse_time_string, Period},
    record::{Record, TIMESTAMP_KEY},
    value::Value,
};

/// Request parameters that take a single value. `collect` and `filter_by` may repeat.
pub(crate) const SINGLE_VALUED_PARAMS: [&str; 9] = [
    "start_at",
    "end_at",
    "period",
    "duration",
    "date",
    "group_by",
    "sort_by",
    "direction",
    "limit",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl FromStr for Direction {
    type Err = BucketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ascending" => Ok(Direction::Ascending),
            "descending" => Ok(Direction::Descending),
            other => Err(BucketError::InvalidSort(other.to_string())),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ascending => f.write_str("ascending"),
            Direction::Descending => f.write_str("descending"),
        }
    }
}

/// A validated sort: one key and one direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sort {
    pub key: String,
    pub direction: Direction,
}

impl Sort {
    pub fn ascending<S: Into<String>>(key: S) -> Self {
        Self {
            key: key.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn descending<S: Into<String>>(key: S) -> Self {
        Self {
            key: key.into(),
            direction: Direction::Descending,
        }
    }

    pub fn parts(&self) -> Vec<String> {
        vec![self.key.clone(), self.direction.to_string()]
    }
}

/// Checks a raw sort specification (`[key, direction]`).
pub fn validate_sort<S: AsRef<str>>(parts: &[S]) -> Result<Sort> {
    match parts {
        [key, direction] => Ok(Sort {
            key: key.as_ref().to_string(),
            direction: direction.as_ref().parse()?,
        }),
        _ => Err(BucketError::InvalidSort(
            "Expected a key and direction".to_string(),
        )),
    }
}

/// Stable sort of `items` by the value `field` extracts for the sort key.
///
/// Every item must carry the key and all values must be comparable with each other.
pub(crate) fn sort_by_field<T, F>(items: Vec<T>, sort: &Sort, field: F) -> Result<Vec<T>>
where
    F: Fn(&T) -> Option<Value>,
{
    let mut keyed = items
        .into_iter()
        .map(|item| match field(&item) {
            Some(value) => Ok((value, item)),
            None => Err(BucketError::InvalidSort(format!(
                "key {} is not present on every result",
                sort.key
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    if let Some((first, _)) = keyed.first() {
        if keyed
            .iter()
            .any(|(value, _)| first.compare_same_kind(value).is_none())
        {
            return Err(BucketError::InvalidSort(format!(
                "values of {} are not comparable",
                sort.key
            )));
        }
    }

    keyed.sort_by(|(l, _), (r, _)| {
        let ordering = l.compare_same_kind(r).unwrap_or(Ordering::Equal);
        match sort.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    });
    Ok(keyed.into_iter().map(|(_, item)| item).collect())
}

/// Stable ascending sort on `_timestamp`. Records without one come first.
pub fn sort_by_timestamp(mut records: Vec<Record>) -> Vec<Record> {
    records.sort_by_key(Record::timestamp);
    records
}

pub fn sort_records(records: Vec<Record>, sort: &Sort) -> Result<Vec<Record>> {
    sort_by_field(records, sort, |record| record.get(&sort.key).cloned())
}

/// A single storage-side constraint.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Equals { key: String, value: Value },
    /// Half-open `[start, end)`. A missing bound is unbounded.
    Range {
        key: String,
        start: Option<Value>,
        end: Option<Value>,
    },
    NotNull { key: String },
}

impl Condition {
    pub fn key(&self) -> &str {
        match self {
            Condition::Equals { key, .. }
            | Condition::Range { key, .. }
            | Condition::NotNull { key } => key,
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Condition::Equals { key, value } => record
                .get(key)
                .map_or(false, |stored| stored.matches(value)),
            Condition::Range { key, start, end } => match record.get(key) {
                Some(stored) => {
                    let after_start = start.as_ref().map_or(true, |start| {
                        matches!(
                            stored.compare_same_kind(start),
                            Some(Ordering::Greater | Ordering::Equal)
                        )
                    });
                    let before_end = end.as_ref().map_or(true, |end| {
                        matches!(stored.compare_same_kind(end), Some(Ordering::Less))
                    });
                    after_start && before_end
                }
                None => false,
            },
            Condition::NotNull { key } => record.contains_key(key),
        }
    }
}

/// The conjunction of conditions a storage collaborator evaluates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }

    pub fn constrains(&self, key: &str) -> bool {
        self.conditions.iter().any(|c| c.key() == key)
    }

    /// Adds a `NotNull` condition for every key not already constrained.
    pub fn require_keys<S: AsRef<str>>(mut self, keys: &[S]) -> Self {
        for key in keys {
            let key = key.as_ref();
            if !self.constrains(key) {
                self.conditions.push(Condition::NotNull {
                    key: key.to_string(),
                });
            }
        }
        self
    }

    /// The `_timestamp` window, if any. Used for index pruning.
    pub fn timestamp_window(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let mut window = (None, None);
        for condition in &self.conditions {
            if let Condition::Range { key, start, end } = condition {
                if key == TIMESTAMP_KEY {
                    window.0 = start.as_ref().and_then(Value::as_timestamp);
                    window.1 = end.as_ref().and_then(Value::as_timestamp);
                }
            }
        }
        window
    }
}

/// An immutable read request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<(String, Value)>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub period: Option<Period>,
    pub group_by: Option<String>,
    /// Raw sort parts as requested. Checked by the repository.
    pub sort_by: Option<Vec<String>>,
    pub limit: Option<usize>,
    pub collect: Vec<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(params: &[(String, String)]) -> Result<Self> {
        Self::parse_at(params, Utc::now())
    }

    /// Parses request parameters. `now` anchors `period` + `duration` windows without a `date`.
    pub fn parse_at(params: &[(String, String)], now: DateTime<Utc>) -> Result<Self> {
        if let Some(name) = SINGLE_VALUED_PARAMS
            .iter()
            .find(|name| params.iter().filter(|(key, _)| key.as_str() == **name).nth(1).is_some())
        {
            return Err(BucketError::Validation(format!(
                "{name} may only be given once"
            )));
        }

        let mut query = Query::new();
        let mut duration = None;
        let mut date = None;
        let mut direction = None;

        for (name, value) in params {
            match name.as_str() {
                "start_at" => query.start_at = Some(parse_time_string(value)?),
                "end_at" => query.end_at = Some(parse_time_string(value)?),
                "period" => query.period = Some(value.parse()?),
                "duration" => duration = Some(parse_positive(name, value)?),
                "date" => date = Some(parse_time_string(value)?),
                "group_by" => query.group_by = Some(value.clone()),
                "sort_by" => {
                    query.sort_by = Some(value.split(':').map(str::to_string).collect())
                }
                "direction" => direction = Some(value.clone()),
                "limit" => {
                    query.limit = Some(value.parse().map_err(|_| {
                        BucketError::Validation("limit must be a positive integer".to_string())
                    })?)
                }
                "collect" => query.collect.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|field| !field.is_empty())
                        .map(str::to_string),
                ),
                "filter_by" => match value.split_once(':') {
                    Some((key, expected)) => query
                        .filters
                        .push((key.to_string(), Value::from(expected))),
                    None => {
                        return Err(BucketError::Validation(format!(
                            "filter_by must be key:value, got {value}"
                        )))
                    }
                },
                other if other.starts_with('_') => {
                    trace!(param = other, "ignoring reserved query parameter");
                }
                other => query
                    .filters
                    .push((other.to_string(), Value::from(value.as_str()))),
            }
        }

        if let (Some(sort), Some(direction)) = (query.sort_by.as_mut(), direction) {
            if sort.len() == 1 {
                sort.push(direction);
            }
        }

        if let (Some(period), Some(duration)) = (query.period, duration) {
            if query.start_at.is_none() && query.end_at.is_none() {
                let anchor = period.start_of(date.unwrap_or(now));
                query.start_at = Some(period.shift_back(anchor, duration)?);
                query.end_at = Some(anchor);
            }
        }

        Ok(query)
    }

    pub fn with_filter<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.filters.push((key.into(), value.into()));
        self
    }

    pub fn with_window(mut self, start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> Self {
        self.start_at = Some(start_at);
        self.end_at = Some(end_at);
        self
    }

    pub fn with_group_by<S: Into<String>>(mut self, key: S) -> Self {
        self.group_by = Some(key.into());
        self
    }

    pub fn with_period(mut self, period: Period) -> Self {
        self.period = Some(period);
        self
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort_by = Some(sort.parts());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_collect<S: Into<String>>(mut self, field: S) -> Self {
        self.collect.push(field.into());
        self
    }

    /// Grouping keys in nesting order: `group_by` first, then the period key.
    pub fn group_keys(&self) -> Vec<String> {
        self.group_by
            .iter()
            .cloned()
            .chain(self.period.map(|p| p.key().to_string()))
            .collect()
    }

    pub fn to_storage_query(&self) -> Filter {
        let mut conditions: Vec<Condition> = self
            .filters
            .iter()
            .map(|(key, value)| Condition::Equals {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        if self.start_at.is_some() || self.end_at.is_some() {
            conditions.push(Condition::Range {
                key: TIMESTAMP_KEY.to_string(),
                start: self.start_at.map(Value::Timestamp),
                end: self.end_at.map(Value::Timestamp),
            });
        }
        Filter { conditions }
    }
}

fn parse_positive(name: &str, value: &str) -> Result<u32> {
    match value.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(BucketError::Validation(format!(
            "{name} must be a positive integer"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn validate_sort_requires_key_and_direction() {
        assert_eq!(
            validate_sort(&["name", "descending"]).ok(),
            Some(Sort::descending("name"))
        );
        let error = validate_sort(&["name"]).unwrap_err();
        assert!(
            matches!(error, BucketError::InvalidSort(m) if m == "Expected a key and direction")
        );
        let error = validate_sort(&["name", "sideways"]).unwrap_err();
        assert!(matches!(error, BucketError::InvalidSort(m) if m == "sideways"));
    }

    #[test]
    fn parse_extracts_reserved_and_filter_params() -> Result<()> {
        let query = Query::parse(&params(&[
            ("start_at", "2012-12-12T00:00:00+00:00"),
            ("end_at", "2012-12-19T00:00:00+00:00"),
            ("group_by", "department"),
            ("sort_by", "_count:descending"),
            ("limit", "5"),
            ("collect", "name"),
            ("collect", "size,colour"),
            ("animal", "dog"),
            ("_internal", "ignored"),
        ]))?;

        assert_eq!(query.start_at, Some(utc(2012, 12, 12)));
        assert_eq!(query.end_at, Some(utc(2012, 12, 19)));
        assert_eq!(query.group_by.as_deref(), Some("department"));
        assert_eq!(
            query.sort_by,
            Some(vec!["_count".to_string(), "descending".to_string()])
        );
        assert_eq!(query.limit, Some(5));
        assert_eq!(query.collect, vec!["name", "size", "colour"]);
        assert_eq!(query.filters, vec![("animal".to_string(), Value::from("dog"))]);
        Ok(())
    }

    #[test]
    fn repeated_single_valued_params_are_rejected() {
        let error = Query::parse(&params(&[("group_by", "name"), ("group_by", "_id")]))
            .unwrap_err();
        assert!(
            matches!(error, BucketError::Validation(m) if m == "group_by may only be given once")
        );
        assert!(Query::parse(&params(&[("collect", "a"), ("collect", "b")])).is_ok());
    }

    #[test]
    fn sort_direction_can_be_a_separate_param() -> Result<()> {
        let query = Query::parse(&params(&[("sort_by", "size"), ("direction", "descending")]))?;
        assert_eq!(
            query.sort_by,
            Some(vec!["size".to_string(), "descending".to_string()])
        );
        Ok(())
    }

    #[test]
    fn filter_by_adds_a_filter() -> Result<()> {
        let query = Query::parse(&params(&[("filter_by", "colour:blue")]))?;
        assert_eq!(query.filters, vec![("colour".to_string(), Value::from("blue"))]);
        assert!(Query::parse(&params(&[("filter_by", "colour")])).is_err());
        Ok(())
    }

    #[test]
    fn period_and_duration_give_a_window_ending_at_the_anchor() -> Result<()> {
        let query = Query::parse_at(
            &params(&[("period", "week"), ("duration", "2"), ("date", "2013-05-16T12:00:00Z")]),
            utc(2020, 1, 1),
        )?;
        assert_eq!(query.start_at, Some(utc(2013, 4, 29)));
        assert_eq!(query.end_at, Some(utc(2013, 5, 13)));
        assert_eq!(query.group_keys(), vec!["_week_start_at"]);

        let query = Query::parse_at(
            &params(&[("period", "day"), ("duration", "3")]),
            Utc.with_ymd_and_hms(2020, 1, 10, 15, 0, 0).unwrap(),
        )?;
        assert_eq!(query.start_at, Some(utc(2020, 1, 7)));
        assert_eq!(query.end_at, Some(utc(2020, 1, 10)));
        Ok(())
    }

    #[test]
    fn bad_params_are_rejected() {
        assert!(Query::parse(&params(&[("limit", "-1")])).is_err());
        assert!(Query::parse(&params(&[("start_at", "yesterday")])).is_err());
        assert!(Query::parse(&params(&[("period", "fortnight")])).is_err());
        assert!(Query::parse(&params(&[("period", "week"), ("duration", "0")])).is_err());
    }

    #[test]
    fn group_keys_order() {
        let query = Query::new()
            .with_group_by("name")
            .with_period(Period::Month);
        assert_eq!(query.group_keys(), vec!["name", "_month_start_at"]);
        assert!(Query::new().group_keys().is_empty());
    }

    #[test]
    fn storage_query_has_half_open_timestamp_window() {
        let filter = Query::new()
            .with_filter("animal", "dog")
            .with_window(utc(2012, 1, 1), utc(2012, 1, 8))
            .to_storage_query();

        let at = |d: DateTime<Utc>| record(&[("animal", Value::from("dog")), ("_timestamp", Value::from(d))]);
        assert!(filter.matches(&at(utc(2012, 1, 1))));
        assert!(filter.matches(&at(utc(2012, 1, 7))));
        assert!(!filter.matches(&at(utc(2012, 1, 8))));
        assert!(!filter.matches(&record(&[("animal", Value::from("cat"))])));
        assert_eq!(
            filter.timestamp_window(),
            (Some(utc(2012, 1, 1)), Some(utc(2012, 1, 8)))
        );
    }

    #[test]
    fn require_keys_skips_constrained_keys() {
        let filter = Query::new()
            .with_filter("animal", "dog")
            .to_storage_query()
            .require_keys(&["animal", "colour"]);
        assert_eq!(filter.conditions.len(), 2);
        assert!(!filter.matches(&record(&[("animal", Value::from("dog"))])));
        assert!(filter.matches(&record(&[
            ("animal", Value::from("dog")),
            ("colour", Value::from("brown")),
        ])));
    }

    #[test]
    fn sort_records_is_stable_and_checks_keys() -> Result<()> {
        let records = vec![
            record(&[("n", Value::from(2)), ("id", Value::from("a"))]),
            record(&[("n", Value::from(1)), ("id", Value::from("b"))]),
            record(&[("n", Value::from(2)), ("id", Value::from("c"))]),
        ];
        let sorted = sort_records(records.clone(), &Sort::descending("n"))?;
        let ids: Vec<_> = sorted.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![Value::from("a"), Value::from("c"), Value::from("b")]);

        assert!(sort_records(records.clone(), &Sort::ascending("missing")).is_err());

        let mut mixed = records;
        mixed.push(record(&[("n", Value::from("two"))]));
        let error = sort_records(mixed, &Sort::ascending("n")).unwrap_err();
        assert!(matches!(error, BucketError::InvalidSort(_)));
        Ok(())
    }
}
