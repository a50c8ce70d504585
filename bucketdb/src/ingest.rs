//! CSV ingestion.
//!
//! Uploaded CSV files become raw records: the header row names the fields, `#` lines are
//! comments, a column named `comment` is dropped and rows with only empty values are skipped.
//! An optional schema types the columns in order.
use std::{io::Read, str::FromStr};

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Number, Value as Json};
use tracing::{debug, trace};

use crate::{
    error::{BucketError, Result},
    record::RawRecord,
    validation::matches_pattern,
    value::Value,
};

const COMMENT_COLUMN: &str = "comment";

const MORE_VALUES: &str = "Some rows in the CSV file contain more values than columns";
const FEWER_VALUES: &str = "Some rows in the CSV file contain fewer values than columns";

/// The type of a CSV column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum FieldKind {
    #[default]
    String,
    Int,
    Decimal,
    /// `YYYY-MM-DD`, stored as midnight UTC.
    Date,
    /// `YYYY-MM-DDTHH:MM:SS`, read as UTC.
    DateTime,
}

impl FromStr for FieldKind {
    type Err = BucketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "string" => Ok(FieldKind::String),
            "int" => Ok(FieldKind::Int),
            "decimal" => Ok(FieldKind::Decimal),
            "date" => Ok(FieldKind::Date),
            "datetime" => Ok(FieldKind::DateTime),
            other => Err(BucketError::Validation(format!(
                "Unknown field type: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for FieldKind {
    type Error = BucketError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Type and bounds for one column. Bounds are inclusive and apply to numeric kinds only.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type", default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl FieldSpec {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Reads a schema such as `[{"type": "int", "max": 100}, {}]`.
    pub fn schema_from_json(schema: &Json) -> Result<Vec<FieldSpec>> {
        Vec::<FieldSpec>::deserialize(schema)
            .map_err(|e| BucketError::Validation(format!("Invalid schema: {e}")))
    }

    /// Converts one cell, or returns `None` when it does not fit this spec.
    fn convert(&self, raw: &str) -> Option<Json> {
        match self.kind {
            FieldKind::String => Some(Json::String(raw.to_string())),
            FieldKind::Int => {
                let digits = raw.strip_prefix('-').unwrap_or(raw);
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let n: i64 = raw.parse().ok()?;
                self.in_bounds(n as f64).then(|| Json::from(n))
            }
            FieldKind::Decimal => {
                let n: f64 = raw.trim().parse().ok()?;
                if !self.in_bounds(n) {
                    return None;
                }
                Number::from_f64(n).map(Json::Number)
            }
            FieldKind::Date => {
                if !matches_pattern(raw.as_bytes(), b"dddd-dd-dd") {
                    return None;
                }
                let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
                let midnight = date.and_hms_opt(0, 0, 0)?;
                Some(Value::Timestamp(Utc.from_utc_datetime(&midnight)).to_json())
            }
            FieldKind::DateTime => {
                if !matches_pattern(raw.as_bytes(), b"dddd-dd-ddTdd:dd:dd") {
                    return None;
                }
                let datetime = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").ok()?;
                Some(Value::Timestamp(Utc.from_utc_datetime(&datetime)).to_json())
            }
        }
    }

    fn in_bounds(&self, n: f64) -> bool {
        self.min.map_or(true, |min| n >= min) && self.max.map_or(true, |max| n <= max)
    }
}

fn csv_error(error: csv::Error) -> BucketError {
    match error.kind() {
        csv::ErrorKind::Utf8 { .. } => BucketError::Parse("Non-UTF8 characters found.".to_string()),
        _ => BucketError::Parse(format!("Could not read CSV: {error}")),
    }
}

/// Parses CSV data into raw records.
///
/// Columns are typed by position when a schema is given; columns past the end of the schema
/// stay strings. Any cell that does not fit its spec fails the whole upload.
pub fn parse_csv<R: Read>(input: R, schema: Option<&[FieldSpec]>) -> Result<Vec<RawRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .flexible(true)
        .from_reader(input);
    let headers = reader.headers().map_err(csv_error)?.clone();
    trace!(columns = headers.len(), "read csv header");

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result.map_err(csv_error)?;
        if row.len() > headers.len() {
            return Err(BucketError::Parse(MORE_VALUES.to_string()));
        }
        if row.len() < headers.len() {
            return Err(BucketError::Parse(FEWER_VALUES.to_string()));
        }
        if row.iter().all(str::is_empty) {
            continue;
        }

        let cells = headers
            .iter()
            .zip(row.iter())
            .filter(|(header, _)| *header != COMMENT_COLUMN);
        let record: RawRecord = match schema {
            None => cells
                .map(|(header, cell)| (header.to_string(), Json::String(cell.to_string())))
                .collect(),
            Some(schema) => typed_record(cells, schema)?,
        };
        records.push(record);
    }
    debug!(records = records.len(), "parsed csv");
    Ok(records)
}

fn typed_record<'a, I>(cells: I, schema: &[FieldSpec]) -> Result<RawRecord>
where
    I: Iterator<Item = (&'a str, &'a str)>,
{
    let mut record = RawRecord::new();
    let mut errors = Vec::new();
    for (position, (header, cell)) in cells.enumerate() {
        let converted = match schema.get(position) {
            Some(spec) => spec.convert(cell),
            None => Some(Json::String(cell.to_string())),
        };
        match converted {
            Some(value) => {
                record.insert(header.to_string(), value);
            }
            None => errors.push(cell.to_string()),
        }
    }
    if errors.is_empty() {
        Ok(record)
    } else {
        Err(BucketError::Validation(format!(
            "Invalid data did not match the expected schema: {}",
            errors.join(", ")
        )))
    }
}

/// Turns rows of values into records, using the first row as field names.
pub fn make_records<I>(rows: I) -> Result<Vec<RawRecord>>
where
    I: IntoIterator<Item = Vec<Json>>,
{
    let mut rows = rows.into_iter();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let keys: Vec<String> = header
        .into_iter()
        .map(|cell| match cell {
            Json::String(s) => s,
            other => other.to_string(),
        })
        .collect();

    rows.map(|row| {
        if row.len() > keys.len() {
            return Err(BucketError::Parse(
                "Some rows contain more values than the header row".to_string(),
            ));
        }
        if row.len() < keys.len() {
            return Err(BucketError::Parse(
                "Some rows contain fewer values than the header row".to_string(),
            ));
        }
        Ok(keys.iter().cloned().zip(row).collect())
    })
    .collect()
}
