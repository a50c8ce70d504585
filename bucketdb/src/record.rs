use std::{
    collections::BTreeMap,
    ops::{Deref, DerefMut},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{BucketError, Result},
    period::{parse_time_string, PERIODS},
    value::Value,
};

/// A record as received from a client: an ordered JSON object, not yet validated.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

pub const TIMESTAMP_KEY: &str = "_timestamp";
pub const ID_KEY: &str = "_id";
pub const UPDATED_AT_KEY: &str = "_updated_at";

/// One stored datum: a flat mapping of field name to scalar value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts a validated raw record. `_timestamp` becomes a timestamp value and the period
    /// start keys derived from it are added.
    pub fn parse(raw: RawRecord) -> Result<Self> {
        let mut record = Record::new();
        for (key, value) in raw {
            let value = if key == TIMESTAMP_KEY {
                match value.as_str() {
                    Some(s) => Value::Timestamp(parse_time_string(s)?),
                    None => {
                        return Err(BucketError::Validation(format!(
                            "{key} is not a valid datetime object"
                        )))
                    }
                }
            } else {
                Value::from_json(&value).ok_or_else(|| {
                    BucketError::Validation(format!("{key} has an invalid value"))
                })?
            };
            record.values.insert(key, value);
        }
        record.add_period_keys();
        Ok(record)
    }

    fn add_period_keys(&mut self) {
        if let Some(ts) = self.timestamp() {
            for period in PERIODS {
                self.values
                    .insert(period.key().to_string(), Value::Timestamp(period.start_of(ts)));
            }
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.values.get(TIMESTAMP_KEY).and_then(Value::as_timestamp)
    }

    pub fn id(&self) -> Option<&Value> {
        self.values.get(ID_KEY)
    }

    pub fn stamp_updated_at(&mut self, now: DateTime<Utc>) {
        self.values
            .insert(UPDATED_AT_KEY.to_string(), Value::Timestamp(now));
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(key, value)| (key.clone(), value.to_json()))
                .collect(),
        )
    }
}

impl Deref for Record {
    type Target = BTreeMap<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.values
    }
}

impl DerefMut for Record {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.values
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl From<BTreeMap<String, Value>> for Record {
    fn from(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawRecord {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("test records must be objects"),
        }
    }

    #[test]
    fn parse_converts_timestamp_and_adds_period_keys() -> Result<()> {
        let record = Record::parse(raw(json!({
            "_timestamp": "2013-05-16T17:33:31+01:00",
            "name": "bottle",
            "size": 123,
        })))?;

        let ts = Utc.with_ymd_and_hms(2013, 5, 16, 16, 33, 31).unwrap();
        assert_eq!(record.timestamp(), Some(ts));
        assert_eq!(record.get("name"), Some(&Value::from("bottle")));
        assert_eq!(record.get("size"), Some(&Value::from(123)));
        assert_eq!(
            record.get("_week_start_at"),
            Some(&Value::from(Utc.with_ymd_and_hms(2013, 5, 13, 0, 0, 0).unwrap()))
        );
        assert_eq!(
            record.get("_hour_start_at"),
            Some(&Value::from(Utc.with_ymd_and_hms(2013, 5, 16, 16, 0, 0).unwrap()))
        );
        assert!(record.contains_key("_day_start_at"));
        assert!(record.contains_key("_month_start_at"));
        Ok(())
    }

    #[test]
    fn records_without_timestamp_get_no_period_keys() -> Result<()> {
        let record = Record::parse(raw(json!({"name": "mug"})))?;
        assert_eq!(record.len(), 1);
        Ok(())
    }

    #[test]
    fn parse_rejects_non_scalar_values() {
        let error = Record::parse(raw(json!({"tags": ["a", "b"]}))).unwrap_err();
        assert!(matches!(error, BucketError::Validation(m) if m == "tags has an invalid value"));
    }

    #[test]
    fn to_json_renders_plain_values() -> Result<()> {
        let mut record = Record::parse(raw(json!({"_id": "abc", "count": 3})))?;
        record.stamp_updated_at(Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(
            record.to_json(),
            json!({
                "_id": "abc",
                "_updated_at": "2014-01-01T00:00:00+00:00",
                "count": 3,
            })
        );
        Ok(())
    }
}
