use std::sync::Arc;

use serde_json::Value as Json;
use tracing::{debug, info};

use crate::{
    error::{BucketError, Result},
    group::GroupNode,
    query::Query,
    record::{RawRecord, Record},
    repository::Repository,
    storage::Storage,
    validation::{key_is_reserved, key_is_valid, validate_record_data},
};

/// A handle on one storage backend, shared by every bucket opened through it.
#[derive(Clone)]
pub struct Database {
    storage: Arc<dyn Storage>,
    name: String,
}

impl Database {
    pub fn new<S: Into<String>>(storage: Arc<dyn Storage>, name: S) -> Self {
        Self {
            storage,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alive(&self) -> bool {
        self.storage.alive()
    }

    pub fn get_repository(&self, bucket: &str) -> Repository {
        Repository::new(self.storage.clone(), bucket)
    }
}

/// The outcome of [`Bucket::query`].
#[derive(Clone, Debug, PartialEq)]
pub enum ResultSet {
    Records(Vec<Record>),
    Groups(Vec<GroupNode>),
}

impl ResultSet {
    pub fn len(&self) -> usize {
        match self {
            ResultSet::Records(records) => records.len(),
            ResultSet::Groups(groups) => groups.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The result rendered as a JSON array.
    pub fn data(&self) -> Json {
        match self {
            ResultSet::Records(records) => records.iter().map(Record::to_json).collect(),
            ResultSet::Groups(groups) => groups.iter().map(GroupNode::to_json).collect(),
        }
    }
}

/// A named collection of records.
pub struct Bucket {
    name: String,
    repository: Repository,
}

impl Bucket {
    pub fn new<S: Into<String>>(db: &Database, name: S) -> Result<Self> {
        let name = name.into();
        if !key_is_valid(&name) || key_is_reserved(&name) {
            return Err(BucketError::Validation(format!(
                "{name} is not a valid bucket name"
            )));
        }
        let repository = db.get_repository(&name);
        Ok(Self { name, repository })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validates every record, then parses and saves them one at a time.
    ///
    /// Nothing is saved when any record fails validation. A storage failure part way through
    /// leaves the records before it saved.
    pub fn store(&self, records: Vec<RawRecord>) -> Result<usize> {
        for raw in &records {
            validate_record_data(raw).into_result()?;
        }
        let records = records
            .into_iter()
            .map(Record::parse)
            .collect::<Result<Vec<_>>>()?;
        let stored = records.len();
        for record in records {
            self.repository.save(record)?;
        }
        info!(bucket = %self.name, stored, "stored records");
        Ok(stored)
    }

    pub fn query(&self, query: &Query) -> Result<ResultSet> {
        let keys = query.group_keys();
        let sort = query.sort_by.clone().or_else(|| match (&query.group_by, query.period) {
            (None, Some(period)) => Some(vec![period.key().to_string(), "ascending".to_string()]),
            _ => None,
        });
        debug!(bucket = %self.name, keys = ?keys, sort = ?sort, "query");

        let result = match keys.as_slice() {
            [] => ResultSet::Records(self.repository.find(query, sort.as_deref(), query.limit)?),
            [key] => ResultSet::Groups(self.repository.group(
                key,
                query,
                sort.as_deref(),
                query.limit,
                &query.collect,
            )?),
            [key1, key2] => ResultSet::Groups(self.repository.multi_group(
                key1,
                key2,
                query,
                sort.as_deref(),
                query.limit,
                &query.collect,
            )?),
            _ => {
                return Err(BucketError::Grouping(
                    "Cannot group on more than two keys".to_string(),
                ))
            }
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{period::Period, query::Sort, storage::MemoryStorage, value::Value};
    use serde_json::json;

    fn raw(value: Json) -> RawRecord {
        match value {
            Json::Object(map) => map,
            _ => panic!("test records are objects"),
        }
    }

    fn setup() -> (Arc<MemoryStorage>, Bucket) {
        let storage = Arc::new(MemoryStorage::new());
        let db = Database::new(storage.clone(), "test");
        let bucket = Bucket::new(&db, "foo").unwrap();
        (storage, bucket)
    }

    #[test]
    fn bucket_names_follow_the_key_grammar() {
        let db = Database::new(Arc::new(MemoryStorage::new()), "test");
        assert!(Bucket::new(&db, "my-bucket").is_ok());
        assert!(matches!(
            Bucket::new(&db, "_private"),
            Err(BucketError::Validation(_))
        ));
        assert!(Bucket::new(&db, "has space").is_err());
        assert!(Bucket::new(&db, "").is_err());
    }

    #[test]
    fn store_aborts_on_the_first_invalid_record() -> Result<()> {
        let (storage, bucket) = setup();
        let error = bucket
            .store(vec![
                raw(json!({"name": "ok"})),
                raw(json!({"_bad": "x"})),
                raw(json!({"name": ["not", "scalar"]})),
            ])
            .unwrap_err();
        assert!(matches!(error, BucketError::Validation(m) if m.contains("_bad")));
        assert_eq!(storage.len("foo")?, 0);
        Ok(())
    }

    #[test]
    fn store_parses_timestamps_and_adds_period_keys() -> Result<()> {
        let (_, bucket) = setup();
        bucket.store(vec![raw(json!({"_timestamp": "2012-12-12T12:12:12+00:00", "n": 1}))])?;
        let ResultSet::Records(records) = bucket.query(&Query::new())? else {
            panic!("expected records");
        };
        let record = &records[0];
        assert!(record.timestamp().is_some());
        assert!(record.contains_key("_week_start_at"));
        assert!(record.contains_key("_updated_at"));
        Ok(())
    }

    #[test]
    fn query_dispatches_on_grouping_keys() -> Result<()> {
        let (_, bucket) = setup();
        bucket.store(vec![
            raw(json!({"_timestamp": "2012-12-03T10:00:00+00:00", "kind": "a"})),
            raw(json!({"_timestamp": "2012-12-04T10:00:00+00:00", "kind": "b"})),
            raw(json!({"_timestamp": "2012-12-11T10:00:00+00:00", "kind": "a"})),
        ])?;

        assert!(matches!(bucket.query(&Query::new())?, ResultSet::Records(r) if r.len() == 3));

        let grouped = bucket.query(&Query::new().with_group_by("kind"))?;
        assert_eq!(grouped.len(), 2);

        let nested = bucket.query(&Query::new().with_group_by("kind").with_period(Period::Week))?;
        let ResultSet::Groups(groups) = nested else {
            panic!("expected groups");
        };
        let a = groups
            .iter()
            .find(|g| g.get("kind") == Some(Value::from("a")))
            .unwrap();
        assert_eq!(a.count(), 2);
        assert_eq!(a.children().len(), 2);
        Ok(())
    }

    #[test]
    fn period_queries_default_to_ascending_period_order() -> Result<()> {
        let (_, bucket) = setup();
        bucket.store(vec![
            raw(json!({"_timestamp": "2012-12-20T10:00:00+00:00"})),
            raw(json!({"_timestamp": "2012-12-03T10:00:00+00:00"})),
            raw(json!({"_timestamp": "2012-12-11T10:00:00+00:00"})),
        ])?;
        let result = bucket.query(&Query::new().with_period(Period::Week))?;
        let data = result.data();
        let starts: Vec<&str> = data
            .as_array()
            .unwrap()
            .iter()
            .map(|g| g["_week_start_at"].as_str().unwrap())
            .collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);

        let result = bucket.query(
            &Query::new()
                .with_period(Period::Week)
                .with_sort(Sort::descending("_week_start_at"))
                .with_limit(1),
        )?;
        assert_eq!(result.len(), 1);
        assert_eq!(
            result.data()[0]["_week_start_at"].as_str(),
            starts.last().copied()
        );
        Ok(())
    }
}
