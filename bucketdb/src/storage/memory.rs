use std::{collections::BTreeMap, sync::RwLock};

use tracing::{debug, trace};

use crate::{
    error::{BucketError, Result},
    query::{sort_records, Filter, Sort},
    record::Record,
};

use super::Storage;

/// Buckets held in process memory. Saving a record whose `_id` is already stored replaces it.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<BTreeMap<String, Vec<Record>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, bucket: &str) -> Result<usize> {
        let buckets = self.read()?;
        Ok(buckets.get(bucket).map_or(0, Vec::len))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<Record>>>> {
        self.buckets
            .read()
            .map_err(|e| BucketError::Storage(format!("memory storage lock poisoned: {e}")))
    }
}

impl Storage for MemoryStorage {
    fn find(
        &self,
        bucket: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>> {
        let matched: Vec<Record> = {
            let buckets = self.read()?;
            buckets
                .get(bucket)
                .map(|records| {
                    records
                        .iter()
                        .filter(|record| filter.matches(record))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        trace!(bucket, matched = matched.len(), "memory find");

        let mut records = match sort {
            Some(sort) => sort_records(matched, sort)?,
            None => matched,
        };
        if let Some(limit) = limit.filter(|&limit| limit > 0) {
            records.truncate(limit);
        }
        Ok(records)
    }

    fn save(&self, bucket: &str, record: Record) -> Result<()> {
        let mut buckets = self
            .buckets
            .write()
            .map_err(|e| BucketError::Storage(format!("memory storage lock poisoned: {e}")))?;
        let records = buckets.entry(bucket.to_string()).or_default();
        let existing = record
            .id()
            .and_then(|id| records.iter().position(|stored| stored.id() == Some(id)));
        match existing {
            Some(position) => {
                debug!(bucket, id = ?record.id(), "replacing record");
                records[position] = record;
            }
            None => records.push(record),
        }
        Ok(())
    }

    fn alive(&self) -> bool {
        self.buckets.read().is_ok()
    }
}
