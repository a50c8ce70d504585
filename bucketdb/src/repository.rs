use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::{
    error::{BucketError, Result},
    group::{aggregate, GroupNode},
    query::{sort_by_timestamp, validate_sort, Query, Sort},
    record::Record,
    storage::{save_with_retry, RetryPolicy, Storage},
};

/// Find, group and save for one bucket.
///
/// Sort specifications arrive as raw parts (`[key, direction]`) and are checked here, before the
/// storage is asked for anything.
pub struct Repository {
    storage: Arc<dyn Storage>,
    bucket: String,
    retry_policy: RetryPolicy,
}

impl Repository {
    pub fn new<S: Into<String>>(storage: Arc<dyn Storage>, bucket: S) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Matching records, sorted by `_timestamp` ascending unless another sort is given.
    ///
    /// Records without a `_timestamp` come first under the default order. A requested sort
    /// fails with [`BucketError::InvalidSort`] when its key is missing from any match.
    pub fn find(
        &self,
        query: &Query,
        sort: Option<&[String]>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>> {
        let filter = query.to_storage_query();
        match sort {
            Some(parts) => {
                let sort = validate_sort(parts)?;
                debug!(bucket = %self.bucket, sort = ?sort, limit = ?limit, "find");
                self.storage.find(&self.bucket, &filter, Some(&sort), limit)
            }
            None => {
                debug!(bucket = %self.bucket, limit = ?limit, "find by timestamp");
                let records = self.storage.find(&self.bucket, &filter, None, None)?;
                let mut records = sort_by_timestamp(records);
                if let Some(limit) = limit.filter(|&limit| limit > 0) {
                    records.truncate(limit);
                }
                Ok(records)
            }
        }
    }

    pub fn group(
        &self,
        key: &str,
        query: &Query,
        sort: Option<&[String]>,
        limit: Option<usize>,
        collect: &[String],
    ) -> Result<Vec<GroupNode>> {
        let sort = sort.map(validate_sort).transpose()?;
        self.group_by_keys(&[key.to_string()], query, sort, limit, collect)
    }

    /// Two-level grouping: `key1` groups at the top, `key2` inside each.
    pub fn multi_group(
        &self,
        key1: &str,
        key2: &str,
        query: &Query,
        sort: Option<&[String]>,
        limit: Option<usize>,
        collect: &[String],
    ) -> Result<Vec<GroupNode>> {
        if key1 == key2 {
            return Err(BucketError::Grouping(
                "Cannot group on two equal keys".to_string(),
            ));
        }
        let sort = sort.map(validate_sort).transpose()?;
        self.group_by_keys(
            &[key1.to_string(), key2.to_string()],
            query,
            sort,
            limit,
            collect,
        )
    }

    fn group_by_keys(
        &self,
        keys: &[String],
        query: &Query,
        sort: Option<Sort>,
        limit: Option<usize>,
        collect: &[String],
    ) -> Result<Vec<GroupNode>> {
        let filter = query.to_storage_query().require_keys(keys);
        let rows = self.storage.group(&self.bucket, keys, &filter, collect)?;
        debug!(bucket = %self.bucket, keys = ?keys, rows = rows.len(), "grouped rows");
        aggregate(keys, rows, sort.as_ref(), limit)
    }

    /// Stamps `_updated_at` and saves, retrying transient storage failures.
    pub fn save(&self, mut record: Record) -> Result<()> {
        record.stamp_updated_at(Utc::now());
        save_with_retry(
            self.storage.as_ref(),
            &self.retry_policy,
            &self.bucket,
            record,
        )?;
        info!(bucket = %self.bucket, "saved record");
        Ok(())
    }
}
