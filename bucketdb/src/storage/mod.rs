//! Storage collaborators behind the repository.
use tracing::warn;

use crate::{
    error::Result,
    group::{reduce_rows, GroupRow},
    query::{Filter, Sort},
    record::Record,
};

#[cfg(feature = "banyan-store")]
mod banyan;
mod memory;

#[cfg(feature = "banyan-store")]
pub use banyan::{memory_store, BanyanStorage, BucketStore, MemStore};
pub use memory::MemoryStorage;

/// Find, group and save primitives over named buckets.
///
/// `save` reports connection loss as [`crate::BucketError::TransientStorage`] so callers can
/// retry, and anything else as a permanent failure.
pub trait Storage: Send + Sync {
    /// Records in `bucket` matching `filter`, sorted and capped as requested. A limit of 0
    /// means no limit.
    fn find(
        &self,
        bucket: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>>;

    /// One partially reduced row per distinct combination of `keys` among matching records.
    fn group(
        &self,
        bucket: &str,
        keys: &[String],
        filter: &Filter,
        collect: &[String],
    ) -> Result<Vec<GroupRow>> {
        let records = self.find(bucket, filter, None, None)?;
        Ok(reduce_rows(keys, collect, records))
    }

    fn save(&self, bucket: &str, record: Record) -> Result<()>;

    fn alive(&self) -> bool;
}

/// How often a save is attempted before a transient failure is given up on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    /// Default: 3
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Runs `operation` until it succeeds, fails permanently, or attempts run out.
    pub fn execute<T, F>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match operation() {
                Err(e) if e.is_transient() && self.should_retry(attempt) => {
                    warn!(
                        "Storage operation failed (attempt {}/{}), retrying: {}",
                        attempt, self.max_attempts, e
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Saves `record`, retrying transient failures according to `policy`.
pub fn save_with_retry(
    storage: &dyn Storage,
    policy: &RetryPolicy,
    bucket: &str,
    record: Record,
) -> Result<()> {
    policy.execute(|| storage.save(bucket, record.clone()))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::BucketError;

    /// Fails the first `failures` saves with a transient error, then delegates.
    pub(crate) struct FlakyStorage {
        pub(crate) inner: MemoryStorage,
        pub(crate) failures: u32,
        pub(crate) attempts: AtomicU32,
    }

    impl FlakyStorage {
        pub(crate) fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStorage::new(),
                failures,
                attempts: AtomicU32::new(0),
            }
        }
    }

    impl Storage for FlakyStorage {
        fn find(
            &self,
            bucket: &str,
            filter: &Filter,
            sort: Option<&Sort>,
            limit: Option<usize>,
        ) -> Result<Vec<Record>> {
            self.inner.find(bucket, filter, sort, limit)
        }

        fn save(&self, bucket: &str, record: Record) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(BucketError::TransientStorage("connection reset".into()))
            } else {
                self.inner.save(bucket, record)
            }
        }

        fn alive(&self) -> bool {
            true
        }
    }

    #[test]
    fn retry_succeeds_after_transient_failures() -> Result<()> {
        let storage = FlakyStorage::new(2);
        save_with_retry(&storage, &RetryPolicy::default(), "b", Record::new())?;
        assert_eq!(storage.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(storage.find("b", &Filter::new(), None, None)?.len(), 1);
        Ok(())
    }

    #[test]
    fn retry_gives_up_after_three_attempts() {
        let storage = FlakyStorage::new(5);
        let error =
            save_with_retry(&storage, &RetryPolicy::default(), "b", Record::new()).unwrap_err();
        assert!(error.is_transient());
        assert_eq!(storage.attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result: Result<()> = policy.execute(|| {
            calls += 1;
            Err(BucketError::Storage("disk full".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
