mod bucket;
mod config;
mod error;
mod group;
mod ingest;
mod period;
mod permissions;
mod query;
mod query_validation;
mod record;
mod repository;
mod service;
mod storage;
mod validation;
mod value;

pub use bucket::{Bucket, Database, ResultSet};
pub use config::{Backend, Config, StorageConfig};
pub use error::{BucketError, Result};
pub use group::{
    aggregate, nested_merge, reduce_rows, sort_groups, Accumulator, Collected, GroupNode, GroupRow,
    COUNT_KEY, GROUP_COUNT_KEY, SUBGROUP_KEY,
};
pub use ingest::{make_records, parse_csv, FieldKind, FieldSpec};
pub use period::{parse_time_string, Period, PERIODS};
pub use permissions::{extract_bearer_token, BucketTokens, Permissions};
pub use query::{
    sort_by_timestamp, sort_records, validate_sort, Condition, Direction, Filter, Query, Sort,
};
pub use query_validation::validate_request_args;
pub use record::{RawRecord, Record, ID_KEY, TIMESTAMP_KEY, UPDATED_AT_KEY};
pub use repository::Repository;
pub use service::{Response, Service};
pub use storage::{save_with_retry, MemoryStorage, RetryPolicy, Storage};
#[cfg(feature = "banyan-store")]
pub use storage::{memory_store, BanyanStorage, BucketStore, MemStore};
pub use validation::{
    key_is_internal, key_is_reserved, key_is_valid, validate_record_data, value_is_valid,
    value_is_valid_datetime_string, value_is_valid_id, ValidationResult,
};
pub use value::Value;
