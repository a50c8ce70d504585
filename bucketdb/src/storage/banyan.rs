//! Bucket storage on banyan trees: one append-only stream per bucket.
//!
//! Each record is a leaf keyed by its `_timestamp`. Tree summaries carry the time span of their
//! subtree so reads with a `_timestamp` window skip branches that cannot match. Root links are
//! kept in memory and, when a state path is configured, persisted as JSON so a restarted process
//! can find its buckets again.
use std::{
    collections::BTreeMap,
    fs::File,
    ops::Bound,
    path::{Path, PathBuf},
    sync::RwLock,
};

use banyan::{
    index::{BranchIndex, LeafIndex, Summarizable, VecSeq},
    query::Query as BanyanQuery,
    store::{BlockWriter, BranchCache, MemStore as BanyanMemStore, ReadOnlyStore},
    Config, Forest, Secrets, StreamBuilder, Transaction, TreeTypes,
};
use banyan_utils::tags::Sha256Digest;
use libipld::{Cid, DagCbor};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::{BucketError, Result},
    query::{sort_records, Filter, Sort},
    record::Record,
    value::Value,
};

use super::Storage;

/// Block store capabilities needed by [`BanyanStorage`].
pub trait BucketStore:
    ReadOnlyStore<Sha256Digest> + BlockWriter<Sha256Digest> + Clone + Send + Sync + 'static
{
}

impl<S> BucketStore for S where
    S: ReadOnlyStore<Sha256Digest> + BlockWriter<Sha256Digest> + Clone + Send + Sync + 'static
{
}

pub type MemStore = BanyanMemStore<Sha256Digest>;

pub fn memory_store(max_size: usize) -> MemStore {
    MemStore::new(max_size, Sha256Digest::digest)
}

#[derive(Clone, Debug)]
pub(crate) struct RecordTreeTypes;

impl TreeTypes for RecordTreeTypes {
    type Key = TimeSpan;
    type Summary = TimeSpan;
    type KeySeq = VecSeq<TimeSpan>;
    type SummarySeq = VecSeq<TimeSpan>;
    type Link = Sha256Digest;
    const NONCE: &'static [u8; 24] = b"bucketdb_record_tree_nce";
}

/// Timestamp range, in microseconds, covered by a leaf or subtree.
///
/// Records without a `_timestamp` sit at `i64::MIN`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, DagCbor)]
pub(crate) struct TimeSpan {
    pub(crate) min_micros: i64,
    pub(crate) max_micros: i64,
    pub(crate) count: u64,
}

impl TimeSpan {
    fn of(record: &Record) -> Self {
        let micros = record
            .timestamp()
            .map_or(i64::MIN, |ts| ts.timestamp_micros());
        Self {
            min_micros: micros,
            max_micros: micros,
            count: 1,
        }
    }
}

impl Summarizable<TimeSpan> for VecSeq<TimeSpan> {
    fn summarize(&self) -> TimeSpan {
        self.as_ref().iter().fold(
            TimeSpan {
                min_micros: i64::MAX,
                max_micros: i64::MIN,
                count: 0,
            },
            |acc, span| TimeSpan {
                min_micros: acc.min_micros.min(span.min_micros),
                max_micros: acc.max_micros.max(span.max_micros),
                count: acc.count + span.count,
            },
        )
    }
}

/// Leaf payload: the record in its tagged JSON encoding.
#[derive(Clone, Debug, PartialEq, DagCbor)]
pub(crate) struct StoredRecord {
    json: String,
}

impl StoredRecord {
    fn encode(record: &Record) -> Result<Self> {
        let json = serde_json::to_string(record)
            .map_err(|e| BucketError::Storage(format!("Failed to encode record: {e}")))?;
        Ok(Self { json })
    }

    fn decode(&self) -> Result<Record> {
        serde_json::from_str(&self.json)
            .map_err(|e| BucketError::Storage(format!("Failed to decode record: {e}")))
    }
}

/// Prunes leaves and branches whose time span misses the requested window.
#[derive(Clone, Debug)]
pub(crate) struct TimeWindowQuery {
    /// Inclusive start, exclusive end, in microseconds.
    pub(crate) window_micros: (Bound<i64>, Bound<i64>),
}

impl TimeWindowQuery {
    fn from_filter(filter: &Filter) -> Self {
        let (start, end) = filter.timestamp_window();
        Self {
            window_micros: (
                start.map_or(Bound::Unbounded, |ts| Bound::Included(ts.timestamp_micros())),
                end.map_or(Bound::Unbounded, |ts| Bound::Excluded(ts.timestamp_micros())),
            ),
        }
    }

    fn overlaps(&self, span: &TimeSpan) -> bool {
        ranges_intersect(
            Bound::Included(span.min_micros),
            Bound::Included(span.max_micros),
            self.window_micros.0,
            self.window_micros.1,
        )
    }
}

fn ranges_intersect<T: PartialOrd>(
    r1_start: Bound<T>,
    r1_end: Bound<T>,
    r2_start: Bound<T>,
    r2_end: Bound<T>,
) -> bool {
    let r1_before_r2 = match (&r1_end, &r2_start) {
        (Bound::Included(e1), Bound::Included(s2)) => e1 < s2,
        (Bound::Excluded(e1), Bound::Included(s2))
        | (Bound::Included(e1), Bound::Excluded(s2))
        | (Bound::Excluded(e1), Bound::Excluded(s2)) => e1 <= s2,
        (_, Bound::Unbounded) | (Bound::Unbounded, _) => false,
    };
    let r2_before_r1 = match (&r2_end, &r1_start) {
        (Bound::Included(e2), Bound::Included(s1)) => e2 < s1,
        (Bound::Excluded(e2), Bound::Included(s1))
        | (Bound::Included(e2), Bound::Excluded(s1))
        | (Bound::Excluded(e2), Bound::Excluded(s1)) => e2 <= s1,
        (_, Bound::Unbounded) | (Bound::Unbounded, _) => false,
    };
    !r1_before_r2 && !r2_before_r1
}

impl BanyanQuery<RecordTreeTypes> for TimeWindowQuery {
    fn containing(&self, _offset: u64, index: &LeafIndex<RecordTreeTypes>, res: &mut [bool]) {
        for (i, key) in index.keys.as_ref().iter().enumerate() {
            res[i] = res[i] && self.overlaps(key);
        }
    }

    fn intersecting(&self, _offset: u64, index: &BranchIndex<RecordTreeTypes>, res: &mut [bool]) {
        for (i, summary) in index.summaries.as_ref().iter().enumerate() {
            res[i] = res[i] && self.overlaps(summary);
        }
        trace!(window = ?self.window_micros, kept = res.iter().filter(|r| **r).count(), "pruned branch");
    }
}

// Persisted state: bucket name to root CID.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageState {
    #[serde(default)]
    buckets: BTreeMap<String, String>,
}

/// [`Storage`] backed by a banyan block store.
pub struct BanyanStorage<S: BucketStore> {
    store: S,
    config: Config,
    secrets: Secrets,
    roots: RwLock<BTreeMap<String, Sha256Digest>>,
    state_path: Option<PathBuf>,
}

impl<S: BucketStore> BanyanStorage<S> {
    /// Creates storage with no buckets.
    pub fn new(store: S, config: Config, secrets: Secrets, state_path: Option<&Path>) -> Self {
        Self {
            store,
            config,
            secrets,
            roots: RwLock::new(BTreeMap::new()),
            state_path: state_path.map(Path::to_path_buf),
        }
    }

    /// Loads bucket roots from `state_path` when it exists, otherwise starts empty.
    pub fn load_or_initialize(
        store: S,
        config: Config,
        secrets: Secrets,
        state_path: Option<&Path>,
    ) -> Result<Self> {
        let storage = Self::new(store, config, secrets, state_path);
        if let Some(path) = state_path.filter(|path| path.exists()) {
            info!("Loading bucket roots from: {:?}", path);
            let roots = Self::load_state(path)?;
            info!("Loaded {} bucket roots", roots.len());
            *storage.write_roots()? = roots;
        }
        Ok(storage)
    }

    fn load_state(path: &Path) -> Result<BTreeMap<String, Sha256Digest>> {
        let file = File::open(path).map_err(|e| {
            BucketError::Storage(format!("Failed to open state file {:?}: {}", path, e))
        })?;
        let state: StorageState = serde_json::from_reader(file).map_err(|e| {
            BucketError::Storage(format!("Failed to deserialize state from {:?}: {}", path, e))
        })?;
        state
            .buckets
            .into_iter()
            .map(|(bucket, cid)| {
                let cid = Cid::try_from(cid.as_str()).map_err(|e| {
                    BucketError::Storage(format!("Invalid root for bucket {bucket}: {e}"))
                })?;
                let link = Sha256Digest::try_from(cid).map_err(|e| {
                    BucketError::Storage(format!("Invalid root for bucket {bucket}: {e}"))
                })?;
                Ok((bucket, link))
            })
            .collect()
    }

    fn save_state(&self, roots: &BTreeMap<String, Sha256Digest>) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let state = StorageState {
            buckets: roots
                .iter()
                .map(|(bucket, link)| (bucket.clone(), Cid::from(*link).to_string()))
                .collect(),
        };
        let file = File::create(path).map_err(|e| {
            BucketError::Storage(format!("Failed to create state file {:?}: {}", path, e))
        })?;
        serde_json::to_writer_pretty(file, &state).map_err(|e| {
            BucketError::Storage(format!("Failed to serialize state to {:?}: {}", path, e))
        })?;
        debug!(buckets = roots.len(), "Saved storage state to {:?}", path);
        Ok(())
    }

    pub fn root(&self, bucket: &str) -> Result<Option<Sha256Digest>> {
        Ok(self.read_roots()?.get(bucket).copied())
    }

    fn forest(&self) -> Forest<RecordTreeTypes, S> {
        Forest::new(self.store.clone(), BranchCache::new(1024))
    }

    fn read_roots(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Sha256Digest>>> {
        self.roots
            .read()
            .map_err(|e| BucketError::Storage(format!("bucket roots lock poisoned: {e}")))
    }

    fn write_roots(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Sha256Digest>>> {
        self.roots
            .write()
            .map_err(|e| BucketError::Storage(format!("bucket roots lock poisoned: {e}")))
    }

    /// All records of `bucket` in the window, oldest write first.
    ///
    /// Only the latest write of an `_id` over the whole stream counts, placed where the first
    /// write of that `_id` was. A stale version inside the window is dropped when a newer one
    /// lies outside it.
    fn scan(&self, bucket: &str, query: TimeWindowQuery) -> Result<Vec<Record>> {
        let Some(link) = self.root(bucket)? else {
            debug!(bucket, "Bucket has no data yet");
            return Ok(Vec::new());
        };
        let forest = self.forest();
        let tree = forest.load_tree::<StoredRecord>(self.secrets.clone(), link)?;

        let mut windowed = Vec::new();
        for chunk in forest.iter_filtered_chunked(&tree, query, &|_| ()) {
            let chunk = chunk?;
            for (offset, _key, stored) in chunk.data {
                windowed.push((offset, stored.decode()?));
            }
        }
        if windowed.iter().all(|(_, record)| record.id().is_none()) {
            return Ok(windowed.into_iter().map(|(_, record)| record).collect());
        }

        // first and last offset per id, over every leaf
        let mut versions: BTreeMap<Value, (u64, u64)> = BTreeMap::new();
        for item in forest.iter_from(&tree) {
            let (offset, _key, stored) = item?;
            if let Some(id) = stored.decode()?.id().cloned() {
                versions
                    .entry(id)
                    .and_modify(|(_, last)| *last = offset)
                    .or_insert((offset, offset));
            }
        }
        trace!(bucket, ids = versions.len(), "resolved id versions");

        let mut records: Vec<(u64, Record)> = windowed
            .into_iter()
            .filter_map(|(offset, record)| {
                match record.id().and_then(|id| versions.get(id)) {
                    Some(&(first, last)) => (offset == last).then_some((first, record)),
                    None => Some((offset, record)),
                }
            })
            .collect();
        records.sort_by_key(|(position, _)| *position);
        Ok(records.into_iter().map(|(_, record)| record).collect())
    }
}

impl<S: BucketStore> Storage for BanyanStorage<S> {
    fn find(
        &self,
        bucket: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>> {
        let query = TimeWindowQuery::from_filter(filter);
        debug!(bucket, window = ?query.window_micros, "banyan find");
        let matched: Vec<Record> = self
            .scan(bucket, query)?
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect();

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
        let mut roots = self.write_roots()?;
        let mut txn = Transaction::new(self.forest(), self.store.clone());
        let mut builder = match roots.get(bucket) {
            Some(link) => {
                txn.load_stream_builder(self.secrets.clone(), self.config.clone(), *link)?
            }
            None => StreamBuilder::new(self.config.clone(), self.secrets.clone()),
        };

        txn.extend(
            &mut builder,
            vec![(TimeSpan::of(&record), StoredRecord::encode(&record)?)],
        )?;
        let tree = builder.snapshot();
        let link = *tree.root().ok_or_else(|| {
            BucketError::Storage(format!("No root link after extending bucket {bucket}"))
        })?;
        trace!(bucket, root = %Cid::from(link), "extended bucket stream");
        drop(txn);

        roots.insert(bucket.to_string(), link);
        if let Err(e) = self.save_state(&roots) {
            error!("Failed to save storage state after write: {}", e);
            return Err(e);
        }
        Ok(())
    }

    fn alive(&self) -> bool {
        let roots = match self.read_roots() {
            Ok(roots) => roots,
            Err(e) => {
                warn!("{}", e);
                return false;
            }
        };
        match roots.iter().next() {
            Some((bucket, link)) => match self.store.get(link) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Block store cannot read the root of bucket {}: {}", bucket, e);
                    false
                }
            },
            None => true,
        }
    }
}
