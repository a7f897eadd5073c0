//! In-process data store
//!
//! Keeps an append-only log of record insertions and deletions per store.
//! An ascending cursor is the sequence number of the last log entry a query
//! consumed. A descending cursor is the (time, sequence) key of the oldest
//! record returned, and the next read continues below it.

use super::types::{
    AccessStatus, CountPage, CountQuery, DateRange, IncrementalQuery, QueryResult,
};
use super::DataStore;
use crate::error::{Error, Result, ResultExt};
use crate::types::{Cursor, DeletionMarker, Record, RecordType, SortOrder};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Seconds, subsecond nanos and sequence number, big endian
const NEWEST_FIRST_CURSOR_LEN: usize = 8 + 4 + 8;

/// Position of a record in a newest-first walk
type NewestFirstKey = (i64, u32, u64);

#[derive(Debug, Clone)]
enum Item {
    Record(Record),
    Deletion(DeletionMarker),
}

impl Item {
    fn record_type(&self) -> &RecordType {
        match self {
            Item::Record(r) => &r.record_type,
            Item::Deletion(d) => &d.record_type,
        }
    }
}

#[derive(Debug, Clone)]
struct LogEntry {
    seq: u64,
    item: Item,
}

#[derive(Debug, Default)]
struct Log {
    next_seq: u64,
    entries: Vec<LogEntry>,
}

impl Log {
    fn append(&mut self, item: Item) -> u64 {
        self.next_seq += 1;
        self.entries.push(LogEntry {
            seq: self.next_seq,
            item,
        });
        self.next_seq
    }

    fn after<'a>(
        &'a self,
        seq: u64,
        record_type: &'a RecordType,
    ) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.seq > seq && e.item.record_type() == record_type)
    }
}

/// Seed document accepted by [`MemoryDataStore::from_json_file`]
#[derive(Debug, Default, Deserialize)]
struct SeedFile {
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default)]
    deletions: Vec<DeletionMarker>,
}

/// Data store held entirely in memory
#[derive(Debug, Clone)]
pub struct MemoryDataStore {
    log: Arc<RwLock<Log>>,
    changes: broadcast::Sender<RecordType>,
    access_granted: Arc<AtomicBool>,
}

impl Default for MemoryDataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDataStore {
    /// Create an empty store with access granted
    pub fn new() -> Self {
        Self::with_log(Log::default())
    }

    /// Create a store holding `records`, in order
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut log = Log::default();
        for record in records {
            log.append(Item::Record(record));
        }
        Self::with_log(log)
    }

    /// Load records and deletions from a JSON seed file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read source seed {}", path.display()))?;
        let seed: SeedFile = serde_json::from_str(&content)?;

        let mut log = Log::default();
        for record in seed.records {
            log.append(Item::Record(record));
        }
        for deletion in seed.deletions {
            log.append(Item::Deletion(deletion));
        }
        debug!(entries = log.entries.len(), "Seeded memory data store");
        Ok(Self::with_log(log))
    }

    fn with_log(log: Log) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            log: Arc::new(RwLock::new(log)),
            changes,
            access_granted: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Append a record and notify observers
    pub async fn insert(&self, record: Record) {
        let record_type = record.record_type.clone();
        self.log.write().await.append(Item::Record(record));
        self.notify(record_type);
    }

    /// Append several records, notifying once per type
    pub async fn insert_many(&self, records: impl IntoIterator<Item = Record>) {
        let mut touched = BTreeSet::new();
        {
            let mut log = self.log.write().await;
            for record in records {
                touched.insert(record.record_type.clone());
                log.append(Item::Record(record));
            }
        }
        for record_type in touched {
            self.notify(record_type);
        }
    }

    /// Remove a record and append a deletion marker for it
    pub async fn delete(&self, id: &str, record_type: &RecordType) {
        {
            let mut log = self.log.write().await;
            log.entries.retain(|e| match &e.item {
                Item::Record(r) => !(r.id == id && &r.record_type == record_type),
                Item::Deletion(_) => true,
            });
            log.append(Item::Deletion(DeletionMarker::new(id, record_type.clone())));
        }
        self.notify(record_type.clone());
    }

    /// Number of live records of a type
    pub async fn record_count(&self, record_type: &RecordType) -> usize {
        self.log
            .read()
            .await
            .after(0, record_type)
            .filter(|e| matches!(e.item, Item::Record(_)))
            .count()
    }

    /// Grant or deny access
    pub fn set_access(&self, granted: bool) {
        self.access_granted.store(granted, Ordering::SeqCst);
    }

    fn notify(&self, record_type: RecordType) {
        // No receivers is fine; nobody is observing yet
        let _ = self.changes.send(record_type);
    }
}

fn encode_cursor(seq: u64) -> Cursor {
    Cursor::new(seq.to_be_bytes().to_vec())
}

fn decode_cursor(cursor: Option<&Cursor>, record_type: &RecordType) -> Result<u64> {
    let Some(cursor) = cursor else {
        return Ok(0);
    };
    let bytes: [u8; 8] = cursor
        .as_bytes()
        .try_into()
        .map_err(|_| unrecognized_cursor(record_type))?;
    Ok(u64::from_be_bytes(bytes))
}

fn newest_first_key(record: &Record, seq: u64) -> NewestFirstKey {
    (record.time.timestamp(), record.time.timestamp_subsec_nanos(), seq)
}

fn encode_newest_first_cursor((secs, nanos, seq): NewestFirstKey) -> Cursor {
    let mut bytes = Vec::with_capacity(NEWEST_FIRST_CURSOR_LEN);
    bytes.extend_from_slice(&secs.to_be_bytes());
    bytes.extend_from_slice(&nanos.to_be_bytes());
    bytes.extend_from_slice(&seq.to_be_bytes());
    Cursor::new(bytes)
}

fn decode_newest_first_cursor(
    cursor: Option<&Cursor>,
    record_type: &RecordType,
) -> Result<Option<NewestFirstKey>> {
    let Some(cursor) = cursor else {
        return Ok(None);
    };
    let bytes = cursor.as_bytes();
    if bytes.len() != NEWEST_FIRST_CURSOR_LEN {
        return Err(unrecognized_cursor(record_type));
    }
    let (secs, rest) = bytes.split_at(8);
    let (nanos, seq) = rest.split_at(4);
    let secs = secs.try_into().map_err(|_| unrecognized_cursor(record_type))?;
    let nanos = nanos.try_into().map_err(|_| unrecognized_cursor(record_type))?;
    let seq = seq.try_into().map_err(|_| unrecognized_cursor(record_type))?;
    Ok(Some((
        i64::from_be_bytes(secs),
        u32::from_be_bytes(nanos),
        u64::from_be_bytes(seq),
    )))
}

fn unrecognized_cursor(record_type: &RecordType) -> Error {
    Error::source_query(record_type.as_str(), "unrecognized cursor")
}

/// Records in log order after the cursor, with deletions
fn read_log_order(log: &Log, query: &IncrementalQuery) -> Result<QueryResult> {
    let after = decode_cursor(query.cursor.as_ref(), &query.record_type)?;

    let mut result = QueryResult::default();
    let mut last_seq = None;
    for entry in log.after(after, &query.record_type) {
        if result.len() >= query.limit {
            break;
        }
        match &entry.item {
            Item::Record(record) => {
                if query.window.contains(record.time) {
                    result.records.push(record.clone());
                }
            }
            Item::Deletion(deletion) => result.deletions.push(deletion.clone()),
        }
        last_seq = Some(entry.seq);
    }

    result.cursor = last_seq.map(encode_cursor).or_else(|| query.cursor.clone());
    Ok(result)
}

/// Records inside the window, newest first, strictly older than the cursor
fn read_newest_first(log: &Log, query: &IncrementalQuery) -> Result<QueryResult> {
    let before = decode_newest_first_cursor(query.cursor.as_ref(), &query.record_type)?;

    let mut candidates: Vec<(NewestFirstKey, &Record)> = log
        .after(0, &query.record_type)
        .filter_map(|entry| match &entry.item {
            Item::Record(record) if query.window.contains(record.time) => {
                Some((newest_first_key(record, entry.seq), record))
            }
            _ => None,
        })
        .filter(|(key, _)| before.map_or(true, |before| *key < before))
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.truncate(query.limit);

    Ok(QueryResult {
        cursor: candidates
            .last()
            .map(|(key, _)| encode_newest_first_cursor(*key))
            .or_else(|| query.cursor.clone()),
        records: candidates.into_iter().map(|(_, r)| r.clone()).collect(),
        deletions: Vec::new(),
    })
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn query_incremental(&self, query: &IncrementalQuery) -> Result<QueryResult> {
        let log = self.log.read().await;
        match query.order {
            SortOrder::Ascending => read_log_order(&log, query),
            SortOrder::Descending => read_newest_first(&log, query),
        }
    }

    async fn query_full_range(&self, record_type: &RecordType) -> Result<Option<DateRange>> {
        let log = self.log.read().await;
        let range = log
            .after(0, record_type)
            .filter_map(|e| match &e.item {
                Item::Record(r) => Some(r.time),
                Item::Deletion(_) => None,
            })
            .fold(None, |range: Option<DateRange>, t| {
                Some(match range {
                    None => DateRange {
                        earliest: t,
                        latest: t,
                    },
                    Some(r) => DateRange {
                        earliest: r.earliest.min(t),
                        latest: r.latest.max(t),
                    },
                })
            });
        Ok(range)
    }

    async fn count_records(&self, query: &CountQuery) -> Result<CountPage> {
        let after = decode_cursor(query.cursor.as_ref(), &query.record_type)?;
        let log = self.log.read().await;

        let mut page = CountPage::default();
        let mut scanned = 0;
        let mut last_seq = None;
        for entry in log.after(after, &query.record_type).take(query.page_size) {
            scanned += 1;
            last_seq = Some(entry.seq);
            if let Item::Record(record) = &entry.item {
                if query.window.contains(record.time) {
                    page.count += 1;
                    page.earliest = Some(page.earliest.map_or(record.time, |e| e.min(record.time)));
                    page.latest = Some(page.latest.map_or(record.time, |l| l.max(record.time)));
                }
            }
        }

        page.cursor = last_seq.map(encode_cursor).or_else(|| query.cursor.clone());
        page.done = scanned < query.page_size;
        Ok(page)
    }

    fn observe_changes(&self) -> broadcast::Receiver<RecordType> {
        self.changes.subscribe()
    }

    async fn request_access(&self, _types: &[RecordType]) -> Result<AccessStatus> {
        if self.access_granted.load(Ordering::SeqCst) {
            Ok(AccessStatus::Granted)
        } else {
            Ok(AccessStatus::Denied)
        }
    }
}
