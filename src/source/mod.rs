//! Data source module
//!
//! The local, append-mostly store that records are read from.
//!
//! # Overview
//!
//! The source module provides:
//! - `DataStore` - Trait for incremental, cursor-based reads, counting and change notification
//! - `MemoryDataStore` - In-process implementation whose cursor is a sequence number
//! - Query/result types shared with the readers

mod memory;
mod types;

pub use memory::MemoryDataStore;
pub use types::{
    AccessStatus, CountPage, CountQuery, DateRange, FenceWindow, IncrementalQuery, QueryResult,
};

use crate::error::Result;
use crate::types::RecordType;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Local store the engine reads records from
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Records and deletions added since the query's cursor, bounded by its window and limit
    async fn query_incremental(&self, query: &IncrementalQuery) -> Result<QueryResult>;

    /// Earliest and latest record times of a type, `None` when it has no records
    async fn query_full_range(&self, record_type: &RecordType) -> Result<Option<DateRange>>;

    /// One page of a counting pass
    async fn count_records(&self, query: &CountQuery) -> Result<CountPage>;

    /// Subscribe to notifications naming the type that gained new data
    fn observe_changes(&self) -> broadcast::Receiver<RecordType>;

    /// Ask for read access to the given types
    async fn request_access(&self, types: &[RecordType]) -> Result<AccessStatus>;
}
