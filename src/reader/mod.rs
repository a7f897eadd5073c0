//! Reader module
//!
//! One `TypeReader` per record type per mode. A reader pulls records
//! incrementally from the data source, buffers them in upload order and
//! owns the cursor and per-type stats for its (mode, type).
//!
//! # Overview
//!
//! - Reads are described as `IncrementalQuery` values the coordinator runs
//! - Buffered records are sorted ascending (live) or descending (historical)
//! - The committed cursor only moves in `commit_round`; `reset_for_next_round`
//!   rewinds to it, so an unconfirmed round is always re-read
//! - Historical readers run a counting pre-pass with a separate cursor

mod type_reader;
mod types;

pub use type_reader::TypeReader;
pub use types::{CountOutcome, CountStep, ReadStep, ReaderState, ReaderStop, RoundStats};
