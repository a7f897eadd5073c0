// Allow common clippy pedantic lints that aren't critical for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::ref_option)]
#![allow(clippy::unused_self)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::match_wildcard_for_single_variants)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::unused_async)]

//! # recsync
//!
//! Incremental, resumable upload of time-stamped records from a local data
//! store to a remote ingestion service.
//!
//! ## Features
//!
//! - **Two Modes**: Live tails new records forward from a fence; Historical
//!   backfills everything before it, newest first
//! - **Crash-Safe Cursors**: a cursor only advances after its batch is confirmed
//! - **Tiered Retries**: repeated failures shrink batches and lengthen timeouts
//! - **Partial Rejection**: rejected items are dropped, the rest resent as is
//! - **Progress Stats**: per-type and per-mode counters for a host UI
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use recsync::{config::HostConfig, engine::Engine, source::MemoryDataStore, state::StateStore, Mode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> recsync::Result<()> {
//!     let config = HostConfig::from_file("host.yaml")?;
//!     let store = StateStore::from_file("state.json")?;
//!     let engine = Engine::with_http(config, store, Arc::new(MemoryDataStore::new())).await?;
//!
//!     let mut events = engine.subscribe();
//!     engine.start(Mode::Historical)?;
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Engine                             │
//! │  start / stop / resume / reset / switch_account / progress   │
//! └───────────────┬──────────────────────────────┬───────────────┘
//!                 │                              │
//!      ┌──────────┴──────────┐        ┌──────────┴──────────┐
//!      │ SyncCoordinator     │        │ SyncCoordinator     │
//!      │ (live)              │        │ (historical)        │
//!      ├─────────────────────┤        ├─────────────────────┤
//!      │ TypeReader × N      │        │ TypeReader × N      │
//!      │ Uploader            │        │ Uploader            │
//!      │ RetryPolicy         │        │ RetryPolicy         │
//!      └──────────┬──────────┘        └──────────┬──────────┘
//!                 │                              │
//! ┌───────────────┴────────┬─────────────────────┴───────────────┐
//! │  DataStore (source)    │  StateStore  │  UploadTransport      │
//! └────────────────────────┴──────────────┴───────────────────────┘
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

// ============================================================================
// Module declarations
// ============================================================================

/// Error types
pub mod error;

/// Common types and type aliases
pub mod types;

/// Host configuration
pub mod config;

/// Persisted cursors, counters and flags
pub mod state;

/// Local data store interface and in-memory implementation
pub mod source;

/// Upload transport with rate limiting
pub mod transport;

/// Per-type incremental readers
pub mod reader;

/// Batch preparation and response interpretation
pub mod uploader;

/// Per-type and per-mode progress
pub mod stats;

/// Per-mode run state machine and retry policy
pub mod coordinator;

/// Top-level engine
pub mod engine;

/// Command-line interface
pub mod cli;

// ============================================================================
// Re-exports
// ============================================================================

pub use error::{Error, Result};
pub use types::*;

pub use coordinator::{StopReason, SyncEvent};
pub use engine::Engine;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
