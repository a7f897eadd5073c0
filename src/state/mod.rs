//! State management module
//!
//! Durable, namespaced key/value storage for cursors, counters, dates and
//! flags. State is persisted between runs so a killed process resumes
//! where its last confirmed upload left off.
//!
//! # Overview
//!
//! The state module provides:
//! - `StateStore` - File-backed (or in-memory) store with atomic writes
//! - `Scope` - Account, Live and Historical partitions that reset independently
//! - `StateKey` - `{mode}-{type}-{field}` and mode-global key naming
//! - A schema version checked at startup

mod manager;
mod types;

pub use manager::{StateStore, StateWriter};
pub use types::{keys, Entry, ModeField, PersistedState, Scope, StateKey, StoredValue, TypeField};
