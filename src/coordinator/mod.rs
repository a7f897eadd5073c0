//! Coordinator module
//!
//! One `SyncCoordinator` per mode drives the read, merge, upload and
//! commit loop for that mode.
//!
//! # Overview
//!
//! ```text
//! Idle -> [Counting ->] Reading -> Uploading -> Reading (next round)
//!                                           \-> Armed (live, caught up)
//!                                           \-> RetryScheduled -> Reading
//!                                           \-> Stopped(reason)
//! ```
//!
//! The coordinator runs as an actor: a tokio task owning all mutable
//! state, fed by a `CoordinatorHandle` command channel, by worker
//! completions on its own event channel, by source change notifications
//! and by the host's connectivity flag.
//!
//! Every failure funnels through one stop path, which asks the
//! `RetryPolicy` whether to retry at the same tier, move to a smaller
//! tier, wait for connectivity or give up.

mod actor;
mod retry;
mod types;

pub use actor::{CoordinatorContext, CoordinatorHandle, SyncCoordinator};
pub use retry::{RetryDecision, RetryPolicy};
pub use types::{
    CoordinatorStatus, ExecutionBudget, RunState, StartOptions, StopReason, SyncEvent, SyncFailure,
};
