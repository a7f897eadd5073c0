//! Engine types
//!
//! Snapshots returned by the engine's query operations.

use crate::coordinator::CoordinatorStatus;
use crate::stats::{GlobalProgress, TypeStats};
use crate::types::Mode;
use serde::Serialize;

/// Active retry tier of one mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryInfo {
    /// Index into the tier table
    pub tier_index: usize,
    /// Last valid index
    pub max_tier_index: usize,
}

impl From<&CoordinatorStatus> for RetryInfo {
    fn from(status: &CoordinatorStatus) -> Self {
        Self {
            tier_index: status.tier_index,
            max_tier_index: status.max_tier_index,
        }
    }
}

/// Everything the host shows about one mode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeReport {
    /// Mode the report covers
    pub mode: Mode,
    /// Live coordinator state
    pub status: CoordinatorStatus,
    /// Persisted summary across types
    pub progress: GlobalProgress,
    /// Per-type breakdown
    pub types: Vec<TypeStats>,
    /// Whether a historical run would resume rather than restart
    pub is_resumable: bool,
}

/// Modes addressed by a reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    /// A single mode's scope
    Mode(Mode),
    /// Both mode scopes and the account scope
    All,
}

impl ResetTarget {
    /// Modes touched by this reset
    pub fn modes(self) -> Vec<Mode> {
        match self {
            ResetTarget::Mode(mode) => vec![mode],
            ResetTarget::All => Mode::ALL.to_vec(),
        }
    }
}
