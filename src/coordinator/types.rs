//! Coordinator state, events and commands

use crate::error::{Error, FailureClass};
use crate::types::Mode;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Run State
// ============================================================================

/// Lifecycle of one mode's coordinator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum RunState {
    #[default]
    Idle,
    /// Historical pre-pass establishing totals and date span
    Counting,
    /// Readers are querying the source
    Reading,
    /// A batch is in flight
    Uploading,
    /// Waiting for a retry timer or for connectivity
    RetryScheduled,
    /// Live only: logically on, waiting for new data
    Armed,
    Stopped(StopReason),
}

impl RunState {
    /// Work is in progress; a non-retry start is ignored
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            RunState::Counting | RunState::Reading | RunState::Uploading | RunState::RetryScheduled
        )
    }

    /// Running or armed; a stop has something to stop
    pub fn is_active(&self) -> bool {
        self.is_running() || *self == RunState::Armed
    }

    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Counting => "counting",
            RunState::Reading => "reading",
            RunState::Uploading => "uploading",
            RunState::RetryScheduled => "retry_scheduled",
            RunState::Armed => "armed",
            RunState::Stopped(_) => "stopped",
        }
    }

    /// Whether `self -> next` is a legal move
    pub fn can_transition_to(&self, next: &RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (_, Stopped(_)) => true,
            (Idle | Stopped(_), Idle) => true,
            (Idle | Stopped(_) | Armed | RetryScheduled, Counting | Reading) => true,
            (Counting, Reading) => true,
            (Reading, Uploading | Armed) => true,
            (Uploading, Reading | Armed) => true,
            (Counting | Reading | Uploading | Armed, RetryScheduled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Stop Reasons
// ============================================================================

/// Snapshot of the error that ended an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub class: FailureClass,
    pub message: String,
    /// HTTP status when the remote side answered
    pub status: Option<u16>,
}

impl SyncFailure {
    /// Capture an error
    pub fn from_error(error: &Error) -> Self {
        Self {
            class: error.failure_class(),
            message: error.to_string(),
            status: error.status(),
        }
    }

    /// Same failure, reclassified
    #[must_use]
    pub fn with_class(mut self, class: FailureClass) -> Self {
        self.class = class;
        self
    }
}

impl From<&Error> for SyncFailure {
    fn from(error: &Error) -> Self {
        Self::from_error(error)
    }
}

/// Why a run ended or paused
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StopReason {
    /// Explicitly stopped by the host
    TurnedOff,
    /// Historical backfill reached the end of its range
    UploadComplete,
    /// Too little execution budget left for another batch
    BudgetExpiring,
    /// In-flight work was cancelled
    Cancelled,
    Failed(SyncFailure),
}

impl StopReason {
    /// Failure class, if this is a failure
    pub fn failure(&self) -> Option<&SyncFailure> {
        match self {
            StopReason::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::TurnedOff => f.write_str("turned off"),
            StopReason::UploadComplete => f.write_str("upload complete"),
            StopReason::BudgetExpiring => f.write_str("execution budget expiring"),
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::Failed(failure) => write!(f, "failed: {}", failure.message),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Notifications published on the engine's event bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SyncEvent {
    RunStarted {
        mode: Mode,
    },
    RunStopped {
        mode: Mode,
        reason: StopReason,
    },
    ProgressUpdated {
        mode: Mode,
    },
    UploadSucceeded {
        mode: Mode,
        samples: usize,
        deletes: usize,
    },
    RetryScheduled {
        mode: Mode,
        tier_index: usize,
        attempts_remaining: u32,
        reason: String,
    },
    CountingStarted {
        mode: Mode,
    },
    CountingFinished {
        mode: Mode,
    },
}

impl SyncEvent {
    /// Mode the event concerns
    pub fn mode(&self) -> Mode {
        match self {
            SyncEvent::RunStarted { mode }
            | SyncEvent::RunStopped { mode, .. }
            | SyncEvent::ProgressUpdated { mode }
            | SyncEvent::UploadSucceeded { mode, .. }
            | SyncEvent::RetryScheduled { mode, .. }
            | SyncEvent::CountingStarted { mode }
            | SyncEvent::CountingFinished { mode } => *mode,
        }
    }
}

// ============================================================================
// Start Options & Status
// ============================================================================

/// Arguments to a start request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Tier to start at; the persisted tier when absent
    pub tier_index: Option<usize>,
    /// Attempts before the tier advances; 1 when absent
    pub attempts: Option<u32>,
    /// Re-entry scheduled by the retry policy
    pub is_retry: bool,
    /// Host time allowance for this run
    pub budget: Option<Duration>,
}

impl StartOptions {
    /// Plain start
    pub fn new() -> Self {
        Self::default()
    }

    /// Start under an execution budget
    #[must_use]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Start at a specific tier
    #[must_use]
    pub fn with_tier(mut self, tier_index: usize) -> Self {
        self.tier_index = Some(tier_index);
        self
    }

    pub(crate) fn retry() -> Self {
        Self {
            is_retry: true,
            ..Self::default()
        }
    }
}

/// Snapshot answered to a status request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatus {
    pub mode: Mode,
    pub state: RunState,
    pub tier_index: usize,
    pub max_tier_index: usize,
    pub attempts_remaining: u32,
    pub is_uploading: bool,
}

/// Host-provided time allowance, checked after each committed round
#[derive(Debug, Clone, Copy)]
pub struct ExecutionBudget {
    deadline: Instant,
    threshold: Duration,
}

impl ExecutionBudget {
    /// Budget ending `allowance` from now
    pub fn new(allowance: Duration, threshold: Duration) -> Self {
        Self {
            deadline: Instant::now() + allowance,
            threshold,
        }
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Too little time left to start another batch
    pub fn is_expiring(&self) -> bool {
        self.remaining() <= self.threshold
    }
}
