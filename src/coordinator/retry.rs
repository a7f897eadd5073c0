//! Tiered retry policy

use crate::error::FailureClass;
use serde::Serialize;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enter start after the retry delay
    Retry,
    /// Re-enter start once connectivity returns
    AwaitConnectivity,
    /// Stop for good
    GiveUp,
}

/// Tier index and attempt budget for one mode.
///
/// Each retryable failure costs one attempt, except the first failure after a
/// tier change, which grants a bonus instead (two attempts for a 5xx, one
/// otherwise). A tier therefore absorbs four 5xx failures, or three of any
/// other retryable class. When the attempts run out the policy moves to the
/// next, smaller tier with a fresh attempt, or gives up on the last tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    tier_index: usize,
    max_tier_index: usize,
    attempts_remaining: u32,
    bonus_granted: bool,
}

impl RetryPolicy {
    /// Policy at `tier_index` (clamped) with one attempt
    pub fn new(tier_index: usize, max_tier_index: usize) -> Self {
        Self {
            tier_index: tier_index.min(max_tier_index),
            max_tier_index,
            attempts_remaining: 1,
            bonus_granted: false,
        }
    }

    /// Override the starting attempt count
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts_remaining = attempts.max(1);
        self
    }

    /// Active tier
    pub fn tier_index(&self) -> usize {
        self.tier_index
    }

    /// Last tier
    pub fn max_tier_index(&self) -> usize {
        self.max_tier_index
    }

    /// Attempts left on the active tier
    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining
    }

    /// Whether the bonus for this tier has been used
    pub fn bonus_granted(&self) -> bool {
        self.bonus_granted
    }

    /// Record a failed attempt
    pub fn on_failure(&mut self, class: FailureClass) -> RetryDecision {
        if !class.is_retryable() {
            return RetryDecision::GiveUp;
        }

        if self.bonus_granted {
            self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
        } else {
            self.attempts_remaining += if class == FailureClass::Server { 2 } else { 1 };
            self.bonus_granted = true;
        }

        if self.attempts_remaining == 0 {
            if self.tier_index >= self.max_tier_index {
                return RetryDecision::GiveUp;
            }
            self.tier_index += 1;
            self.attempts_remaining = 1;
            self.bonus_granted = false;
        }

        if class == FailureClass::Connectivity {
            RetryDecision::AwaitConnectivity
        } else {
            RetryDecision::Retry
        }
    }

    /// Record a committed round: step one tier toward the largest batches
    pub fn on_success(&mut self) {
        self.tier_index = self.tier_index.saturating_sub(1);
        self.attempts_remaining = 1;
        self.bonus_granted = false;
    }
}
