//! Uploader types

use crate::error::Error;
use crate::types::{DeletionMarker, JsonValue, Record};

/// A batch ready to send, with the items that survived serialization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedBatch {
    /// Records in upload order
    pub records: Vec<Record>,
    /// Deletions that will be sent
    pub deletions: Vec<DeletionMarker>,
    /// JSON array for the create call, `None` when there are no records
    pub create_body: Option<JsonValue>,
    /// JSON array for the delete call, `None` when there are no deletions
    pub delete_body: Option<JsonValue>,
}

impl PreparedBatch {
    /// True when there is nothing to send
    pub fn is_empty(&self) -> bool {
        self.create_body.is_none() && self.delete_body.is_none()
    }
}

/// Result of one upload attempt (create then delete)
#[derive(Debug)]
pub enum UploadOutcome {
    /// Both calls succeeded
    Success,
    /// The remote side refused the records at these batch indices
    PartialRejection {
        /// Zero-based positions in the create body
        indices: Vec<usize>,
    },
    /// The attempt failed; the error is kept for classification
    Failed(Error),
}

impl UploadOutcome {
    /// True for [`UploadOutcome::Success`]
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Success)
    }
}
