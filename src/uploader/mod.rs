//! Uploader module
//!
//! Turns a batch of records and deletions into remote create and delete
//! calls and interprets what comes back.
//!
//! # Overview
//!
//! - `Uploader::prepare` serializes a batch, dropping items that cannot be
//!   represented (empty ids, non-finite numbers)
//! - `Uploader::send_batch` issues the create call and, if it succeeds, the
//!   delete call, reporting both as one `UploadOutcome`
//! - A 400 response listing rejected indices becomes a partial rejection;
//!   everything else that is not 2xx is a failure

mod body;
mod response;
mod sender;
mod types;

pub use body::{build_create_body, build_delete_body, deletion_to_json, record_to_json};
pub use response::{interpret_create_failure, parse_rejected_indices, strip_rejected};
pub use sender::Uploader;
pub use types::{PreparedBatch, UploadOutcome};
