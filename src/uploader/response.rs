//! Response interpretation

use super::types::UploadOutcome;
use crate::error::{Error, Result};
use crate::transport::TransportResponse;
use crate::types::{JsonValue, Record};
use std::collections::BTreeSet;

/// Status whose body may list rejected items
const REJECTION_STATUS: u16 = 400;

/// Pull rejected item indices out of an error-details body.
///
/// Accepts `{"errors": [{"source": {"pointer": "/3/value"}}, ..]}` or a
/// single `{"source": {"pointer": "/3"}}`. The index is the leading integer
/// of the pointer. Entries without a `source` are skipped; a `source` whose
/// pointer does not parse voids the whole list.
pub fn parse_rejected_indices(body: &str) -> Option<Vec<usize>> {
    let value: JsonValue = serde_json::from_str(body).ok()?;

    let sources: Vec<&JsonValue> = if let Some(errors) = value.get("errors") {
        errors
            .as_array()?
            .iter()
            .filter_map(|entry| entry.get("source"))
            .collect()
    } else {
        vec![value.get("source")?]
    };

    let indices: Vec<usize> = sources
        .into_iter()
        .map(|source| pointer_index(source.get("pointer")?.as_str()?))
        .collect::<Option<_>>()?;
    if indices.is_empty() {
        None
    } else {
        Some(indices)
    }
}

/// Leading item index of a pointer such as `/2` or `/2/value`
fn pointer_index(pointer: &str) -> Option<usize> {
    let rest = pointer.strip_prefix('/')?;
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Outcome for a create call that did not succeed
pub fn interpret_create_failure(response: TransportResponse) -> UploadOutcome {
    if response.status == REJECTION_STATUS {
        if let Some(indices) = parse_rejected_indices(&response.body) {
            return UploadOutcome::PartialRejection { indices };
        }
    }
    UploadOutcome::Failed(Error::http_status(response.status, response.body))
}

/// Remove the records at `rejected` positions, keeping the rest in order.
///
/// Fails when the number removed differs from the number reported, which
/// happens with duplicate or out-of-range indices.
pub fn strip_rejected(records: &[Record], rejected: &[usize]) -> Result<Vec<Record>> {
    let rejected_set: BTreeSet<usize> = rejected.iter().copied().collect();
    let remaining: Vec<Record> = records
        .iter()
        .enumerate()
        .filter(|(index, _)| !rejected_set.contains(index))
        .map(|(_, record)| record.clone())
        .collect();

    let removed = records.len() - remaining.len();
    if removed != rejected.len() {
        return Err(Error::RejectionMismatch {
            message: format!(
                "server rejected {} items but {} matched a batch of {}",
                rejected.len(),
                removed,
                records.len()
            ),
        });
    }
    Ok(remaining)
}
