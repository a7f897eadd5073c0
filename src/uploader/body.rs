//! Request body construction
//!
//! Items that cannot be represented are dropped here and logged; they are
//! never retried.

use crate::error::{Error, Result};
use crate::types::{DeletionMarker, JsonObject, JsonValue, Record};
use serde_json::json;
use tracing::error;

/// JSON form of one record
pub fn record_to_json(record: &Record) -> Result<JsonValue> {
    if record.id.is_empty() {
        return Err(Error::serialization("", "record id is empty"));
    }

    let mut object = JsonObject::new();
    for (name, value) in &record.fields {
        let encoded = value.to_json().ok_or_else(|| {
            Error::serialization(&record.id, format!("field '{name}' is not a finite number"))
        })?;
        object.insert(name.clone(), encoded);
    }
    object.insert("id".to_string(), JsonValue::String(record.id.clone()));
    object.insert(
        "type".to_string(),
        JsonValue::String(record.record_type.to_string()),
    );
    object.insert("time".to_string(), JsonValue::String(record.time.to_rfc3339()));
    object.insert("origin".to_string(), json!({ "id": record.id }));
    Ok(JsonValue::Object(object))
}

/// JSON form of one deletion
pub fn deletion_to_json(deletion: &DeletionMarker) -> Result<JsonValue> {
    if deletion.id.is_empty() {
        return Err(Error::serialization("", "deletion id is empty"));
    }
    Ok(json!({
        "type": deletion.record_type.as_str(),
        "origin": { "id": deletion.id },
    }))
}

/// Serialize records, dropping the ones that fail.
///
/// Returns the kept records in their original order and the body, which is
/// `None` when nothing was kept.
pub fn build_create_body(records: Vec<Record>) -> (Vec<Record>, Option<JsonValue>) {
    let mut kept = Vec::with_capacity(records.len());
    let mut items = Vec::with_capacity(records.len());
    for record in records {
        match record_to_json(&record) {
            Ok(item) => {
                items.push(item);
                kept.push(record);
            }
            Err(e) => {
                error!(record_type = %record.record_type, error = %e, "Dropping record that cannot be serialized");
            }
        }
    }

    let body = (!items.is_empty()).then(|| JsonValue::Array(items));
    (kept, body)
}

/// Serialize deletions, dropping the ones that fail
pub fn build_delete_body(deletions: Vec<DeletionMarker>) -> (Vec<DeletionMarker>, Option<JsonValue>) {
    let mut kept = Vec::with_capacity(deletions.len());
    let mut items = Vec::with_capacity(deletions.len());
    for deletion in deletions {
        match deletion_to_json(&deletion) {
            Ok(item) => {
                items.push(item);
                kept.push(deletion);
            }
            Err(e) => {
                error!(record_type = %deletion.record_type, error = %e, "Dropping deletion that cannot be serialized");
            }
        }
    }

    let body = (!items.is_empty()).then(|| JsonValue::Array(items));
    (kept, body)
}
