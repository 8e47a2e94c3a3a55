// Versioned upgrades of stored run headers

use log::debug;
use serde_json::{Map, Value};

use crate::errors::ShiftlabError;
use crate::telemetry::RunKind;

use super::RunHeader;

/// Header format written by this version of the crate.
pub const CURRENT_SCHEMA_VERSION: u64 = 2;

/// Headers written before versioning was introduced carry no `schema_version`.
const UNVERSIONED_SCHEMA: u64 = 1;

/// Upgrade a raw stored header to the current format and deserialize it.
///
/// Each step only adds fields with their documented defaults, so any
/// header that parsed under its own version keeps its meaning.
pub fn migrate_header(raw: Value) -> Result<RunHeader, ShiftlabError> {
    let Value::Object(mut fields) = raw else {
        return Err(ShiftlabError::InvalidUserInput {
            field: "run header".to_string(),
            reason: "expected a JSON object".to_string(),
        });
    };

    let mut version = fields
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(UNVERSIONED_SCHEMA);
    if version > CURRENT_SCHEMA_VERSION {
        return Err(ShiftlabError::UnsupportedSchemaVersion { version });
    }

    while version < CURRENT_SCHEMA_VERSION {
        debug!("Migrating run header from schema version {}", version);
        match version {
            1 => v1_to_v2(&mut fields)?,
            other => return Err(ShiftlabError::UnsupportedSchemaVersion { version: other }),
        }
        version += 1;
        fields.insert("schema_version".to_string(), Value::from(version));
    }

    serde_json::from_value(Value::Object(fields))
        .map_err(|e| ShiftlabError::StorageSerialize { source: e })
}

/// v2 introduced run kinds, operator notes and explicit sealing.
/// Every v1 run was a drag run and was only written once complete.
fn v1_to_v2(fields: &mut Map<String, Value>) -> Result<(), ShiftlabError> {
    let drag = serde_json::to_value(RunKind::Drag)
        .map_err(|e| ShiftlabError::StorageSerialize { source: e })?;
    fields.entry("run_kind").or_insert(drag);
    fields
        .entry("notes")
        .or_insert_with(|| Value::String(String::new()));
    fields.entry("sealed").or_insert(Value::Bool(true));
    fields.entry("sample_count").or_insert(Value::from(0));
    Ok(())
}
