//! JSON documents stored as index values by the object-store write path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entry of the probable-delete index, keyed by object id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbableDeleteRecord {
    pub probable_object_name: String,
    /// Write-path instance that was handling the object when the record was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_instance_id: Option<String>,
}

impl ProbableDeleteRecord {
    pub fn new(probable_object_name: impl Into<String>) -> Self {
        Self {
            probable_object_name: probable_object_name.into(),
            global_instance_id: None,
        }
    }

    pub fn from_json(value: &str) -> serde_json::Result<Self> {
        serde_json::from_str(value)
    }
}

/// Live metadata of an object, keyed by object id.
///
/// Only the fields the deletion worker compares are typed; the rest of the
/// document is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadataRecord {
    pub object_id: String,
    pub object_name: String,
}

impl ObjectMetadataRecord {
    pub fn new(object_id: impl Into<String>, object_name: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            object_name: object_name.into(),
        }
    }

    pub fn from_json(value: &str) -> serde_json::Result<Self> {
        serde_json::from_str(value)
    }
}

/// Extract `create_timestamp` from a JSON index value.
///
/// Returns `None` when the value is not a JSON object or the field is missing
/// or not an RFC 3339 timestamp.
pub fn create_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let doc: serde_json::Value = serde_json::from_str(value).ok()?;
    let raw = doc.get("create_timestamp")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
