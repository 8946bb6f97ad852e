//! Parsers for the index service response bodies.
//!
//! One function per schema. The caller picks the parser for the operation it
//! issued.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::{ErrorResult, IndexEntry, ListPage, StoreError};

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawListResponse {
    #[serde(default)]
    keys: Option<Vec<IndexEntry>>,
    #[serde(default, deserialize_with = "truncation_flag")]
    is_truncated: bool,
    #[serde(default)]
    next_marker: Option<String>,
}

/// The service reports `IsTruncated` as a string, older builds as a boolean.
fn truncation_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(flag) => Ok(flag),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") || s.is_empty() => Ok(false),
        Value::Null => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "invalid IsTruncated value: {other}"
        ))),
    }
}

/// Parse the body of a successful index listing.
pub fn parse_list_response(index_id: &str, body: &str) -> Result<ListPage, StoreError> {
    let raw: RawListResponse = serde_json::from_str(body)
        .map_err(|e| StoreError::malformed(index_id, format!("invalid list response: {e}")))?;

    Ok(ListPage {
        entries: raw.keys.unwrap_or_default(),
        is_truncated: raw.is_truncated,
        next_marker: raw.next_marker.filter(|m| !m.is_empty()),
    })
}

impl ErrorResult {
    /// Build the failure for a non-success response.
    ///
    /// The body is an XML error document (`<Code>`, `<Message>`); when it has no
    /// `<Message>` the trimmed body itself is kept as the message.
    pub fn from_response(status: u16, reason: &str, body: &str) -> Self {
        let message = extract_tag(body, "Message")
            .or_else(|| extract_tag(body, "Code"))
            .unwrap_or_else(|| body.trim().to_string());
        Self::new(status, reason, message)
    }
}

fn extract_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].trim().to_string())
}
