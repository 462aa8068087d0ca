use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::snapshot::Snapshot;

/// MIME type requested from the daemon.
pub const JSON_MIME_TYPE: &str = "application/json";

/// Older nsqd releases wrap the stats document in this envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status_code: Option<i64>,
    #[serde(default)]
    status_text: Option<String>,
    data: Value,
}

/// Decode a status document, with or without the response envelope.
///
/// The envelope is recognised by a top-level `data` object. An envelope
/// carrying a non-200 `status_code` is rejected, since its `data` is not a
/// snapshot.
pub fn decode_snapshot(data: &[u8]) -> Result<Snapshot> {
    let document: Value = serde_json::from_slice(data)?;

    let Value::Object(map) = &document else {
        return Err(Error::Decode(format!(
            "expected a JSON object, got {}",
            json_type(&document)
        )));
    };

    if matches!(map.get("data"), Some(Value::Object(_))) {
        let envelope: Envelope = serde_json::from_value(document)?;
        if let Some(code) = envelope.status_code
            && code != 200
        {
            return Err(Error::Decode(format!(
                "daemon returned status {} ({})",
                code,
                envelope.status_text.as_deref().unwrap_or("")
            )));
        }
        return Ok(serde_json::from_value(envelope.data)?);
    }

    Ok(serde_json::from_value(document)?)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
