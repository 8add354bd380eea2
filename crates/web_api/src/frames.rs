use serde_json::{json, Value};

use crate::error::WebApiError;

/// Anti-hijacking prefix that opens every RPC response body.
pub const RESPONSE_SENTINEL: &str = ")]}'";
/// Tag of response entries that carry an RPC result.
pub const RESULT_TAG: &str = "wrb.fr";

/// One decoded RPC result entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireFrame {
    pub rpc_id: Option<String>,
    /// JSON-encoded payload string from the entry's third slot.
    pub payload: Option<String>,
    pub identifier: Option<String>,
    pub error_code: Option<i64>,
}

impl WireFrame {
    fn from_entry(entry: &Value) -> Option<Self> {
        let slots = entry.as_array()?;
        if slots.first().and_then(Value::as_str) != Some(RESULT_TAG) {
            return None;
        }

        let text_at = |index: usize| slots.get(index).and_then(Value::as_str).map(str::to_owned);
        let error_code = slots
            .get(5)
            .and_then(|info| info.pointer("/2/0/1/0"))
            .and_then(Value::as_i64);

        Some(Self {
            rpc_id: text_at(1),
            payload: text_at(2),
            identifier: text_at(6),
            error_code,
        })
    }
}

/// Decode a framed response body into RPC result entries, in body order.
///
/// The body starts with [`RESPONSE_SENTINEL`] and continues with
/// length-prefixed JSON arrays. Length prefixes are skipped rather than
/// trusted; each chunk is read as one complete JSON value.
pub fn decode_frames(body: &str) -> Result<Vec<WireFrame>, WebApiError> {
    let rest = body
        .trim_start()
        .strip_prefix(RESPONSE_SENTINEL)
        .ok_or_else(|| WebApiError::MalformedFrames("missing response sentinel".to_owned()))?;

    let mut frames = Vec::new();
    let mut chunks = 0usize;
    let mut cursor = rest;

    loop {
        cursor = cursor.trim_start_matches(|c: char| c.is_ascii_whitespace() || c.is_ascii_digit());
        if cursor.is_empty() {
            break;
        }

        let mut stream = serde_json::Deserializer::from_str(cursor).into_iter::<Value>();
        let chunk = match stream.next() {
            Some(Ok(value)) => value,
            Some(Err(error)) => {
                return Err(WebApiError::MalformedFrames(format!(
                    "chunk {chunks} is not valid JSON: {error}"
                )))
            }
            None => break,
        };
        cursor = &cursor[stream.byte_offset()..];
        chunks += 1;

        let Some(entries) = chunk.as_array() else {
            continue;
        };
        frames.extend(entries.iter().filter_map(WireFrame::from_entry));
    }

    if chunks == 0 {
        return Err(WebApiError::MalformedFrames("no JSON chunk after sentinel".to_owned()));
    }

    Ok(frames)
}

/// Build one `wrb.fr` entry. Used to script responses.
pub fn frame_entry(rpc_id: Option<&str>, payload: Option<&str>, identifier: &str) -> Value {
    json!([RESULT_TAG, rpc_id, payload, null, null, null, identifier])
}

/// Build a failed entry carrying a service error code.
pub fn error_entry(rpc_id: Option<&str>, code: i64) -> Value {
    json!([RESULT_TAG, rpc_id, null, null, null, [8, null, [[null, [code]]]], "generic"])
}

/// Frame chunks the way the service does: sentinel, then each chunk
/// prefixed by its length.
pub fn encode_frames(chunks: &[Value]) -> String {
    let mut body = format!("{RESPONSE_SENTINEL}\n\n");
    for chunk in chunks {
        let text = chunk.to_string();
        body.push_str(&(text.chars().count() + 1).to_string());
        body.push('\n');
        body.push_str(&text);
        body.push('\n');
    }
    body
}
