use serde_json::{json, Value};

use crate::error::WebApiError;
use crate::payload::BatchCall;

pub const RPC_LIST_GEMS: &str = "CNgdBe";
pub const RPC_CREATE_GEM: &str = "oMH3Zd";
pub const RPC_UPDATE_GEM: &str = "kHv0Vd";
pub const RPC_DELETE_GEM: &str = "UXcSJb";

pub const IDENTIFIER_SYSTEM: &str = "system";
pub const IDENTIFIER_CUSTOM: &str = "custom";

/// Persona record as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireGem {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub prompt: Option<String>,
    pub predefined: bool,
}

/// The two list calls: system personas first, then custom ones.
pub fn list_calls(include_hidden: bool) -> Vec<BatchCall> {
    let system_payload = if include_hidden { "[4]" } else { "[3]" };
    vec![
        BatchCall::new(RPC_LIST_GEMS, system_payload, IDENTIFIER_SYSTEM),
        BatchCall::new(RPC_LIST_GEMS, "[2]", IDENTIFIER_CUSTOM),
    ]
}

fn gem_fields(name: &str, prompt: &str, description: &str) -> Value {
    json!([name, description, prompt, null, null, null, null, null, 0, null, 1, null, null, null, []])
}

pub fn create_call(name: &str, prompt: &str, description: &str) -> BatchCall {
    let payload = json!([gem_fields(name, prompt, description)]).to_string();
    BatchCall::new(RPC_CREATE_GEM, payload, "generic")
}

pub fn update_call(id: &str, name: &str, prompt: &str, description: &str) -> BatchCall {
    let mut fields = gem_fields(name, prompt, description);
    if let Some(slots) = fields.as_array_mut() {
        slots.push(json!(0));
    }
    let payload = json!([id, fields]).to_string();
    BatchCall::new(RPC_UPDATE_GEM, payload, "generic")
}

pub fn delete_call(id: &str) -> BatchCall {
    BatchCall::new(RPC_DELETE_GEM, json!([id]).to_string(), "generic")
}

/// Parse a list payload. A payload without a list slot means no personas.
pub fn parse_gem_list(payload: &str, predefined: bool) -> Result<Vec<WireGem>, WebApiError> {
    let body: Value = serde_json::from_str(payload)?;
    let Some(entries) = body.get(2).and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    let text = |value: Option<&Value>| {
        value
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(str::to_owned)
    };

    entries
        .iter()
        .map(|entry| {
            let id = text(entry.get(0)).ok_or_else(|| {
                WebApiError::MalformedFrames("persona entry without id".to_owned())
            })?;
            Ok(WireGem {
                name: text(entry.pointer("/1/0")).unwrap_or_else(|| id.clone()),
                description: text(entry.pointer("/1/1")),
                prompt: text(entry.pointer("/2/0")),
                id,
                predefined,
            })
        })
        .collect()
}

/// Parse the id returned by a create call.
pub fn parse_created_gem_id(payload: &str) -> Result<String, WebApiError> {
    let body: Value = serde_json::from_str(payload)?;
    body.get(0)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| WebApiError::MalformedFrames("create response without persona id".to_owned()))
}
