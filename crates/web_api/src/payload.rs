use serde_json::{json, Value};

/// Inner request slot that carries the persona id.
pub const GEM_SLOT: usize = 19;

/// Reference to a previously uploaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub id: String,
    pub name: String,
}

impl FileRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One conversational turn in wire terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateCall {
    pub prompt: String,
    pub files: Vec<FileRef>,
    /// `cid`, `rid`, `rcid` in order; empty strings are sent as null.
    pub metadata: [String; 3],
    /// Model id for the model selection header; `None` keeps the
    /// service default.
    pub model_id: Option<String>,
    pub gem_id: Option<String>,
}

impl GenerateCall {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, cid: &str, rid: &str, rcid: &str) -> Self {
        self.metadata = [cid.to_owned(), rid.to_owned(), rcid.to_owned()];
        self
    }

    pub fn with_file(mut self, file: FileRef) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_gem(mut self, gem_id: impl Into<String>) -> Self {
        self.gem_id = Some(gem_id.into());
        self
    }

    /// The inner request array, before string encoding.
    pub fn inner_request(&self) -> Value {
        let files = if self.files.is_empty() {
            Value::Null
        } else {
            Value::Array(
                self.files
                    .iter()
                    .map(|file| json!([[file.id], file.name]))
                    .collect(),
            )
        };
        let metadata: Vec<Value> = self
            .metadata
            .iter()
            .map(|token| {
                if token.is_empty() {
                    Value::Null
                } else {
                    Value::String(token.clone())
                }
            })
            .collect();

        let mut slots = vec![json!([self.prompt, 0, null, files]), Value::Null, Value::Array(metadata)];
        if let Some(gem_id) = self.gem_id.as_deref().filter(|id| !id.is_empty()) {
            slots.resize(GEM_SLOT, Value::Null);
            slots.push(Value::String(gem_id.to_owned()));
        }
        Value::Array(slots)
    }
}

/// One call inside a batch-execute request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCall {
    pub rpc_id: String,
    pub payload: String,
    pub identifier: String,
}

impl BatchCall {
    pub fn new(
        rpc_id: impl Into<String>,
        payload: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            rpc_id: rpc_id.into(),
            payload: payload.into(),
            identifier: identifier.into(),
        }
    }
}

/// Outbound request handled by [`crate::WebApiClient::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireBatch {
    Generate(GenerateCall),
    Execute(Vec<BatchCall>),
}

/// Form fields of a generate request.
pub fn generate_form(call: &GenerateCall, access_token: &str) -> Vec<(String, String)> {
    let inner = call.inner_request().to_string();
    let outer = json!([null, inner]).to_string();
    vec![
        ("at".to_owned(), access_token.to_owned()),
        ("f.req".to_owned(), outer),
    ]
}

/// Form fields of a batch-execute request.
pub fn batch_form(calls: &[BatchCall], access_token: &str) -> Vec<(String, String)> {
    let entries: Vec<Value> = calls
        .iter()
        .map(|call| json!([call.rpc_id, call.payload, null, call.identifier]))
        .collect();
    vec![
        ("at".to_owned(), access_token.to_owned()),
        ("f.req".to_owned(), json!([entries]).to_string()),
    ]
}

/// Comma-joined rpc ids for the `rpcids` query parameter.
pub fn rpc_ids(calls: &[BatchCall]) -> String {
    calls
        .iter()
        .map(|call| call.rpc_id.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Query parameters shared by all RPC posts.
pub fn rpc_query(
    build_label: Option<&str>,
    session_id: Option<&str>,
    language: &str,
    request_id: u64,
) -> Vec<(String, String)> {
    let mut query = Vec::new();
    if let Some(label) = build_label {
        query.push(("bl".to_owned(), label.to_owned()));
    }
    if let Some(sid) = session_id {
        query.push(("f.sid".to_owned(), sid.to_owned()));
    }
    query.push(("hl".to_owned(), language.to_owned()));
    query.push(("_reqid".to_owned(), request_id.to_string()));
    query.push(("rt".to_owned(), "c".to_owned()));
    query.push(("source-path".to_owned(), "/app".to_owned()));
    query
}
