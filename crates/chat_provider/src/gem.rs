use serde::{Deserialize, Serialize};

/// Named prompt preamble ("Gem") the service applies to a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gem {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Service-provided personas are read-only.
    #[serde(default)]
    pub predefined: bool,
}

/// Editable persona fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GemDraft {
    pub name: String,
    pub prompt: String,
    pub description: String,
}

impl GemDraft {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        prompt: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            description: description.into(),
        }
    }
}

/// Persona mutation dispatched to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GemMutation {
    Create(GemDraft),
    Update { id: String, draft: GemDraft },
    Delete { id: String },
}

impl GemMutation {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}
