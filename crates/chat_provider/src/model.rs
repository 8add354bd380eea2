use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Target model of a turn. The tag is what gets persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Model {
    /// Let the service pick its default model.
    #[default]
    #[serde(rename = "unspecified")]
    Unspecified,
    #[serde(rename = "gemini-2.5-flash")]
    Flash25,
    #[serde(rename = "gemini-2.5-pro")]
    Pro25,
    #[serde(rename = "gemini-3.0-pro")]
    Pro30,
}

impl Model {
    pub const ALL: [Model; 4] = [Model::Unspecified, Model::Flash25, Model::Pro25, Model::Pro30];

    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Flash25 => "gemini-2.5-flash",
            Self::Pro25 => "gemini-2.5-pro",
            Self::Pro30 => "gemini-3.0-pro",
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Model {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|model| model.tag() == normalized)
            .ok_or_else(|| {
                let known = Self::ALL.map(Model::tag).join(", ");
                format!("unknown model '{}'; expected one of: {known}", value.trim())
            })
    }
}
