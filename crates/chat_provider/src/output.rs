use serde::{Deserialize, Serialize};

/// Image the service referenced from the web while answering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebImage {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub alt: String,
}

/// Image the service generated for the turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Echo of the prompt the service used to generate the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// One alternative assistant reply for a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Reply identifier; becomes the `rcid` token when this candidate is chosen.
    pub rcid: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub web_images: Vec<WebImage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_images: Vec<GeneratedImage>,
}

impl Candidate {
    #[must_use]
    pub fn text(rcid: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            rcid: rcid.into(),
            text: text.into(),
            thoughts: None,
            web_images: Vec::new(),
            generated_images: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_thoughts(mut self, thoughts: impl Into<String>) -> Self {
        self.thoughts = Some(thoughts.into());
        self
    }

    #[must_use]
    pub fn with_web_image(mut self, image: WebImage) -> Self {
        self.web_images.push(image);
        self
    }

    #[must_use]
    pub fn with_generated_image(mut self, image: GeneratedImage) -> Self {
        self.generated_images.push(image);
        self
    }
}

/// Parsed assistant response: every candidate plus the selected one.
///
/// Always holds at least one candidate and `chosen` is always in range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelOutput {
    candidates: Vec<Candidate>,
    chosen: usize,
}

impl ModelOutput {
    /// Builds an output, falling back to the first candidate when `chosen` is
    /// out of range. Returns `None` for an empty candidate list.
    #[must_use]
    pub fn new(candidates: Vec<Candidate>, chosen: usize) -> Option<Self> {
        if candidates.is_empty() {
            return None;
        }
        let chosen = if chosen < candidates.len() { chosen } else { 0 };
        Some(Self { candidates, chosen })
    }

    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    #[must_use]
    pub fn chosen(&self) -> usize {
        self.chosen
    }

    #[must_use]
    pub fn chosen_candidate(&self) -> &Candidate {
        &self.candidates[self.chosen]
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.chosen_candidate().text
    }

    #[must_use]
    pub fn thoughts(&self) -> Option<&str> {
        self.chosen_candidate().thoughts.as_deref()
    }

    /// Selects another candidate. Out-of-range indices leave the selection
    /// untouched and return `None`.
    pub fn choose(&mut self, index: usize) -> Option<&Candidate> {
        if index >= self.candidates.len() {
            return None;
        }
        self.chosen = index;
        Some(&self.candidates[index])
    }
}
