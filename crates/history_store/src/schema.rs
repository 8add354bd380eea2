use std::cmp::Ordering;

use chat_provider::{ContinuationTokens, GeneratedImage, Model, WebImage};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::HistoryStoreError;

pub const RECORD_VERSION: u32 = 1;
pub const UNTITLED: &str = "Untitled";
pub const TITLE_MAX_GRAPHEMES: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Web,
    Generated,
}

/// Image shown with an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub kind: ImageKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl From<&WebImage> for ImageRef {
    fn from(image: &WebImage) -> Self {
        Self {
            kind: ImageKind::Web,
            url: image.url.clone(),
            title: Some(image.title.clone()).filter(|title| !title.is_empty()),
        }
    }
}

impl From<&GeneratedImage> for ImageRef {
    fn from(image: &GeneratedImage) -> Self {
        Self {
            kind: ImageKind::Generated,
            url: image.url.clone(),
            title: image.title.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<String>,
    pub created_at: String,
    /// Display names of the files sent with the turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
    /// Candidate the assistant text was taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_index: Option<usize>,
    /// User turn that never got an assistant reply.
    #[serde(default, skip_serializing_if = "is_false")]
    pub orphaned: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Message content before the store stamps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub thoughts: Option<String>,
    pub attachments: Vec<String>,
    pub images: Vec<ImageRef>,
    pub candidate_index: Option<usize>,
}

impl NewMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            thoughts: None,
            attachments: Vec::new(),
            images: Vec::new(),
            candidate_index: None,
        }
    }

    #[must_use]
    pub fn with_thoughts(mut self, thoughts: Option<String>) -> Self {
        self.thoughts = thoughts.filter(|thoughts| !thoughts.is_empty());
        self
    }

    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    #[must_use]
    pub fn with_images(mut self, images: Vec<ImageRef>) -> Self {
        self.images = images;
        self
    }

    #[must_use]
    pub fn with_candidate_index(mut self, index: usize) -> Self {
        self.candidate_index = Some(index);
        self
    }

    pub(crate) fn stamp(self, created_at: String) -> Message {
        Message {
            role: self.role,
            content: self.content,
            thoughts: self.thoughts,
            created_at,
            attachments: self.attachments,
            images: self.images,
            candidate_index: self.candidate_index,
            orphaned: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub version: u32,
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub model: Model,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gem_id: Option<String>,
    #[serde(default)]
    pub tokens: ContinuationTokens,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    #[must_use]
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            model: self.model,
            updated_at: self.updated_at.clone(),
            favorite: self.favorite,
            order: self.order,
        }
    }

    /// Last message that takes part in user/assistant alternation.
    #[must_use]
    pub fn last_turn(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|message| !message.orphaned)
    }

    #[must_use]
    pub fn has_user_message(&self) -> bool {
        self.messages
            .iter()
            .any(|message| message.role == Role::User)
    }
}

/// Index entry for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub model: Model,
    pub updated_at: String,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub order: i64,
}

/// `order` ascending, favorites first, most recently updated first.
#[must_use]
pub fn listing_order(left: &ConversationSummary, right: &ConversationSummary) -> Ordering {
    left.order
        .cmp(&right.order)
        .then_with(|| right.favorite.cmp(&left.favorite))
        .then_with(|| compare_timestamps(&right.updated_at, &left.updated_at))
        .then_with(|| left.id.cmp(&right.id))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexFile {
    pub version: u32,
    #[serde(default)]
    pub conversations: Vec<ConversationSummary>,
}

/// Title derived from the first user message.
#[must_use]
pub fn title_from_content(content: &str) -> String {
    let prefix = content
        .trim_start()
        .graphemes(true)
        .take(TITLE_MAX_GRAPHEMES)
        .collect::<String>();
    let title = prefix.trim_end();
    if title.is_empty() {
        UNTITLED.to_owned()
    } else {
        title.to_owned()
    }
}

pub(crate) fn now_rfc3339() -> Result<String, HistoryStoreError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(HistoryStoreError::ClockFormat)
}

pub(crate) fn parse_timestamp(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).ok()
}

/// Chronological comparison; unparseable values sort first.
pub(crate) fn compare_timestamps(left: &str, right: &str) -> Ordering {
    match (parse_timestamp(left), parse_timestamp(right)) {
        (Some(left), Some(right)) => left.cmp(&right),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => left.cmp(right),
    }
}

/// The later of `now` and `previous`, so stamps never go backwards.
pub(crate) fn not_before(now: String, previous: &str) -> String {
    if compare_timestamps(&now, previous) == Ordering::Less {
        previous.to_owned()
    } else {
        now
    }
}
