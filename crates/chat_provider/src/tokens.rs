use serde::{Deserialize, Serialize};

/// Opaque server-issued identifiers that thread turns of one conversation.
///
/// The values are never interpreted. They are stored and re-sent verbatim,
/// and only ever change through [`ContinuationTokens::merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContinuationTokens {
    #[serde(default)]
    cid: String,
    #[serde(default)]
    rid: String,
    #[serde(default)]
    rcid: String,
}

impl ContinuationTokens {
    #[must_use]
    pub fn new(cid: impl Into<String>, rid: impl Into<String>, rcid: impl Into<String>) -> Self {
        Self {
            cid: cid.into(),
            rid: rid.into(),
            rcid: rcid.into(),
        }
    }

    #[must_use]
    pub fn cid(&self) -> &str {
        &self.cid
    }

    #[must_use]
    pub fn rid(&self) -> &str {
        &self.rid
    }

    #[must_use]
    pub fn rcid(&self) -> &str {
        &self.rcid
    }

    /// Returns true when no component is set, i.e. the conversation has not
    /// been acknowledged by the server yet.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.cid.is_empty() && self.rid.is_empty() && self.rcid.is_empty()
    }

    /// Per-field merge: a non-empty received component replaces the current
    /// one, an empty received component keeps it.
    pub fn merge(&mut self, received: &ContinuationTokens) {
        merge_field(&mut self.cid, &received.cid);
        merge_field(&mut self.rid, &received.rid);
        merge_field(&mut self.rcid, &received.rcid);
    }

    /// Consuming variant of [`ContinuationTokens::merge`].
    #[must_use]
    pub fn merged(mut self, received: &ContinuationTokens) -> Self {
        self.merge(received);
        self
    }

    /// Components in wire order.
    #[must_use]
    pub fn as_array(&self) -> [&str; 3] {
        [&self.cid, &self.rid, &self.rcid]
    }
}

fn merge_field(current: &mut String, received: &str) {
    if !received.is_empty() {
        *current = received.to_owned();
    }
}
