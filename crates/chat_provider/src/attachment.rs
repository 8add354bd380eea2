use serde::{Deserialize, Serialize};

/// Which upload path produced a handle. The service exposes separate image
/// and file uploads and the split is kept end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    File,
    Image,
}

impl AttachmentKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Image => "image",
        }
    }
}

/// Server-issued reference to an uploaded file, attachable to the next turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttachmentHandle {
    pub id: String,
    pub kind: AttachmentKind,
    pub mime: String,
    /// Display name; the only part of an attachment that gets persisted.
    pub name: String,
}

/// Upload payload handed to a backend.
#[derive(Clone, PartialEq, Eq)]
pub struct Upload {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upload")
            .field("name", &self.name)
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}
