//! Local file intake for the next turn.
//!
//! Files are validated locally (existence, kind, size) before any network
//! call, then pushed through the image or file upload path of the backend.
//! Handles are returned to the caller and never cached here.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::sync::Arc;

use chat_provider::{AttachmentHandle, AttachmentKind, ChatBackend, ChatError, Upload};
use tracing::{debug, info};

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

const FALLBACK_MIME: &str = "application/octet-stream";

pub struct AttachmentManager {
    backend: Arc<dyn ChatBackend>,
    max_bytes: u64,
}

impl AttachmentManager {
    #[must_use]
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Uploads `path`, choosing the image path for `image/*` types.
    pub fn upload(&self, path: &Path) -> Result<AttachmentHandle, ChatError> {
        let mime = guess_mime(path);
        let kind = if mime.starts_with("image/") {
            AttachmentKind::Image
        } else {
            AttachmentKind::File
        };
        self.upload_with(path, kind, mime)
    }

    /// Uploads `path` through an explicit path. Image uploads reject files
    /// whose type is not an image.
    pub fn upload_as(
        &self,
        path: &Path,
        kind: AttachmentKind,
    ) -> Result<AttachmentHandle, ChatError> {
        let mime = guess_mime(path);
        if kind == AttachmentKind::Image && !mime.starts_with("image/") {
            return Err(ChatError::Unsupported(format!(
                "{} is not an image ({mime})",
                path.display()
            )));
        }
        self.upload_with(path, kind, mime)
    }

    /// Uploads an in-memory buffer under `name`.
    pub fn upload_buffer(
        &self,
        name: &str,
        bytes: Vec<u8>,
        kind: AttachmentKind,
    ) -> Result<AttachmentHandle, ChatError> {
        let mime = guess_mime(Path::new(name));
        self.check_size(name, bytes.len() as u64)?;
        let upload = Upload {
            name: name.to_owned(),
            mime,
            bytes,
        };
        self.push(upload, kind)
    }

    fn upload_with(
        &self,
        path: &Path,
        kind: AttachmentKind,
        mime: String,
    ) -> Result<AttachmentHandle, ChatError> {
        let metadata = fs::metadata(path).map_err(|error| read_error(path, &error))?;
        if !metadata.is_file() {
            return Err(ChatError::Unsupported(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let name = display_name(path);
        self.check_size(&name, metadata.len())?;
        let bytes = fs::read(path).map_err(|error| read_error(path, &error))?;
        self.push(Upload { name, mime, bytes }, kind)
    }

    fn check_size(&self, name: &str, size: u64) -> Result<(), ChatError> {
        if size > self.max_bytes {
            return Err(ChatError::TooLarge {
                name: name.to_owned(),
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    fn push(&self, upload: Upload, kind: AttachmentKind) -> Result<AttachmentHandle, ChatError> {
        debug!(
            name = %upload.name,
            kind = kind.as_str(),
            bytes = upload.bytes.len(),
            "uploading attachment"
        );
        let id = match kind {
            AttachmentKind::Image => self.backend.upload_image(&upload)?,
            AttachmentKind::File => self.backend.upload_file(&upload)?,
        };
        info!(name = %upload.name, kind = kind.as_str(), "attachment uploaded");
        Ok(AttachmentHandle {
            id,
            kind,
            mime: upload.mime,
            name: upload.name,
        })
    }
}

fn guess_mime(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(FALLBACK_MIME)
        .to_owned()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn read_error(path: &Path, error: &std::io::Error) -> ChatError {
    if error.kind() == IoErrorKind::NotFound {
        ChatError::NotFound(path.display().to_string())
    } else {
        ChatError::Unsupported(format!("cannot read {}: {error}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use chat_provider_mock::ScriptedBackend;
    use tempfile::tempdir;

    use super::*;

    fn manager() -> (Arc<ScriptedBackend>, AttachmentManager) {
        let backend = Arc::new(ScriptedBackend::default());
        let manager = AttachmentManager::new(Arc::clone(&backend) as Arc<dyn ChatBackend>);
        (backend, manager)
    }

    #[test]
    fn missing_path_is_not_found_without_network() {
        let (backend, manager) = manager();
        let error = manager
            .upload(Path::new("/definitely/not/here.txt"))
            .expect_err("missing file must fail");

        assert!(matches!(error, ChatError::NotFound(_)));
        assert!(backend.uploads().is_empty());
    }

    #[test]
    fn images_and_files_take_separate_paths() {
        let dir = tempdir().expect("tempdir");
        let image = dir.path().join("photo.png");
        let notes = dir.path().join("notes.txt");
        fs::write(&image, [0x89, b'P', b'N', b'G']).expect("write image");
        fs::write(&notes, "hello").expect("write notes");
        let (backend, manager) = manager();

        let image_handle = manager.upload(&image).expect("image upload");
        let file_handle = manager.upload(&notes).expect("file upload");

        assert_eq!(image_handle.kind, AttachmentKind::Image);
        assert_eq!(image_handle.mime, "image/png");
        assert_eq!(image_handle.name, "photo.png");
        assert_eq!(file_handle.kind, AttachmentKind::File);
        assert_eq!(file_handle.mime, "text/plain");
        assert_eq!(
            backend.uploads(),
            vec![
                (AttachmentKind::Image, "photo.png".to_owned()),
                (AttachmentKind::File, "notes.txt".to_owned()),
            ]
        );
    }

    #[test]
    fn oversized_files_are_rejected_before_upload() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("big.bin");
        fs::write(&path, vec![0u8; 32]).expect("write");
        let (backend, manager) = manager();
        let manager = manager.with_max_bytes(16);

        let error = manager.upload(&path).expect_err("too large");
        assert_eq!(
            error,
            ChatError::TooLarge {
                name: "big.bin".to_owned(),
                size: 32,
                limit: 16,
            }
        );
        assert!(backend.uploads().is_empty());
    }

    #[test]
    fn directories_and_non_images_are_unsupported() {
        let dir = tempdir().expect("tempdir");
        let notes = dir.path().join("notes.txt");
        fs::write(&notes, "x").expect("write");
        let (_backend, manager) = manager();

        assert!(matches!(manager.upload(dir.path()), Err(ChatError::Unsupported(_))));
        assert!(matches!(
            manager.upload_as(&notes, AttachmentKind::Image),
            Err(ChatError::Unsupported(_))
        ));
        assert_eq!(
            manager
                .upload_as(&notes, AttachmentKind::File)
                .expect("file path accepts anything")
                .kind,
            AttachmentKind::File
        );
    }

    #[test]
    fn buffers_upload_under_their_name() {
        let (backend, manager) = manager();
        let handle = manager
            .upload_buffer("clip.jpg", vec![1, 2, 3], AttachmentKind::Image)
            .expect("buffer upload");

        assert_eq!(handle.mime, "image/jpeg");
        assert_eq!(backend.uploads(), vec![(AttachmentKind::Image, "clip.jpg".to_owned())]);
    }
}
