use std::path::{Path, PathBuf};

pub const HISTORY_DIR: &str = "history";
pub const INDEX_FILE: &str = "index.json";
pub const LOCK_FILE: &str = ".lock";

const TEMP_SUFFIX: &str = ".tmp";
const RECORD_EXTENSION: &str = "json";

#[must_use]
pub fn history_root(config_root: &Path) -> PathBuf {
    config_root.join(HISTORY_DIR)
}

#[must_use]
pub fn conversation_file_name(id: &str) -> String {
    format!("{id}.{RECORD_EXTENSION}")
}

/// Conversation ids end up in file names, so only plain id characters pass.
#[must_use]
pub fn is_valid_conversation_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Id of a conversation record file, or `None` for anything else in the
/// history directory.
#[must_use]
pub fn conversation_id_from_file_name(file_name: &str) -> Option<&str> {
    if file_name == INDEX_FILE {
        return None;
    }
    file_name
        .strip_suffix(".json")
        .filter(|id| is_valid_conversation_id(id))
}

#[must_use]
pub fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}{TEMP_SUFFIX}"))
}

#[must_use]
pub fn is_temp_file_name(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(TEMP_SUFFIX)
}
