//! Read-only access to `cookies.json`.
//!
//! The file is produced by an external collaborator (a browser export or a
//! refresh helper). It is never written here.

use std::fs;
use std::path::{Path, PathBuf};

use chat_provider_web::CookieSource;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use web_api::SessionCookies;

pub const COOKIES_FILE: &str = "cookies.json";

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("cookie file {path} not found; export session cookies from a logged-in browser")]
    Missing { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid cookie file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cookie file {path} has no primary cookie (c1)")]
    Empty { path: PathBuf },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CookieFile {
    c1: String,
    c2: String,
    c3: String,
    updated_at: Option<String>,
}

#[must_use]
pub fn cookies_path(config_root: &Path) -> PathBuf {
    config_root.join(COOKIES_FILE)
}

/// Reads the cookie triple. The primary cookie is required.
pub fn load_cookies(path: &Path) -> Result<SessionCookies, CookieError> {
    let text = fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            CookieError::Missing {
                path: path.to_path_buf(),
            }
        } else {
            CookieError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    let file: CookieFile = serde_json::from_str(&text).map_err(|source| CookieError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let cookies = SessionCookies::new(file.c1.trim(), file.c2.trim(), file.c3.trim());
    if cookies.is_empty() {
        return Err(CookieError::Empty {
            path: path.to_path_buf(),
        });
    }
    debug!(
        path = %path.display(),
        updated_at = file.updated_at.as_deref().unwrap_or("unknown"),
        "cookies loaded"
    );
    Ok(cookies)
}

/// Refresh source that re-reads the cookie file on demand.
#[derive(Debug, Clone)]
pub struct FileCookieSource {
    path: PathBuf,
}

impl FileCookieSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CookieSource for FileCookieSource {
    fn fresh_cookies(&self) -> Result<SessionCookies, String> {
        load_cookies(&self.path).map_err(|error| error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn loads_all_three_cookies() {
        let dir = tempdir().expect("tempdir");
        let path = cookies_path(dir.path());
        fs::write(
            &path,
            r#"{"c1":"one","c2":"two","c3":"three","updated_at":"2026-01-01T00:00:00Z"}"#,
        )
        .expect("write");

        let cookies = load_cookies(&path).expect("cookies");
        assert_eq!(cookies, SessionCookies::new("one", "two", "three"));
    }

    #[test]
    fn secondary_cookies_are_optional() {
        let dir = tempdir().expect("tempdir");
        let path = cookies_path(dir.path());
        fs::write(&path, r#"{"c1":"one"}"#).expect("write");

        let cookies = load_cookies(&path).expect("cookies");
        assert_eq!(cookies.secondary, "");
    }

    #[test]
    fn missing_or_empty_files_are_reported() {
        let dir = tempdir().expect("tempdir");
        let path = cookies_path(dir.path());
        assert!(matches!(load_cookies(&path), Err(CookieError::Missing { .. })));

        fs::write(&path, r#"{"c1":"  "}"#).expect("write");
        assert!(matches!(load_cookies(&path), Err(CookieError::Empty { .. })));

        fs::write(&path, "not json").expect("write");
        assert!(matches!(load_cookies(&path), Err(CookieError::Json { .. })));
    }

    #[test]
    fn file_source_rereads_the_file() {
        let dir = tempdir().expect("tempdir");
        let path = cookies_path(dir.path());
        fs::write(&path, r#"{"c1":"old"}"#).expect("write");
        let source = FileCookieSource::new(&path);
        assert_eq!(source.fresh_cookies().map(|c| c.primary), Ok("old".to_owned()));

        fs::write(&path, r#"{"c1":"new"}"#).expect("write");
        assert_eq!(source.fresh_cookies().map(|c| c.primary), Ok("new".to_owned()));
    }
}
