use std::path::Path;
use std::sync::Arc;

use chat_provider::{ChatBackend, ChatError};
use chat_provider_mock::{ScriptedBackend, MOCK_BACKEND_ID};
use chat_provider_web::{CookieSource, WebBackend, WebBackendConfig, WEB_BACKEND_ID};
use thiserror::Error;
use tracing::info;

use crate::config::Config;
use crate::cookies::{cookies_path, load_cookies, CookieError, FileCookieSource};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unsupported backend '{0}'; available backends: {WEB_BACKEND_ID}, {MOCK_BACKEND_ID}")]
    Unsupported(String),

    #[error(transparent)]
    Cookies(#[from] CookieError),

    #[error(transparent)]
    Backend(#[from] ChatError),
}

/// Builds the backend named by `config.backend`.
pub fn backend_for_config(
    config: &Config,
    config_root: &Path,
) -> Result<Arc<dyn ChatBackend>, BackendError> {
    backend_for_id(&config.backend, config, config_root)
}

pub fn backend_for_id(
    backend_id: &str,
    config: &Config,
    config_root: &Path,
) -> Result<Arc<dyn ChatBackend>, BackendError> {
    match backend_id.trim() {
        WEB_BACKEND_ID => {
            let path = cookies_path(config_root);
            let cookies = load_cookies(&path)?;
            let mut web_config = WebBackendConfig::new(cookies).with_timeouts(
                config.request_timeout(),
                config.send_deadline(),
                config.upload_timeout(),
            );
            if let Some(delay) = config.close_delay() {
                web_config = web_config.with_auto_close(delay, config.auto_re_init);
            }
            let source: Arc<dyn CookieSource> = Arc::new(FileCookieSource::new(path));
            let backend = WebBackend::new(web_config, Some(source))?;
            info!(backend = WEB_BACKEND_ID, "backend ready");
            Ok(Arc::new(backend))
        }
        MOCK_BACKEND_ID => {
            info!(backend = MOCK_BACKEND_ID, "backend ready");
            Ok(Arc::new(ScriptedBackend::echo()))
        }
        unknown => Err(BackendError::Unsupported(unknown.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn mock_backend_resolves_without_cookies() {
        let dir = tempdir().expect("tempdir");
        let backend = backend_for_id("mock", &Config::default(), dir.path()).expect("mock");
        assert_eq!(backend.profile().backend_id, MOCK_BACKEND_ID);
    }

    #[test]
    fn web_backend_requires_cookie_file() {
        let dir = tempdir().expect("tempdir");
        let error = match backend_for_id("web", &Config::default(), dir.path()) {
            Ok(_) => panic!("web backend needs cookies"),
            Err(error) => error,
        };
        assert!(matches!(error, BackendError::Cookies(CookieError::Missing { .. })));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let error = match backend_for_id("custom", &Config::default(), dir.path()) {
            Ok(_) => panic!("unknown backends should fail"),
            Err(error) => error,
        };
        assert!(error.to_string().contains("unsupported backend 'custom'"));
    }
}
