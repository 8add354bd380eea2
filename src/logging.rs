//! Subscriber setup for the binary.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "GEM_CHAT_LOG";
pub const LOG_FILE: &str = "gem-chat.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    File(PathBuf),
    Stderr,
}

impl LogTarget {
    #[must_use]
    pub fn in_config_root(root: &Path) -> Self {
        Self::File(root.join(LOG_FILE))
    }
}

/// `GEM_CHAT_LOG` when set, else `debug` for verbose runs and `info` otherwise.
#[must_use]
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Installs the global subscriber. A second call is a no-op.
pub fn init_logging(target: &LogTarget, verbose: bool) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let installed = match target {
        LogTarget::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .try_init()
        }
        LogTarget::Stderr => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init(),
    };
    // Already installed (tests, embedding callers).
    let _ = installed;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_the_default_level() {
        assert_eq!(default_directive(false), "info");
        assert_eq!(default_directive(true), "debug");
    }

    #[test]
    fn file_target_lives_in_config_root() {
        assert_eq!(
            LogTarget::in_config_root(Path::new("/tmp/gem")),
            LogTarget::File(PathBuf::from("/tmp/gem/gem-chat.log"))
        );
    }
}
