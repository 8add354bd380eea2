//! User configuration and config-root resolution.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chat_provider::Model;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::attachments::DEFAULT_MAX_UPLOAD_BYTES;

pub const CONFIG_TOML: &str = "config.toml";
pub const CONFIG_JSON: &str = "config.json";
pub const HOME_ENV: &str = "GEM_CHAT_HOME";
pub const MODEL_ENV: &str = "GEM_CHAT_MODEL";
pub const VERBOSE_ENV: &str = "GEM_CHAT_VERBOSE";
pub const BACKEND_ENV: &str = "GEM_CHAT_BACKEND";
const APP_DIR: &str = "gem-chat";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write TOML for {path}: {source}")]
    TomlSerialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    InvalidEnv { key: &'static str, reason: String },

    #[error("no config directory; pass --config-dir or set {HOME_ENV}")]
    NoConfigRoot,
}

impl ConfigError {
    fn io(operation: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Json,
}

impl ConfigFormat {
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Toml => CONFIG_TOML,
            Self::Json => CONFIG_JSON,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(alias = "defaultModel")]
    pub default_model: Model,
    pub verbose: bool,
    #[serde(alias = "autoClose")]
    pub auto_close: bool,
    #[serde(alias = "closeDelaySeconds")]
    pub close_delay_seconds: u64,
    #[serde(alias = "autoReInit")]
    pub auto_re_init: bool,
    #[serde(alias = "copyToClipboard")]
    pub copy_to_clipboard: bool,
    #[serde(alias = "markdownStyle")]
    pub markdown_style: String,
    #[serde(alias = "tuiTheme")]
    pub tui_theme: String,
    #[serde(alias = "requestTimeoutSeconds")]
    pub request_timeout_seconds: u64,
    #[serde(alias = "sendDeadlineSeconds")]
    pub send_deadline_seconds: u64,
    #[serde(alias = "uploadTimeoutSeconds")]
    pub upload_timeout_seconds: u64,
    #[serde(alias = "maxUploadBytes")]
    pub max_upload_bytes: u64,
    pub backend: String,
    /// Keys this version does not know; written back untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    format: ConfigFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_model: Model::Unspecified,
            verbose: false,
            auto_close: false,
            close_delay_seconds: 300,
            auto_re_init: true,
            copy_to_clipboard: false,
            markdown_style: "dark".to_owned(),
            tui_theme: "default".to_owned(),
            request_timeout_seconds: 60,
            send_deadline_seconds: 180,
            upload_timeout_seconds: 120,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            backend: "web".to_owned(),
            extra: BTreeMap::new(),
            format: ConfigFormat::Toml,
        }
    }
}

impl Config {
    /// Loads `config.toml`, else `config.json`, else defaults.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let toml_path = root.join(CONFIG_TOML);
        if toml_path.is_file() {
            let text = read(&toml_path)?;
            let mut config: Config = toml::from_str(&text).map_err(|source| ConfigError::Toml {
                path: toml_path.clone(),
                source,
            })?;
            config.format = ConfigFormat::Toml;
            debug!(path = %toml_path.display(), "config loaded");
            return Ok(config);
        }

        let json_path = root.join(CONFIG_JSON);
        if json_path.is_file() {
            let text = read(&json_path)?;
            let mut config: Config =
                serde_json::from_str(&text).map_err(|source| ConfigError::Json {
                    path: json_path.clone(),
                    source,
                })?;
            config.format = ConfigFormat::Json;
            debug!(path = %json_path.display(), "config loaded");
            return Ok(config);
        }

        Ok(Self::default())
    }

    /// Loads the config, writing a default `config.toml` when none exists.
    pub fn load_or_init(root: &Path) -> Result<Self, ConfigError> {
        let exists = root.join(CONFIG_TOML).is_file() || root.join(CONFIG_JSON).is_file();
        let config = Self::load(root)?;
        if !exists {
            config.save(root)?;
            info!(root = %root.display(), "wrote default config");
        }
        Ok(config)
    }

    /// Writes in the format the config was loaded from.
    pub fn save(&self, root: &Path) -> Result<PathBuf, ConfigError> {
        let path = root.join(self.format.file_name());
        let text = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self).map_err(|source| {
                ConfigError::TomlSerialize {
                    path: path.clone(),
                    source,
                }
            })?,
            ConfigFormat::Json => {
                let mut text =
                    serde_json::to_string_pretty(self).map_err(|source| ConfigError::Json {
                        path: path.clone(),
                        source,
                    })?;
                text.push('\n');
                text
            }
        };
        fs::create_dir_all(root).map_err(|error| ConfigError::io("creating", root, error))?;
        write_atomic(&path, text.as_bytes())?;
        Ok(path)
    }

    #[must_use]
    pub fn format(&self) -> ConfigFormat {
        self.format
    }

    /// Applies `GEM_CHAT_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = non_empty(lookup(MODEL_ENV)) {
            self.default_model = value
                .parse()
                .map_err(|reason| ConfigError::InvalidEnv {
                    key: MODEL_ENV,
                    reason,
                })?;
        }
        if let Some(value) = non_empty(lookup(VERBOSE_ENV)) {
            self.verbose = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Some(value) = non_empty(lookup(BACKEND_ENV)) {
            self.backend = value.trim().to_ascii_lowercase();
        }
        Ok(())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    #[must_use]
    pub fn send_deadline(&self) -> Duration {
        Duration::from_secs(self.send_deadline_seconds)
    }

    #[must_use]
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_seconds)
    }

    /// Idle delay before the web session is dropped, if enabled.
    #[must_use]
    pub fn close_delay(&self) -> Option<Duration> {
        self.auto_close
            .then(|| Duration::from_secs(self.close_delay_seconds))
    }
}

/// `--config-dir`, else `GEM_CHAT_HOME`, else the platform config dir.
pub fn resolve_config_root<F>(explicit: Option<&Path>, lookup: F) -> Result<PathBuf, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(home) = non_empty(lookup(HOME_ENV)) {
        return Ok(PathBuf::from(home));
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR))
        .ok_or(ConfigError::NoConfigRoot)
}

/// Process environment lookup for [`Config::apply_env_overrides`].
#[must_use]
pub fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|error| ConfigError::io("reading", path, error))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ConfigError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.tmp"));

    let mut file =
        fs::File::create(&temp).map_err(|error| ConfigError::io("creating", &temp, error))?;
    file.write_all(bytes)
        .map_err(|error| ConfigError::io("writing", &temp, error))?;
    file.sync_all()
        .map_err(|error| ConfigError::io("syncing", &temp, error))?;
    drop(file);
    fs::rename(&temp, path).map_err(|error| ConfigError::io("renaming", path, error))
}
