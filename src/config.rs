//! Configuration loader and validator for the agenda conductor.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Top-level YAML document. Only `app` is required.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub autosave: AutosaveSettings,
    #[serde(default)]
    pub audit: AuditSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Autosave period bounds, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutosaveSettings {
    pub default_seconds: u64,
    pub min_seconds: u64,
    pub max_seconds: u64,
}

impl Default for AutosaveSettings {
    fn default() -> Self {
        Self {
            default_seconds: 30,
            min_seconds: 5,
            max_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditSettings {
    pub max_entries_per_meeting: i64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            max_entries_per_meeting: 500,
        }
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match (self.data_dir.strip_prefix("~/"), std::env::var("HOME")) {
            (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
            _ => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Create `app.data_dir` so the SQLite file can be opened.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` if set, otherwise a SQLite file inside the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/conductor.db", self.app.resolved_data_dir()))
    }
}

/// Read and validate a YAML config; `None` means `./config.yaml`.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let a = &cfg.autosave;
    if a.min_seconds == 0 {
        return Err(ConfigError::Invalid("autosave.min_seconds must be > 0"));
    }
    if a.max_seconds < a.min_seconds {
        return Err(ConfigError::Invalid(
            "autosave.max_seconds must be >= autosave.min_seconds",
        ));
    }
    if a.default_seconds == 0 {
        return Err(ConfigError::Invalid("autosave.default_seconds must be > 0"));
    }

    if cfg.audit.max_entries_per_meeting <= 0 {
        return Err(ConfigError::Invalid(
            "audit.max_entries_per_meeting must be > 0",
        ));
    }

    Ok(())
}

/// Config printed by `--print-example-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

autosave:
  default_seconds: 30
  min_seconds: 5
  max_seconds: 300

audit:
  max_entries_per_meeting: 500
"#
}
