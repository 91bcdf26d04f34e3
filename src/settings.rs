//! Configuration for the logging facility.
//!
//! Settings come from a TOML file or from environment variables. The core
//! store types never read the environment themselves; they are built from a
//! [`Settings`] value once at startup.

use crate::backend::StorageType;
use crate::error::StoreError;
use crate::record::DEFAULT_TIMEZONE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Selected backend: `relational` or `file`.
pub const LOGSHELF_STORAGE_TYPE_ENV: &str = "LOGSHELF_STORAGE_TYPE";

/// Absolute path of the JSON-lines log file.
pub const LOGSHELF_FILE_PATH_ENV: &str = "LOGSHELF_FILE_PATH";

/// SQLite connection URL, e.g. `sqlite:///var/lib/app/logs.db`.
pub const LOGSHELF_DATABASE_URL_ENV: &str = "LOGSHELF_DATABASE_URL";

/// Table holding log entries in the relational backend.
pub const LOGSHELF_TABLE_NAME_ENV: &str = "LOGSHELF_TABLE_NAME";

/// Zone label stamped on new records.
pub const LOGSHELF_TIMEZONE_ENV: &str = "LOGSHELF_TIMEZONE";

fn default_database_url() -> String {
    "sqlite://logshelf.db".to_string()
}

fn default_table_name() -> String {
    "log_entries".to_string()
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub storage_type: StorageType,

    /// Required when `storage_type` is `file`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// IANA zone name or `UTC`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            storage_type: StorageType::default(),
            file_path: None,
            database_url: default_database_url(),
            table_name: default_table_name(),
            timezone: default_timezone(),
        }
    }
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Self, StoreError> {
        toml::from_str(content)
            .map_err(|e| StoreError::Configuration(format!("invalid settings: {}", e)))
    }

    /// Load settings from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::io(format!("reading settings {}", path.display()), e))?;
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by `LOGSHELF_*` environment variables. The zone
    /// falls back to `TZ` when `LOGSHELF_TIMEZONE` is unset.
    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, StoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut settings = Settings::default();

        if let Some(kind) = get(LOGSHELF_STORAGE_TYPE_ENV) {
            settings.storage_type = kind.parse()?;
        }
        if let Some(path) = get(LOGSHELF_FILE_PATH_ENV) {
            settings.file_path = Some(PathBuf::from(path));
        }
        if let Some(url) = get(LOGSHELF_DATABASE_URL_ENV) {
            settings.database_url = url;
        }
        if let Some(table) = get(LOGSHELF_TABLE_NAME_ENV) {
            settings.table_name = table;
        }
        if let Some(tz) = get(LOGSHELF_TIMEZONE_ENV).or_else(|| get("TZ")) {
            settings.timezone = tz;
        }

        Ok(settings)
    }

    /// String view of a single setting, `None` when unset or unknown.
    pub fn get_setting(&self, key: &str) -> Option<String> {
        match key {
            "storage_type" => Some(self.storage_type.to_string()),
            "file_path" => self.file_path.as_ref().map(|p| p.display().to_string()),
            "database_url" => Some(self.database_url.clone()),
            "table_name" => Some(self.table_name.clone()),
            "timezone" => Some(self.timezone.clone()),
            _ => None,
        }
    }
}
