use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::file::FileStore;
use crate::settings::Settings;
use crate::store::LogStore;

/// Supported storage backends, selected via [`Settings::storage_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Indexed SQL table.
    #[default]
    #[serde(alias = "sqlite", alias = "mysql", alias = "database")]
    Relational,
    /// Append-only JSON-lines file.
    File,
}

impl FromStr for StorageType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" | "sqlite" | "mysql" | "database" => Ok(StorageType::Relational),
            "file" => Ok(StorageType::File),
            other => Err(StoreError::Configuration(format!(
                "unknown storage type {:?} (expected \"relational\" or \"file\")",
                other
            ))),
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Relational => f.write_str("relational"),
            StorageType::File => f.write_str("file"),
        }
    }
}

/// Create the concrete [`LogStore`] selected by `settings`.
///
/// This is the single point where the backend is chosen; everything else
/// receives the returned handle.
///
/// The file backend never fails here: a bad path leaves it latched in a
/// broken state that every later call reports. The relational backend
/// fails if the database cannot be opened or migrated.
pub async fn open_store(settings: &Settings) -> Result<Arc<dyn LogStore>, StoreError> {
    match settings.storage_type {
        StorageType::File => {
            let store = match &settings.file_path {
                Some(path) => FileStore::open(path),
                None => FileStore::broken(StoreError::Configuration(
                    "no log file path configured".to_string(),
                )),
            };
            Ok(Arc::new(store) as Arc<dyn LogStore>)
        }
        StorageType::Relational => {
            #[cfg(feature = "sqlite")]
            {
                use crate::sqlite::SqliteStore;

                let store = SqliteStore::connect(&settings.database_url, &settings.table_name).await?;
                Ok(Arc::new(store) as Arc<dyn LogStore>)
            }

            #[cfg(not(feature = "sqlite"))]
            {
                Err(StoreError::Configuration(
                    "relational storage requires the `sqlite` feature".to_string(),
                ))
            }
        }
    }
}
