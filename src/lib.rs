pub mod record;
pub mod error;
pub mod store;
pub mod backend;
pub mod settings;
pub mod file;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub mod logbook;
pub mod init;

pub use backend::{open_store, StorageType};
pub use error::{Diagnostic, ErrorKind, StoreError};
pub use file::FileStore;
pub use logbook::Logbook;
pub use record::{CallerInfo, LogRecord, NewRecord};
pub use settings::Settings;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use store::{LogStore, PageRequest, QueryResult};
