use serde::Serialize;
use std::error::Error;
use std::fmt;

/// Coarse classification of every failure a store can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or missing path, storage type or table name.
    Configuration,
    /// File unreadable/unwritable or directory uncreatable.
    Io,
    /// A value could not be serialized.
    Encoding,
    /// The underlying engine failed.
    Backend,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Io => "i/o error",
            ErrorKind::Encoding => "encoding error",
            ErrorKind::Backend => "backend error",
        };
        f.write_str(name)
    }
}

/// Cloneable snapshot of a failure, suitable for caching and for handing
/// to a presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub reason: String,
}

impl Diagnostic {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Diagnostic { kind, reason: reason.into() }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// Error type returned by every [`LogStore`](crate::store::LogStore)
/// operation.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("i/o error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn Error + Send + Sync>),

    /// The store is latched in a broken state; every call reports the
    /// diagnostic captured when it broke.
    #[error("store unavailable: {0}")]
    Unavailable(Diagnostic),
}

impl StoreError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io { context: context.into(), source }
    }

    pub fn backend(reason: impl Into<String>) -> Self {
        let reason: String = reason.into();
        StoreError::Backend(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Configuration(_) => ErrorKind::Configuration,
            StoreError::Io { .. } => ErrorKind::Io,
            StoreError::Encoding(_) => ErrorKind::Encoding,
            StoreError::Backend(_) => ErrorKind::Backend,
            StoreError::Unavailable(diagnostic) => diagnostic.kind,
        }
    }

    /// Reduce this error to its kind and a human-readable reason.
    pub fn diagnostic(&self) -> Diagnostic {
        match self {
            StoreError::Unavailable(diagnostic) => diagnostic.clone(),
            StoreError::Configuration(reason) => Diagnostic::new(ErrorKind::Configuration, reason.clone()),
            StoreError::Io { context, source } => {
                Diagnostic::new(ErrorKind::Io, format!("{}: {}", context, source))
            }
            StoreError::Encoding(e) => Diagnostic::new(ErrorKind::Encoding, e.to_string()),
            StoreError::Backend(e) => Diagnostic::new(ErrorKind::Backend, e.to_string()),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(Box::new(err))
    }
}
