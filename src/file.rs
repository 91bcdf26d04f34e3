use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::StorageType;
use crate::error::{Diagnostic, StoreError};
use crate::record::{
    format_timestamp, metadata_text, normalize_metadata, parse_timestamp, LogRecord, NewRecord, DEFAULT_TIMEZONE,
};
use crate::store::{LogStore, PageRequest, QueryResult};

/// Append-only JSON-lines backend.
///
/// Each record is one line:
/// `{"timestamp":..,"timezone":..,"message":..,"metadata":{..}}`.
///
/// There is no index, so every query reads and parses the whole file,
/// filters, sorts newest first and then slices the requested page. This
/// backend targets small and medium logs.
///
/// Appends and truncation hold an exclusive advisory lock for the single
/// operation. Reads take no lock; a half-written trailing line is skipped
/// like any other undecodable line.
///
/// If the path cannot be validated, or a write fails, the store latches a
/// [`Diagnostic`] and every later call fails with
/// [`StoreError::Unavailable`] until [`FileStore::revalidate`] succeeds.
pub struct FileStore {
    path: PathBuf,
    failure: RwLock<Option<Diagnostic>>,
}

#[derive(Serialize)]
struct LineOut<'a> {
    timestamp: String,
    timezone: &'a str,
    message: &'a str,
    metadata: &'a Value,
}

#[derive(Deserialize)]
struct LineIn {
    timestamp: String,
    #[serde(default = "default_timezone")]
    timezone: String,
    message: String,
    #[serde(default, alias = "meta_data")]
    metadata: Value,
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

impl FileStore {
    /// Validate `path` and build a store for it. Validation failure does
    /// not return an error; it leaves the store latched.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let failure = validate_path(&path).err().map(|e| {
            warn!(path = %path.display(), error = %e, "log file is unusable");
            e.diagnostic()
        });
        FileStore {
            path,
            failure: RwLock::new(failure),
        }
    }

    /// A store that reports `err` from every call.
    pub fn broken(err: StoreError) -> Self {
        FileStore {
            path: PathBuf::new(),
            failure: RwLock::new(Some(err.diagnostic())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The latched failure, if the store is currently broken.
    pub fn last_error(&self) -> Option<Diagnostic> {
        self.failure.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Re-run path validation and clear the latched failure on success.
    pub fn revalidate(&self) -> Result<(), StoreError> {
        match validate_path(&self.path) {
            Ok(()) => {
                *self.failure.write().unwrap_or_else(|e| e.into_inner()) = None;
                Ok(())
            }
            Err(e) => {
                self.latch(&e);
                Err(e)
            }
        }
    }

    fn ensure_usable(&self) -> Result<(), StoreError> {
        match self.last_error() {
            Some(diagnostic) => Err(StoreError::Unavailable(diagnostic)),
            None => Ok(()),
        }
    }

    fn latch(&self, err: &StoreError) {
        warn!(path = %self.path.display(), error = %err, "file store marked unavailable");
        *self.failure.write().unwrap_or_else(|e| e.into_inner()) = Some(err.diagnostic());
    }

    /// Run a write-side operation, latching the store if it fails.
    async fn guarded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Path) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_usable()?;
        let path = self.path.clone();
        let outcome = run_blocking(move || op(&path)).await;
        if let Err(e) = &outcome {
            self.latch(e);
        }
        outcome
    }
}

fn validate_path(path: &Path) -> Result<(), StoreError> {
    if path.as_os_str().is_empty() {
        return Err(StoreError::Configuration("no log file path configured".to_string()));
    }
    if !path.is_absolute() {
        return Err(StoreError::Configuration(format!(
            "log file path {} is not absolute",
            path.display()
        )));
    }
    if path.is_dir() {
        return Err(StoreError::Configuration(format!(
            "log file path {} is a directory",
            path.display()
        )));
    }

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| StoreError::io(format!("creating log directory {}", dir.display()), e))?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(format!("opening {} for writing", path.display()), e))?;

    Ok(())
}

async fn run_blocking<T, F>(op: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| StoreError::backend(format!("file worker failed: {}", e)))?
}

/// Exclusive advisory lock held for the lifetime of the guard.
#[cfg_attr(not(unix), allow(dead_code))]
struct ExclusiveLock<'a> {
    file: &'a File,
}

impl<'a> ExclusiveLock<'a> {
    fn acquire(file: &'a File) -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            // SAFETY: the descriptor stays open for as long as `file` is borrowed.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(ExclusiveLock { file })
    }
}

impl Drop for ExclusiveLock<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            // SAFETY: see `acquire`. Closing the file would release it too.
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

fn append_line(path: &Path, line: &[u8]) -> Result<(), StoreError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(format!("opening {} for append", path.display()), e))?;
    let _lock = ExclusiveLock::acquire(&file)
        .map_err(|e| StoreError::io(format!("locking {}", path.display()), e))?;

    let len_before = file
        .metadata()
        .map_err(|e| StoreError::io(format!("inspecting {}", path.display()), e))?
        .len();

    if let Err(e) = (&file).write_all(line) {
        // Drop whatever part of the line made it to disk.
        let _ = file.set_len(len_before);
        return Err(StoreError::io(format!("writing to {}", path.display()), e));
    }

    Ok(())
}

fn truncate(path: &Path) -> Result<(), StoreError> {
    let file = match OpenOptions::new().write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StoreError::io(format!("opening {} for truncation", path.display()), e)),
    };
    let _lock = ExclusiveLock::acquire(&file)
        .map_err(|e| StoreError::io(format!("locking {}", path.display()), e))?;
    file.set_len(0)
        .map_err(|e| StoreError::io(format!("truncating {}", path.display()), e))
}

fn decode_line(bytes: &[u8]) -> Option<LogRecord> {
    let line: LineIn = serde_json::from_slice(bytes).ok()?;
    let timestamp = parse_timestamp(&line.timestamp, &line.timezone)?;
    Some(LogRecord {
        id: None,
        timestamp,
        timezone: line.timezone,
        message: line.message,
        metadata: normalize_metadata(line.metadata),
    })
}

fn scan(path: &Path, request: &PageRequest) -> Result<QueryResult, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(QueryResult::default()),
        Err(e) => return Err(StoreError::io(format!("opening {}", path.display()), e)),
    };

    let mut matched = Vec::new();
    let mut skipped = 0usize;

    for chunk in BufReader::new(file).split(b'\n') {
        let bytes = chunk.map_err(|e| StoreError::io(format!("reading {}", path.display()), e))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let Some(record) = decode_line(&bytes) else {
            skipped += 1;
            continue;
        };
        if request.matches(&record.message, &metadata_text(&record.metadata)) {
            matched.push(record);
        }
    }

    if skipped > 0 {
        debug!(path = %path.display(), skipped, "skipped undecodable log lines");
    }

    // Later lines first, then a stable sort keeps that order among equal
    // timestamps.
    matched.reverse();
    matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let total = matched.len() as u64;
    let start = usize::try_from(request.offset()).unwrap_or(usize::MAX);
    let records = matched
        .into_iter()
        .skip(start)
        .take(request.page_size() as usize)
        .collect();

    Ok(QueryResult::new(records, total))
}

#[async_trait]
impl LogStore for FileStore {
    async fn insert(&self, record: &NewRecord) -> Result<Option<i64>, StoreError> {
        self.ensure_usable()?;

        let mut line = serde_json::to_string(&LineOut {
            timestamp: format_timestamp(&record.timestamp),
            timezone: &record.timezone,
            message: &record.message,
            metadata: &record.metadata,
        })?;
        line.push('\n');

        self.guarded(move |path| append_line(path, line.as_bytes())).await?;
        Ok(None)
    }

    async fn query(&self, request: &PageRequest) -> Result<QueryResult, StoreError> {
        self.ensure_usable()?;
        let path = self.path.clone();
        let request = request.clone();
        run_blocking(move || scan(&path, &request)).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.guarded(truncate).await
    }

    fn kind(&self) -> StorageType {
        StorageType::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn entry(message: &str, secs: i64) -> NewRecord {
        NewRecord {
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            timezone: "Europe/Berlin".into(),
            message: message.into(),
            metadata: json!({"file": "src/upload.rs", "line": 88, "function": "store", "class": "Uploader"}),
        }
    }

    #[tokio::test]
    async fn creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/app.jsonl");
        let store = FileStore::open(&path);

        assert!(store.last_error().is_none());
        assert!(path.exists());
        assert_eq!(store.insert(&entry("\"hello\"", 1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn writes_one_json_object_per_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.jsonl");
        let store = FileStore::open(&path);
        store.insert(&entry("{\n  \"a\": 1\n}", 1)).await.unwrap();
        store.insert(&entry("\"b\"", 2)).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["timezone"], "Europe/Berlin");
        assert_eq!(first["metadata"]["class"], "Uploader");
        assert_eq!(first["timestamp"], "2023-11-14T22:13:21.000000Z");
    }

    #[tokio::test]
    async fn corrupt_and_truncated_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.jsonl");
        let good = r#"{"timestamp":"2024-02-01T10:00:00.000000Z","timezone":"UTC","message":"\"ok\"","metadata":{}}"#;
        let mut content = Vec::new();
        content.extend_from_slice(good.as_bytes());
        content.extend_from_slice(b"\nnot json at all\n\xff\xfe\n\n");
        content.extend_from_slice(br#"{"timestamp":"2024-02-01T10:00:01.000000Z","timezone":"UTC","mess"#);
        std::fs::write(&path, content).unwrap();

        let store = FileStore::open(&path);
        let result = store.query(&PageRequest::all(1, 10)).await.unwrap();
        assert!(result.is_ok());
        assert_eq!(result.total, 1);
        assert_eq!(result.records[0].message, "\"ok\"");
    }

    #[tokio::test]
    async fn legacy_lines_are_normalized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jl.txt");
        let legacy = r#"{"timestamp":"2023-08-01 12:00:00","message":"\"old\"","meta_data":"{\"file\":\"x.php\",\"line\":5,\"function\":\"f\",\"class\":\"N\/A\"}"}"#;
        std::fs::write(&path, format!("{}\n", legacy)).unwrap();

        let store = FileStore::open(&path);
        let result = store.query(&PageRequest::new(1, 10, "x.php")).await.unwrap();
        assert_eq!(result.total, 1);
        let record = &result.records[0];
        assert_eq!(record.timezone, "UTC");
        assert_eq!(record.metadata["line"], 5);
        assert_eq!(record.timestamp, Utc.with_ymd_and_hms(2023, 8, 1, 12, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn legacy_wall_clock_uses_the_line_timezone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jl.txt");
        let lines = [
            r#"{"timestamp":"2023-08-01 12:00:00","timezone":"Asia/Dhaka","message":"\"dhaka\"","metadata":{}}"#,
            r#"{"timestamp":"2023-08-01 07:00:00","timezone":"UTC","message":"\"utc\"","metadata":{}}"#,
        ];
        std::fs::write(&path, format!("{}\n", lines.join("\n"))).unwrap();

        let result = FileStore::open(&path).query(&PageRequest::all(1, 10)).await.unwrap();
        let order: Vec<&str> = result.records.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(order, vec!["\"utc\"", "\"dhaka\""]);
        assert_eq!(result.records[1].timestamp, Utc.with_ymd_and_hms(2023, 8, 1, 6, 0, 0).unwrap());
        assert_eq!(result.records[1].timezone, "Asia/Dhaka");
    }

    #[tokio::test]
    async fn equal_timestamps_keep_newest_written_first() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("app.jsonl"));
        store.insert(&entry("\"first\"", 5)).await.unwrap();
        store.insert(&entry("\"second\"", 5)).await.unwrap();

        let result = store.query(&PageRequest::all(1, 10)).await.unwrap();
        assert_eq!(result.records[0].message, "\"second\"");
        assert_eq!(result.records[1].message, "\"first\"");
    }

    #[tokio::test]
    async fn relative_path_latches_configuration_error() {
        let store = FileStore::open("logs/app.jsonl");
        let first = store.insert(&entry("\"x\"", 1)).await.unwrap_err();
        let second = store.query(&PageRequest::all(1, 10)).await.unwrap_err();
        let third = store.clear().await.unwrap_err();

        assert_eq!(first.kind(), ErrorKind::Configuration);
        assert_eq!(first.diagnostic(), second.diagnostic());
        assert_eq!(second.diagnostic(), third.diagnostic());
        assert!(matches!(third, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn broken_store_recovers_after_revalidate() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let path = blocker.join("app.jsonl");

        let store = FileStore::open(&path);
        let diagnostic = store.last_error().unwrap();
        assert_eq!(diagnostic.kind, ErrorKind::Io);
        assert!(store.revalidate().is_err());
        assert_eq!(store.clear().await.unwrap_err().diagnostic(), diagnostic);

        std::fs::remove_file(&blocker).unwrap();
        store.revalidate().unwrap();
        store.insert(&entry("\"back\"", 1)).await.unwrap();
        assert_eq!(store.query(&PageRequest::all(1, 10)).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn clear_without_file_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.jsonl");
        let store = FileStore::open(&path);
        std::fs::remove_file(&path).unwrap();

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        let result = store.query(&PageRequest::all(1, 10)).await.unwrap();
        assert_eq!(result.total, 0);
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_never_interleave() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.jsonl");
        let store = Arc::new(FileStore::open(&path));
        let payload = format!("\"{}\"", "x".repeat(8 * 1024));

        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            let payload = payload.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    store.insert(&entry(&payload, worker * 100 + i)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 200);
        assert!(raw.lines().all(|l| serde_json::from_str::<Value>(l).is_ok()));
        assert_eq!(store.query(&PageRequest::all(1, 1)).await.unwrap().total, 200);
    }
}
