use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::backend::StorageType;
use crate::error::StoreError;
use crate::record::{
    format_timestamp, metadata_text, normalize_metadata, parse_timestamp, LogRecord, NewRecord, STORED_GLOB,
};
use crate::store::{LogStore, PageRequest, QueryResult};

/// Relational backend: one SQLite table indexed on `timestamp`.
///
/// ```sql
/// CREATE TABLE log_entries (
///   id        INTEGER PRIMARY KEY,
///   timestamp TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%f', 'now') || '000Z'),
///   timezone  TEXT NOT NULL DEFAULT 'UTC',
///   message   TEXT NOT NULL,
///   metadata  TEXT NOT NULL
/// );
/// ```
///
/// `timestamp` always holds the fixed-width UTC form, so ordering by its
/// text is chronological. Legacy rows are rewritten when the store opens,
/// and rows whose timestamp still cannot be read are left out of queries.
/// `id` is a plain rowid, so numbering restarts after [`LogStore::clear`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    table: String,
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: i64,
    timestamp: String,
    timezone: String,
    message: String,
    metadata: String,
}

impl EntryRow {
    fn into_record(self) -> Option<LogRecord> {
        let Some(timestamp) = parse_timestamp(&self.timestamp, &self.timezone) else {
            warn!(id = self.id, timestamp = %self.timestamp, "skipping row with an unreadable timestamp");
            return None;
        };
        let metadata = match serde_json::from_str::<Value>(&self.metadata) {
            Ok(value) => normalize_metadata(value),
            Err(_) => Value::String(self.metadata),
        };

        Some(LogRecord {
            id: Some(self.id),
            timestamp,
            timezone: self.timezone,
            message: self.message,
            metadata,
        })
    }
}

impl SqliteStore {
    /// Open (creating if missing) the database at `database_url` and bring
    /// `table` up to the current schema.
    ///
    /// In-memory URLs get a single pinned connection, since every SQLite
    /// memory connection is a separate database.
    pub async fn connect(database_url: &str, table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;

        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new();

        if in_memory {
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>);
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            pool_options = pool_options.max_connections(5);
        }

        let pool = pool_options.connect_with(options).await?;
        Self::with_pool(pool, table).await
    }

    pub async fn in_memory(table: &str) -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", table).await
    }

    /// Wrap an existing pool. Schema creation and upgrades run here and
    /// are safe to repeat.
    pub async fn with_pool(pool: SqlitePool, table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        let store = SqliteStore {
            pool,
            table: table.to_string(),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let table = &self.table;

        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY,
                timestamp TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%f', 'now') || '000Z'),
                timezone TEXT NOT NULL DEFAULT 'UTC',
                message TEXT NOT NULL,
                metadata TEXT NOT NULL
            )
            "#
        );
        sqlx::query(&create).execute(&self.pool).await?;

        let columns = self.columns().await?;

        if !columns.contains("metadata") && columns.contains("meta_data") {
            info!(table = %table, "renaming legacy meta_data column");
            let rename = format!("ALTER TABLE {table} RENAME COLUMN meta_data TO metadata");
            sqlx::query(&rename).execute(&self.pool).await?;
        }

        if !columns.contains("timezone") {
            info!(table = %table, "adding timezone column");
            let add = format!("ALTER TABLE {table} ADD COLUMN timezone TEXT NOT NULL DEFAULT 'UTC'");
            sqlx::query(&add).execute(&self.pool).await?;
        }

        self.upgrade_legacy_rows().await?;

        let index = format!("CREATE INDEX IF NOT EXISTS {table}_timestamp_idx ON {table}(timestamp)");
        sqlx::query(&index).execute(&self.pool).await?;

        Ok(())
    }

    /// Rewrite rows left by older writers: wall-clock timestamps become the
    /// stored UTC form (read in the row's own zone) and string-encoded
    /// metadata becomes the JSON it encodes. Rows already in shape are not
    /// selected, so repeat runs only revisit unreadable timestamps.
    async fn upgrade_legacy_rows(&self) -> Result<(), StoreError> {
        let table = &self.table;
        let select = format!(
            "SELECT id, timestamp, timezone, metadata FROM {table} \
             WHERE timestamp NOT GLOB '{STORED_GLOB}' OR metadata LIKE '\"%'"
        );
        let rows = sqlx::query_as::<_, (i64, Option<String>, String, String)>(&select)
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Ok(());
        }

        let update = format!("UPDATE {table} SET timestamp = ?, metadata = ? WHERE id = ?");
        let mut tx = self.pool.begin().await?;
        let mut rewritten = 0usize;
        let mut unreadable = 0usize;

        for (id, raw_timestamp, timezone, raw_metadata) in rows {
            let timestamp = match raw_timestamp.as_deref().and_then(|raw| parse_timestamp(raw, &timezone)) {
                Some(ts) => Some(format_timestamp(&ts)),
                None => {
                    unreadable += 1;
                    raw_timestamp.clone()
                }
            };
            let metadata = match serde_json::from_str::<Value>(&raw_metadata) {
                Ok(value @ Value::String(_)) => metadata_text(&normalize_metadata(value)),
                _ => raw_metadata.clone(),
            };
            if timestamp == raw_timestamp && metadata == raw_metadata {
                continue;
            }

            sqlx::query(&update)
                .bind(timestamp)
                .bind(metadata)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            rewritten += 1;
        }

        tx.commit().await?;

        if rewritten > 0 {
            info!(table = %table, rewritten, "upgraded legacy log rows");
        }
        if unreadable > 0 {
            warn!(table = %table, unreadable, "rows with unreadable timestamps are hidden from queries");
        }
        Ok(())
    }

    async fn columns(&self) -> Result<HashSet<String>, StoreError> {
        let pragma = format!("PRAGMA table_info({})", self.table);
        let rows = sqlx::query(&pragma).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(StoreError::from))
            .collect()
    }

    /// Fetch a single record by id.
    pub async fn get(&self, id: i64) -> Result<Option<LogRecord>, StoreError> {
        let sql = format!(
            "SELECT id, timestamp, timezone, message, metadata FROM {} WHERE id = ?",
            self.table
        );
        let row = sqlx::query_as::<_, EntryRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(EntryRow::into_record))
    }

    /// Remove the table entirely. Used when uninstalling.
    pub async fn drop_table(&self) -> Result<(), StoreError> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.table);
        sqlx::query(&sql).execute(&self.pool).await?;
        info!(table = %self.table, "dropped log table");
        Ok(())
    }
}

/// Table names are interpolated into SQL, so only `[A-Za-z0-9_]` is allowed.
fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let valid = !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::Configuration(format!("invalid table name {:?}", table)))
    }
}

/// Escape `LIKE` wildcards so user input matches literally under
/// `ESCAPE '\'`.
fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Shared `WHERE` clause and its bind values; the page and count queries
/// must use the same predicate. Rows whose timestamp is not in the stored
/// form are excluded from both.
fn search_filter(request: &PageRequest) -> (String, Vec<String>) {
    let mut clause = format!("timestamp GLOB '{STORED_GLOB}'");
    let mut binds = Vec::new();

    if let Some(term) = request.search() {
        let pattern = format!("%{}%", escape_like(term));
        clause.push_str(" AND (message LIKE ? ESCAPE '\\' OR metadata LIKE ? ESCAPE '\\')");
        binds.push(pattern.clone());
        binds.push(pattern);
    }

    (clause, binds)
}

#[async_trait]
impl LogStore for SqliteStore {
    async fn insert(&self, record: &NewRecord) -> Result<Option<i64>, StoreError> {
        let sql = format!(
            "INSERT INTO {} (timestamp, timezone, message, metadata) VALUES (?, ?, ?, ?)",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(format_timestamp(&record.timestamp))
            .bind(&record.timezone)
            .bind(&record.message)
            .bind(metadata_text(&record.metadata))
            .execute(&self.pool)
            .await?;

        Ok(Some(result.last_insert_rowid()))
    }

    async fn query(&self, request: &PageRequest) -> Result<QueryResult, StoreError> {
        let (clause, binds) = search_filter(request);
        let limit = i64::from(request.page_size());
        let offset = i64::try_from(request.offset()).unwrap_or(i64::MAX);

        // One read transaction so the count and the page share a snapshot.
        let mut tx = self.pool.begin().await?;

        let count_sql = format!("SELECT COUNT(*) FROM {} WHERE {}", self.table, clause);
        let mut count = sqlx::query_scalar::<_, i64>(&count_sql);
        for value in &binds {
            count = count.bind(value.as_str());
        }
        let total = count.fetch_one(&mut *tx).await?;

        let page_sql = format!(
            "SELECT id, timestamp, timezone, message, metadata FROM {} WHERE {} \
             ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
            self.table, clause
        );
        let mut page = sqlx::query_as::<_, EntryRow>(&page_sql);
        for value in &binds {
            page = page.bind(value.as_str());
        }
        let rows = page.bind(limit).bind(offset).fetch_all(&mut *tx).await?;

        tx.commit().await?;

        let records: Vec<LogRecord> = rows.into_iter().filter_map(EntryRow::into_record).collect();

        debug!(
            table = %self.table,
            page = request.page(),
            returned = records.len(),
            total,
            "queried log entries"
        );

        Ok(QueryResult::new(records, total.max(0) as u64))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        // An unqualified DELETE takes SQLite's truncate path.
        let sql = format!("DELETE FROM {}", self.table);
        let mut tx = self.pool.begin().await?;
        sqlx::query(&sql).execute(&mut *tx).await?;
        tx.commit().await?;
        info!(table = %self.table, "cleared log entries");
        Ok(())
    }

    fn kind(&self) -> StorageType {
        StorageType::Relational
    }
}
