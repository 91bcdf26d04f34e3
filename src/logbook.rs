use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::backend::open_store;
use crate::error::StoreError;
use crate::record::{CallerInfo, NewRecord};
use crate::settings::Settings;
use crate::store::{LogStore, PageRequest, QueryResult};

/// Process-wide handle to the active store.
///
/// Build one at startup with [`Logbook::open`] (or [`Logbook::new`]) and
/// pass it, or clones of it, to every call site. Cloning is cheap.
///
/// Writing never fails from the caller's point of view: encoding and
/// backend errors are reported through `tracing` and otherwise dropped.
/// [`search`](Logbook::search) and [`clear`](Logbook::clear) surface
/// their failures, since a viewer asked for them explicitly.
#[derive(Clone)]
pub struct Logbook {
    store: Arc<dyn LogStore>,
    timezone: String,
}

impl Logbook {
    pub fn new(store: Arc<dyn LogStore>, timezone: impl Into<String>) -> Self {
        Logbook {
            store,
            timezone: timezone.into(),
        }
    }

    /// Open the backend selected by `settings`.
    pub async fn open(settings: &Settings) -> Result<Self, StoreError> {
        let store = open_store(settings).await?;
        Ok(Logbook::new(store, settings.timezone.clone()))
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    /// Log a single value.
    pub async fn log<T: Serialize + ?Sized>(&self, caller: CallerInfo, value: &T) {
        let rendered = render_value(value).map(|text| vec![text]);
        self.log_rendered(caller, rendered).await;
    }

    /// Log several values of one type as a single entry.
    pub async fn log_all<T: Serialize>(&self, caller: CallerInfo, values: &[T]) {
        let rendered = values.iter().map(|v| render_value(v)).collect();
        self.log_rendered(caller, rendered).await;
    }

    /// Persist already-rendered values, one part per value, joined by
    /// newlines. Used by [`capture!`](crate::capture).
    pub async fn log_rendered(&self, caller: CallerInfo, rendered: Result<Vec<String>, StoreError>) {
        let file = caller.file.clone();
        let line = caller.line;
        if let Err(e) = self.write(caller, rendered).await {
            warn!(error = %e, kind = %e.kind(), file = %file, line, "dropping log entry");
        }
    }

    async fn write(&self, caller: CallerInfo, rendered: Result<Vec<String>, StoreError>) -> Result<(), StoreError> {
        let message = rendered?.join("\n");
        let metadata = serde_json::to_value(&caller)?;
        let record = NewRecord::now(self.timezone.clone(), message, metadata);
        self.store.insert(&record).await?;
        Ok(())
    }

    /// Page `page` (1-indexed) of entries containing `term`, newest first.
    /// A failed query comes back with `error` set instead of records.
    pub async fn search(&self, page: u32, page_size: u32, term: &str) -> QueryResult {
        let request = PageRequest::new(page, page_size, term);
        match self.store.query(&request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "log search failed");
                QueryResult::failed(e.diagnostic())
            }
        }
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.clear().await
    }
}

/// Pretty-print one value for inclusion in a log message.
pub fn render_value<T: Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Log any number of serializable values of any type through a
/// [`Logbook`], capturing the calling file, line and function.
///
/// Expands to an `.await`, so it must be used inside async code.
///
/// ```ignore
/// logshelf::capture!(book, "order failed", order_id, &cart);
/// ```
#[macro_export]
macro_rules! capture {
    ($book:expr, $($value:expr),+ $(,)?) => {{
        let rendered = (|| -> ::std::result::Result<::std::vec::Vec<::std::string::String>, $crate::StoreError> {
            ::std::result::Result::Ok(::std::vec![$($crate::logbook::render_value(&$value)?),+])
        })();
        $book.log_rendered($crate::caller!(), rendered).await
    }};
}
