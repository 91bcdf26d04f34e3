use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Zone label written when none is configured, and assumed for records
/// written before the field existed.
pub const DEFAULT_TIMEZONE: &str = "UTC";

// Fixed width and always UTC, so lexical order equals chronological order.
const STORED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// `GLOB` pattern matching exactly the values [`format_timestamp`] produces.
pub const STORED_GLOB: &str = "????-??-??T??:??:??.??????Z";

// Wall-clock forms written without an offset.
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Provenance of a log call: where it was made and from which function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerInfo {
    pub file: String,
    pub line: u32,
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

impl CallerInfo {
    pub fn new(file: impl Into<String>, line: u32, function: impl Into<String>) -> Self {
        CallerInfo {
            file: file.into(),
            line,
            function: function.into(),
            class: None,
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    /// Build caller info from a call site and the type path of a probe
    /// function declared inside the calling function (see [`caller!`]).
    ///
    /// Trait impl segments (`<Worker as Job>`, `<impl Job for Worker>`) are
    /// reduced to the implementing type. Generic arguments and closure
    /// frames are dropped from the path. The last remaining segment is the
    /// function; the one before it is taken as the class when it names a
    /// type.
    ///
    /// [`caller!`]: crate::caller
    pub fn from_site(file: &str, line: u32, probe_path: &str) -> Self {
        let path = strip_generics(&resolve_impl_self(probe_path));
        let mut segments: Vec<&str> = path
            .split("::")
            .filter(|s| !s.is_empty() && !s.starts_with("{{"))
            .collect();

        // The probe itself is always the innermost item.
        segments.pop();

        let function = segments.pop().unwrap_or("unknown").to_string();
        let class = segments
            .last()
            .filter(|s| s.chars().next().map_or(false, char::is_uppercase))
            .map(|s| s.to_string());

        CallerInfo {
            file: file.to_string(),
            line,
            function,
            class,
        }
    }
}

/// Replace every qualified-self segment with the bare name of its self type.
/// Ordinary generic arguments are left for [`strip_generics`].
fn resolve_impl_self(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut rest = path;
    while let Some(start) = rest.find('<') {
        let Some(end) = matching_close(&rest[start..]).map(|len| start + len) else {
            break;
        };
        let before = &rest[..start];
        let at_segment_start = if before.is_empty() {
            out.is_empty() || out.ends_with("::")
        } else {
            before.ends_with("::")
        };

        out.push_str(before);
        if at_segment_start {
            out.push_str(&self_type_name(&rest[start + 1..end]));
        } else {
            out.push_str(&rest[start..=end]);
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Byte offset of the `>` closing the `<` that `s` starts with.
fn matching_close(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn self_type_name(qualified: &str) -> String {
    let self_ty = match qualified.strip_prefix("impl ") {
        Some(body) => split_top_level(body, " for ").map_or(body, |(_, ty)| ty),
        None => split_top_level(qualified, " as ").map_or(qualified, |(ty, _)| ty),
    };
    let bare = strip_generics(self_ty.trim());
    let last = bare.rsplit("::").next().unwrap_or_default();
    last.rsplit(' ').next().unwrap_or_default().trim_start_matches('&').to_string()
}

fn split_top_level<'a>(s: &'a str, sep: &str) -> Option<(&'a str, &'a str)> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            _ if depth == 0 && s[i..].starts_with(sep) => return Some((&s[..i], &s[i + sep.len()..])),
            _ => {}
        }
    }
    None
}

fn strip_generics(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut depth = 0usize;
    for c in path.chars() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Capture the current file, line and enclosing function as a
/// [`CallerInfo`].
#[macro_export]
macro_rules! caller {
    () => {{
        fn __logshelf_probe() {}
        $crate::record::CallerInfo::from_site(
            file!(),
            line!(),
            ::std::any::type_name_of_val(&__logshelf_probe),
        )
    }};
}

/// A record about to be written. Backends assign identity on insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub timestamp: DateTime<Utc>,
    pub timezone: String,
    pub message: String,
    pub metadata: Value,
}

impl NewRecord {
    /// Stamp a record with the current instant.
    pub fn now(timezone: impl Into<String>, message: impl Into<String>, metadata: Value) -> Self {
        NewRecord {
            timestamp: Utc::now(),
            timezone: timezone.into(),
            message: message.into(),
            metadata,
        }
    }
}

/// A stored log entry as returned by a query.
///
/// `id` is only assigned by the relational backend; file-backed records
/// are addressed by position alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub timezone: String,
    pub message: String,
    pub metadata: Value,
}

impl LogRecord {
    /// Typed view over `metadata`, when it has the caller shape.
    pub fn caller(&self) -> Option<CallerInfo> {
        serde_json::from_value(self.metadata.clone()).ok()
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(STORED_FORMAT).to_string()
}

/// Parse a stored timestamp together with the zone label it was written
/// under.
///
/// RFC 3339 values (including the stored format) carry their own offset
/// and ignore `timezone`. Legacy values without an offset, such as
/// `YYYY-MM-DD HH:MM:SS`, are wall-clock time in `timezone`; an ambiguous
/// time resolves to its earlier instant. An unknown label is read as UTC.
pub fn parse_timestamp(raw: &str, timezone: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())?;

    let Ok(tz) = timezone.trim().parse::<Tz>() else {
        return Some(Utc.from_utc_datetime(&naive));
    };
    // A wall-clock time skipped by a DST jump lands just after the jump.
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Decode metadata that was stored as a JSON-encoded string into the
/// structured value it encodes. Anything else is returned unchanged.
pub fn normalize_metadata(value: Value) -> Value {
    let mut value = value;
    // Older writers could double-encode; two rounds cover that.
    for _ in 0..2 {
        let decoded = match &value {
            Value::String(raw) => serde_json::from_str::<Value>(raw).ok(),
            _ => None,
        };
        match decoded {
            Some(inner @ (Value::Object(_) | Value::Array(_) | Value::String(_))) => value = inner,
            _ => break,
        }
    }
    value
}

/// Compact serialization of metadata, used both for storage and as the
/// haystack for search.
pub fn metadata_text(metadata: &Value) -> String {
    metadata.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_site_splits_type_and_method() {
        let info = CallerInfo::from_site(
            "src/orders.rs",
            42,
            "shop::orders::OrderService::submit::{{closure}}::__logshelf_probe",
        );
        assert_eq!(info.file, "src/orders.rs");
        assert_eq!(info.line, 42);
        assert_eq!(info.function, "submit");
        assert_eq!(info.class.as_deref(), Some("OrderService"));
    }

    #[test]
    fn from_site_free_function_has_no_class() {
        let info = CallerInfo::from_site("src/main.rs", 7, "app::main::__logshelf_probe");
        assert_eq!(info.function, "main");
        assert_eq!(info.class, None);
    }

    #[test]
    fn from_site_drops_generic_arguments() {
        let info = CallerInfo::from_site(
            "src/cache.rs",
            3,
            "kv::cache::Cache<alloc::string::String>::get::__logshelf_probe",
        );
        assert_eq!(info.function, "get");
        assert_eq!(info.class.as_deref(), Some("Cache"));
    }

    #[test]
    fn from_site_reads_the_self_type_of_trait_impls() {
        let qualified = CallerInfo::from_site(
            "src/worker.rs",
            9,
            "app::<app::worker::Worker as app::Job>::tick::__logshelf_probe",
        );
        assert_eq!(qualified.function, "tick");
        assert_eq!(qualified.class.as_deref(), Some("Worker"));

        let nested = CallerInfo::from_site(
            "src/worker.rs",
            9,
            "app::worker::<impl app::Job for app::worker::Pool<u8>>::run::{{closure}}::__logshelf_probe",
        );
        assert_eq!(nested.function, "run");
        assert_eq!(nested.class.as_deref(), Some("Pool"));
    }

    trait Describe {
        fn site(&self) -> CallerInfo;
    }

    struct Worker;

    impl Describe for Worker {
        fn site(&self) -> CallerInfo {
            crate::caller!()
        }
    }

    #[test]
    fn caller_macro_inside_a_trait_impl() {
        let info = Worker.site();
        assert_eq!(info.function, "site");
        assert_eq!(info.class.as_deref(), Some("Worker"));
    }

    #[test]
    fn caller_macro_names_this_test() {
        let info = crate::caller!();
        assert_eq!(info.function, "caller_macro_names_this_test");
        assert!(info.file.ends_with("record.rs"));
        assert_eq!(info.class, None);
    }

    #[test]
    fn stored_format_round_trips_and_sorts() {
        let early = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let (a, b) = (format_timestamp(&early), format_timestamp(&late));
        assert!(a < b);
        assert_eq!(parse_timestamp(&a, "Asia/Tokyo"), Some(early));
        assert!(a.ends_with('Z') && a.len() == STORED_GLOB.len());
    }

    #[test]
    fn legacy_timestamp_is_wall_clock_in_its_zone() {
        let dhaka = parse_timestamp("2023-08-01 12:00:00", "Asia/Dhaka").unwrap();
        assert_eq!(dhaka, Utc.with_ymd_and_hms(2023, 8, 1, 6, 0, 0).unwrap());

        let utc = parse_timestamp("2023-11-02 08:15:00", "UTC").unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2023, 11, 2, 8, 15, 0).unwrap());

        assert!(parse_timestamp("yesterday", "UTC").is_none());
    }

    #[test]
    fn legacy_timestamp_edge_cases() {
        // 01:30 happens twice on this date in New York; the EDT reading wins.
        let ambiguous = parse_timestamp("2023-11-05 01:30:00", "America/New_York").unwrap();
        assert_eq!(ambiguous, Utc.with_ymd_and_hms(2023, 11, 5, 5, 30, 0).unwrap());

        // 02:30 does not exist on this date in New York.
        let skipped = parse_timestamp("2023-03-12 02:30:00", "America/New_York").unwrap();
        assert_eq!(skipped, Utc.with_ymd_and_hms(2023, 3, 12, 7, 30, 0).unwrap());

        let unknown_zone = parse_timestamp("2024-06-01T10:00:00", "Mars/Olympus").unwrap();
        assert_eq!(unknown_zone, Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap());

        let offset = parse_timestamp("2024-06-01T10:00:00+02:00", "Asia/Dhaka").unwrap();
        assert_eq!(offset, Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
    }

    #[test]
    fn string_encoded_metadata_is_decoded() {
        let legacy = Value::String(r#"{"file":"a.php","line":"N/A"}"#.to_string());
        assert_eq!(normalize_metadata(legacy), json!({"file": "a.php", "line": "N/A"}));

        let structured = json!({"file": "b.rs"});
        assert_eq!(normalize_metadata(structured.clone()), structured);

        let plain = Value::String("not json".into());
        assert_eq!(normalize_metadata(plain.clone()), plain);
    }

    #[test]
    fn caller_view_over_metadata() {
        let record = LogRecord {
            id: None,
            timestamp: Utc::now(),
            timezone: DEFAULT_TIMEZONE.into(),
            message: "x".into(),
            metadata: json!({"file": "src/lib.rs", "line": 10, "function": "run"}),
        };
        let caller = record.caller().unwrap();
        assert_eq!(caller.function, "run");
        assert_eq!(caller.class, None);
    }
}
