// SerialCollect - util/logging.rs
//
// Structured logging with runtime-selectable debug mode.
//
// Activation:
//   - Environment variable: RUST_LOG=debug (or trace)
//   - CLI flag: --debug (sets RUST_LOG=debug)
//   - Config file: "logging": { "level": "debug" }
//
// Output: stderr, plus an optional in-memory `LogBuffer` that keeps the most
// recent entries for the log export (`[ISO] [LEVEL] message | JSON-data`).

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialise the logging subsystem.
///
/// `debug_flag` is true when the user passed --debug on the CLI.
/// `config_level` is the level from the config document (if present).
/// `capture` receives a copy of every event that passes the filter.
///
/// Priority: RUST_LOG env var > CLI --debug flag > config level > default "info".
pub fn init(debug_flag: bool, config_level: Option<&str>, capture: Option<LogBuffer>) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if debug_flag {
        EnvFilter::new("debug")
    } else if let Some(level) = config_level {
        EnvFilter::new(level)
    } else {
        EnvFilter::new(super::constants::DEFAULT_LOG_LEVEL)
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(capture.map(CaptureLayer::new))
        .init();

    tracing::debug!(
        app = super::constants::APP_NAME,
        version = super::constants::APP_VERSION,
        "Logging initialised"
    );
}

// =============================================================================
// Captured entries
// =============================================================================

/// Severity of a captured log entry, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Upper-case label used in the text export.
    pub fn label(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Parse a configuration level name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One captured log event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    /// Structured fields of the event, `None` when it had none.
    pub data: Option<Value>,
}

impl LogEntry {
    /// Render as `[ISO-timestamp] [LEVEL] message | JSON-data`.
    pub fn to_export_line(&self) -> String {
        let ts = self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        match &self.data {
            Some(data) => format!("[{ts}] [{}] {} | {data}", self.level, self.message),
            None => format!("[{ts}] [{}] {}", self.level, self.message),
        }
    }
}

// =============================================================================
// LogBuffer
// =============================================================================

#[derive(Debug)]
struct BufferInner {
    entries: VecDeque<LogEntry>,
    max_entries: usize,
    min_level: LogLevel,
}

/// Bounded, shareable ring of recent log entries.
///
/// Cloning yields another handle to the same buffer. When the buffer is full
/// the oldest entry is dropped.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<BufferInner>>,
}

impl LogBuffer {
    pub fn new(max_entries: usize, min_level: LogLevel) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufferInner {
                entries: VecDeque::new(),
                max_entries: max_entries.max(1),
                min_level,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        // A panic while holding the lock cannot leave the ring inconsistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the capacity, dropping the oldest entries if needed.
    pub fn set_max_entries(&self, max_entries: usize) {
        let mut inner = self.lock();
        inner.max_entries = max_entries.max(1);
        while inner.entries.len() > inner.max_entries {
            inner.entries.pop_front();
        }
    }

    /// Change the least severe level that is captured.
    pub fn set_min_level(&self, level: LogLevel) {
        self.lock().min_level = level;
    }

    pub fn min_level(&self) -> LogLevel {
        self.lock().min_level
    }

    /// Append an entry, honouring the minimum level and capacity.
    pub fn push(&self, entry: LogEntry) {
        let mut inner = self.lock();
        if entry.level < inner.min_level {
            return;
        }
        inner.entries.push_back(entry);
        while inner.entries.len() > inner.max_entries {
            inner.entries.pop_front();
        }
    }

    /// Snapshot of all entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn entries_by_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.level == level)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Render every entry as one export line, newline-joined.
    pub fn export_text(&self) -> String {
        self.lock()
            .entries
            .iter()
            .map(LogEntry::to_export_line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// =============================================================================
// tracing layer
// =============================================================================

/// `tracing` layer that copies events into a `LogBuffer`.
pub struct CaptureLayer {
    buffer: LogBuffer,
}

impl CaptureLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = LogLevel::from(*event.metadata().level());
        if level < self.buffer.min_level() {
            return;
        }

        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        self.buffer.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message: visitor.message,
            data: if visitor.fields.is_empty() {
                None
            } else {
                Some(Value::Object(visitor.fields))
            },
        });
    }
}

/// Collects an event's `message` and remaining fields as JSON.
#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: Map<String, Value>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::Bool(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(format!("{value:?}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(level: LogLevel, message: &str, data: Option<Value>) -> LogEntry {
        LogEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap(),
            level,
            message: message.to_string(),
            data,
        }
    }

    #[test]
    fn test_export_line_format() {
        let with_data = entry(
            LogLevel::Warn,
            "Rule evaluation error",
            Some(serde_json::json!({"ruleId": "r1"})),
        );
        assert_eq!(
            with_data.to_export_line(),
            r#"[2024-03-01T12:30:05.000Z] [WARN] Rule evaluation error | {"ruleId":"r1"}"#
        );

        let plain = entry(LogLevel::Info, "Recording stopped", None);
        assert_eq!(
            plain.to_export_line(),
            "[2024-03-01T12:30:05.000Z] [INFO] Recording stopped"
        );
    }

    #[test]
    fn test_buffer_drops_oldest_when_full() {
        let buffer = LogBuffer::new(2, LogLevel::Debug);
        buffer.push(entry(LogLevel::Info, "one", None));
        buffer.push(entry(LogLevel::Info, "two", None));
        buffer.push(entry(LogLevel::Info, "three", None));

        let messages: Vec<_> = buffer.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["two", "three"]);

        buffer.set_max_entries(1);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.entries()[0].message, "three");
    }

    #[test]
    fn test_buffer_honours_min_level() {
        let buffer = LogBuffer::new(10, LogLevel::Warn);
        buffer.push(entry(LogLevel::Debug, "noise", None));
        buffer.push(entry(LogLevel::Error, "boom", None));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.entries_by_level(LogLevel::Error).len(), 1);
        assert!(buffer.entries_by_level(LogLevel::Debug).is_empty());
    }

    #[test]
    fn test_capture_layer_records_message_and_fields() {
        let buffer = LogBuffer::new(10, LogLevel::Debug);
        let subscriber = tracing_subscriber::registry().with(CaptureLayer::new(buffer.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(samples = 3_u64, class = "classA", "Recording stopped");
            tracing::trace!("below the capture level");
        });

        let entries = buffer.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[0].message, "Recording stopped");
        let data = entries[0].data.as_ref().unwrap();
        assert_eq!(data["samples"], Value::from(3_u64));
        assert_eq!(data["class"], Value::from("classA"));
    }

    #[test]
    fn test_clear_empties_buffer() {
        let buffer = LogBuffer::new(10, LogLevel::Debug);
        buffer.push(entry(LogLevel::Info, "x", None));
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.export_text(), "");
    }

    #[test]
    fn test_level_from_name() {
        assert_eq!(LogLevel::from_name("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_name("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_name("verbose"), None);
    }
}
