// SerialCollect - util/constants.rs
//
// Single source of truth for all named constants, limits, and defaults.

// =============================================================================
// Application metadata
// =============================================================================

/// Application display name.
pub const APP_NAME: &str = "SerialCollect";

/// Application identifier used for config/data directories.
pub const APP_ID: &str = "SerialCollect";

/// Current application version (updated by release script).
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Serial defaults
// =============================================================================

/// Default baud rate for serial ports.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Lowest accepted baud rate.
pub const MIN_BAUD_RATE: u32 = 300;

/// Highest accepted baud rate.
pub const MAX_BAUD_RATE: u32 = 4_000_000;

/// Default line delimiter for incoming text.
pub const DEFAULT_LINE_DELIMITER: &str = "\n";

/// Default line ending appended to outbound writes.
pub const DEFAULT_LINE_ENDING: &str = "\n";

/// Default text encoding of the incoming byte stream.
pub const DEFAULT_ENCODING: &str = "utf-8";

/// Encodings the line framer knows how to decode.
pub const SUPPORTED_ENCODINGS: &[&str] = &["utf-8", "ascii", "latin1"];

/// Read timeout for serial ports. Timeouts are not errors; they only give the
/// reader thread a chance to observe the cancel flag.
pub const SERIAL_READ_TIMEOUT_MS: u64 = 100;

/// Size of the buffer handed to each `read` call on the source.
pub const SOURCE_READ_CHUNK_BYTES: usize = 4 * 1024;

/// Maximum size of the in-progress (undelimited) line buffer. A device that
/// never sends a delimiter would otherwise grow it without bound.
pub const MAX_PARTIAL_LINE_BYTES: usize = 64 * 1024;

/// Number of reopen attempts after a read error before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Base reconnect delay; attempt N waits N times this value.
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// How often sleeping background threads check their cancel flag (ms).
pub const CANCEL_CHECK_INTERVAL_MS: u64 = 50;

/// Default minimum spacing between outbound commands (ms).
pub const DEFAULT_TX_DELAY_MS: u64 = 100;

/// Upper bound on `delayBetweenCommands` (ms).
pub const MAX_TX_DELAY_MS: u64 = 60_000;

/// Number of distinct commands kept in the command history.
pub const MAX_COMMAND_HISTORY: usize = 50;

/// Number of written commands kept in the TX log.
pub const TX_LOG_CAPACITY: usize = 1_000;

/// Outbound encodings accepted in `serialTx.encoding`.
pub const SUPPORTED_TX_ENCODINGS: &[&str] = &["utf-8", "ascii", "raw"];

// =============================================================================
// Parsing defaults
// =============================================================================

/// Default delimiter for the split parser.
pub const DEFAULT_SPLIT_DELIMITER: &str = ",";

/// Default configured field names.
pub const DEFAULT_FIELDS: &[&str] = &["timestamp", "value1", "value2", "value3"];

/// Maximum regex pattern length to prevent ReDoS.
pub const MAX_REGEX_PATTERN_LENGTH: usize = 4_096;

/// Maximum length of a custom parser expression source.
pub const MAX_EXPRESSION_SOURCE_LENGTH: usize = 16 * 1024;

/// Maximum nesting depth accepted by the expression parser.
pub const MAX_EXPRESSION_DEPTH: usize = 64;

/// Maximum length of a string produced while evaluating a custom expression.
pub const MAX_EXPRESSION_STRING_BYTES: usize = 64 * 1024;

/// Maximum length of a line included in debug output.
pub const DEBUG_MAX_LINE_PREVIEW: usize = 200;

// =============================================================================
// Recording defaults
// =============================================================================

/// Default auto-stop delay for a recording (seconds, 0 = disabled).
pub const DEFAULT_AUTO_STOP_SECONDS: u64 = 10;

/// Upper bound on the configurable auto-stop delay (24 h).
pub const MAX_AUTO_STOP_SECONDS: u64 = 86_400;

/// Label used in class counts for samples that carry no label.
pub const UNLABELED: &str = "unlabeled";

/// Number of raw lines retained for the live view.
pub const LIVE_BUFFER_LINES: usize = 100;

// =============================================================================
// Export defaults
// =============================================================================

/// Default export row template.
pub const DEFAULT_EXPORT_TEMPLATE: &str = "${timestamp},${value1},${value2},${value3},${label}";

/// Default export filename template.
pub const DEFAULT_EXPORT_FILENAME: &str = "data_export_${timestamp}";

/// Extension appended to export filenames that lack one.
pub const EXPORT_EXTENSION: &str = ".csv";

/// Default number of sample rows shown by an export preview.
pub const DEFAULT_PREVIEW_LINES: usize = 5;

/// Preview text returned when there is nothing recorded.
pub const EMPTY_PREVIEW_TEXT: &str = "No data to preview";

// =============================================================================
// Logging
// =============================================================================

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Valid log level names accepted from configuration.
pub const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Default capacity of the in-memory log buffer.
pub const DEFAULT_MAX_LOG_ENTRIES: usize = 1_000;

/// Smallest configurable log buffer capacity.
pub const MIN_MAX_LOG_ENTRIES: usize = 10;

/// Largest configurable log buffer capacity.
pub const ABSOLUTE_MAX_LOG_ENTRIES: usize = 100_000;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration file name.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// File the captured log is written to on shutdown when `persistToFile` is set.
pub const LOG_FILE_NAME: &str = "serialcollect.log";
