// SerialCollect - core/model.rs
//
// Core data model types. Pure data definitions with no I/O and no platform
// dependencies. These types are the shared vocabulary across all layers and
// mirror the camelCase configuration document on the wire.

use crate::util::constants;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Milliseconds since the Unix epoch, the timestamp unit used throughout.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// =============================================================================
// Field values
// =============================================================================

/// A single typed field value extracted from a line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value. Text is accepted when it parses as a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            FieldValue::Text(s) => parse_number(s),
            FieldValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// Strict finite number parse of a trimmed string.
pub(crate) fn parse_number(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    t.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Field name to value map of one parsed line.
pub type FieldMap = BTreeMap<String, FieldValue>;

// =============================================================================
// Parsed data and samples
// =============================================================================

/// The result of successfully parsing one line. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedData {
    /// Parse time in milliseconds since the epoch.
    pub timestamp: i64,
    /// The trimmed line the fields were extracted from.
    pub raw: String,
    pub fields: FieldMap,
}

/// A parsed line stored while recording was active.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedSample {
    #[serde(flatten)]
    pub data: ParsedData,
    /// Time the sample was stored, in milliseconds since the epoch.
    pub recorded_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl RecordedSample {
    /// Label used for class counting; samples without one count as unlabeled.
    pub fn count_label(&self) -> &str {
        self.label.as_deref().unwrap_or(constants::UNLABELED)
    }
}

// =============================================================================
// Rules
// =============================================================================

/// What a matching rule does to a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Store the sample with the rule's value as label.
    Label,
    /// Drop the line.
    Ignore,
    /// Log the parsed line and do not store it.
    Log,
}

/// A user-defined condition to action mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    pub id: String,
    pub condition: String,
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Decision returned by the rule engine for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Label,
    Ignore,
    Log,
    /// No rule matched; the line is accepted unlabeled.
    Pass,
}

impl From<RuleAction> for Decision {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Label => Decision::Label,
            RuleAction::Ignore => Decision::Ignore,
            RuleAction::Log => Decision::Log,
        }
    }
}

/// Result of evaluating the rule list against a line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResult {
    pub action: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl RuleResult {
    pub fn pass() -> Self {
        Self {
            action: Decision::Pass,
            value: None,
            rule_id: None,
        }
    }
}

// =============================================================================
// Configuration sections
// =============================================================================

/// Line parsing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    #[default]
    Split,
    Regex,
    Json,
    Custom,
}

impl ParserKind {
    pub fn label(&self) -> &'static str {
        match self {
            ParserKind::Split => "split",
            ParserKind::Regex => "regex",
            ParserKind::Json => "json",
            ParserKind::Custom => "custom",
        }
    }
}

/// Parser settings. The field-name list lives alongside in `AppConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParserConfig {
    #[serde(rename = "type")]
    pub kind: ParserKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_delimiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_groups: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_parser: Option<String>,
    /// Literal prefixes, or regexes when wrapped in `/.../`.
    #[serde(default)]
    pub skip_lines: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            kind: ParserKind::Split,
            split_delimiter: Some(constants::DEFAULT_SPLIT_DELIMITER.to_string()),
            regex: None,
            regex_groups: None,
            custom_parser: None,
            skip_lines: Vec::new(),
        }
    }
}

/// Export template settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    pub template: String,
    pub filename: String,
    pub include_header: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            template: constants::DEFAULT_EXPORT_TEMPLATE.to_string(),
            filename: constants::DEFAULT_EXPORT_FILENAME.to_string(),
            include_header: true,
        }
    }
}

/// A recording class the user can label samples with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: String,
}

/// Recording session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingConfig {
    /// Stop automatically after this many seconds (0 = never).
    pub auto_stop_seconds: u64,
    /// When true a class must be chosen before recording can start.
    pub enable_labeling: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            auto_stop_seconds: constants::DEFAULT_AUTO_STOP_SECONDS,
            enable_labeling: true,
        }
    }
}

/// Line source settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialConfig {
    pub baud_rate: u32,
    /// Incoming line delimiter.
    pub delimiter: String,
    pub encoding: String,
    /// Appended to every outbound write.
    pub line_ending: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: constants::DEFAULT_BAUD_RATE,
            delimiter: constants::DEFAULT_LINE_DELIMITER.to_string(),
            encoding: constants::DEFAULT_ENCODING.to_string(),
            line_ending: constants::DEFAULT_LINE_ENDING.to_string(),
        }
    }
}

// =============================================================================
// Outbound commands
// =============================================================================

/// How outbound command text is turned into bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TxEncoding {
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "ascii")]
    Ascii,
    /// The text is hex (`"0A 0D FF"` or `"0A0DFF"`); the bytes are sent as-is.
    #[serde(rename = "raw")]
    Raw,
}

impl TxEncoding {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Self::Utf8),
            "ascii" => Some(Self::Ascii),
            "raw" | "hex" => Some(Self::Raw),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Ascii => "ascii",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for TxEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A named command that can be sent on demand by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickCommand {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub command: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Command sent when a recording starts with the given class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassCommand {
    pub class_id: String,
    pub command: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Commands sent automatically on lifecycle events. Empty means none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomatedCommands {
    pub on_connect: String,
    pub on_disconnect: String,
    pub on_recording_start: String,
    pub on_recording_stop: String,
    /// Minimum spacing between two consecutive writes (ms).
    pub delay_between_commands: u64,
}

impl Default for AutomatedCommands {
    fn default() -> Self {
        Self {
            on_connect: String::new(),
            on_disconnect: String::new(),
            on_recording_start: String::new(),
            on_recording_stop: String::new(),
            delay_between_commands: constants::DEFAULT_TX_DELAY_MS,
        }
    }
}

/// Lifecycle event that may carry an automated command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxTrigger {
    Connect,
    Disconnect,
    RecordingStart,
    RecordingStop,
}

impl TxTrigger {
    /// Configuration key of the trigger.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connect => "onConnect",
            Self::Disconnect => "onDisconnect",
            Self::RecordingStart => "onRecordingStart",
            Self::RecordingStop => "onRecordingStop",
        }
    }
}

impl AutomatedCommands {
    pub fn command(&self, trigger: TxTrigger) -> &str {
        match trigger {
            TxTrigger::Connect => &self.on_connect,
            TxTrigger::Disconnect => &self.on_disconnect,
            TxTrigger::RecordingStart => &self.on_recording_start,
            TxTrigger::RecordingStop => &self.on_recording_stop,
        }
    }
}

/// Outbound command settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialTxConfig {
    pub enabled: bool,
    pub encoding: TxEncoding,
    /// Appended to every text command (ignored for `raw`).
    pub line_ending: String,
    pub quick_commands: Vec<QuickCommand>,
    pub class_commands: Vec<ClassCommand>,
    pub automated_commands: AutomatedCommands,
}

impl Default for SerialTxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            encoding: TxEncoding::Utf8,
            line_ending: constants::DEFAULT_LINE_ENDING.to_string(),
            quick_commands: Vec::new(),
            class_commands: Vec::new(),
            automated_commands: AutomatedCommands::default(),
        }
    }
}

/// One successfully written command, as shown in the TX log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxLogEntry {
    pub timestamp: i64,
    pub direction: &'static str,
    pub data: String,
    pub encoding: TxEncoding,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    pub level: String,
    /// Write the captured log to the data directory on shutdown.
    pub persist_to_file: bool,
    pub max_entries: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: constants::DEFAULT_LOG_LEVEL.to_string(),
            persist_to_file: false,
            max_entries: constants::DEFAULT_MAX_LOG_ENTRIES,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub parser: ParserConfig,
    /// Ordered field names shared by the parser, rules and export.
    pub fields: Vec<String>,
    pub classes: Vec<ClassConfig>,
    pub rules: Vec<RuleConfig>,
    pub export: ExportConfig,
    pub recording: RecordingConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub serial_tx: SerialTxConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            parser: ParserConfig::default(),
            fields: constants::DEFAULT_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            classes: (1..=3)
                .zip(["bg-blue-500", "bg-green-500", "bg-purple-500"])
                .map(|(n, color)| ClassConfig {
                    id: format!("class{n}"),
                    name: format!("Class {n}"),
                    color: color.to_string(),
                })
                .collect(),
            rules: Vec::new(),
            export: ExportConfig::default(),
            recording: RecordingConfig::default(),
            logging: LoggingConfig::default(),
            serial_tx: SerialTxConfig::default(),
        }
    }
}

// =============================================================================
// Statistics and status
// =============================================================================

/// Running totals for the recorded sample sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    pub total_samples: usize,
    pub class_counts: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sample_time: Option<i64>,
}

/// Connection state of the line source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// Collector events
// =============================================================================

/// Messages consumed sequentially by the collector's event loop.
///
/// Sent by the line-source reader thread and the auto-stop timer thread.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectorEvent {
    /// One framed, trimmed, non-empty line.
    Line(String),
    /// Line-source connection state changed.
    Status {
        status: ConnectionStatus,
        message: Option<String>,
    },
    /// The auto-stop timer armed by recording start `generation` expired.
    AutoStop { generation: u64 },
    /// The line source reached end of stream or gave up reconnecting.
    SourceClosed,
    /// Stop the event loop.
    Shutdown,
}
