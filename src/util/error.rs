// SerialCollect - util/error.rs
//
// Typed error hierarchy with context-preserving error chains.
// Only configuration, import/export and source-open failures travel as
// errors; per-line parse and rule failures are logged and dropped.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Top-level error type for all SerialCollect operations.
/// Errors are categorised by the subsystem that produced them.
#[derive(Debug)]
pub enum CollectorError {
    /// Parser configuration is invalid.
    Parser(ParserError),

    /// Configuration loading, import or validation failed.
    Config(ConfigError),

    /// Export operation failed.
    Export(ExportError),

    /// Line source could not be opened or written.
    Source(SourceError),

    /// An outbound command could not be sent.
    Command(CommandError),
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parser(e) => write!(f, "Parser error: {e}"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::Export(e) => write!(f, "Export error: {e}"),
            Self::Source(e) => write!(f, "Source error: {e}"),
            Self::Command(e) => write!(f, "Command error: {e}"),
        }
    }
}

impl std::error::Error for CollectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parser(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Export(e) => Some(e),
            Self::Source(e) => Some(e),
            Self::Command(e) => Some(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Parser errors
// ---------------------------------------------------------------------------

/// Errors raised while (re)configuring the line parser.
#[derive(Debug)]
pub enum ParserError {
    /// Parser type is `regex` but no pattern was supplied.
    MissingRegex,

    /// A regex pattern in the parser configuration is invalid.
    InvalidRegex {
        field: &'static str,
        pattern: String,
        source: regex::Error,
    },

    /// A regex pattern exceeds the maximum allowed length.
    RegexTooLong {
        field: &'static str,
        length: usize,
        max_length: usize,
    },

    /// Parser type is `custom` but no expression source was supplied.
    MissingExpression,

    /// The custom parser expression could not be parsed.
    InvalidExpression {
        line: usize,
        column: usize,
        reason: String,
    },

    /// The custom parser expression exceeds the maximum allowed length.
    ExpressionTooLong { length: usize, max_length: usize },
}

impl fmt::Display for ParserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRegex => write!(f, "parser type is 'regex' but no pattern is set"),
            Self::InvalidRegex {
                field,
                pattern,
                source,
            } => write!(f, "invalid regex in '{field}' ('{pattern}'): {source}"),
            Self::RegexTooLong {
                field,
                length,
                max_length,
            } => write!(
                f,
                "regex in '{field}' is {length} chars, exceeds maximum of {max_length}"
            ),
            Self::MissingExpression => {
                write!(f, "parser type is 'custom' but no expression is set")
            }
            Self::InvalidExpression {
                line,
                column,
                reason,
            } => write!(
                f,
                "invalid custom parser expression at line {line}, column {column}: {reason}"
            ),
            Self::ExpressionTooLong { length, max_length } => write!(
                f,
                "custom parser expression is {length} bytes, exceeds maximum of {max_length}"
            ),
        }
    }
}

impl std::error::Error for ParserError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidRegex { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ParserError> for CollectorError {
    fn from(e: ParserError) -> Self {
        Self::Parser(e)
    }
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

/// Errors related to configuration loading, import and persistence.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration document is not valid JSON or has the wrong shape.
    InvalidJson { source: serde_json::Error },

    /// Serialising the configuration failed.
    Serialize { source: serde_json::Error },

    /// A config value is out of the allowed range.
    ValueOutOfRange {
        field: String,
        value: String,
        expected: String,
    },

    /// I/O error reading or writing a config file.
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { source } => write!(f, "Invalid configuration JSON: {source}"),
            Self::Serialize { source } => {
                write!(f, "Failed to serialise configuration: {source}")
            }
            Self::ValueOutOfRange {
                field,
                value,
                expected,
            } => write!(
                f,
                "Config '{field}' = '{value}' is out of range. Expected: {expected}"
            ),
            Self::Io { path, source } => {
                write!(f, "Config I/O error '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidJson { source } => Some(source),
            Self::Serialize { source } => Some(source),
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ConfigError> for CollectorError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Export errors
// ---------------------------------------------------------------------------

/// Errors related to export operations.
#[derive(Debug)]
pub enum ExportError {
    /// There are no recorded samples to export.
    NoSamples,

    /// The export template has fatal problems.
    InvalidTemplate { errors: Vec<String> },

    /// I/O error writing the export file.
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSamples => write!(f, "No data to export"),
            Self::InvalidTemplate { errors } => {
                write!(f, "Export template is invalid: {}", errors.join("; "))
            }
            Self::Io { path, source } => {
                write!(f, "Export I/O error '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ExportError> for CollectorError {
    fn from(e: ExportError) -> Self {
        Self::Export(e)
    }
}

// ---------------------------------------------------------------------------
// Source errors
// ---------------------------------------------------------------------------

/// Errors related to the line source (file, stdin or serial port).
#[derive(Debug)]
pub enum SourceError {
    /// A file or stream could not be opened.
    Open { target: String, source: io::Error },

    /// A serial port could not be opened.
    Serial {
        port: String,
        source: serialport::Error,
    },

    /// The configured text encoding is not supported.
    UnsupportedEncoding { encoding: String },

    /// No source is currently running.
    NotConnected,

    /// The running source has no outbound channel (e.g. stdin, a file).
    NotWritable,

    /// Writing outbound text failed.
    Write { source: io::Error },
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { target, source } => write!(f, "Cannot open '{target}': {source}"),
            Self::Serial { port, source } => {
                write!(f, "Cannot open serial port '{port}': {source}")
            }
            Self::UnsupportedEncoding { encoding } => write!(
                f,
                "Encoding '{encoding}' is not supported. Expected one of: utf-8, ascii, latin1"
            ),
            Self::NotConnected => write!(f, "Source is not connected"),
            Self::NotWritable => write!(f, "Source is not writable"),
            Self::Write { source } => write!(f, "Failed to write to source: {source}"),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } => Some(source),
            Self::Serial { source, .. } => Some(source),
            Self::Write { source } => Some(source),
            _ => None,
        }
    }
}

impl From<SourceError> for CollectorError {
    fn from(e: SourceError) -> Self {
        Self::Source(e)
    }
}

// ---------------------------------------------------------------------------
// Command errors
// ---------------------------------------------------------------------------

/// Errors from sending outbound commands.
#[derive(Debug)]
pub enum CommandError {
    /// `serialTx.enabled` is false.
    Disabled,

    /// No enabled quick command has this id.
    UnknownQuickCommand { id: String },

    /// A `raw` command is not a hex byte string.
    InvalidHex { text: String },

    /// The bytes could not be written to the source.
    Port(SourceError),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "Serial TX is disabled"),
            Self::UnknownQuickCommand { id } => {
                write!(f, "Quick command '{id}' not found or disabled")
            }
            Self::InvalidHex { text } => write!(f, "'{text}' is not a hex byte string"),
            Self::Port(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Port(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SourceError> for CommandError {
    fn from(e: SourceError) -> Self {
        Self::Port(e)
    }
}

impl From<CommandError> for CollectorError {
    fn from(e: CommandError) -> Self {
        Self::Command(e)
    }
}

/// Convenience type alias for SerialCollect results.
pub type Result<T> = std::result::Result<T, CollectorError>;
