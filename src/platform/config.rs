// SerialCollect - platform/config.rs
//
// Configuration document handling: JSON import/export of `AppConfig`,
// structural merge onto defaults (or onto the current config), range
// validation with non-fatal warnings, platform directory resolution and
// atomic persistence.
//
// Uses the `directories` crate for XDG (Linux), AppData (Windows),
// Library (macOS) compliance.

use crate::core::framer::TextEncoding;
use crate::core::model::{
    AppConfig, AutomatedCommands, ClassCommand, ClassConfig, ExportConfig, LoggingConfig,
    ParserConfig, ParserKind, QuickCommand, RecordingConfig, RuleConfig, SerialConfig,
    SerialTxConfig, TxEncoding,
};
use crate::util::constants;
use crate::util::error::ConfigError;
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Resolved platform paths for SerialCollect configuration and data.
#[derive(Debug, Clone)]
pub struct PlatformPaths {
    /// Configuration directory (e.g. ~/.config/serialcollect/ or %APPDATA%\SerialCollect\)
    pub config_dir: PathBuf,

    /// Data directory for exports and persisted logs.
    pub data_dir: PathBuf,
}

impl PlatformPaths {
    /// Resolve platform-appropriate paths.
    ///
    /// Falls back to current directory if platform dirs cannot be determined.
    pub fn resolve() -> Self {
        if let Some(proj_dirs) = ProjectDirs::from("", "", constants::APP_ID) {
            let config_dir = proj_dirs.config_dir().to_path_buf();
            let data_dir = proj_dirs.data_dir().to_path_buf();

            tracing::debug!(
                config = %config_dir.display(),
                data = %data_dir.display(),
                "Platform paths resolved"
            );

            Self {
                config_dir,
                data_dir,
            }
        } else {
            tracing::warn!("Could not determine platform directories, using current directory");
            let fallback = PathBuf::from(".");
            Self {
                config_dir: fallback.clone(),
                data_dir: fallback,
            }
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(constants::CONFIG_FILE_NAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join(constants::LOG_FILE_NAME)
    }
}

// =============================================================================
// Raw document shape
// =============================================================================

/// Raw deserialisable shape of the configuration document.
///
/// Every key is optional and unknown keys are ignored, so a partial document
/// only overrides what it names. Values of the wrong type are still a hard
/// error: nothing is applied from a document that does not deserialise.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawConfig {
    serial: Option<RawSerial>,
    parser: Option<RawParser>,
    fields: Option<Vec<String>>,
    classes: Option<Vec<ClassConfig>>,
    rules: Option<Vec<RuleConfig>>,
    export: Option<RawExport>,
    recording: Option<RawRecording>,
    logging: Option<RawLogging>,
    serial_tx: Option<RawSerialTx>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawSerial {
    baud_rate: Option<u32>,
    delimiter: Option<String>,
    encoding: Option<String>,
    line_ending: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawParser {
    #[serde(rename = "type")]
    kind: Option<ParserKind>,
    split_delimiter: Option<String>,
    regex: Option<String>,
    regex_groups: Option<Vec<String>>,
    custom_parser: Option<String>,
    skip_lines: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawExport {
    template: Option<String>,
    filename: Option<String>,
    include_header: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawRecording {
    auto_stop_seconds: Option<u64>,
    enable_labeling: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawLogging {
    level: Option<String>,
    persist_to_file: Option<bool>,
    max_entries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawSerialTx {
    enabled: Option<bool>,
    encoding: Option<String>,
    line_ending: Option<String>,
    quick_commands: Option<Vec<QuickCommand>>,
    class_commands: Option<Vec<ClassCommand>>,
    automated_commands: Option<RawAutomatedCommands>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawAutomatedCommands {
    on_connect: Option<String>,
    on_disconnect: Option<String>,
    on_recording_start: Option<String>,
    on_recording_stop: Option<String>,
    delay_between_commands: Option<u64>,
}

// =============================================================================
// Section merges
// =============================================================================

fn merge_serial(base: &mut SerialConfig, raw: RawSerial, warnings: &mut Vec<String>) {
    if let Some(baud) = raw.baud_rate {
        if (constants::MIN_BAUD_RATE..=constants::MAX_BAUD_RATE).contains(&baud) {
            base.baud_rate = baud;
        } else {
            warnings.push(format!(
                "serial.baudRate = {baud} is out of range ({}-{}). Keeping {}.",
                constants::MIN_BAUD_RATE,
                constants::MAX_BAUD_RATE,
                base.baud_rate,
            ));
        }
    }
    if let Some(delimiter) = raw.delimiter {
        if delimiter.is_empty() {
            warnings.push("serial.delimiter must not be empty. Keeping the previous delimiter.".to_string());
        } else {
            base.delimiter = delimiter;
        }
    }
    if let Some(encoding) = raw.encoding {
        if TextEncoding::from_name(&encoding).is_ok() {
            base.encoding = encoding;
        } else {
            warnings.push(format!(
                "serial.encoding = \"{encoding}\" is not supported. Valid values: {}. Keeping \"{}\".",
                constants::SUPPORTED_ENCODINGS.join(", "),
                base.encoding,
            ));
        }
    }
    if let Some(line_ending) = raw.line_ending {
        base.line_ending = line_ending;
    }
}

fn merge_parser(base: &mut ParserConfig, raw: RawParser) {
    if let Some(kind) = raw.kind {
        base.kind = kind;
    }
    if raw.split_delimiter.is_some() {
        base.split_delimiter = raw.split_delimiter;
    }
    if raw.regex.is_some() {
        base.regex = raw.regex;
    }
    if raw.regex_groups.is_some() {
        base.regex_groups = raw.regex_groups;
    }
    if raw.custom_parser.is_some() {
        base.custom_parser = raw.custom_parser;
    }
    if let Some(skip_lines) = raw.skip_lines {
        base.skip_lines = skip_lines;
    }
}

fn merge_export(base: &mut ExportConfig, raw: RawExport) {
    if let Some(template) = raw.template {
        base.template = template;
    }
    if let Some(filename) = raw.filename {
        base.filename = filename;
    }
    if let Some(include_header) = raw.include_header {
        base.include_header = include_header;
    }
}

fn merge_recording(base: &mut RecordingConfig, raw: RawRecording, warnings: &mut Vec<String>) {
    if let Some(secs) = raw.auto_stop_seconds {
        if secs <= constants::MAX_AUTO_STOP_SECONDS {
            base.auto_stop_seconds = secs;
        } else {
            warnings.push(format!(
                "recording.autoStopSeconds = {secs} is out of range (0-{}). Keeping {}.",
                constants::MAX_AUTO_STOP_SECONDS,
                base.auto_stop_seconds,
            ));
        }
    }
    if let Some(enable) = raw.enable_labeling {
        base.enable_labeling = enable;
    }
}

fn merge_logging(base: &mut LoggingConfig, raw: RawLogging, warnings: &mut Vec<String>) {
    if let Some(level) = raw.level {
        let lower = level.to_lowercase();
        if constants::VALID_LOG_LEVELS.contains(&lower.as_str()) {
            base.level = lower;
        } else {
            warnings.push(format!(
                "logging.level = \"{level}\" is not recognised. Valid values: {}. Keeping \"{}\".",
                constants::VALID_LOG_LEVELS.join(", "),
                base.level,
            ));
        }
    }
    if let Some(persist) = raw.persist_to_file {
        base.persist_to_file = persist;
    }
    if let Some(max) = raw.max_entries {
        if (constants::MIN_MAX_LOG_ENTRIES..=constants::ABSOLUTE_MAX_LOG_ENTRIES).contains(&max) {
            base.max_entries = max;
        } else {
            warnings.push(format!(
                "logging.maxEntries = {max} is out of range ({}-{}). Keeping {}.",
                constants::MIN_MAX_LOG_ENTRIES,
                constants::ABSOLUTE_MAX_LOG_ENTRIES,
                base.max_entries,
            ));
        }
    }
}

fn merge_serial_tx(base: &mut SerialTxConfig, raw: RawSerialTx, warnings: &mut Vec<String>) {
    if let Some(enabled) = raw.enabled {
        base.enabled = enabled;
    }
    if let Some(encoding) = raw.encoding {
        match TxEncoding::from_name(&encoding) {
            Some(e) => base.encoding = e,
            None => warnings.push(format!(
                "serialTx.encoding = \"{encoding}\" is not supported. Valid values: {}. Keeping \"{}\".",
                constants::SUPPORTED_TX_ENCODINGS.join(", "),
                base.encoding,
            )),
        }
    }
    if let Some(line_ending) = raw.line_ending {
        base.line_ending = line_ending;
    }
    if let Some(quick) = raw.quick_commands {
        base.quick_commands = quick;
    }
    if let Some(class) = raw.class_commands {
        base.class_commands = class;
    }
    if let Some(automated) = raw.automated_commands {
        merge_automated(&mut base.automated_commands, automated, warnings);
    }
}

fn merge_automated(
    base: &mut AutomatedCommands,
    raw: RawAutomatedCommands,
    warnings: &mut Vec<String>,
) {
    if let Some(cmd) = raw.on_connect {
        base.on_connect = cmd;
    }
    if let Some(cmd) = raw.on_disconnect {
        base.on_disconnect = cmd;
    }
    if let Some(cmd) = raw.on_recording_start {
        base.on_recording_start = cmd;
    }
    if let Some(cmd) = raw.on_recording_stop {
        base.on_recording_stop = cmd;
    }
    if let Some(delay) = raw.delay_between_commands {
        if delay <= constants::MAX_TX_DELAY_MS {
            base.delay_between_commands = delay;
        } else {
            warnings.push(format!(
                "serialTx.automatedCommands.delayBetweenCommands = {delay} is out of range (0-{}). Keeping {}.",
                constants::MAX_TX_DELAY_MS,
                base.delay_between_commands,
            ));
        }
    }
}

// =============================================================================
// Import / export
// =============================================================================

/// Merge a JSON document onto `base`, section by section.
///
/// Returns the merged config and a list of non-fatal warnings for values
/// that were out of range (those keep the value from `base`). Malformed JSON
/// or a value of the wrong type is an error and nothing is applied.
pub fn merge_config(base: &AppConfig, json: &str) -> Result<(AppConfig, Vec<String>), ConfigError> {
    let raw: RawConfig =
        serde_json::from_str(json).map_err(|source| ConfigError::InvalidJson { source })?;

    let mut config = base.clone();
    let mut warnings = Vec::new();

    if let Some(serial) = raw.serial {
        merge_serial(&mut config.serial, serial, &mut warnings);
    }
    if let Some(parser) = raw.parser {
        merge_parser(&mut config.parser, parser);
    }
    if let Some(fields) = raw.fields {
        if fields.is_empty() {
            warnings.push("fields must not be empty. Keeping the previous field list.".to_string());
        } else {
            config.fields = fields;
        }
    }
    if let Some(classes) = raw.classes {
        config.classes = classes;
    }
    if let Some(rules) = raw.rules {
        config.rules = rules;
    }
    if let Some(export) = raw.export {
        merge_export(&mut config.export, export);
    }
    if let Some(recording) = raw.recording {
        merge_recording(&mut config.recording, recording, &mut warnings);
    }
    if let Some(logging) = raw.logging {
        merge_logging(&mut config.logging, logging, &mut warnings);
    }
    if let Some(serial_tx) = raw.serial_tx {
        merge_serial_tx(&mut config.serial_tx, serial_tx, &mut warnings);
    }

    if !warnings.is_empty() {
        tracing::warn!(count = warnings.len(), "Config validation produced warnings");
        for w in &warnings {
            tracing::warn!("{}", w);
        }
    }
    Ok((config, warnings))
}

/// Import a JSON document merged onto the defaults.
pub fn import_config(json: &str) -> Result<(AppConfig, Vec<String>), ConfigError> {
    merge_config(&AppConfig::default(), json)
}

/// Serialise the full configuration as pretty JSON.
pub fn export_config(config: &AppConfig) -> Result<String, ConfigError> {
    serde_json::to_string_pretty(config).map_err(|source| ConfigError::Serialize { source })
}

// =============================================================================
// Persistence
// =============================================================================

/// Load the config file at `path`.
///
/// A missing file is the first-run case and yields defaults with no
/// warnings. An unreadable or malformed file is an error.
pub fn load_config_file(path: &Path) -> Result<(AppConfig, Vec<String>), ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No config file found; using defaults");
            return Ok((AppConfig::default(), Vec::new()));
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let loaded = import_config(&content)?;
    tracing::info!(path = %path.display(), "Loaded config file");
    Ok(loaded)
}

/// Persist `config` to `path` atomically (sibling temp file, then rename).
pub fn save_config_file(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let json = export_config(config)?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json.as_bytes()).map_err(|source| ConfigError::Io {
        path: tmp.clone(),
        source,
    })?;

    std::fs::rename(&tmp, path).map_err(|source| {
        let _ = std::fs::remove_file(&tmp);
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    })?;

    tracing::debug!(path = %path.display(), "Config saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::RuleAction;

    #[test]
    fn test_empty_document_yields_defaults() {
        let (config, warnings) = import_config("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_partial_document_overrides_only_named_keys() {
        let json = r#"{
            "serial": { "baudRate": 9600 },
            "parser": { "type": "regex", "regex": "^(\\d+)$", "regexGroups": ["n"] },
            "fields": ["n"],
            "rules": [{ "id": "r1", "condition": "n > 5", "action": "label", "value": "big" }],
            "recording": { "enableLabeling": false },
            "somethingNew": { "ignored": true }
        }"#;
        let (config, warnings) = import_config(json).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.delimiter, "\n");
        assert_eq!(config.parser.kind, ParserKind::Regex);
        assert_eq!(config.parser.regex_groups, Some(vec!["n".to_string()]));
        assert_eq!(config.fields, vec!["n"]);
        assert_eq!(config.rules[0].action, RuleAction::Label);
        assert!(config.rules[0].enabled);
        assert!(!config.recording.enable_labeling);
        assert_eq!(config.recording.auto_stop_seconds, constants::DEFAULT_AUTO_STOP_SECONDS);
        assert_eq!(config.export, ExportConfig::default());
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(matches!(
            import_config("{ not json"),
            Err(ConfigError::InvalidJson { .. })
        ));
        // Wrong value type is rejected, not partially applied.
        assert!(import_config(r#"{"serial": {"baudRate": "fast"}}"#).is_err());
        assert!(import_config(r#"{"parser": {"type": "xml"}}"#).is_err());
    }

    #[test]
    fn test_out_of_range_values_warn_and_keep_base() {
        let json = r#"{
            "serial": { "baudRate": 12, "encoding": "utf-16" },
            "recording": { "autoStopSeconds": 999999 },
            "logging": { "level": "loud", "maxEntries": 1 },
            "fields": []
        }"#;
        let (config, warnings) = import_config(json).unwrap();
        assert_eq!(warnings.len(), 6);
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_merge_onto_current_config() {
        let (current, _) = import_config(r#"{"serial": {"baudRate": 9600}}"#).unwrap();
        let (merged, _) = merge_config(&current, r#"{"logging": {"level": "DEBUG"}}"#).unwrap();
        assert_eq!(merged.serial.baud_rate, 9600);
        assert_eq!(merged.logging.level, "debug");
    }

    #[test]
    fn test_serial_tx_section_merges_with_warnings() {
        let json = r#"{
            "serialTx": {
                "enabled": true,
                "encoding": "raw",
                "quickCommands": [{ "id": "q1", "label": "Reset", "command": "FF00" }],
                "classCommands": [{ "classId": "class1", "command": "01", "enabled": false }],
                "automatedCommands": { "onConnect": "AA", "delayBetweenCommands": 999999 }
            }
        }"#;
        let (config, warnings) = import_config(json).unwrap();
        let tx = &config.serial_tx;
        assert!(tx.enabled);
        assert_eq!(tx.encoding, TxEncoding::Raw);
        assert!(tx.quick_commands[0].enabled);
        assert!(!tx.class_commands[0].enabled);
        assert_eq!(tx.automated_commands.on_connect, "AA");
        assert_eq!(tx.automated_commands.on_disconnect, "");
        assert_eq!(
            tx.automated_commands.delay_between_commands,
            constants::DEFAULT_TX_DELAY_MS
        );
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("delayBetweenCommands"));

        let (kept, warnings) = merge_config(&config, r#"{"serialTx": {"encoding": "utf-16"}}"#).unwrap();
        assert_eq!(kept.serial_tx.encoding, TxEncoding::Raw);
        assert!(warnings[0].contains("serialTx.encoding"));
    }

    #[test]
    fn test_export_then_import_is_stable() {
        let mut config = AppConfig::default();
        config.parser.skip_lines = vec!["#".to_string(), "/^DEBUG/".to_string()];
        config.serial_tx.encoding = TxEncoding::Ascii;
        config.serial_tx.automated_commands.on_recording_start = "GO".to_string();
        let json = export_config(&config).unwrap();
        assert!(json.contains("\"baudRate\": 115200"));
        let (again, warnings) = import_config(&json).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(again, config);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(constants::CONFIG_FILE_NAME);

        let (missing, warnings) = load_config_file(&path).unwrap();
        assert_eq!(missing, AppConfig::default());
        assert!(warnings.is_empty());

        let mut config = AppConfig::default();
        config.export.include_header = false;
        save_config_file(&config, &path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let (loaded, _) = load_config_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(constants::CONFIG_FILE_NAME);
        std::fs::write(&path, "[1, 2").unwrap();
        assert!(load_config_file(&path).is_err());
    }
}
