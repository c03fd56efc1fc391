// SerialCollect - app/collector.rs
//
// The collection pipeline: line -> parser -> rules -> recording session,
// plus export and validation helpers over the recorded samples.
//
// Architecture:
//   - `Collector` owns explicitly constructed parser, rules engine,
//     formatter and session instances; nothing is process-global.
//   - Every state change happens on the thread that calls `handle_line` /
//     `run`. The line source and the auto-stop timer only send
//     `CollectorEvent`s into the channel whose sender the collector hands
//     out, so the sample sequence has exactly one writer.
//   - `configure` compiles the new parser, rules and formatter before
//     touching any live state; a failing configuration leaves the previous
//     one fully in place.
//   - Outbound commands go through a `CommandWriter` on the same thread.
//     Automated commands follow connection and recording changes; failures
//     are logged and never stop collection.

use crate::app::session::RecordingSession;
use crate::app::writer::{CommandPort, CommandWriter};
use crate::core::model::{
    AppConfig, CollectionStats, CollectorEvent, ConnectionStatus, Decision, ParsedData,
    RecordedSample, TxLogEntry, TxTrigger,
};
use crate::core::parser::LineParser;
use crate::core::rules::{validate_rule, RulesEngine};
use crate::core::template::{self, TemplateFormatter, TemplateValidation};
use crate::util::constants;
use crate::util::error::{CollectorError, CommandError, ExportError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

/// What happened to one incoming line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// Skipped or unparseable.
    Rejected,
    /// Dropped by an `ignore` rule.
    Ignored { rule_id: String },
    /// Matched a `log` rule: logged, not stored.
    Logged { rule_id: String },
    /// Accepted, but no recording is active.
    Passed,
    /// Stored as a sample.
    Recorded { label: Option<String> },
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// The line source reached end of stream or gave up.
    SourceClosed,
    /// The auto-stop timer ended the recording.
    AutoStopped,
    /// A `Shutdown` event was received, or the receiver has no senders left.
    Shutdown,
}

/// A command held back until the source reports `connected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingCommand {
    Text(String),
    Quick(String),
    Automated(TxTrigger),
    Class(String),
}

/// A rendered export ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFile {
    pub filename: String,
    pub content: String,
}

pub struct Collector {
    config: AppConfig,
    parser: LineParser,
    rules: RulesEngine,
    formatter: TemplateFormatter,
    session: RecordingSession,
    live: VecDeque<String>,
    status: ConnectionStatus,
    status_message: Option<String>,
    commands: CommandWriter,
    pending: Vec<PendingCommand>,
    events: mpsc::Sender<CollectorEvent>,
}

impl Collector {
    /// Build a collector from `config`. `events` is the sending half of the
    /// channel later passed to [`run`](Self::run); the auto-stop timer posts
    /// into it.
    pub fn new(
        config: AppConfig,
        events: mpsc::Sender<CollectorEvent>,
    ) -> Result<Self, CollectorError> {
        let parser = LineParser::new(&config.parser, &config.fields)?;
        let rules = RulesEngine::new(&config.rules);
        let formatter = TemplateFormatter::new(&config.export.template, &config.fields);
        let session = RecordingSession::new(config.recording, events.clone());
        let commands = CommandWriter::new(config.serial_tx.clone());

        tracing::info!(
            parser = config.parser.kind.label(),
            fields = config.fields.len(),
            rules = config.rules.len(),
            "Collector initialised"
        );

        Ok(Self {
            config,
            parser,
            rules,
            formatter,
            session,
            live: VecDeque::with_capacity(constants::LIVE_BUFFER_LINES),
            status: ConnectionStatus::default(),
            status_message: None,
            commands,
            pending: Vec::new(),
            events,
        })
    }

    /// Apply a new configuration. Takes effect from the next line; on error
    /// nothing changes.
    pub fn configure(&mut self, config: AppConfig) -> Result<(), CollectorError> {
        let parser = LineParser::new(&config.parser, &config.fields)?;
        let rules = RulesEngine::new(&config.rules);
        let formatter = TemplateFormatter::new(&config.export.template, &config.fields);

        self.parser = parser;
        self.rules = rules;
        self.formatter = formatter;
        self.session.configure(config.recording);
        self.commands.configure(config.serial_tx.clone());
        self.config = config;

        tracing::info!(
            parser = self.config.parser.kind.label(),
            rules = self.config.rules.len(),
            "Collector reconfigured"
        );
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Sender for the line source and other producers.
    pub fn sender(&self) -> mpsc::Sender<CollectorEvent> {
        self.events.clone()
    }

    /// Stop recording, cancel the auto-stop timer and drop the command port.
    /// Samples are kept so they can still be exported.
    pub fn dispose(&mut self) {
        self.session.dispose();
        self.commands.disconnect();
        self.pending.clear();
        tracing::debug!("Collector disposed");
    }

    // -------------------------------------------------------------------------
    // Pipeline
    // -------------------------------------------------------------------------

    /// Run one line through parser, rules and session.
    pub fn handle_line(&mut self, line: &str) -> LineOutcome {
        if self.live.len() == constants::LIVE_BUFFER_LINES {
            self.live.pop_front();
        }
        self.live.push_back(line.to_string());

        let Some(data) = self.parser.parse(line) else {
            return LineOutcome::Rejected;
        };

        let result = self.rules.evaluate(&data);
        let rule_id = result.rule_id.unwrap_or_default();
        let rule_label = match result.action {
            Decision::Ignore => {
                tracing::debug!(rule_id = %rule_id, "Line ignored by rule");
                return LineOutcome::Ignored { rule_id };
            }
            Decision::Log => {
                tracing::info!(
                    rule_id = %rule_id,
                    raw = %data.raw,
                    fields = %fields_json(&data),
                    "Rule matched"
                );
                return LineOutcome::Logged { rule_id };
            }
            Decision::Label => result.value,
            Decision::Pass => None,
        };

        match self.session.record(data, rule_label) {
            Some(sample) => LineOutcome::Recorded {
                label: sample.label.clone(),
            },
            None => LineOutcome::Passed,
        }
    }

    /// Consume events until the source closes or a shutdown arrives. With
    /// `stop_on_auto_stop`, an auto-stop that ends the recording also ends
    /// the loop.
    pub fn run(&mut self, rx: &mpsc::Receiver<CollectorEvent>, stop_on_auto_stop: bool) -> RunEnd {
        let mut lines = 0usize;
        let end = loop {
            // Only reachable when `rx` is not paired with our own sender.
            let Ok(event) = rx.recv() else {
                break RunEnd::Shutdown;
            };
            match event {
                CollectorEvent::Line(line) => {
                    lines += 1;
                    self.handle_line(&line);
                }
                CollectorEvent::Status { status, message } => {
                    self.set_status(status, message);
                }
                CollectorEvent::AutoStop { generation } => {
                    if self.session.handle_auto_stop(generation) {
                        self.send_automated(TxTrigger::RecordingStop);
                        if stop_on_auto_stop {
                            break RunEnd::AutoStopped;
                        }
                    }
                }
                CollectorEvent::SourceClosed => break RunEnd::SourceClosed,
                CollectorEvent::Shutdown => break RunEnd::Shutdown,
            }
        };
        tracing::info!(
            lines,
            samples = self.session.stats().total_samples,
            end = ?end,
            "Collector loop finished"
        );
        end
    }

    fn set_status(&mut self, status: ConnectionStatus, message: Option<String>) {
        if status == ConnectionStatus::Error {
            tracing::warn!(message = message.as_deref().unwrap_or(""), "Line source error");
        }
        let connected = status == ConnectionStatus::Connected;
        self.status = status;
        self.status_message = message;

        if connected {
            self.send_automated(TxTrigger::Connect);
            for command in std::mem::take(&mut self.pending) {
                let result = match &command {
                    PendingCommand::Text(text) => self.commands.write(text),
                    PendingCommand::Quick(id) => self.commands.send_quick_command(id),
                    PendingCommand::Automated(trigger) => self.commands.send_automated(*trigger),
                    PendingCommand::Class(class_id) => self.commands.send_class_command(class_id),
                };
                if let Err(e) = result {
                    tracing::warn!(command = ?command, error = %e, "Queued command not sent");
                }
            }
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    /// Raw lines received most recently, oldest first.
    pub fn live_lines(&self) -> impl Iterator<Item = &str> {
        self.live.iter().map(String::as_str)
    }

    pub fn clear_live_lines(&mut self) {
        self.live.clear();
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Start recording. The `onRecordingStart` and class commands are sent
    /// now, or on connection when the source is not connected yet.
    pub fn start_recording(&mut self, class_id: Option<&str>) -> bool {
        if !self.session.start_recording(class_id) {
            return false;
        }
        if !self.commands.is_enabled() {
            return true;
        }
        if self.status != ConnectionStatus::Connected {
            self.pending
                .push(PendingCommand::Automated(TxTrigger::RecordingStart));
            if let Some(class_id) = class_id {
                self.pending.push(PendingCommand::Class(class_id.to_string()));
            }
            return true;
        }

        self.send_automated(TxTrigger::RecordingStart);
        if let Some(class_id) = class_id {
            if let Err(e) = self.commands.send_class_command(class_id) {
                tracing::warn!(class_id, error = %e, "Class command not sent");
            }
        }
        true
    }

    pub fn stop_recording(&mut self) {
        let was_recording = self.session.is_recording();
        self.session.stop_recording();
        if was_recording {
            self.send_automated(TxTrigger::RecordingStop);
        }
    }

    pub fn clear_recorded_samples(&mut self) {
        self.session.clear();
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_recording()
    }

    pub fn current_class(&self) -> Option<&str> {
        self.session.current_class()
    }

    pub fn samples(&self) -> &[RecordedSample] {
        self.session.samples()
    }

    pub fn stats(&self) -> &CollectionStats {
        self.session.stats()
    }

    // -------------------------------------------------------------------------
    // Outbound commands
    // -------------------------------------------------------------------------

    /// Route outbound commands to `port`.
    pub fn attach_port(&mut self, port: Box<dyn CommandPort>) {
        self.commands.set_port(port);
    }

    /// Send the `onDisconnect` command, then drop the port. Call before the
    /// source is stopped.
    pub fn detach_port(&mut self) {
        self.send_automated(TxTrigger::Disconnect);
        self.commands.disconnect();
    }

    /// Send a command once the source next reports `connected`.
    pub fn queue_on_connect(&mut self, command: PendingCommand) {
        self.pending.push(command);
    }

    pub fn send_command(&mut self, text: &str) -> Result<(), CommandError> {
        self.commands.write(text)
    }

    pub fn send_quick_command(&mut self, id: &str) -> Result<(), CommandError> {
        self.commands.send_quick_command(id)
    }

    /// Distinct commands sent, most recent first.
    pub fn command_history(&self) -> Vec<&str> {
        self.commands.history().collect()
    }

    pub fn clear_command_history(&mut self) {
        self.commands.clear_history();
    }

    pub fn tx_log(&self) -> Vec<&TxLogEntry> {
        self.commands.tx_log().collect()
    }

    fn send_automated(&mut self, trigger: TxTrigger) {
        if !self.commands.is_enabled() {
            return;
        }
        if let Err(e) = self.commands.send_automated(trigger) {
            tracing::warn!(trigger = trigger.label(), error = %e, "Automated command not sent");
        }
    }

    // -------------------------------------------------------------------------
    // Export
    // -------------------------------------------------------------------------

    /// Render every recorded sample with the export template.
    pub fn export(&self) -> Result<ExportFile, ExportError> {
        let samples = self.session.samples();
        if samples.is_empty() {
            return Err(ExportError::NoSamples);
        }
        let validation = self.formatter.validate();
        if !validation.is_valid() {
            return Err(ExportError::InvalidTemplate {
                errors: validation.errors,
            });
        }

        let filename = template::with_export_extension(&template::generate_filename(
            &self.config.export.filename,
            chrono::Utc::now(),
        ));
        let content = self
            .formatter
            .generate_csv(samples, self.config.export.include_header);
        tracing::info!(filename = %filename, samples = samples.len(), "Export generated");
        Ok(ExportFile { filename, content })
    }

    /// Export and write the file into `dir`. Returns the written path.
    pub fn write_export(&self, dir: &Path) -> Result<PathBuf, ExportError> {
        let export = self.export()?;
        let path = dir.join(&export.filename);
        std::fs::create_dir_all(dir).map_err(|source| ExportError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        std::fs::write(&path, format!("{}\n", export.content)).map_err(|source| {
            ExportError::Io {
                path: path.clone(),
                source,
            }
        })?;
        tracing::info!(path = %path.display(), "Export written");
        Ok(path)
    }

    pub fn preview_export(&self, max_lines: usize) -> Vec<String> {
        let samples = self.session.samples();
        if samples.is_empty() {
            return vec![constants::EMPTY_PREVIEW_TEXT.to_string()];
        }
        self.formatter
            .preview_export(samples, max_lines, self.config.export.include_header)
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    pub fn validate_line(&self, line: &str) -> Result<ParsedData, String> {
        self.parser.validate_line(line)
    }

    pub fn validate_template(&self) -> TemplateValidation {
        self.formatter.validate()
    }

    /// Syntax check of every configured rule, in order.
    pub fn validate_rules(&self) -> Vec<(String, Result<(), String>)> {
        self.config
            .rules
            .iter()
            .map(|r| (r.id.clone(), validate_rule(&r.condition)))
            .collect()
    }
}

fn fields_json(data: &ParsedData) -> String {
    serde_json::to_string(&data.fields).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{
        AutomatedCommands, ClassCommand, ParserConfig, ParserKind, QuickCommand, RuleAction,
        RuleConfig,
    };
    use crate::util::error::SourceError;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn config(fields: &[&str]) -> AppConfig {
        let mut cfg = AppConfig {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            ..AppConfig::default()
        };
        cfg.export.template = fields
            .iter()
            .map(|f| format!("${{{f}}}"))
            .chain(std::iter::once("${label}".to_string()))
            .collect::<Vec<_>>()
            .join(",");
        cfg.recording.auto_stop_seconds = 0;
        cfg
    }

    fn rule(id: &str, condition: &str, action: RuleAction, value: Option<&str>) -> RuleConfig {
        RuleConfig {
            id: id.to_string(),
            condition: condition.to_string(),
            action,
            value: value.map(str::to_string),
            enabled: true,
        }
    }

    fn collector(cfg: AppConfig) -> (Collector, mpsc::Receiver<CollectorEvent>) {
        let (tx, rx) = mpsc::channel();
        (Collector::new(cfg, tx).unwrap(), rx)
    }

    #[test]
    fn test_lines_pass_until_recording_starts() {
        let (mut c, _rx) = collector(config(&["a", "b"]));
        assert_eq!(c.handle_line("1,2"), LineOutcome::Passed);
        assert!(c.start_recording(Some("classA")));
        assert_eq!(
            c.handle_line("3,4"),
            LineOutcome::Recorded {
                label: Some("classA".to_string())
            }
        );
        assert_eq!(c.handle_line("oops"), LineOutcome::Rejected);
        assert_eq!(c.stats().total_samples, 1);
        assert_eq!(c.stats().class_counts.get("classA"), Some(&1));
    }

    #[test]
    fn test_rule_actions() {
        let mut cfg = config(&["value"]);
        cfg.recording.enable_labeling = false;
        cfg.rules = vec![
            rule("drop", "value < 0", RuleAction::Ignore, None),
            rule("note", "value == 0", RuleAction::Log, None),
            rule("hot", "value > 100", RuleAction::Label, Some("hot")),
        ];
        let (mut c, _rx) = collector(cfg);
        assert!(c.start_recording(None));

        assert_eq!(
            c.handle_line("-5"),
            LineOutcome::Ignored {
                rule_id: "drop".to_string()
            }
        );
        assert_eq!(
            c.handle_line("0"),
            LineOutcome::Logged {
                rule_id: "note".to_string()
            }
        );
        assert_eq!(
            c.handle_line("150"),
            LineOutcome::Recorded {
                label: Some("hot".to_string())
            }
        );
        assert_eq!(c.handle_line("50"), LineOutcome::Recorded { label: None });

        let counts = &c.stats().class_counts;
        assert_eq!(counts.get("hot"), Some(&1));
        assert_eq!(counts.get(constants::UNLABELED), Some(&1));
        assert_eq!(c.samples().len(), 2);
    }

    #[test]
    fn test_invalid_configuration_keeps_previous_one() {
        let (mut c, _rx) = collector(config(&["a", "b"]));
        let mut bad = config(&["x"]);
        bad.parser = ParserConfig {
            kind: ParserKind::Regex,
            regex: Some("(unclosed".to_string()),
            ..ParserConfig::default()
        };
        assert!(c.configure(bad).is_err());
        assert_eq!(c.config().fields, vec!["a", "b"]);
        assert!(c.validate_line("1,2").is_ok());
    }

    #[test]
    fn test_export_and_preview() {
        let (mut c, _rx) = collector(config(&["a", "b"]));
        assert!(matches!(c.export(), Err(ExportError::NoSamples)));
        assert_eq!(c.preview_export(5), vec!["No data to preview"]);

        c.start_recording(Some("x,y"));
        for line in ["1,2", "3,4", "5,6"] {
            c.handle_line(line);
        }

        let export = c.export().unwrap();
        assert!(export.filename.starts_with("data_export_"));
        assert!(export.filename.ends_with(".csv"));
        let rows: Vec<&str> = export.content.lines().collect();
        assert_eq!(rows[0], "a,b,label");
        assert_eq!(rows[1], "1,2,\"x,y\"");
        assert_eq!(rows.len(), 4);

        let preview = c.preview_export(2);
        assert_eq!(preview.len(), 4);
        assert_eq!(preview[3], "... and 1 more rows");
    }

    #[test]
    fn test_write_export_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut c, _rx) = collector(config(&["a"]));
        c.start_recording(Some("k"));
        c.handle_line("7");
        let path = c.write_export(&dir.path().join("out")).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text, "a,label\n7,k\n");
    }

    #[test]
    fn test_live_buffer_is_bounded() {
        let (mut c, _rx) = collector(config(&["a"]));
        for i in 0..constants::LIVE_BUFFER_LINES + 5 {
            c.handle_line(&i.to_string());
        }
        let live: Vec<&str> = c.live_lines().collect();
        assert_eq!(live.len(), constants::LIVE_BUFFER_LINES);
        assert_eq!(live[0], "5");
        c.clear_live_lines();
        assert_eq!(c.live_lines().count(), 0);
    }

    #[test]
    fn test_run_consumes_events_until_source_closes() {
        let (mut c, rx) = collector(config(&["a"]));
        c.start_recording(Some("k"));
        let tx = c.sender();
        tx.send(CollectorEvent::Status {
            status: ConnectionStatus::Connected,
            message: None,
        })
        .unwrap();
        tx.send(CollectorEvent::Line("1".to_string())).unwrap();
        tx.send(CollectorEvent::Line("2".to_string())).unwrap();
        tx.send(CollectorEvent::SourceClosed).unwrap();

        assert_eq!(c.run(&rx, false), RunEnd::SourceClosed);
        assert_eq!(c.stats().total_samples, 2);
        assert_eq!(c.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_run_ends_on_auto_stop() {
        let mut cfg = config(&["a"]);
        cfg.recording.auto_stop_seconds = 1;
        let (mut c, rx) = collector(cfg);
        assert!(c.start_recording(Some("k")));

        let end = c.run(&rx, true);
        assert_eq!(end, RunEnd::AutoStopped);
        assert!(!c.is_recording());
        // No second expiry is queued.
        assert!(rx.recv_timeout(Duration::from_millis(1_500)).is_err());
    }

    #[test]
    fn test_run_on_a_detached_receiver_ends_as_shutdown() {
        let (mut c, _rx) = collector(config(&["a"]));
        let (tx, rx) = mpsc::channel();
        tx.send(CollectorEvent::Line("1".to_string())).unwrap();
        drop(tx);
        assert_eq!(c.run(&rx, false), RunEnd::Shutdown);
        assert_eq!(c.live_lines().collect::<Vec<_>>(), vec!["1"]);
    }

    #[test]
    fn test_clear_recorded_samples_resets_everything() {
        let (mut c, _rx) = collector(config(&["a"]));
        assert!(c.start_recording(Some("k")));
        for line in ["1", "2", "3"] {
            c.handle_line(line);
        }
        assert_eq!(c.stats().total_samples, 3);

        // Clearing twice is the same as clearing once.
        for _ in 0..2 {
            c.clear_recorded_samples();
            assert!(c.samples().is_empty());
            assert_eq!(c.stats(), &CollectionStats::default());
            assert_eq!(c.preview_export(5), vec!["No data to preview"]);
            assert!(matches!(c.export(), Err(ExportError::NoSamples)));
        }

        // The recording itself keeps going.
        assert!(c.is_recording());
        c.handle_line("4");
        assert_eq!(c.stats().total_samples, 1);
    }

    /// Collects every outbound write as text.
    struct RecordingPort(Arc<Mutex<Vec<String>>>);

    impl CommandPort for RecordingPort {
        fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SourceError> {
            let text = String::from_utf8_lossy(bytes).trim_end().to_string();
            self.0.lock().unwrap().push(text);
            Ok(())
        }
    }

    fn with_commands(mut cfg: AppConfig) -> AppConfig {
        let tx = &mut cfg.serial_tx;
        tx.enabled = true;
        tx.automated_commands = AutomatedCommands {
            on_connect: "HELLO".to_string(),
            on_disconnect: "BYE".to_string(),
            on_recording_start: "START".to_string(),
            on_recording_stop: "STOP".to_string(),
            delay_between_commands: 0,
        };
        tx.class_commands = vec![ClassCommand {
            class_id: "class1".to_string(),
            command: "MODE 1".to_string(),
            enabled: true,
        }];
        tx.quick_commands = vec![QuickCommand {
            id: "ping".to_string(),
            label: "Ping".to_string(),
            command: "PING".to_string(),
            enabled: true,
        }];
        cfg
    }

    fn attach(c: &mut Collector) -> Arc<Mutex<Vec<String>>> {
        let sent = Arc::new(Mutex::new(Vec::new()));
        c.attach_port(Box::new(RecordingPort(Arc::clone(&sent))));
        sent
    }

    #[test]
    fn test_lifecycle_commands_follow_connection_and_recording() {
        let (mut c, rx) = collector(with_commands(config(&["a"])));
        let sent = attach(&mut c);
        c.queue_on_connect(PendingCommand::Quick("ping".to_string()));
        c.queue_on_connect(PendingCommand::Text("VER?".to_string()));

        let tx = c.sender();
        tx.send(CollectorEvent::Status {
            status: ConnectionStatus::Connected,
            message: None,
        })
        .unwrap();
        tx.send(CollectorEvent::SourceClosed).unwrap();
        c.run(&rx, false);

        assert!(c.start_recording(Some("class1")));
        c.stop_recording();
        c.stop_recording();
        c.detach_port();
        assert!(c.send_command("LATE").is_err());

        assert_eq!(
            *sent.lock().unwrap(),
            vec!["HELLO", "PING", "VER?", "START", "MODE 1", "STOP", "BYE"]
        );
        assert_eq!(c.command_history()[0], "BYE");
        assert_eq!(c.tx_log().len(), 7);
        c.clear_command_history();
        assert!(c.command_history().is_empty());
    }

    #[test]
    fn test_auto_stop_sends_stop_command() {
        let mut cfg = with_commands(config(&["a"]));
        cfg.recording.auto_stop_seconds = 1;
        cfg.recording.enable_labeling = false;
        let (mut c, rx) = collector(cfg);
        let sent = attach(&mut c);

        // Started before the source connects: the start command waits.
        assert!(c.start_recording(None));
        assert!(sent.lock().unwrap().is_empty());
        c.sender()
            .send(CollectorEvent::Status {
                status: ConnectionStatus::Connected,
                message: None,
            })
            .unwrap();

        assert_eq!(c.run(&rx, true), RunEnd::AutoStopped);
        assert_eq!(*sent.lock().unwrap(), vec!["HELLO", "START", "STOP"]);
    }

    #[test]
    fn test_disabled_commands_stay_silent() {
        let mut cfg = with_commands(config(&["a"]));
        cfg.serial_tx.enabled = false;
        let (mut c, _rx) = collector(cfg);
        let sent = attach(&mut c);

        assert!(c.start_recording(Some("class1")));
        c.stop_recording();
        assert!(matches!(c.send_quick_command("ping"), Err(CommandError::Disabled)));
        assert!(sent.lock().unwrap().is_empty());

        // Enabling through configure applies to the next command.
        let mut enabled = c.config().clone();
        enabled.serial_tx.enabled = true;
        c.configure(enabled).unwrap();
        c.send_quick_command("ping").unwrap();
        assert_eq!(*sent.lock().unwrap(), vec!["PING"]);
    }

    #[test]
    fn test_validate_rules_and_template() {
        let mut cfg = config(&["a"]);
        cfg.rules = vec![
            rule("ok", "a > 1", RuleAction::Log, None),
            rule("bad", "a is maybe", RuleAction::Log, None),
        ];
        cfg.export.template = "${a},${nope}".to_string();
        let (c, _rx) = collector(cfg);

        let results = c.validate_rules();
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());

        let validation = c.validate_template();
        assert!(validation.is_valid());
        assert_eq!(validation.warnings.len(), 1);
    }
}
