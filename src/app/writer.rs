// SerialCollect - app/writer.rs
//
// Outbound commands: free text, quick commands by id, per-class commands and
// automated commands on lifecycle events.
//
// Writes are serialised through `&mut self`, so commands leave in call order.
// Two consecutive writes are spaced by at least `delayBetweenCommands`. Every
// successful write is added to the command history (deduplicated, most
// recent first) and appended to the bounded TX log.

use crate::core::framer::TextEncoding;
use crate::core::model::{now_millis, SerialTxConfig, TxEncoding, TxLogEntry, TxTrigger};
use crate::util::constants::{MAX_COMMAND_HISTORY, TX_LOG_CAPACITY};
use crate::util::error::{CommandError, SourceError};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Where encoded command bytes go.
pub trait CommandPort: Send {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SourceError>;
}

pub struct CommandWriter {
    config: SerialTxConfig,
    port: Option<Box<dyn CommandPort>>,
    history: VecDeque<String>,
    tx_log: VecDeque<TxLogEntry>,
    last_write: Option<Instant>,
}

impl CommandWriter {
    pub fn new(config: SerialTxConfig) -> Self {
        Self {
            config,
            port: None,
            history: VecDeque::new(),
            tx_log: VecDeque::new(),
            last_write: None,
        }
    }

    /// Replace the settings. History and TX log are kept.
    pub fn configure(&mut self, config: SerialTxConfig) {
        tracing::debug!(
            enabled = config.enabled,
            encoding = %config.encoding,
            delay_ms = config.automated_commands.delay_between_commands,
            "Command writer reconfigured"
        );
        self.config = config;
    }

    pub fn config(&self) -> &SerialTxConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn set_port(&mut self, port: Box<dyn CommandPort>) {
        self.port = Some(port);
        self.last_write = None;
    }

    /// Drop the port. Later writes fail with `NotConnected`.
    pub fn disconnect(&mut self) {
        self.port = None;
        self.last_write = None;
    }

    /// Encode and send `text`.
    pub fn write(&mut self, text: &str) -> Result<(), CommandError> {
        if !self.config.enabled {
            tracing::warn!(data = %text, "Serial TX is disabled");
            return Err(CommandError::Disabled);
        }
        let payload = encode_command(text, self.config.encoding, &self.config.line_ending)?;
        let port = self
            .port
            .as_mut()
            .ok_or(CommandError::Port(SourceError::NotConnected))?;

        if let Some(last) = self.last_write {
            let spacing = Duration::from_millis(self.config.automated_commands.delay_between_commands);
            let wait = spacing.saturating_sub(last.elapsed());
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
        }

        if let Err(e) = port.write_bytes(&payload) {
            tracing::error!(error = %e, data = %text, "Failed to write command");
            return Err(e.into());
        }
        self.last_write = Some(Instant::now());

        self.remember(text);
        tracing::debug!(
            bytes = payload.len(),
            data = %text,
            encoding = %self.config.encoding,
            "TX"
        );
        Ok(())
    }

    /// Send the enabled quick command with this id.
    pub fn send_quick_command(&mut self, id: &str) -> Result<(), CommandError> {
        let command = self
            .config
            .quick_commands
            .iter()
            .find(|c| c.id == id && c.enabled)
            .map(|c| c.command.clone());
        match command {
            Some(command) => self.write(&command),
            None => {
                tracing::warn!(id, "Quick command not found or disabled");
                Err(CommandError::UnknownQuickCommand { id: id.to_string() })
            }
        }
    }

    /// Send the command configured for `trigger`. Nothing configured is not
    /// an error.
    pub fn send_automated(&mut self, trigger: TxTrigger) -> Result<(), CommandError> {
        let command = self.config.automated_commands.command(trigger).trim().to_string();
        if command.is_empty() {
            return Ok(());
        }
        tracing::info!(trigger = trigger.label(), command = %command, "Sending automated command");
        self.write(&command)
    }

    /// Send the first enabled command for `class_id`, if any.
    pub fn send_class_command(&mut self, class_id: &str) -> Result<(), CommandError> {
        let command = self
            .config
            .class_commands
            .iter()
            .find(|c| c.class_id == class_id && c.enabled)
            .map(|c| c.command.trim().to_string())
            .unwrap_or_default();
        if command.is_empty() {
            return Ok(());
        }
        tracing::info!(class_id, command = %command, "Sending class command");
        self.write(&command)
    }

    /// Distinct commands sent, most recent first.
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Written commands, oldest first.
    pub fn tx_log(&self) -> impl Iterator<Item = &TxLogEntry> {
        self.tx_log.iter()
    }

    fn remember(&mut self, text: &str) {
        self.history.retain(|c| c != text);
        self.history.push_front(text.to_string());
        self.history.truncate(MAX_COMMAND_HISTORY);

        if self.tx_log.len() == TX_LOG_CAPACITY {
            self.tx_log.pop_front();
        }
        self.tx_log.push_back(TxLogEntry {
            timestamp: now_millis(),
            direction: "TX",
            data: text.to_string(),
            encoding: self.config.encoding,
        });
    }
}

/// Bytes for one command. Text encodings append `line_ending`; `raw` parses
/// hex pairs (whitespace ignored, a trailing single digit is one byte).
pub fn encode_command(
    text: &str,
    encoding: TxEncoding,
    line_ending: &str,
) -> Result<Vec<u8>, CommandError> {
    match encoding {
        TxEncoding::Utf8 => Ok(TextEncoding::Utf8.encode(&format!("{text}{line_ending}"))),
        TxEncoding::Ascii => Ok(TextEncoding::Ascii.encode(&format!("{text}{line_ending}"))),
        TxEncoding::Raw => parse_hex(text),
    }
}

fn parse_hex(text: &str) -> Result<Vec<u8>, CommandError> {
    let digits: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    digits
        .chunks(2)
        .map(|pair| {
            let s: String = pair.iter().collect();
            u8::from_str_radix(&s, 16).map_err(|_| CommandError::InvalidHex {
                text: text.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{ClassCommand, QuickCommand};
    use std::sync::{Arc, Mutex};

    /// Records every write; fails when `fail` is set.
    struct MemoryPort {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: bool,
    }

    impl CommandPort for MemoryPort {
        fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SourceError> {
            if self.fail {
                return Err(SourceError::NotWritable);
            }
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    fn tx_config() -> SerialTxConfig {
        let mut config = SerialTxConfig {
            enabled: true,
            ..SerialTxConfig::default()
        };
        config.automated_commands.delay_between_commands = 0;
        config
    }

    fn writer(config: SerialTxConfig) -> (CommandWriter, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut w = CommandWriter::new(config);
        w.set_port(Box::new(MemoryPort {
            sent: Arc::clone(&sent),
            fail: false,
        }));
        (w, sent)
    }

    #[test]
    fn test_write_appends_line_ending_and_logs() {
        let mut config = tx_config();
        config.line_ending = "\r\n".to_string();
        let (mut w, sent) = writer(config);

        w.write("AT").unwrap();
        assert_eq!(sent.lock().unwrap()[0], b"AT\r\n");
        let log: Vec<&TxLogEntry> = w.tx_log().collect();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].data, "AT");
        assert_eq!(log[0].direction, "TX");
        assert_eq!(log[0].encoding, TxEncoding::Utf8);
    }

    #[test]
    fn test_disabled_and_disconnected_writes_fail() {
        let (mut w, sent) = writer(SerialTxConfig::default());
        assert!(matches!(w.write("AT"), Err(CommandError::Disabled)));

        let mut w2 = CommandWriter::new(tx_config());
        assert!(matches!(
            w2.write("AT"),
            Err(CommandError::Port(SourceError::NotConnected))
        ));

        w.configure(tx_config());
        w.disconnect();
        assert!(w.write("AT").is_err());
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(w.history().count(), 0);
    }

    #[test]
    fn test_failed_write_is_not_remembered() {
        let mut w = CommandWriter::new(tx_config());
        w.set_port(Box::new(MemoryPort {
            sent: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        }));
        assert!(matches!(
            w.write("AT"),
            Err(CommandError::Port(SourceError::NotWritable))
        ));
        assert_eq!(w.history().count(), 0);
        assert_eq!(w.tx_log().count(), 0);
    }

    #[test]
    fn test_history_is_deduplicated_most_recent_first_and_capped() {
        let (mut w, _sent) = writer(tx_config());
        w.write("a").unwrap();
        w.write("b").unwrap();
        w.write("a").unwrap();
        assert_eq!(w.history().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(w.tx_log().count(), 3);

        for i in 0..MAX_COMMAND_HISTORY + 10 {
            w.write(&format!("cmd{i}")).unwrap();
        }
        let history: Vec<&str> = w.history().collect();
        assert_eq!(history.len(), MAX_COMMAND_HISTORY);
        assert_eq!(history[0], format!("cmd{}", MAX_COMMAND_HISTORY + 9));

        w.clear_history();
        assert_eq!(w.history().count(), 0);
    }

    #[test]
    fn test_raw_encoding_sends_hex_bytes() {
        assert_eq!(
            encode_command("0A 0d FF", TxEncoding::Raw, "\n").unwrap(),
            vec![0x0a, 0x0d, 0xff]
        );
        assert_eq!(encode_command("0A0DF", TxEncoding::Raw, "").unwrap(), vec![0x0a, 0x0d, 0x0f]);
        assert!(matches!(
            encode_command("0G", TxEncoding::Raw, ""),
            Err(CommandError::InvalidHex { .. })
        ));
        assert_eq!(encode_command("é", TxEncoding::Ascii, "\n").unwrap(), vec![0x69, b'\n']);
    }

    #[test]
    fn test_quick_class_and_automated_commands() {
        let mut config = tx_config();
        config.quick_commands = vec![
            QuickCommand {
                id: "reset".to_string(),
                label: "Reset".to_string(),
                command: "RST".to_string(),
                enabled: true,
            },
            QuickCommand {
                id: "off".to_string(),
                label: "Off".to_string(),
                command: "OFF".to_string(),
                enabled: false,
            },
        ];
        config.class_commands = vec![
            ClassCommand {
                class_id: "class1".to_string(),
                command: "MODE 1".to_string(),
                enabled: true,
            },
            ClassCommand {
                class_id: "class2".to_string(),
                command: "  ".to_string(),
                enabled: true,
            },
        ];
        config.automated_commands.on_recording_start = "START".to_string();
        let (mut w, sent) = writer(config);

        w.send_quick_command("reset").unwrap();
        assert!(matches!(
            w.send_quick_command("off"),
            Err(CommandError::UnknownQuickCommand { .. })
        ));
        w.send_class_command("class1").unwrap();
        w.send_class_command("class2").unwrap();
        w.send_class_command("class9").unwrap();
        w.send_automated(TxTrigger::RecordingStart).unwrap();
        w.send_automated(TxTrigger::Connect).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![b"RST\n".to_vec(), b"MODE 1\n".to_vec(), b"START\n".to_vec()]
        );
    }

    #[test]
    fn test_consecutive_writes_are_spaced() {
        let mut config = tx_config();
        config.automated_commands.delay_between_commands = 60;
        let (mut w, _sent) = writer(config);

        let start = Instant::now();
        w.write("one").unwrap();
        w.write("two").unwrap();
        w.write("three").unwrap();
        assert!(start.elapsed() >= Duration::from_millis(120));
    }
}
