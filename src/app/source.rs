// SerialCollect - app/source.rs
//
// Line source adapter: reads bytes from a serial port, a file or stdin on a
// background thread, frames them into lines and streams them to the
// collector.
//
// Architecture:
//   - `SourceManager` lives on the controlling thread; `run_reader` runs on a
//     background thread that owns the reader half of the connection.
//   - An `Arc<AtomicBool>` cancel flag allows the owner to stop the reader.
//   - Lines and connection status changes are sent as `CollectorEvent`s over
//     the collector's mpsc channel; `SourceClosed` is always the last event of
//     a source that ended on its own. A stopped reader sends nothing more.
//   - The writer half (when the source has one) is kept behind a mutex so
//     `write` can be called from the controlling thread while reading. The
//     slot carries the generation of the reader that owns it, so a reader
//     left over from a restart can never install or clear the live writer.
//
// Failure handling:
//   - End of stream is a clean disconnect.
//   - A read error on a reconnectable source (serial ports) triggers up to
//     `MAX_RECONNECT_ATTEMPTS` reopen attempts, waiting
//     `RECONNECT_BASE_DELAY_MS * attempt` before each. When all fail the
//     status becomes `error` and the source closes.
//   - Serial read timeouts are the normal idle case and are not errors.

use crate::app::writer::CommandPort;
use crate::core::framer::{LineFramer, TextEncoding};
use crate::core::model::{CollectorEvent, ConnectionStatus, SerialConfig};
use crate::util::constants::{
    CANCEL_CHECK_INTERVAL_MS, MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY_MS,
    SERIAL_READ_TIMEOUT_MS, SOURCE_READ_CHUNK_BYTES,
};
use crate::util::error::SourceError;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Openers
// =============================================================================

/// An open connection: a byte reader and, for bidirectional sources, a
/// writer.
pub struct Connection {
    pub reader: Box<dyn Read + Send>,
    pub writer: Option<Box<dyn Write + Send>>,
}

/// Something the reader thread can (re)open.
pub trait Opener: Send {
    /// Human-readable target for logs and errors.
    fn target(&self) -> String;

    fn open(&mut self) -> Result<Connection, SourceError>;

    /// Whether read errors should trigger reconnect attempts.
    fn reconnectable(&self) -> bool {
        false
    }
}

/// Reads lines from a file.
pub struct FileOpener {
    path: PathBuf,
}

impl FileOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Opener for FileOpener {
    fn target(&self) -> String {
        self.path.display().to_string()
    }

    fn open(&mut self) -> Result<Connection, SourceError> {
        let file = std::fs::File::open(&self.path).map_err(|source| SourceError::Open {
            target: self.target(),
            source,
        })?;
        Ok(Connection {
            reader: Box::new(file),
            writer: None,
        })
    }
}

/// Reads lines from standard input.
pub struct StdinOpener;

impl Opener for StdinOpener {
    fn target(&self) -> String {
        "stdin".to_string()
    }

    fn open(&mut self) -> Result<Connection, SourceError> {
        Ok(Connection {
            reader: Box::new(std::io::stdin()),
            writer: None,
        })
    }
}

/// A serial port opened with the `serialport` crate (8N1, no flow control).
pub struct SerialOpener {
    port: String,
    baud_rate: u32,
}

impl SerialOpener {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

impl Opener for SerialOpener {
    fn target(&self) -> String {
        format!("{} @ {} baud", self.port, self.baud_rate)
    }

    fn open(&mut self) -> Result<Connection, SourceError> {
        let port = serialport::new(&self.port, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(SERIAL_READ_TIMEOUT_MS))
            .open()
            .map_err(|source| SourceError::Serial {
                port: self.port.clone(),
                source,
            })?;
        let writer = port.try_clone().map_err(|source| SourceError::Serial {
            port: self.port.clone(),
            source,
        })?;
        Ok(Connection {
            reader: Box::new(port),
            writer: Some(Box::new(writer)),
        })
    }

    fn reconnectable(&self) -> bool {
        true
    }
}

// =============================================================================
// SourceManager
// =============================================================================

/// Writer half of the current connection, tagged with the generation of the
/// reader thread allowed to replace it.
#[derive(Default)]
struct WriterSlot {
    generation: u64,
    writer: Option<Box<dyn Write + Send>>,
}

impl WriterSlot {
    /// Replace the writer if `generation` still owns the slot.
    fn set(&mut self, generation: u64, writer: Option<Box<dyn Write + Send>>) {
        if self.generation == generation {
            self.writer = writer;
        }
    }
}

type SharedWriter = Arc<Mutex<WriterSlot>>;

/// Owns the reader thread of one line source.
pub struct SourceManager {
    cancel_flag: Option<Arc<AtomicBool>>,
    writer: SharedWriter,
    generation: u64,
    encoding: TextEncoding,
    line_ending: String,
}

impl SourceManager {
    pub fn new() -> Self {
        Self {
            cancel_flag: None,
            writer: Arc::new(Mutex::new(WriterSlot::default())),
            generation: 0,
            encoding: TextEncoding::Utf8,
            line_ending: crate::util::constants::DEFAULT_LINE_ENDING.to_string(),
        }
    }

    /// Start reading from `opener` on a background thread, framing with the
    /// delimiter and encoding in `serial`. A running source is stopped first.
    ///
    /// Only an unsupported encoding fails here; open failures are reported
    /// through the channel as an `error` status followed by `SourceClosed`.
    pub fn start(
        &mut self,
        opener: Box<dyn Opener>,
        serial: &SerialConfig,
        tx: mpsc::Sender<CollectorEvent>,
    ) -> Result<(), SourceError> {
        self.stop();

        let encoding = TextEncoding::from_name(&serial.encoding)?;
        let framer = LineFramer::new(&serial.delimiter, encoding);
        let cancel = Arc::new(AtomicBool::new(false));

        self.encoding = encoding;
        self.line_ending = serial.line_ending.clone();
        self.cancel_flag = Some(Arc::clone(&cancel));

        let writer = Arc::clone(&self.writer);
        let generation = self.generation;
        let target = opener.target();
        std::thread::spawn(move || {
            run_reader(opener, framer, tx, cancel, writer, generation);
        });

        tracing::info!(source = %target, generation, "Line source started");
        Ok(())
    }

    /// Request the reader thread to stop. It exits within one read timeout
    /// (serial) or after the current blocking read returns (file/stdin),
    /// without sending further events.
    pub fn stop(&mut self) {
        if let Some(flag) = self.cancel_flag.take() {
            flag.store(true, Ordering::SeqCst);
            tracing::info!("Line source stop requested");
        }
        self.generation += 1;
        let mut slot = lock(&self.writer);
        slot.generation = self.generation;
        slot.writer = None;
    }

    pub fn is_active(&self) -> bool {
        self.cancel_flag.is_some()
    }

    /// Send `text` followed by the configured line ending.
    pub fn write(&self, text: &str) -> Result<(), SourceError> {
        if !self.is_active() {
            return Err(SourceError::NotConnected);
        }
        let mut slot = lock(&self.writer);
        let writer = slot.writer.as_mut().ok_or(SourceError::NotWritable)?;

        let payload = self.encoding.encode(&format!("{text}{}", self.line_ending));
        writer
            .write_all(&payload)
            .and_then(|_| writer.flush())
            .map_err(|source| SourceError::Write { source })?;

        tracing::debug!(bytes = payload.len(), data = %text, "TX");
        Ok(())
    }

    /// A handle that writes raw bytes to whichever connection is current.
    pub fn port(&self) -> SourcePort {
        SourcePort {
            writer: Arc::clone(&self.writer),
        }
    }
}

/// Outbound side of a `SourceManager`, usable from the collector thread.
#[derive(Clone)]
pub struct SourcePort {
    writer: SharedWriter,
}

impl CommandPort for SourcePort {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SourceError> {
        let mut slot = lock(&self.writer);
        let writer = slot.writer.as_mut().ok_or(SourceError::NotWritable)?;
        writer
            .write_all(bytes)
            .and_then(|_| writer.flush())
            .map_err(|source| SourceError::Write { source })
    }
}

impl Default for SourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SourceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(writer: &SharedWriter) -> std::sync::MutexGuard<'_, WriterSlot> {
    writer.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Background reader
// =============================================================================

/// Why a read loop ended.
enum ReadEnd {
    Cancelled,
    Eof,
    /// The channel is gone or this reader was superseded.
    Detached,
    Failed(std::io::Error),
}

/// Sleep for `total`, waking every `CANCEL_CHECK_INTERVAL_MS` to check the
/// cancel flag. Returns false if cancelled.
fn sleep_cancelable(total: Duration, cancel: &AtomicBool) -> bool {
    let slice = Duration::from_millis(CANCEL_CHECK_INTERVAL_MS);
    let mut remaining = total;
    while !remaining.is_zero() {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
    !cancel.load(Ordering::SeqCst)
}

fn run_reader(
    mut opener: Box<dyn Opener>,
    mut framer: LineFramer,
    tx: mpsc::Sender<CollectorEvent>,
    cancel: Arc<AtomicBool>,
    writer: SharedWriter,
    generation: u64,
) {
    // A stopped reader is stale: the owner may already have a newer source
    // publishing on the same channel. Checking the generation under the slot
    // lock orders every send before or after `stop`.
    let emit = |event: CollectorEvent| {
        let slot = lock(&writer);
        slot.generation == generation && tx.send(event).is_ok()
    };
    let status = |status: ConnectionStatus, message: Option<String>| {
        tracing::info!(status = %status, message = message.as_deref().unwrap_or(""), "Source status changed");
        emit(CollectorEvent::Status { status, message })
    };
    let close = || {
        let mut slot = lock(&writer);
        if slot.generation == generation {
            slot.writer = None;
            let _ = tx.send(CollectorEvent::SourceClosed);
        }
    };

    let target = opener.target();
    if !status(ConnectionStatus::Connecting, None) {
        return;
    }

    let mut connection = match opener.open() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(source = %target, error = %e, "Failed to open line source");
            status(ConnectionStatus::Error, Some(e.to_string()));
            close();
            return;
        }
    };

    loop {
        lock(&writer).set(generation, connection.writer.take());
        if !status(ConnectionStatus::Connected, None) {
            return;
        }
        tracing::info!(source = %target, "Line source connected");

        match read_lines(connection.reader.as_mut(), &mut framer, &emit, &cancel) {
            ReadEnd::Cancelled => {
                tracing::debug!(source = %target, generation, "Stopped line source exited");
                return;
            }
            ReadEnd::Detached => return,
            ReadEnd::Eof => {
                if let Some(line) = framer.flush() {
                    emit(CollectorEvent::Line(line));
                }
                tracing::info!(source = %target, "Line source stream ended");
                status(ConnectionStatus::Disconnected, None);
                close();
                return;
            }
            ReadEnd::Failed(e) => {
                tracing::error!(source = %target, error = %e, "Error reading from line source");
                lock(&writer).set(generation, None);
                if !opener.reconnectable() {
                    status(ConnectionStatus::Error, Some(e.to_string()));
                    close();
                    return;
                }
                match reconnect(opener.as_mut(), &cancel, &status) {
                    Some(c) => {
                        framer.reset();
                        connection = c;
                    }
                    None => {
                        if !cancel.load(Ordering::SeqCst) {
                            tracing::error!(source = %target, "Max reconnection attempts reached");
                            status(ConnectionStatus::Error, Some("Connection lost".to_string()));
                        }
                        close();
                        return;
                    }
                }
            }
        }
    }
}

fn read_lines(
    reader: &mut dyn Read,
    framer: &mut LineFramer,
    emit: &dyn Fn(CollectorEvent) -> bool,
    cancel: &AtomicBool,
) -> ReadEnd {
    let mut buf = vec![0u8; SOURCE_READ_CHUNK_BYTES];
    loop {
        if cancel.load(Ordering::SeqCst) {
            return ReadEnd::Cancelled;
        }
        match reader.read(&mut buf) {
            Ok(0) => return ReadEnd::Eof,
            Ok(n) => {
                for line in framer.push_bytes(&buf[..n]) {
                    if !emit(CollectorEvent::Line(line)) {
                        return ReadEnd::Detached;
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => return ReadEnd::Failed(e),
        }
    }
}

/// Try to reopen the source with linear backoff. `None` when every attempt
/// failed or the source was cancelled while waiting.
fn reconnect(
    opener: &mut dyn Opener,
    cancel: &AtomicBool,
    status: &dyn Fn(ConnectionStatus, Option<String>) -> bool,
) -> Option<Connection> {
    for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
        let message = format!("Reconnecting ({attempt}/{MAX_RECONNECT_ATTEMPTS})");
        tracing::info!(attempt, max = MAX_RECONNECT_ATTEMPTS, "Attempting to reconnect");
        if !status(ConnectionStatus::Connecting, Some(message)) {
            return None;
        }
        let delay = Duration::from_millis(RECONNECT_BASE_DELAY_MS * u64::from(attempt));
        if !sleep_cancelable(delay, cancel) {
            return None;
        }
        match opener.open() {
            Ok(connection) => return Some(connection),
            Err(e) => tracing::warn!(attempt, error = %e, "Reconnection failed"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    fn drain(rx: &mpsc::Receiver<CollectorEvent>) -> Vec<CollectorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            let done = event == CollectorEvent::SourceClosed;
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn lines(events: &[CollectorEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                CollectorEvent::Line(l) => Some(l.as_str()),
                _ => None,
            })
            .collect()
    }

    fn statuses(events: &[CollectorEvent]) -> Vec<ConnectionStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                CollectorEvent::Status { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_file_source_streams_lines_then_closes() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"1,2,3\r\n\n4,5,6\nlast").unwrap();

        let (tx, rx) = mpsc::channel();
        let mut manager = SourceManager::new();
        manager
            .start(Box::new(FileOpener::new(file.path())), &SerialConfig::default(), tx)
            .unwrap();

        let events = drain(&rx);
        assert_eq!(lines(&events), vec!["1,2,3", "4,5,6", "last"]);
        assert_eq!(
            statuses(&events),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected
            ]
        );
        assert_eq!(events.last(), Some(&CollectorEvent::SourceClosed));
    }

    #[test]
    fn test_missing_file_reports_error_status() {
        let (tx, rx) = mpsc::channel();
        let mut manager = SourceManager::new();
        manager
            .start(
                Box::new(FileOpener::new("/definitely/not/here.txt")),
                &SerialConfig::default(),
                tx,
            )
            .unwrap();
        let events = drain(&rx);
        assert_eq!(
            statuses(&events),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Error]
        );
        assert_eq!(events.last(), Some(&CollectorEvent::SourceClosed));
    }

    #[test]
    fn test_unsupported_encoding_fails_fast() {
        let (tx, _rx) = mpsc::channel();
        let serial = SerialConfig {
            encoding: "utf-16".to_string(),
            ..SerialConfig::default()
        };
        let mut manager = SourceManager::new();
        let err = manager
            .start(Box::new(StdinOpener), &serial, tx)
            .unwrap_err();
        assert!(matches!(err, SourceError::UnsupportedEncoding { .. }));
        assert!(!manager.is_active());
    }

    #[test]
    fn test_write_requires_a_writable_connection() {
        let manager = SourceManager::new();
        assert!(matches!(manager.write("AT"), Err(SourceError::NotConnected)));
    }

    /// Fails its first read, then serves data after a reopen.
    struct FlakyOpener {
        opens: usize,
        sent: Arc<Mutex<Vec<u8>>>,
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(ErrorKind::BrokenPipe, "device unplugged"))
        }
    }

    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Opener for FlakyOpener {
        fn target(&self) -> String {
            "flaky".to_string()
        }

        fn open(&mut self) -> Result<Connection, SourceError> {
            self.opens += 1;
            let reader: Box<dyn Read + Send> = if self.opens == 1 {
                Box::new(FailingReader)
            } else {
                Box::new(Cursor::new(b"after reconnect\n".to_vec()))
            };
            Ok(Connection {
                reader,
                writer: Some(Box::new(SharedSink(Arc::clone(&self.sent)))),
            })
        }

        fn reconnectable(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_read_error_triggers_reconnect() {
        let (tx, rx) = mpsc::channel();
        let opener = FlakyOpener {
            opens: 0,
            sent: Arc::new(Mutex::new(Vec::new())),
        };
        let mut manager = SourceManager::new();
        manager
            .start(Box::new(opener), &SerialConfig::default(), tx)
            .unwrap();

        let events = drain(&rx);
        assert_eq!(lines(&events), vec!["after reconnect"]);
        let seen: VecDeque<ConnectionStatus> = statuses(&events).into();
        assert_eq!(seen.front(), Some(&ConnectionStatus::Connecting));
        assert!(seen.iter().filter(|s| **s == ConnectionStatus::Connected).count() == 2);
        assert_eq!(seen.back(), Some(&ConnectionStatus::Disconnected));
    }

    #[test]
    fn test_write_appends_line_ending() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let writer = Arc::new(Mutex::new(WriterSlot {
            generation: 0,
            writer: Some(Box::new(SharedSink(Arc::clone(&sent)))),
        }));
        let manager = SourceManager {
            cancel_flag: Some(Arc::new(AtomicBool::new(false))),
            writer,
            generation: 0,
            encoding: TextEncoding::Utf8,
            line_ending: "\r\n".to_string(),
        };
        manager.write("AT+RST").unwrap();
        assert_eq!(sent.lock().unwrap().as_slice(), b"AT+RST\r\n");
    }

    /// A serial-like source that never ends: every read times out.
    struct IdleOpener {
        name: &'static str,
        sent: Arc<Mutex<Vec<u8>>>,
    }

    struct IdleReader;

    impl Read for IdleReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_millis(10));
            Err(std::io::Error::new(ErrorKind::TimedOut, "idle"))
        }
    }

    impl Opener for IdleOpener {
        fn target(&self) -> String {
            self.name.to_string()
        }

        fn open(&mut self) -> Result<Connection, SourceError> {
            Ok(Connection {
                reader: Box::new(IdleReader),
                writer: Some(Box::new(SharedSink(Arc::clone(&self.sent)))),
            })
        }
    }

    fn wait_for_connected(rx: &mpsc::Receiver<CollectorEvent>) {
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                CollectorEvent::Status {
                    status: ConnectionStatus::Connected,
                    ..
                } => return,
                CollectorEvent::SourceClosed => panic!("source closed before connecting"),
                _ => {}
            }
        }
    }

    #[test]
    fn test_restart_leaves_new_source_untouched() {
        let first_sent = Arc::new(Mutex::new(Vec::new()));
        let second_sent = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let mut manager = SourceManager::new();

        let first = IdleOpener {
            name: "first",
            sent: Arc::clone(&first_sent),
        };
        manager
            .start(Box::new(first), &SerialConfig::default(), tx.clone())
            .unwrap();
        wait_for_connected(&rx);

        let second = IdleOpener {
            name: "second",
            sent: Arc::clone(&second_sent),
        };
        manager
            .start(Box::new(second), &SerialConfig::default(), tx.clone())
            .unwrap();
        wait_for_connected(&rx);

        // Give the first reader time to notice it was stopped and exit.
        std::thread::sleep(Duration::from_millis(200));
        let stray: Vec<CollectorEvent> = rx.try_iter().collect();
        assert!(stray.is_empty(), "unexpected events: {stray:?}");

        assert!(manager.is_active());
        manager.write("PING").unwrap();
        assert_eq!(second_sent.lock().unwrap().as_slice(), b"PING\n");
        assert!(first_sent.lock().unwrap().is_empty());

        manager.stop();
        drop(tx);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        );
        assert!(matches!(manager.write("PING"), Err(SourceError::NotConnected)));
    }

    #[test]
    fn test_port_follows_the_current_connection() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let mut manager = SourceManager::new();
        let mut port = manager.port();
        assert!(matches!(port.write_bytes(b"x"), Err(SourceError::NotWritable)));

        let opener = IdleOpener {
            name: "idle",
            sent: Arc::clone(&sent),
        };
        manager
            .start(Box::new(opener), &SerialConfig::default(), tx)
            .unwrap();
        wait_for_connected(&rx);

        port.write_bytes(&[0x0a, 0xff]).unwrap();
        assert_eq!(sent.lock().unwrap().as_slice(), &[0x0a, 0xff]);

        manager.stop();
        assert!(matches!(port.write_bytes(b"x"), Err(SourceError::NotWritable)));
    }

    #[test]
    fn test_sleep_cancelable_returns_early() {
        let cancel = AtomicBool::new(true);
        assert!(!sleep_cancelable(Duration::from_secs(10), &cancel));
    }
}
