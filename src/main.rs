// SerialCollect - main.rs
//
// Application entry point. Handles:
// 1. CLI argument parsing
// 2. Configuration loading and CLI overrides
// 3. Logging initialisation (debug mode, in-memory capture for log export)
// 4. Running the line source into the collector until it ends
// 5. Writing the CSV export and the optional log export

use clap::Parser;
use serialcollect::app::collector::{Collector, PendingCommand, RunEnd};
use serialcollect::app::source::{FileOpener, Opener, SerialOpener, SourceManager, StdinOpener};
use serialcollect::core::model::AppConfig;
use serialcollect::platform::config::{self, PlatformPaths};
use serialcollect::util::constants;
use serialcollect::util::logging::{self, LogBuffer, LogLevel};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;

/// SerialCollect - record labelled samples from a serial line stream.
///
/// Lines are read from a serial port, a file or stdin, parsed into fields,
/// filtered and labelled by rules, and exported as CSV.
#[derive(Parser, Debug)]
#[command(name = "SerialCollect", version, about)]
struct Cli {
    /// Configuration JSON file (defaults to the platform config directory).
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Read lines from this file instead of stdin.
    #[arg(short = 'i', long = "input", conflicts_with = "port")]
    input: Option<PathBuf>,

    /// Serial port to read from (e.g. /dev/ttyUSB0, COM3).
    #[arg(short = 'p', long = "port")]
    port: Option<String>,

    /// Baud rate override for --port.
    #[arg(short = 'b', long = "baud", requires = "port")]
    baud: Option<u32>,

    /// Class to label recorded samples with.
    #[arg(long = "class")]
    class: Option<String>,

    /// Start recording as soon as the source is opened.
    #[arg(short = 'r', long = "record")]
    record: bool,

    /// Auto-stop override in seconds (0 disables).
    #[arg(long = "auto-stop")]
    auto_stop: Option<u64>,

    /// End the session when the auto-stop timer fires.
    #[arg(long = "stop-on-auto-stop")]
    stop_on_auto_stop: bool,

    /// Send this command once the source connects (repeatable; enables serialTx).
    #[arg(long = "send", value_name = "COMMAND")]
    send: Vec<String>,

    /// Send the configured quick command with this id once the source
    /// connects (repeatable; enables serialTx).
    #[arg(long = "quick", value_name = "ID")]
    quick: Vec<String>,

    /// Directory the CSV export is written to.
    #[arg(short = 'o', long = "output", default_value = ".")]
    output: PathBuf,

    /// Print the first N export rows to stdout (default 5).
    #[arg(long = "preview", num_args = 0..=1)]
    preview: Option<Option<usize>>,

    /// Write the captured log to this file on exit.
    #[arg(long = "log-export")]
    log_export: Option<PathBuf>,

    /// Validate the template and rules of the configuration and exit.
    #[arg(long = "validate")]
    validate: bool,

    /// Enable debug logging (equivalent to RUST_LOG=debug).
    #[arg(short = 'd', long = "debug")]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let platform_paths = PlatformPaths::resolve();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| platform_paths.config_file());

    let (mut app_config, warnings) = match config::load_config_file(&config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    apply_overrides(&mut app_config, &cli);

    let log_buffer = LogBuffer::new(
        app_config.logging.max_entries,
        LogLevel::from_name(&app_config.logging.level).unwrap_or(LogLevel::Info),
    );
    logging::init(
        cli.debug,
        Some(&app_config.logging.level),
        Some(log_buffer.clone()),
    );

    tracing::info!(
        version = constants::APP_VERSION,
        debug = cli.debug,
        config = %config_path.display(),
        "SerialCollect starting"
    );
    for w in &warnings {
        tracing::warn!(warning = %w, "Configuration warning");
    }

    let code = if cli.validate {
        validate(app_config.clone())
    } else {
        collect(&cli, app_config.clone())
    };

    write_logs(&cli, &app_config, &platform_paths, &log_buffer);
    code
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(baud) = cli.baud {
        config.serial.baud_rate = baud;
    }
    if let Some(secs) = cli.auto_stop {
        config.recording.auto_stop_seconds = secs.min(constants::MAX_AUTO_STOP_SECONDS);
    }
    if !cli.send.is_empty() || !cli.quick.is_empty() {
        config.serial_tx.enabled = true;
    }
}

fn validate(config: AppConfig) -> ExitCode {
    let (tx, _rx) = mpsc::channel();
    let collector = match Collector::new(config, tx) {
        Ok(c) => c,
        Err(e) => {
            println!("parser: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut ok = true;
    let template = collector.validate_template();
    for w in &template.warnings {
        println!("template warning: {w}");
    }
    for e in &template.errors {
        println!("template error: {e}");
        ok = false;
    }
    for (id, result) in collector.validate_rules() {
        match result {
            Ok(()) => println!("rule {id}: ok"),
            Err(e) => {
                println!("rule {id}: {e}");
                ok = false;
            }
        }
    }

    if ok {
        println!("Configuration is valid");
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn collect(cli: &Cli, config: AppConfig) -> ExitCode {
    let (tx, rx) = mpsc::channel();
    let serial = config.serial.clone();
    let mut collector = match Collector::new(config, tx) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut source = SourceManager::new();
    collector.attach_port(Box::new(source.port()));
    for command in &cli.send {
        collector.queue_on_connect(PendingCommand::Text(command.clone()));
    }
    for id in &cli.quick {
        collector.queue_on_connect(PendingCommand::Quick(id.clone()));
    }

    if cli.record && !collector.start_recording(cli.class.as_deref()) {
        eprintln!("Error: labeling is enabled; pass --class to start recording");
        return ExitCode::FAILURE;
    }

    let opener: Box<dyn Opener> = match (&cli.port, &cli.input) {
        (Some(port), _) => Box::new(SerialOpener::new(port.clone(), serial.baud_rate)),
        (None, Some(path)) => Box::new(FileOpener::new(path.clone())),
        (None, None) => Box::new(StdinOpener),
    };

    if let Err(e) = source.start(opener, &serial, collector.sender()) {
        tracing::error!(error = %e, "Cannot start line source");
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    let end = collector.run(&rx, cli.stop_on_auto_stop);
    collector.stop_recording();
    collector.detach_port();
    source.stop();
    collector.dispose();

    let stats = collector.stats();
    tracing::info!(
        total = stats.total_samples,
        classes = ?stats.class_counts,
        end = ?end,
        "Collection finished"
    );

    if let Some(max_lines) = cli.preview {
        let max_lines = max_lines.unwrap_or(constants::DEFAULT_PREVIEW_LINES);
        for line in collector.preview_export(max_lines) {
            println!("{line}");
        }
    }

    if collector.samples().is_empty() {
        tracing::info!("No samples recorded; nothing to export");
    } else {
        match collector.write_export(&cli.output) {
            Ok(path) => println!("Exported {} samples to {}", stats.total_samples, path.display()),
            Err(e) => {
                tracing::error!(error = %e, "Export failed");
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    if end == RunEnd::SourceClosed && collector.status_message().is_some() {
        eprintln!(
            "Source ended with status {}: {}",
            collector.status(),
            collector.status_message().unwrap_or_default()
        );
    }
    ExitCode::SUCCESS
}

fn write_logs(cli: &Cli, config: &AppConfig, paths: &PlatformPaths, buffer: &LogBuffer) {
    let text = buffer.export_text();
    if let Some(path) = &cli.log_export {
        write_log_file(path, &text);
    }
    if config.logging.persist_to_file {
        write_log_file(&paths.log_file(), &text);
    }
}

fn write_log_file(path: &Path, text: &str) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::write(path, format!("{text}\n")) {
        Ok(()) => tracing::debug!(path = %path.display(), "Log written"),
        Err(e) => eprintln!("Error: cannot write log '{}': {e}", path.display()),
    }
}
