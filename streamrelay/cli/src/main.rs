//! StreamRelay - Relay Bytes Between Files, Pipes and Terminals
//!
//! Reads from an input (stdin by default) and writes to an output (stdout by
//! default) through a [`StreamPipe`], driven by a `poll(2)` run loop.
//!
//! # Usage
//!
//! ```bash
//! # stdin to stdout
//! streamrelay < in.bin > out.bin
//!
//! # Files, bigger chunks, summary on stderr
//! streamrelay -i in.bin -o out.bin --chunk-size 4096 --summary
//!
//! # With config file
//! streamrelay --config ~/.config/streamrelay/relay.toml
//!
//! # Verbose logging
//! RUST_LOG=debug streamrelay -i in.bin -o out.bin
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop relaying and close both ends

use std::fs::File;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use streamrelay_core::{
    default_config_path, load_config_from_path, ConfigOverrides, PipeOutcome, PipeSummary,
    PollRunLoop, RelayConfigFile, StreamPipe,
};

/// StreamRelay - event-driven byte relay
#[derive(Parser, Debug)]
#[command(name = "streamrelay")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// File to read from (stdin when omitted)
    #[arg(short = 'i', long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// File to write to, created or truncated (stdout when omitted)
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "STREAMRELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bytes read per readable event
    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<usize>,

    /// Stop relaying on the first read or write error
    #[arg(long)]
    stop_on_error: bool,

    /// Print the pipe summary as JSON on stderr
    #[arg(long)]
    summary: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "STREAMRELAY_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(size) = self.chunk_size {
            overrides = overrides.with_chunk_size(size);
        }
        if self.stop_on_error {
            overrides = overrides.with_teardown_on_error(true);
        }
        overrides
    }
}

/// Initialize logging with the specified level
///
/// Logs go to stderr; stdout may be the relay's output.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "streamrelay_cli={level},streamrelay_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Load file and environment settings, then apply the CLI flags
fn resolve_config(args: &Args) -> Result<RelayConfigFile> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = %config.source(),
        chunk_size = config.pipe.chunk_size,
        teardown_on_error = config.pipe.teardown_on_error,
        "Configuration resolved"
    );
    Ok(config)
}

fn open_input(path: Option<&Path>) -> Result<File> {
    match path {
        Some(path) => {
            File::open(path).with_context(|| format!("Failed to open input: {}", path.display()))
        }
        None => {
            let fd = std::io::stdin()
                .as_fd()
                .try_clone_to_owned()
                .context("Failed to duplicate stdin")?;
            Ok(File::from(fd))
        }
    }
}

fn open_output(path: Option<&Path>) -> Result<File> {
    match path {
        Some(path) => File::create(path)
            .with_context(|| format!("Failed to create output: {}", path.display())),
        None => {
            let fd = std::io::stdout()
                .as_fd()
                .try_clone_to_owned()
                .context("Failed to duplicate stdout")?;
            Ok(File::from(fd))
        }
    }
}

/// Relay input to output until end of input or `stop`
///
/// Everything `Rc`-based is created and dropped on the calling thread.
fn run_relay(
    config: &RelayConfigFile,
    input: Option<&Path>,
    output: Option<&Path>,
    stop: &AtomicBool,
) -> Result<PipeSummary> {
    let run_loop = Rc::new(PollRunLoop::new(config.run_loop.clone()));
    let source = run_loop.source(open_input(input)?);
    let sink = run_loop.sink(open_output(output)?);

    let handle = StreamPipe::new(config.pipe.clone())
        .pipe(&source, &sink, None)
        .context("Failed to start relay")?;
    run_loop.run(stop).context("Run loop failed")?;

    if !handle.is_finished() {
        warn!("Relay stopped before end of input");
        sink.close();
        source.close();
    }
    Ok(handle.summary())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "StreamRelay starting");
    let config = resolve_config(&args)?;

    let stop = Arc::new(AtomicBool::new(false));
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let stop_clone = Arc::clone(&stop);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, stopping relay"),
            _ = sigint.recv() => info!("Received SIGINT, stopping relay"),
        }
        stop_clone.store(true, Ordering::SeqCst);
    });

    let relay_stop = Arc::clone(&stop);
    let (input, output) = (args.input.clone(), args.output.clone());
    let summary = tokio::task::spawn_blocking(move || {
        run_relay(&config, input.as_deref(), output.as_deref(), &relay_stop)
    })
    .await
    .context("Relay thread panicked")??;

    if args.summary {
        let json = serde_json::to_string(&summary).context("Failed to encode summary")?;
        eprintln!("{json}");
    }

    info!(
        bytes_read = summary.bytes_read,
        bytes_written = summary.bytes_written,
        outcome = ?summary.outcome,
        "StreamRelay stopped"
    );

    check_summary(&summary)
}

/// Fail unless every byte read reached the output
fn check_summary(summary: &PipeSummary) -> Result<()> {
    if summary.outcome == PipeOutcome::Failed {
        anyhow::bail!(
            "Relay failed after {} of {} bytes",
            summary.bytes_written,
            summary.bytes_read
        );
    }
    if summary.bytes_abandoned > 0 {
        anyhow::bail!(
            "Relay lost {} of {} bytes read",
            summary.bytes_abandoned,
            summary.bytes_read
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["streamrelay"]).unwrap();
        assert!(args.input.is_none());
        assert!(args.output.is_none());
        assert!(!args.stop_on_error);
        assert!(!args.summary);
        assert!(args.overrides().chunk_size.is_none());
        assert!(args.overrides().teardown_on_error.is_none());
    }

    #[test]
    fn test_args_map_to_overrides() {
        let args = Args::try_parse_from([
            "streamrelay",
            "-i",
            "in.bin",
            "-o",
            "out.bin",
            "--chunk-size",
            "64",
            "--stop-on-error",
        ])
        .unwrap();

        assert_eq!(args.input, Some(PathBuf::from("in.bin")));
        let overrides = args.overrides();
        assert_eq!(overrides.chunk_size, Some(64));
        assert_eq!(overrides.teardown_on_error, Some(true));
    }

    #[test]
    fn test_relay_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.bin");
        let output = dir.path().join("out.bin");
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        File::create(&input).unwrap().write_all(&payload).unwrap();

        let mut config = RelayConfigFile::default();
        config.pipe.chunk_size = 700;
        let summary = run_relay(
            &config,
            Some(&input),
            Some(&output),
            &AtomicBool::new(false),
        )
        .unwrap();

        assert_eq!(summary.outcome, PipeOutcome::Ended);
        assert_eq!(summary.bytes_written, 3000);
        assert_eq!(summary.chunks, 5);
        assert_eq!(std::fs::read(&output).unwrap(), payload);
    }

    #[test]
    fn test_abandoned_bytes_fail_the_relay() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.bin");
        File::create(&input).unwrap().write_all(b"abc").unwrap();
        let mut summary = run_relay(
            &RelayConfigFile::default(),
            Some(&input),
            Some(&dir.path().join("out.bin")),
            &AtomicBool::new(false),
        )
        .unwrap();
        assert!(check_summary(&summary).is_ok());

        summary.bytes_written = 1;
        summary.bytes_abandoned = 2;
        let err = check_summary(&summary).unwrap_err();
        assert!(err.to_string().contains("lost 2 of 3"));

        summary.bytes_abandoned = 0;
        summary.outcome = PipeOutcome::Failed;
        assert!(check_summary(&summary).is_err());
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_relay(
            &RelayConfigFile::default(),
            Some(&dir.path().join("missing.bin")),
            Some(&dir.path().join("out.bin")),
            &AtomicBool::new(false),
        );
        assert!(result.is_err());
    }
}
