//! # thumbservice
//!
//! Watches a Perforce client for submitted image files, converts each new
//! revision to a thumbnail with an external tool, and records the MD5 digest
//! of that thumbnail as an attribute on the revision.
//!
//! By default revisions that already carry a digest are left alone;
//! `--force` converts them again and `--delete` removes the digests from the
//! configured change range instead.
//!
//! Exit codes: 0 after a graceful stop or a successful `--test` conversion,
//! 1 when the configuration, command line or log file cannot be used, 2 when
//! a `--test` conversion fails.

mod shutdown;

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use anyhow::Context;
use clap::Parser;
use thumbservice_config::{ConfigLoad, Configuration};
use thumbservice_core::{
    ConverterRouter, Digest, EventLog, P4CommandClient, PollScheduler,
    ProcessingMode, SourceImage, ThumbnailConverter, logging,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EXIT_CONFIG: u8 = 1;
const EXIT_TEST_FAILED: u8 = 2;

const DELETE_NEEDS_RANGE: &str = "Error: You must also set a finalChange in \
    the configuration to delete thumbnails";

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "thumbservice", version)]
#[command(
    about = "Record thumbnail digests on image files submitted to a \
             Perforce depot"
)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Log debug lines as well
    #[arg(short, long)]
    verbose: bool,

    /// Convert revisions even if they already have a thumbnail digest
    #[arg(short, long)]
    force: bool,

    /// Remove thumbnail digests up to finalChange instead of converting
    #[arg(short, long, conflicts_with = "test")]
    delete: bool,

    /// Convert one local file with the configured converter, print the
    /// digest and exit without contacting the server
    #[arg(long, value_name = "FILE")]
    test: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let ConfigLoad { config, warnings } =
        match thumbservice_config::load(&cli.config) {
            Ok(load) => load,
            Err(err) => {
                EventLog::stdout().fatal(&err.to_string());
                return ExitCode::from(EXIT_CONFIG);
            }
        };

    if cli.delete && config.connection.final_change.is_none() {
        EventLog::stdout().fatal(DELETE_NEEDS_RANGE);
        return ExitCode::from(EXIT_CONFIG);
    }

    if let Err(err) = open_log(&config, cli.verbose) {
        EventLog::stdout().fatal(&format!("Error: {err:#}"));
        return ExitCode::from(EXIT_CONFIG);
    }

    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(
                message = %warning.message,
                hint = %hint,
                "configuration warning"
            ),
            None => {
                warn!(message = %warning.message, "configuration warning")
            }
        }
    }

    match &cli.test {
        Some(file) => convert_one(&config, file).await,
        None => serve(config, mode(&cli)).await,
    }
}

fn mode(cli: &Cli) -> ProcessingMode {
    if cli.delete {
        ProcessingMode::ClearThumbnails
    } else if cli.force {
        ProcessingMode::ForceConvert
    } else {
        ProcessingMode::Convert
    }
}

/// Route all further logging to `logFile` (or stdout) and install the
/// subscriber.
fn open_log(config: &Configuration, verbose: bool) -> anyhow::Result<()> {
    let log = match &config.log_file {
        Some(path) => EventLog::append_to(path).with_context(|| {
            format!("Couldn't open log file {}", path.display())
        })?,
        None => EventLog::stdout(),
    };
    let directive = if verbose { "debug" } else { "info" };
    logging::install(&log, directive)
        .context("failed to install the log subscriber")
}

async fn convert_one(config: &Configuration, file: &Path) -> ExitCode {
    let bytes = match tokio::fs::read(file).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("Can't read {}: {err}", file.display());
            return ExitCode::from(EXIT_TEST_FAILED);
        }
    };
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let converter = ConverterRouter::from_config(&config.conversion);
    match converter.convert(&SourceImage::new(name, bytes)).await {
        Ok(thumbnail) => {
            println!(
                "{} {} byte thumbnail from {}",
                Digest::of(&thumbnail),
                thumbnail.len(),
                file.display()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("Can't convert image file {}: {err}", file.display());
            ExitCode::from(EXIT_TEST_FAILED)
        }
    }
}

async fn serve(config: Configuration, mode: ProcessingMode) -> ExitCode {
    let config = Arc::new(config);
    info!(
        config = %config.metadata.config_path.display(),
        client = config.client(),
        ?mode,
        "Thumbnail service started"
    );

    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();
    let signals = tokio::spawn(shutdown::watch(
        shutdown.clone(),
        abort.clone(),
        config.polling.shutdown_grace,
    ));

    let client = Arc::new(P4CommandClient::new(&config.connection));
    let converter = Arc::new(
        ConverterRouter::from_config(&config.conversion)
            .with_abort(abort.clone()),
    );
    let mut scheduler = PollScheduler::new(config, client, converter)
        .with_mode(mode)
        .with_cancellation(shutdown, abort);

    let reason = scheduler.run().await;
    signals.abort();
    info!(?reason, "exiting");
    ExitCode::SUCCESS
}
