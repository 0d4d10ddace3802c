//! Archive Shipper - replays archived test-run logs into Seq
//!
//! Reads tar archives of container logs collected after a test run, keeps the
//! members belonging to the shipped components, unwraps the CLEF events from
//! their JSON envelopes and posts them to Seq in size-bounded batches.
//!
//! ## Configuration
//!
//! Settings come from environment variables, overridden by flags:
//!
//! - `ARCHIVE_SHIPPER_URL` / `--url`: Seq raw-events URL
//!   (default: http://localhost:9341/api/events/raw?clef)
//! - `ARCHIVE_SHIPPER_BATCH_BYTES` / `--batch-bytes`: batch byte threshold (default: 100000)
//! - `ARCHIVE_SHIPPER_BATCH_LINES` / `--batch-lines`: flush every N lines instead
//! - `ARCHIVE_SHIPPER_BATCH_SCOPE` / `--batch-scope`: `member` or `run` (default: member)
//! - `ARCHIVE_SHIPPER_COMPONENTS` / `--component`: shipped components (default: control,compute)
//! - `ARCHIVE_SHIPPER_EXTENSION` / `--extension`: member extension (default: .log)
//! - `ARCHIVE_SHIPPER_REQUIRE_TIMESTAMP` / `--require-timestamp`: require `@t`
//! - `ARCHIVE_SHIPPER_REQUEST_TIMEOUT_SECS` / `--request-timeout-secs`: HTTP timeout (default: 30)
//! - `ARCHIVE_SHIPPER_MAX_RETRIES` / `--max-retries`: retries on connection errors (default: 0)
//! - `RUST_LOG`: Logging level filter (default: info)
//!
//! The process exits with status 1 on the first archive or delivery error.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use archive_shipper::cli::Cli;
use archive_shipper::client::HttpDelivery;
use archive_shipper::config::Config;
use archive_shipper::pipeline::{Pipeline, PipelineConfig};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();

    let config = match Config::from_env().and_then(|config| cli.apply(config)) {
        Ok(config) => {
            info!(
                url = %config.url,
                flush_policy = ?config.flush_policy,
                batch_scope = ?config.batch_scope,
                components = ?config.components,
                extension = %config.extension,
                require_timestamp = config.require_timestamp,
                max_retries = config.max_retries,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let client = match HttpDelivery::new(&config) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to create HTTP client");
            return ExitCode::FAILURE;
        }
    };

    let pipeline = Pipeline::new(PipelineConfig::from(&config), client);

    match pipeline.run_all(&cli.archives).await {
        Ok(reports) => {
            let lines: u64 = reports.iter().map(|r| r.decoded_lines).sum();
            let batches: u64 = reports.iter().map(|r| r.batches_delivered).sum();
            info!(
                archives = reports.len(),
                decoded_lines = lines,
                batches = batches,
                "All archives shipped"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Shipping aborted");
            ExitCode::FAILURE
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
