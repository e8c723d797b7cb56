//! CLI entry point for folio.

use std::io::IsTerminal;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use folio_core::{
    AdapterRegistry, HttpClient, Orchestrator, ProfileSet, RunError, RunReport, RunSettings,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod cli;
mod progress_ui;

use cli::Args;

/// Some pages or chunks are missing from the output.
const EXIT_PARTIAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    debug!(?args, "CLI arguments parsed");

    match run(args).await {
        Ok(report) if report.is_complete() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(EXIT_PARTIAL),
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<RunReport> {
    let client = HttpClient::new().context("failed to build HTTP client")?;

    let profiles = match &args.profiles {
        Some(path) => ProfileSet::load(path)
            .with_context(|| format!("cannot load profiles from {}", path.display()))?,
        None => ProfileSet::default(),
    };
    let overrides = args.overrides();
    overrides
        .validate("command line")
        .context("invalid command-line override")?;

    let registry = AdapterRegistry::with_defaults(client.clone());
    let manifest = registry
        .resolve(&args.manifest)
        .await
        .with_context(|| format!("cannot resolve manifest {}", args.manifest))?;
    let settings = RunSettings::resolve(
        &overrides.merged_over(&profiles.profile_for(&manifest.source_name)),
    );
    info!(
        manifest_id = %manifest.id,
        pages = manifest.pages.len(),
        source = %manifest.source_name,
        concurrency = settings.concurrency,
        "manifest resolved"
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            ctrl_c.cancel();
        }
    });

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let show_bar = !args.quiet && std::io::stderr().is_terminal();
    let ui = progress_ui::spawn_progress_ui(show_bar, events_rx);

    let orchestrator = Orchestrator::new(client, &args.output).with_events(events_tx);
    let outcome = orchestrator.run(manifest, &settings, cancel).await;
    drop(orchestrator);
    if let Err(e) = ui.await {
        debug!(error = %e, "progress UI task ended abnormally");
    }

    match outcome {
        Ok(report) => {
            print_report(&report);
            Ok(report)
        }
        Err(RunError::Cancelled { partial }) => {
            print_report(&partial);
            Err(anyhow::anyhow!("run cancelled"))
        }
        Err(e) => Err(e).context("run failed"),
    }
}

#[allow(clippy::print_stdout)]
fn print_report(report: &RunReport) {
    for artifact in &report.artifacts {
        println!("{}", artifact.display());
    }
    if !report.failed_pages.is_empty() {
        let pages: Vec<String> = report
            .failed_pages
            .iter()
            .map(|index| (index + 1).to_string())
            .collect();
        println!("failed pages: {}", pages.join(", "));
    }
    if report.resumed_chunks > 0 {
        info!(resumed = report.resumed_chunks, "reused chunks from an earlier run");
    }
}
